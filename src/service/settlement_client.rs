//! 结算服务客户端
//!
//! 本地回环 Connect-RPC 端点的瘦封装。调用形如
//! `(service, method, json) -> json`；重试与退避由各调用方按自身
//! 节奏处理，不在此层实现。

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

/// L1 节点状态服务
pub const BITCOIND_SERVICE: &str = "bitcoind.v1.BitcoindService";
/// 结算守护进程控制服务
pub const DAEMON_SERVICE: &str = "bitwindowd.v1.BitwindowdService";
/// 快速提现服务
pub const FAST_WITHDRAWAL_SERVICE: &str = "fastwithdraw.v1.FastWithdrawalService";

/// 连通性探测间隔固定 1 秒
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

pub struct SettlementClient {
    base_url: String,
    http: reqwest::Client,
}

impl SettlementClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.into(),
            http,
        }
    }

    fn endpoint_url(&self, service: &str, method: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            service,
            method
        )
    }

    /// 发起一次 Connect 调用
    pub async fn call(&self, service: &str, method: &str, body: Value) -> Result<Value> {
        let url = self.endpoint_url(service, method);

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Connect-Protocol-Version", "1")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Connect call failed ({}/{})", service, method))?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Connect call {}/{} returned status {}",
                service,
                method,
                response.status()
            );
        }

        response
            .json::<Value>()
            .await
            .with_context(|| format!("Invalid JSON from {}/{}", service, method))
    }

    /// 连通性探测
    pub async fn check_connection(&self) -> bool {
        self.call(BITCOIND_SERVICE, "GetBlockchainInfo", Value::Object(Default::default()))
            .await
            .is_ok()
    }

    /// 等待服务可达，1 秒间隔轮询直到超时
    pub async fn wait_for_connection(&self, timeout_secs: u64) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

        loop {
            if self.check_connection().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "Settlement service unreachable after {}s at {}",
                    timeout_secs,
                    self.base_url
                );
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    /// 读取 L1 区块高度
    pub async fn block_count(&self) -> Result<i64> {
        let info = self
            .call(BITCOIND_SERVICE, "GetBlockchainInfo", Value::Object(Default::default()))
            .await?;

        info.get("blocks")
            .and_then(Value::as_i64)
            .context("GetBlockchainInfo response missing 'blocks'")
    }

    /// 请求结算守护进程自行关停
    pub async fn stop_daemon(&self) -> Result<()> {
        self.call(DAEMON_SERVICE, "Stop", Value::Object(Default::default()))
            .await?;
        Ok(())
    }

    /// 请求 L1 节点自行关停
    pub async fn stop_node(&self) -> Result<()> {
        self.call(BITCOIND_SERVICE, "Stop", Value::Object(Default::default()))
            .await?;
        Ok(())
    }
}
