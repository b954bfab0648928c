use std::sync::Arc;

use crate::{
    config::Config,
    domain::chain_registry::ChainRegistry,
    domain::lifecycle::ChainStatus,
    error::AppError,
    infrastructure::event_bus::EventBus,
    service::{
        chain_state::ChainStateStore, dependency_resolver::DependencyResolver,
        download_manager::DownloadManager, fast_withdrawal::FastWithdrawalService,
        process_supervisor::ProcessSupervisor, settlement_client::SettlementClient,
        wallet_engine::WalletEngine,
    },
};

/// 应用状态
///
/// 所有组件显式构造并注入，无隐藏全局单例。注册表与各服务以
/// Arc 共享，链状态的唯一可变权威副本在 ChainStateStore 内。
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ChainRegistry>,
    pub events: Arc<EventBus>,
    pub store: Arc<ChainStateStore>,
    pub resolver: Arc<DependencyResolver>,
    pub settlement: Arc<SettlementClient>,
    pub downloads: Arc<DownloadManager>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub wallet: Arc<WalletEngine>,
    pub withdrawals: Arc<FastWithdrawalService>,
}

impl AppState {
    /// 创建新的应用状态
    ///
    /// 注册表校验失败（依赖环、未知依赖）是致命配置错误，直接拒绝启动。
    pub async fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let registry = Arc::new(ChainRegistry::new());
        if let Err(errors) = registry.validate() {
            anyhow::bail!("Invalid chain registry: {}", errors.join("; "));
        }

        let base_dir = config.paths.base_dir.clone();
        let events = Arc::new(EventBus::default());
        let store = Arc::new(ChainStateStore::new(&registry, events.clone()));
        let resolver = Arc::new(DependencyResolver::new(registry.clone(), store.clone()));
        let settlement = Arc::new(SettlementClient::new(config.settlement.base_url.clone()));

        let downloads = Arc::new(DownloadManager::new(
            registry.clone(),
            store.clone(),
            events.clone(),
            config.downloads.clone(),
            base_dir.clone(),
        ));
        let supervisor = Arc::new(ProcessSupervisor::new(
            registry.clone(),
            store.clone(),
            resolver.clone(),
            settlement.clone(),
            events.clone(),
            base_dir.clone(),
            config.settlement.connect_timeout_secs,
        ));
        let wallet = Arc::new(WalletEngine::new(
            base_dir.join("wallets"),
            registry.clone(),
            events.clone(),
        ));
        let withdrawals = Arc::new(FastWithdrawalService::new(
            settlement.clone(),
            registry.clone(),
            events.clone(),
        ));

        // 恢复落盘的主钱包；文件损坏不阻止启动
        match wallet.load_persisted().await {
            Ok(true) => tracing::info!("Master wallet loaded"),
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to restore master wallet: {}", e),
        }

        Ok(Self {
            config,
            registry,
            events,
            store,
            resolver,
            settlement,
            downloads,
            supervisor,
            wallet,
            withdrawals,
        })
    }

    /// 重置链到 not_downloaded
    ///
    /// 过渡态中的重置被拒绝；运行中的链先被强制停止，链目录清空。
    pub async fn reset_chain(&self, chain_id: &str) -> Result<(), AppError> {
        let def = self
            .registry
            .get(chain_id)
            .ok_or_else(|| AppError::not_found(format!("Unknown chain: {}", chain_id)))?
            .clone();

        let status = self.store.status(chain_id).await?;
        if status.is_transient() {
            return Err(AppError::state_conflict(format!(
                "Cannot reset chain '{}' while {}",
                chain_id,
                status.as_str()
            )));
        }

        if status.is_active() {
            self.supervisor.stop(chain_id, true).await?;
        }
        // 理论上不存在，但残留的下载任务一并取消
        self.downloads.cancel(chain_id).await;

        let base = &self.config.paths.base_dir;
        tokio::fs::remove_dir_all(def.data_dir(base)).await.ok();
        tokio::fs::remove_dir_all(def.binary_dir(base)).await.ok();

        self.store.reset(chain_id).await?;
        tracing::info!(chain_id = %chain_id, "Chain reset to not_downloaded");
        Ok(())
    }

    /// 读取链区块高度
    ///
    /// 运行中优先取结算服务实时值，失败时退回最近快照；未启动返回 -1。
    pub async fn chain_block_count(&self, chain_id: &str) -> Result<i64, AppError> {
        let def = self
            .registry
            .get(chain_id)
            .ok_or_else(|| AppError::not_found(format!("Unknown chain: {}", chain_id)))?;
        if !def.has_height_probe() {
            return Err(AppError::chain_not_supported(format!(
                "Chain '{}' does not expose a block height",
                chain_id
            )));
        }

        let snapshot = self.store.snapshot(chain_id).await?;
        if snapshot.status == ChainStatus::Running || snapshot.status == ChainStatus::Starting {
            if let Ok(height) = self.settlement.block_count().await {
                let _ = self.store.set_block_height(chain_id, height).await;
                return Ok(height);
            }
        }
        Ok(snapshot.block_height.unwrap_or(-1))
    }
}
