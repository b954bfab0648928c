//! 进程监督器
//!
//! 启动/停止链的节点二进制并轮询就绪状态。启动经由依赖解析器门控；
//! 停止先走优雅通道（结算服务 Stop RPC），有界等待后升级为强制终止，
//! 保证最终必达 stopped，绝不悬挂状态机。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::domain::chain_registry::{ChainDefinition, ChainRegistry, ProbeKind};
use crate::domain::lifecycle::{ChainStatus, SyncHealth};
use crate::error::AppError;
use crate::infrastructure::event_bus::{EventBus, OrchestratorEvent};
use crate::service::chain_state::ChainStateStore;
use crate::service::dependency_resolver::DependencyResolver;
use crate::service::settlement_client::SettlementClient;

/// 冷启动阶段的探测间隔
const PROBE_BASELINE: Duration = Duration::from_secs(5);
/// 进程存活超过 5 秒后收紧到 500ms，启动关键窗口内快速反馈
const PROBE_FAST: Duration = Duration::from_millis(500);
const PROBE_TIGHTEN_AFTER: Duration = Duration::from_secs(5);
/// 优雅退出的有界等待
const STOP_GRACE: Duration = Duration::from_secs(10);

struct ManagedProcess {
    child: Child,
    started_at: Instant,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    registry: Arc<ChainRegistry>,
    store: Arc<ChainStateStore>,
    resolver: Arc<DependencyResolver>,
    settlement: Arc<SettlementClient>,
    events: Arc<EventBus>,
    base_dir: std::path::PathBuf,
    /// 结算服务连通等待上限（秒），1 秒间隔轮询
    settlement_timeout_secs: u64,
    children: Arc<Mutex<HashMap<String, ManagedProcess>>>,
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<ChainRegistry>,
        store: Arc<ChainStateStore>,
        resolver: Arc<DependencyResolver>,
        settlement: Arc<SettlementClient>,
        events: Arc<EventBus>,
        base_dir: std::path::PathBuf,
        settlement_timeout_secs: u64,
    ) -> Self {
        Self {
            registry,
            store,
            resolver,
            settlement,
            events,
            base_dir,
            settlement_timeout_secs,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 启动链进程
    ///
    /// 依赖缺失时由解析器门控拒绝，目标链状态不变。
    pub async fn start(&self, chain_id: &str, extra_args: Vec<String>) -> Result<(), AppError> {
        let def = self
            .registry
            .get(chain_id)
            .ok_or_else(|| AppError::not_found(format!("Unknown chain: {}", chain_id)))?
            .clone();

        self.resolver.gate_start(chain_id).await?;

        let binary = def.binary_path(&self.base_dir);
        if !binary.exists() {
            return Err(AppError::not_found(format!(
                "Binary for chain '{}' not found; download it first",
                chain_id
            )));
        }

        // downloaded|stopped -> starting；其余状态属于冲突
        self.store
            .transition(chain_id, ChainStatus::Starting)
            .await?;

        let data_dir = def.data_dir(&self.base_dir);
        if let Err(e) = tokio::fs::create_dir_all(&data_dir).await {
            let _ = self.store.transition(chain_id, ChainStatus::Stopping).await;
            let _ = self.store.transition(chain_id, ChainStatus::Stopped).await;
            return Err(AppError::internal(format!(
                "Failed to create data dir: {}",
                e
            )));
        }

        let mut command = Command::new(&binary);
        command
            .args(&def.base_args)
            .args(&extra_args)
            .current_dir(&data_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                // 启动失败也必须把状态机送达 stopped
                let _ = self.store.transition(chain_id, ChainStatus::Stopping).await;
                let _ = self.store.transition(chain_id, ChainStatus::Stopped).await;
                return Err(AppError::internal(format!(
                    "Failed to spawn '{}': {}",
                    def.binary_name, e
                )));
            }
        };

        tracing::info!(
            chain_id = %chain_id,
            binary = %binary.display(),
            pid = ?child.id(),
            "Chain process started"
        );

        self.forward_logs(&def.id, &mut child);

        self.children.lock().await.insert(
            chain_id.to_string(),
            ManagedProcess {
                child,
                started_at: Instant::now(),
            },
        );

        // 守护进程型链：按配置上限等待结算服务可达，超时只告警
        if def.probe == ProbeKind::Settlement {
            let client = self.settlement.clone();
            let timeout_secs = self.settlement_timeout_secs;
            let id = def.id.clone();
            tokio::spawn(async move {
                if let Err(e) = client.wait_for_connection(timeout_secs).await {
                    tracing::warn!(chain_id = %id, error = %e, "Settlement service unavailable");
                }
            });
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.probe_loop(def).await;
        });

        Ok(())
    }

    /// 转发子进程输出为 ChainLog 事件
    fn forward_logs(&self, chain_id: &str, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            let events = self.events.clone();
            let id = chain_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    events
                        .publish(OrchestratorEvent::ChainLog {
                            chain_id: id.clone(),
                            line,
                        })
                        .await;
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let events = self.events.clone();
            let id = chain_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    events
                        .publish(OrchestratorEvent::ChainLog {
                            chain_id: id.clone(),
                            line,
                        })
                        .await;
                }
            });
        }
    }

    /// 就绪/健康探测循环
    ///
    /// 链离开 starting/running/ready 后自行退出。探测失败是瞬态错误，
    /// 按轮询节奏继续重试，不放弃整条链。
    async fn probe_loop(self, def: ChainDefinition) {
        let started_at = match self.children.lock().await.get(&def.id) {
            Some(mp) => mp.started_at,
            None => return,
        };
        let mut last_health: Option<SyncHealth> = None;

        loop {
            let interval = if started_at.elapsed() > PROBE_TIGHTEN_AFTER {
                PROBE_FAST
            } else {
                PROBE_BASELINE
            };
            tokio::time::sleep(interval).await;

            let status = match self.store.status(&def.id).await {
                Ok(s) => s,
                Err(_) => return,
            };
            if !status.is_active() {
                return;
            }

            // 进程意外退出：驱动状态机到 stopped 并广播离线
            if self.process_exited(&def.id).await {
                tracing::warn!(chain_id = %def.id, "Chain process exited unexpectedly");
                let _ = self.store.transition(&def.id, ChainStatus::Stopping).await;
                let _ = self.store.transition(&def.id, ChainStatus::Stopped).await;
                self.children.lock().await.remove(&def.id);
                self.publish_health(&def.id, SyncHealth::Offline, -1, &mut last_health)
                    .await;
                return;
            }

            match def.probe {
                ProbeKind::Height => match self.settlement.block_count().await {
                    Ok(height) => {
                        let _ = self.store.set_block_height(&def.id, height).await;
                        if status == ChainStatus::Starting {
                            let _ = self.store.transition(&def.id, def.ready_status()).await;
                        }
                        let health = SyncHealth::classify(ChainStatus::Running, Some(height));
                        self.publish_health(&def.id, health, height, &mut last_health)
                            .await;
                    }
                    Err(e) => {
                        // 进程活着但高度端点无响应：保持 starting，继续轮询
                        tracing::debug!(chain_id = %def.id, error = %e, "Height probe failed");
                        self.publish_health(&def.id, SyncHealth::Warning, -1, &mut last_health)
                            .await;
                    }
                },
                ProbeKind::Settlement => {
                    if self.settlement.check_connection().await {
                        if status == ChainStatus::Starting {
                            let _ = self.store.transition(&def.id, def.ready_status()).await;
                        }
                        self.publish_health(&def.id, SyncHealth::Healthy, -1, &mut last_health)
                            .await;
                    } else {
                        self.publish_health(&def.id, SyncHealth::Warning, -1, &mut last_health)
                            .await;
                    }
                }
                ProbeKind::Process => {
                    // 进程存活即就绪
                    if status == ChainStatus::Starting {
                        let _ = self.store.transition(&def.id, def.ready_status()).await;
                    }
                    self.publish_health(&def.id, SyncHealth::Healthy, -1, &mut last_health)
                        .await;
                }
            }
        }
    }

    async fn process_exited(&self, chain_id: &str) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(chain_id) {
            None => true,
            Some(mp) => matches!(mp.child.try_wait(), Ok(Some(_))),
        }
    }

    /// 仅在健康状态变化时广播
    async fn publish_health(
        &self,
        chain_id: &str,
        health: SyncHealth,
        block_height: i64,
        last: &mut Option<SyncHealth>,
    ) {
        if *last == Some(health) && health != SyncHealth::Healthy {
            return;
        }
        // healthy 状态下高度持续推进，仍然周期性广播
        if *last == Some(health) && health == SyncHealth::Healthy && block_height < 0 {
            return;
        }
        *last = Some(health);
        self.events
            .publish(OrchestratorEvent::SyncStatusChanged {
                chain_id: chain_id.to_string(),
                health,
                block_height,
            })
            .await;
    }

    /// 停止链进程
    ///
    /// 依赖方运行中且未 force 时由解析器拒绝；force 只停目标链。
    /// 守护进程/L1 链先尝试 RPC 优雅关停（macOS 上 API 路径不可靠，
    /// 跳过直接终止），有界等待后升级为 kill。
    pub async fn stop(&self, chain_id: &str, force: bool) -> Result<(), AppError> {
        let def = self
            .registry
            .get(chain_id)
            .ok_or_else(|| AppError::not_found(format!("Unknown chain: {}", chain_id)))?
            .clone();

        self.resolver.gate_stop(chain_id, force).await?;

        // starting|running|ready -> stopping
        self.store
            .transition(chain_id, ChainStatus::Stopping)
            .await?;

        let managed = self.children.lock().await.remove(chain_id);

        let use_rpc_stop = std::env::consts::OS != "macos";
        match def.probe {
            ProbeKind::Settlement if use_rpc_stop => {
                if let Err(e) = self.settlement.stop_daemon().await {
                    tracing::warn!(chain_id = %chain_id, error = %e, "Daemon stop RPC failed, falling back to termination");
                }
            }
            ProbeKind::Height if use_rpc_stop => {
                if let Err(e) = self.settlement.stop_node().await {
                    tracing::warn!(chain_id = %chain_id, error = %e, "Node stop RPC failed, falling back to termination");
                }
            }
            _ => {}
        }

        if let Some(mut managed) = managed {
            match tokio::time::timeout(STOP_GRACE, managed.child.wait()).await {
                Ok(Ok(exit)) => {
                    tracing::info!(chain_id = %chain_id, exit = %exit, "Chain process exited gracefully");
                }
                Ok(Err(e)) => {
                    tracing::warn!(chain_id = %chain_id, error = %e, "Wait on chain process failed");
                }
                Err(_) => {
                    // 优雅路径超时，升级为强制终止
                    tracing::warn!(chain_id = %chain_id, "Graceful stop timed out, killing process");
                    if let Err(e) = managed.child.kill().await {
                        tracing::error!(chain_id = %chain_id, error = %e, "Failed to kill chain process");
                    }
                }
            }
        }

        // 停止必须最终到达 stopped
        self.store.transition(chain_id, ChainStatus::Stopped).await?;
        self.events
            .publish(OrchestratorEvent::SyncStatusChanged {
                chain_id: chain_id.to_string(),
                health: SyncHealth::Offline,
                block_height: -1,
            })
            .await;

        tracing::info!(chain_id = %chain_id, "Chain stopped");
        Ok(())
    }

    /// 守护进程退出前按依赖反序强制停掉所有活跃链
    pub async fn shutdown_all(&self) {
        let mut order = self.registry.topo_order();
        order.reverse();

        for chain_id in order {
            let status = match self.store.status(&chain_id).await {
                Ok(s) => s,
                Err(_) => continue,
            };
            if status.is_active() {
                if let Err(e) = self.stop(&chain_id, true).await {
                    tracing::warn!(chain_id = %chain_id, error = %e, "Failed to stop chain during shutdown");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Arc<ChainStateStore>, Arc<ProcessSupervisor>) {
        let registry = Arc::new(ChainRegistry::new());
        let events = Arc::new(EventBus::new(64));
        let store = Arc::new(ChainStateStore::new(&registry, events.clone()));
        let resolver = Arc::new(DependencyResolver::new(registry.clone(), store.clone()));
        let settlement = Arc::new(SettlementClient::new("http://127.0.0.1:1"));
        let supervisor = Arc::new(ProcessSupervisor::new(
            registry,
            store.clone(),
            resolver,
            settlement,
            events,
            std::env::temp_dir().join("drivecore-supervisor-tests"),
            5,
        ));
        (store, supervisor)
    }

    async fn drive_to_running(store: &ChainStateStore, id: &str) {
        for status in [
            ChainStatus::Downloading,
            ChainStatus::Extracting,
            ChainStatus::Downloaded,
            ChainStatus::Starting,
            ChainStatus::Running,
        ] {
            store.transition(id, status).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_start_refused_on_missing_dependencies() {
        let (store, supervisor) = fixture();
        for status in [
            ChainStatus::Downloading,
            ChainStatus::Extracting,
            ChainStatus::Downloaded,
        ] {
            store.transition("thunder", status).await.unwrap();
        }

        let err = supervisor.start("thunder", vec![]).await.unwrap_err();
        assert_eq!(err.code, crate::error::AppErrorCode::MissingDependencies);
        // 状态保持 downloaded，未被触碰
        assert_eq!(
            store.status("thunder").await.unwrap(),
            ChainStatus::Downloaded
        );
    }

    #[tokio::test]
    async fn test_start_requires_binary_on_disk() {
        let (store, supervisor) = fixture();
        drive_to_running(&store, "bitcoin").await;

        for status in [
            ChainStatus::Downloading,
            ChainStatus::Extracting,
            ChainStatus::Downloaded,
        ] {
            store.transition("enforcer", status).await.unwrap();
        }

        let err = supervisor.start("enforcer", vec![]).await.unwrap_err();
        assert_eq!(err.code, crate::error::AppErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_stop_blocked_then_forced_leaves_dependent_running() {
        let (store, supervisor) = fixture();
        drive_to_running(&store, "bitcoin").await;
        drive_to_running(&store, "enforcer").await;
        drive_to_running(&store, "thunder").await;

        let err = supervisor.stop("enforcer", false).await.unwrap_err();
        assert_eq!(err.code, crate::error::AppErrorCode::BlockedByDependents);
        assert_eq!(
            store.status("enforcer").await.unwrap(),
            ChainStatus::Running
        );

        // force=true：目标链走完 stopping -> stopped，依赖方不动
        supervisor.stop("enforcer", true).await.unwrap();
        assert_eq!(
            store.status("enforcer").await.unwrap(),
            ChainStatus::Stopped
        );
        assert_eq!(
            store.status("thunder").await.unwrap(),
            ChainStatus::Running
        );
    }

    #[tokio::test]
    async fn test_stop_on_idle_chain_is_conflict() {
        let (_store, supervisor) = fixture();
        let err = supervisor.stop("bitcoin", false).await.unwrap_err();
        assert_eq!(err.code, crate::error::AppErrorCode::StateConflict);
    }

    #[tokio::test]
    async fn test_shutdown_all_reverse_order() {
        let (store, supervisor) = fixture();
        drive_to_running(&store, "bitcoin").await;
        drive_to_running(&store, "enforcer").await;
        drive_to_running(&store, "thunder").await;

        supervisor.shutdown_all().await;

        assert_eq!(store.status("bitcoin").await.unwrap(), ChainStatus::Stopped);
        assert_eq!(
            store.status("enforcer").await.unwrap(),
            ChainStatus::Stopped
        );
        assert_eq!(store.status("thunder").await.unwrap(), ChainStatus::Stopped);
    }
}
