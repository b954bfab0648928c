//! 链状态存储
//!
//! 每条链运行时状态的唯一权威副本。其余组件只能通过状态机转换入口
//! 修改状态，观察者拿到只读快照和事件流。

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::domain::chain_registry::ChainRegistry;
use crate::domain::lifecycle::{self, ChainRuntimeState, ChainStatus};
use crate::error::AppError;
use crate::infrastructure::event_bus::{EventBus, OrchestratorEvent};
use std::sync::Arc;

/// 链状态存储
///
/// 状态集合在构造时按注册表固定，此后不增不减。单链转换经由该链的
/// 互斥锁串行化；不同链的转换互不阻塞。
pub struct ChainStateStore {
    states: HashMap<String, Mutex<ChainRuntimeState>>,
    events: Arc<EventBus>,
}

impl ChainStateStore {
    pub fn new(registry: &ChainRegistry, events: Arc<EventBus>) -> Self {
        let states = registry
            .list_all()
            .into_iter()
            .map(|def| {
                (
                    def.id.clone(),
                    Mutex::new(ChainRuntimeState::new(def.has_height_probe())),
                )
            })
            .collect();

        Self { states, events }
    }

    fn entry(&self, chain_id: &str) -> Result<&Mutex<ChainRuntimeState>, AppError> {
        self.states
            .get(chain_id)
            .ok_or_else(|| AppError::not_found(format!("Unknown chain: {}", chain_id)))
    }

    /// 应用一次状态转换
    ///
    /// 并发冲突的转换至多一个胜者；落败方观察到已变更的状态并收到
    /// `StateConflict`，不会被静默覆盖。
    pub async fn transition(&self, chain_id: &str, to: ChainStatus) -> Result<(), AppError> {
        {
            let mut state = self.entry(chain_id)?.lock().await;

            lifecycle::validate_transition(state.status, to)
                .map_err(|e| AppError::state_conflict(e.to_string()))?;

            state.status = to;
            match to {
                ChainStatus::Downloading => state.download_progress = Some(0),
                ChainStatus::Downloaded | ChainStatus::NotDownloaded => {
                    state.download_progress = None
                }
                _ => {}
            }
            // 离开运行状态后高度回到未知
            if !to.is_active() && state.block_height.is_some() {
                state.block_height = Some(-1);
            }
        }

        tracing::debug!(chain_id = %chain_id, status = %to.as_str(), "Chain state transition");
        self.events
            .publish(OrchestratorEvent::ChainStatusChanged {
                chain_id: chain_id.to_string(),
                status: to,
            })
            .await;
        Ok(())
    }

    /// 重置为 not_downloaded
    ///
    /// 过渡态（downloading/extracting/stopping）中的重置被拒绝。
    pub async fn reset(&self, chain_id: &str) -> Result<(), AppError> {
        {
            let mut state = self.entry(chain_id)?.lock().await;

            if state.status.is_transient() {
                return Err(AppError::state_conflict(format!(
                    "Cannot reset chain '{}' while {}",
                    chain_id,
                    state.status.as_str()
                )));
            }

            state.status = ChainStatus::NotDownloaded;
            state.download_progress = None;
            if state.block_height.is_some() {
                state.block_height = Some(-1);
            }
        }

        self.events
            .publish(OrchestratorEvent::ChainStatusChanged {
                chain_id: chain_id.to_string(),
                status: ChainStatus::NotDownloaded,
            })
            .await;
        Ok(())
    }

    /// 更新下载进度（仅 downloading 状态有效，单调不减）
    pub async fn set_download_progress(&self, chain_id: &str, percent: u8) -> Result<(), AppError> {
        let mut state = self.entry(chain_id)?.lock().await;

        if state.status != ChainStatus::Downloading {
            return Ok(());
        }
        let current = state.download_progress.unwrap_or(0);
        state.download_progress = Some(current.max(percent.min(100)));
        Ok(())
    }

    /// 更新区块高度
    pub async fn set_block_height(&self, chain_id: &str, height: i64) -> Result<(), AppError> {
        let mut state = self.entry(chain_id)?.lock().await;
        state.block_height = Some(height);
        Ok(())
    }

    pub async fn status(&self, chain_id: &str) -> Result<ChainStatus, AppError> {
        Ok(self.entry(chain_id)?.lock().await.status)
    }

    /// 单链只读快照
    pub async fn snapshot(&self, chain_id: &str) -> Result<ChainRuntimeState, AppError> {
        Ok(self.entry(chain_id)?.lock().await.clone())
    }

    /// 全量只读快照（调用瞬间的一致视图按链取得）
    pub async fn snapshot_all(&self) -> HashMap<String, ChainRuntimeState> {
        let mut out = HashMap::with_capacity(self.states.len());
        for (id, state) in &self.states {
            out.insert(id.clone(), state.lock().await.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ChainStateStore {
        ChainStateStore::new(&ChainRegistry::new(), Arc::new(EventBus::new(64)))
    }

    #[tokio::test]
    async fn test_transition_happy_path() {
        let store = store();

        store
            .transition("thunder", ChainStatus::Downloading)
            .await
            .unwrap();
        store
            .transition("thunder", ChainStatus::Extracting)
            .await
            .unwrap();
        store
            .transition("thunder", ChainStatus::Downloaded)
            .await
            .unwrap();

        assert_eq!(
            store.status("thunder").await.unwrap(),
            ChainStatus::Downloaded
        );
    }

    #[tokio::test]
    async fn test_illegal_transition_is_conflict() {
        let store = store();

        let err = store
            .transition("thunder", ChainStatus::Running)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::AppErrorCode::StateConflict);
        // 状态保持不变
        assert_eq!(
            store.status("thunder").await.unwrap(),
            ChainStatus::NotDownloaded
        );
    }

    #[tokio::test]
    async fn test_concurrent_transition_single_winner() {
        let store = Arc::new(store());

        let a = {
            let s = store.clone();
            tokio::spawn(async move { s.transition("bitcoin", ChainStatus::Downloading).await })
        };
        let b = {
            let s = store.clone();
            tokio::spawn(async move { s.transition("bitcoin", ChainStatus::Downloading).await })
        };

        let ra = a.await.unwrap();
        let rb = b.await.unwrap();
        // 恰有一个胜者
        assert!(ra.is_ok() ^ rb.is_ok());
    }

    #[tokio::test]
    async fn test_download_progress_monotonic() {
        let store = store();
        store
            .transition("bitnames", ChainStatus::Downloading)
            .await
            .unwrap();

        store.set_download_progress("bitnames", 40).await.unwrap();
        store.set_download_progress("bitnames", 30).await.unwrap();
        let snap = store.snapshot("bitnames").await.unwrap();
        assert_eq!(snap.download_progress, Some(40));

        store.set_download_progress("bitnames", 90).await.unwrap();
        let snap = store.snapshot("bitnames").await.unwrap();
        assert_eq!(snap.download_progress, Some(90));
    }

    #[tokio::test]
    async fn test_reset_rejected_mid_transition() {
        let store = store();
        store
            .transition("zside", ChainStatus::Downloading)
            .await
            .unwrap();

        let err = store.reset("zside").await.unwrap_err();
        assert_eq!(err.code, crate::error::AppErrorCode::StateConflict);
    }

    #[tokio::test]
    async fn test_reset_from_stopped() {
        let store = store();
        for status in [
            ChainStatus::Downloading,
            ChainStatus::Extracting,
            ChainStatus::Downloaded,
            ChainStatus::Starting,
            ChainStatus::Running,
            ChainStatus::Stopping,
            ChainStatus::Stopped,
        ] {
            store.transition("thunder", status).await.unwrap();
        }

        store.reset("thunder").await.unwrap();
        assert_eq!(
            store.status("thunder").await.unwrap(),
            ChainStatus::NotDownloaded
        );
    }

    #[tokio::test]
    async fn test_unknown_chain() {
        let store = store();
        assert!(store.status("ghost").await.is_err());
    }
}
