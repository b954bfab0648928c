// Event Bus 框架
// 编排器状态变更的发布/订阅系统，观察者只拿到只读快照和通知流

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::domain::lifecycle::{ChainStatus, SyncHealth};
use crate::domain::withdrawal::WithdrawalStatus;

// ============ 事件类型定义 ============

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum OrchestratorEvent {
    ChainStatusChanged {
        chain_id: String,
        status: ChainStatus,
    },
    DownloadStarted {
        chain_id: String,
    },
    DownloadProgress {
        chain_id: String,
        percent: u8,
        received_bytes: u64,
        total_bytes: u64,
    },
    DownloadComplete {
        chain_id: String,
    },
    DownloadFailed {
        chain_id: String,
        /// 结构化错误码：download_corrupt 必须整包重下，network 可重试
        code: String,
        reason: String,
    },
    SyncStatusChanged {
        chain_id: String,
        health: SyncHealth,
        block_height: i64,
    },
    ChainLog {
        chain_id: String,
        line: String,
    },
    WalletUpdated {
        wallet_type: String,
    },
    WithdrawalUpdated {
        hash: String,
        status: WithdrawalStatus,
    },
}

impl OrchestratorEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            OrchestratorEvent::ChainStatusChanged { .. } => "ChainStatusChanged",
            OrchestratorEvent::DownloadStarted { .. } => "DownloadStarted",
            OrchestratorEvent::DownloadProgress { .. } => "DownloadProgress",
            OrchestratorEvent::DownloadComplete { .. } => "DownloadComplete",
            OrchestratorEvent::DownloadFailed { .. } => "DownloadFailed",
            OrchestratorEvent::SyncStatusChanged { .. } => "SyncStatusChanged",
            OrchestratorEvent::ChainLog { .. } => "ChainLog",
            OrchestratorEvent::WalletUpdated { .. } => "WalletUpdated",
            OrchestratorEvent::WithdrawalUpdated { .. } => "WithdrawalUpdated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event: OrchestratorEvent,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

// ============ Event Bus 实现 ============

/// 内存事件总线
///
/// broadcast 通道推送给在线订阅者，环形缓冲保留最近历史供补拉。
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    history: RwLock<VecDeque<EventEnvelope>>,
    history_capacity: usize,
}

impl EventBus {
    pub fn new(history_capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(256);
        Self {
            sender,
            history: RwLock::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
        }
    }

    /// 发布事件
    ///
    /// 没有在线订阅者不是错误，事件仍进入历史缓冲。
    pub async fn publish(&self, event: OrchestratorEvent) {
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4(),
            event,
            published_at: chrono::Utc::now(),
        };

        {
            let mut history = self.history.write().await;
            if history.len() >= self.history_capacity {
                history.pop_front();
            }
            history.push_back(envelope.clone());
        }

        if let Err(e) = self.sender.send(envelope) {
            tracing::trace!("No active event subscribers: {}", e);
        }
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// 获取最近事件历史（最新在后）
    pub async fn get_event_history(&self, limit: usize) -> Vec<EventEnvelope> {
        let history = self.history.read().await;
        history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(OrchestratorEvent::ChainStatusChanged {
            chain_id: "bitcoin".to_string(),
            status: ChainStatus::Downloading,
        })
        .await;

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event.event_type(), "ChainStatusChanged");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(16);
        bus.publish(OrchestratorEvent::WalletUpdated {
            wallet_type: "master".to_string(),
        })
        .await;

        let history = bus.get_event_history(10).await;
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_history_ring_buffer() {
        let bus = EventBus::new(3);
        for i in 0..5 {
            bus.publish(OrchestratorEvent::ChainLog {
                chain_id: "thunder".to_string(),
                line: format!("line {}", i),
            })
            .await;
        }

        let history = bus.get_event_history(10).await;
        assert_eq!(history.len(), 3);
        match &history[0].event {
            OrchestratorEvent::ChainLog { line, .. } => assert_eq!(line, "line 2"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = OrchestratorEvent::DownloadProgress {
            chain_id: "thunder".to_string(),
            percent: 42,
            received_bytes: 4200,
            total_bytes: 10000,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("DownloadProgress"));

        let parsed: OrchestratorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
