//! 链生命周期状态机模块
//!
//! 每条链的权威状态及合法状态转换验证

use serde::{Deserialize, Serialize};

/// 链运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    NotDownloaded,
    Downloading,
    Extracting,
    Downloaded,
    Starting,
    Running,
    Ready,
    Stopping,
    Stopped,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::NotDownloaded => "not_downloaded",
            ChainStatus::Downloading => "downloading",
            ChainStatus::Extracting => "extracting",
            ChainStatus::Downloaded => "downloaded",
            ChainStatus::Starting => "starting",
            ChainStatus::Running => "running",
            ChainStatus::Ready => "ready",
            ChainStatus::Stopping => "stopping",
            ChainStatus::Stopped => "stopped",
        }
    }

    /// 过渡态：重置在这些状态下被拒绝
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainStatus::Downloading | ChainStatus::Extracting | ChainStatus::Stopping
        )
    }

    /// 满足依赖要求的状态
    pub fn is_running_or_ready(&self) -> bool {
        matches!(self, ChainStatus::Running | ChainStatus::Ready)
    }

    /// 占用进程的状态（starting/running/ready）
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ChainStatus::Starting | ChainStatus::Running | ChainStatus::Ready
        )
    }

    /// 可发起启动的状态
    pub fn can_start(&self) -> bool {
        matches!(self, ChainStatus::Downloaded | ChainStatus::Stopped)
    }
}

/// 非法状态转换
#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal transition: {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: ChainStatus,
    pub to: ChainStatus,
}

/// 验证状态转换是否合法
///
/// # 状态转换规则
/// ```text
/// NotDownloaded -> Downloading
/// Downloading   -> Extracting | NotDownloaded (取消/失败)
/// Extracting    -> Downloaded | NotDownloaded (解包损坏)
/// Downloaded    -> Starting
/// Stopped       -> Starting
/// Starting      -> Running | Ready | Stopping
/// Running       -> Stopping
/// Ready         -> Stopping
/// Stopping      -> Stopped
///
/// 相同状态的重复转换视为冲突（并发竞争至多一个胜者）。
/// 重置走独立入口：非过渡态 -> NotDownloaded。
/// ```
pub fn validate_transition(from: ChainStatus, to: ChainStatus) -> Result<(), IllegalTransition> {
    use ChainStatus::*;

    let valid = match from {
        NotDownloaded => matches!(to, Downloading),
        Downloading => matches!(to, Extracting | NotDownloaded),
        Extracting => matches!(to, Downloaded | NotDownloaded),
        Downloaded => matches!(to, Starting),
        Stopped => matches!(to, Starting),
        Starting => matches!(to, Running | Ready | Stopping),
        Running => matches!(to, Stopping),
        Ready => matches!(to, Stopping),
        Stopping => matches!(to, Stopped),
    };

    if valid {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

/// 健康探测派生的同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncHealth {
    Healthy,
    Warning,
    Offline,
}

impl SyncHealth {
    /// 根据运行状态和区块高度分类
    ///
    /// 高度为 0（或未知）但进程处于 starting/running 时归为 warning 而非 healthy。
    pub fn classify(status: ChainStatus, block_height: Option<i64>) -> Self {
        if !status.is_active() {
            return SyncHealth::Offline;
        }
        match block_height {
            Some(h) if h > 0 => SyncHealth::Healthy,
            _ => SyncHealth::Warning,
        }
    }
}

/// 单条链的运行时状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRuntimeState {
    pub status: ChainStatus,
    /// 仅下载期间存在，0-100 单调不减
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<u8>,
    /// 仅高度探测链存在，-1 表示未知
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<i64>,
}

impl ChainRuntimeState {
    pub fn new(has_height_probe: bool) -> Self {
        Self {
            status: ChainStatus::NotDownloaded,
            download_progress: None,
            block_height: if has_height_probe { Some(-1) } else { None },
        }
    }
}
