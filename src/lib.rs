//! DriveCore - 侧链节点编排守护进程
//!
//! 单机管理 L1/L2 节点生命周期、分层确定性钱包与两阶段快速提现协议

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod service;

// 重新导出常用类型
pub use app_state::AppState;
pub use error::{AppError, AppErrorCode};

// 统一模块导出
pub mod prelude {
    pub use crate::{
        app_state::AppState,
        domain::{ChainDefinition, ChainRegistry, ChainStatus},
        error::{AppError, AppErrorCode},
    };
}
