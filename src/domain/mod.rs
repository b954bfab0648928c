//! Domain 模块
//!
//! 包含核心业务逻辑和领域模型

pub mod chain_registry;
pub mod lifecycle;
pub mod withdrawal;

// 重新导出常用类型
pub use chain_registry::{ChainDefinition, ChainRegistry, ChainType, ProbeKind};
pub use lifecycle::{ChainRuntimeState, ChainStatus, SyncHealth};
pub use withdrawal::{WithdrawalRequest, WithdrawalStatus};
