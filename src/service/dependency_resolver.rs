//! 依赖解析器
//!
//! 启动前计算缺失前置、停止前计算反向依赖。集合基于调用瞬间的
//! 注册表与运行时快照；检查与执行之间的竞态由健康探测兜底暴露。

use std::sync::Arc;

use crate::domain::chain_registry::ChainRegistry;
use crate::error::AppError;
use crate::service::chain_state::ChainStateStore;

pub struct DependencyResolver {
    registry: Arc<ChainRegistry>,
    store: Arc<ChainStateStore>,
}

impl DependencyResolver {
    pub fn new(registry: Arc<ChainRegistry>, store: Arc<ChainStateStore>) -> Self {
        Self { registry, store }
    }

    /// 启动缺失的依赖集合：dependencies(id) \ {running, ready}
    ///
    /// 无依赖的链恒为空集。
    pub async fn missing_dependencies(&self, chain_id: &str) -> Result<Vec<String>, AppError> {
        let def = self
            .registry
            .get(chain_id)
            .ok_or_else(|| AppError::not_found(format!("Unknown chain: {}", chain_id)))?;

        let mut missing = Vec::new();
        for dep in &def.dependencies {
            let status = self.store.status(dep).await?;
            if !status.is_running_or_ready() {
                missing.push(dep.clone());
            }
        }
        Ok(missing)
    }

    /// 处于 starting/running/ready 的反向依赖集合
    pub async fn running_dependents(&self, chain_id: &str) -> Result<Vec<String>, AppError> {
        if self.registry.get(chain_id).is_none() {
            return Err(AppError::not_found(format!("Unknown chain: {}", chain_id)));
        }

        let mut dependents = Vec::new();
        for def in self.registry.list_all() {
            if def.dependencies.iter().any(|d| d == chain_id) {
                let status = self.store.status(&def.id).await?;
                if status.is_active() {
                    dependents.push(def.id.clone());
                }
            }
        }
        Ok(dependents)
    }

    /// 启动门控：依赖缺失时拒绝，不产生任何状态转换
    pub async fn gate_start(&self, chain_id: &str) -> Result<(), AppError> {
        let missing = self.missing_dependencies(chain_id).await?;
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::missing_dependencies(chain_id, &missing))
        }
    }

    /// 停止门控
    ///
    /// 有运行中依赖方且未显式 force 时拒绝。force=true 只停目标链，
    /// 依赖方保持运行（降级运行，由健康探测暴露），不做级联停止。
    pub async fn gate_stop(&self, chain_id: &str, force: bool) -> Result<(), AppError> {
        let dependents = self.running_dependents(chain_id).await?;
        if dependents.is_empty() || force {
            Ok(())
        } else {
            Err(AppError::blocked_by_dependents(chain_id, &dependents))
        }
    }
}
