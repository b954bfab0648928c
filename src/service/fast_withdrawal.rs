//! 快速提现协调器
//!
//! 两阶段协议：先向结算服务请求提现（拿到关联 hash、服务端 L2
//! 收款地址与费用），用户完成 L2 支付后再提交交易 id 通知完成。
//! 卡在 payment_pending 的请求不做自动对账轮询，由调用方手动重试。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;

use crate::domain::chain_registry::{ChainRegistry, ChainType};
use crate::domain::withdrawal::{WithdrawalRequest, WithdrawalStatus};
use crate::error::AppError;
use crate::infrastructure::event_bus::{EventBus, OrchestratorEvent};
use crate::service::settlement_client::{SettlementClient, FAST_WITHDRAWAL_SERVICE};

/// 阶段一响应
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct WithdrawalReceipt {
    pub hash: String,
    pub server_l2_address: String,
    pub server_fee_sats: u64,
    /// 用户实际需在 L2 支付的总额
    pub total_amount: f64,
}

/// 阶段二响应
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct CompletionMessage {
    pub message: String,
}

pub struct FastWithdrawalService {
    settlement: Arc<SettlementClient>,
    registry: Arc<ChainRegistry>,
    events: Arc<EventBus>,
    requests: RwLock<HashMap<String, WithdrawalRequest>>,
}

impl FastWithdrawalService {
    pub fn new(
        settlement: Arc<SettlementClient>,
        registry: Arc<ChainRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            settlement,
            registry,
            events,
            requests: RwLock::new(HashMap::new()),
        }
    }

    /// 阶段一：请求提现
    ///
    /// 无效输入快速失败，不发起任何网络往返。
    pub async fn request_withdrawal(
        &self,
        destination: &str,
        amount: f64,
        layer2_chain: &str,
    ) -> Result<WithdrawalReceipt, AppError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(AppError::invalid_amount(
                "Amount must be greater than 0".to_string(),
            ));
        }
        if destination.trim().is_empty() {
            return Err(AppError::invalid_address(
                "Please enter a valid withdrawal address".to_string(),
            ));
        }

        let chain_id = layer2_chain.to_lowercase();
        let def = self
            .registry
            .get(&chain_id)
            .ok_or_else(|| AppError::not_found(format!("Unknown chain: {}", layer2_chain)))?;
        if def.chain_type != ChainType::L2 {
            return Err(AppError::chain_not_supported(format!(
                "Chain '{}' is not a Layer-2 chain",
                layer2_chain
            )));
        }

        let response = self
            .settlement
            .call(
                FAST_WITHDRAWAL_SERVICE,
                "RequestWithdrawal",
                json!({
                    "destination": destination,
                    "amount": amount,
                    "layer_2_chain": def.id,
                }),
            )
            .await
            .map_err(|e| AppError::settlement_unavailable(e.to_string()))?;

        let hash = response
            .get("hash")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AppError::invalid_server_response(
                    "Invalid server response: Missing withdrawal hash".to_string(),
                )
            })?
            .to_string();
        let server_l2_address = response
            .get("server_l2_address")
            .and_then(|v| v.get("info"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AppError::invalid_server_response(
                    "Invalid server response: Missing L2 address".to_string(),
                )
            })?
            .to_string();
        let server_fee_sats = response
            .get("server_fee_sats")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                AppError::invalid_server_response(
                    "Invalid server response: Missing server fee".to_string(),
                )
            })?;

        let request = WithdrawalRequest::new(
            hash.clone(),
            amount,
            destination.to_string(),
            def.id.clone(),
            server_l2_address.clone(),
            server_fee_sats,
        );
        let receipt = WithdrawalReceipt {
            hash: hash.clone(),
            server_l2_address,
            server_fee_sats,
            total_amount: request.total_amount,
        };

        self.requests.write().await.insert(hash.clone(), request);

        tracing::info!(hash = %hash, chain = %def.id, amount = amount, "Withdrawal requested");
        self.events
            .publish(OrchestratorEvent::WithdrawalUpdated {
                hash,
                status: WithdrawalStatus::PaymentPending,
            })
            .await;

        Ok(receipt)
    }

    /// 阶段二：通知 L2 支付完成
    ///
    /// 对同一 (hash, txid) 幂等：已完成的请求重复提交直接返回既有
    /// 确认，不产生第二次结算调用。失败时请求保持 payment_pending，
    /// 调用方可安全重试。
    pub async fn notify_payment_complete(
        &self,
        hash: &str,
        l2_txid: &str,
    ) -> Result<CompletionMessage, AppError> {
        if l2_txid.trim().is_empty() {
            return Err(AppError::bad_request(
                "Please enter your L2 payment transaction ID".to_string(),
            ));
        }

        // 全程持有写锁，同一 hash 的并发完成通知串行化
        let mut requests = self.requests.write().await;
        let request = requests.get_mut(hash).ok_or_else(|| {
            AppError::not_found(format!("Unknown withdrawal hash: {}", hash))
        })?;

        if request.status == WithdrawalStatus::Completed {
            if request.l2_txid.as_deref() == Some(l2_txid) {
                // 幂等重放
                return Ok(CompletionMessage {
                    message: request.confirmation.clone().unwrap_or_default(),
                });
            }
            return Err(AppError::state_conflict(format!(
                "Withdrawal {} already completed with a different txid",
                hash
            )));
        }

        let response = self
            .settlement
            .call(
                FAST_WITHDRAWAL_SERVICE,
                "NotifyPaymentComplete",
                json!({ "hash": hash, "txid": l2_txid }),
            )
            .await
            .map_err(|e| {
                // 请求保持 payment_pending 以便重试
                AppError::settlement_unavailable(e.to_string())
            })?;

        let message = response
            .get("message")
            .and_then(|v| v.get("info"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AppError::invalid_server_response(
                    "Invalid server response: Missing confirmation message".to_string(),
                )
            })?
            .to_string();

        request
            .transition(WithdrawalStatus::Completed)
            .map_err(|e| AppError::state_conflict(e.to_string()))?;
        request.l2_txid = Some(l2_txid.to_string());
        request.confirmation = Some(message.clone());
        drop(requests);

        tracing::info!(hash = %hash, txid = %l2_txid, "Withdrawal completed");
        self.events
            .publish(OrchestratorEvent::WithdrawalUpdated {
                hash: hash.to_string(),
                status: WithdrawalStatus::Completed,
            })
            .await;

        Ok(CompletionMessage { message })
    }

    /// 查询单个提现请求
    pub async fn get(&self, hash: &str) -> Result<WithdrawalRequest, AppError> {
        self.requests
            .read()
            .await
            .get(hash)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("Unknown withdrawal hash: {}", hash)))
    }

    /// 列出全部提现请求
    pub async fn list(&self) -> Vec<WithdrawalRequest> {
        self.requests.read().await.values().cloned().collect()
    }
}
