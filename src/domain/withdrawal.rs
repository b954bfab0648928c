//! 快速提现领域模型
//!
//! 两阶段提现协议的请求记录与状态机

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 1 BTC = 1e8 聪
pub const SATS_PER_COIN: f64 = 100_000_000.0;

/// 提现请求状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Requested,
    PaymentPending,
    Completed,
    Failed,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Requested => "requested",
            WithdrawalStatus::PaymentPending => "payment_pending",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WithdrawalStatus::Completed | WithdrawalStatus::Failed)
    }
}

/// 验证提现状态转换
///
/// ```text
/// Requested      -> PaymentPending | Failed
/// PaymentPending -> Completed | Failed
/// 终态不再转换；完成通知失败时保持 PaymentPending 以便重试
/// ```
pub fn validate_transition(
    from: WithdrawalStatus,
    to: WithdrawalStatus,
) -> anyhow::Result<()> {
    use WithdrawalStatus::*;

    let valid = match from {
        Requested => matches!(to, PaymentPending | Failed),
        PaymentPending => matches!(to, Completed | Failed),
        Completed | Failed => false,
    };

    if valid {
        Ok(())
    } else {
        anyhow::bail!(
            "Invalid withdrawal transition: {} -> {}",
            from.as_str(),
            to.as_str()
        )
    }
}

/// 用户实际需在 L2 支付的总额：提现额 + 服务端费用（聪换算）
pub fn total_amount(amount: f64, server_fee_sats: u64) -> f64 {
    amount + server_fee_sats as f64 / SATS_PER_COIN
}

/// 一次在途提现，以服务端签发的 hash 为关联 id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    /// 服务端签发的关联 id
    pub hash: String,
    /// 提现金额（L1 币）
    pub amount: f64,
    /// L1 目标地址
    pub destination_address: String,
    /// 扣款来源侧链
    pub layer2_chain: String,
    /// 服务端 L2 收款地址
    pub server_l2_address: String,
    /// 服务端费用（聪）
    pub server_fee_sats: u64,
    /// 用户需支付总额
    pub total_amount: f64,
    pub status: WithdrawalStatus,
    /// 完成通知携带的 L2 交易 id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l2_txid: Option<String>,
    /// 服务端确认消息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WithdrawalRequest {
    pub fn new(
        hash: String,
        amount: f64,
        destination_address: String,
        layer2_chain: String,
        server_l2_address: String,
        server_fee_sats: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            hash,
            total_amount: total_amount(amount, server_fee_sats),
            amount,
            destination_address,
            layer2_chain,
            server_l2_address,
            server_fee_sats,
            status: WithdrawalStatus::PaymentPending,
            l2_txid: None,
            confirmation: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 应用状态转换
    pub fn transition(&mut self, to: WithdrawalStatus) -> anyhow::Result<()> {
        validate_transition(self.status, to)?;
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}
