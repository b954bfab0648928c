//! 快速提现 API
//!
//! 两阶段协议：请求提现，支付完成后通知结算服务

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::{
    api::response::{success_response, ApiResponse},
    app_state::AppState,
    domain::withdrawal::WithdrawalRequest,
    error::AppError,
    service::fast_withdrawal::{CompletionMessage, WithdrawalReceipt},
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 请求模型
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize, ToSchema)]
pub struct RequestWithdrawalBody {
    /// L1 目标地址
    pub destination: String,
    /// 提现金额（L1 币）
    pub amount: f64,
    /// 扣款来源侧链
    pub layer2_chain: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct NotifyPaymentBody {
    /// L2 支付交易 id
    pub txid: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// POST /api/v1/withdrawals
///
/// 阶段一：请求提现。无效输入在任何网络往返前快速失败。
#[utoipa::path(
    post,
    path = "/api/v1/withdrawals",
    request_body = RequestWithdrawalBody,
    responses(
        (status = 200, description = "Withdrawal requested", body = WithdrawalReceipt),
        (status = 400, description = "Invalid amount or address"),
        (status = 502, description = "Invalid server response")
    )
)]
pub async fn request_withdrawal(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RequestWithdrawalBody>,
) -> Result<Json<ApiResponse<WithdrawalReceipt>>, AppError> {
    let receipt = state
        .withdrawals
        .request_withdrawal(&body.destination, body.amount, &body.layer2_chain)
        .await?;
    success_response(receipt)
}

/// POST /api/v1/withdrawals/:hash/complete
///
/// 阶段二：通知 L2 支付完成。同一 (hash, txid) 可安全重复提交。
#[utoipa::path(
    post,
    path = "/api/v1/withdrawals/{hash}/complete",
    params(("hash" = String, Path, description = "Withdrawal correlation hash")),
    request_body = NotifyPaymentBody,
    responses(
        (status = 200, description = "Withdrawal completed", body = CompletionMessage),
        (status = 404, description = "Unknown withdrawal hash"),
        (status = 503, description = "Settlement service unavailable, retry later")
    )
)]
pub async fn notify_payment_complete(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    Json(body): Json<NotifyPaymentBody>,
) -> Result<Json<ApiResponse<CompletionMessage>>, AppError> {
    let message = state
        .withdrawals
        .notify_payment_complete(&hash, &body.txid)
        .await?;
    success_response(message)
}

/// GET /api/v1/withdrawals/:hash
#[utoipa::path(
    get,
    path = "/api/v1/withdrawals/{hash}",
    params(("hash" = String, Path, description = "Withdrawal correlation hash")),
    responses(
        (status = 200, description = "Withdrawal request"),
        (status = 404, description = "Unknown withdrawal hash")
    )
)]
pub async fn get_withdrawal(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<Json<ApiResponse<WithdrawalRequest>>, AppError> {
    success_response(state.withdrawals.get(&hash).await?)
}

/// GET /api/v1/withdrawals
#[utoipa::path(
    get,
    path = "/api/v1/withdrawals",
    responses(
        (status = 200, description = "All withdrawal requests")
    )
)]
pub async fn list_withdrawals(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<WithdrawalRequest>>>, AppError> {
    success_response(state.withdrawals.list().await)
}
