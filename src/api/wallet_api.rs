//! 钱包 API
//!
//! 主钱包创建/导入/删除，链钱包派生与启动器揭示

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
    error::AppError,
    service::wallet_engine::{
        AdvancedWalletOptions, ChainWalletInfo, MasterWalletInfo, StarterReveal, WalletEngine,
        WalletPreview,
    },
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 请求模型
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CreateMasterRequest {
    /// 助记词长度（12 或 24，默认 12）
    pub word_count: Option<u8>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ImportMasterRequest {
    pub mnemonic: String,
    #[serde(default)]
    pub passphrase: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// POST /api/v1/wallet/master
#[utoipa::path(
    post,
    path = "/api/v1/wallet/master",
    request_body = CreateMasterRequest,
    responses(
        (status = 200, description = "Master wallet created", body = MasterWalletInfo),
        (status = 409, description = "Master wallet already exists")
    )
)]
pub async fn create_master_wallet(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateMasterRequest>>,
) -> Result<Json<ApiResponse<MasterWalletInfo>>, AppError> {
    let word_count = body.and_then(|Json(b)| b.word_count);
    let info = state.wallet.create_master(word_count).await?;
    success_response(info)
}

/// POST /api/v1/wallet/master/import
#[utoipa::path(
    post,
    path = "/api/v1/wallet/master/import",
    request_body = ImportMasterRequest,
    responses(
        (status = 200, description = "Master wallet imported", body = MasterWalletInfo),
        (status = 400, description = "Invalid mnemonic"),
        (status = 409, description = "Master wallet already exists")
    )
)]
pub async fn import_master_wallet(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ImportMasterRequest>,
) -> Result<Json<ApiResponse<MasterWalletInfo>>, AppError> {
    let info = state
        .wallet
        .import_master(&body.mnemonic, &body.passphrase)
        .await?;
    success_response(info)
}

/// GET /api/v1/wallet/master
#[utoipa::path(
    get,
    path = "/api/v1/wallet/master",
    responses(
        (status = 200, description = "Master wallet info (no secrets)", body = MasterWalletInfo),
        (status = 404, description = "No master wallet")
    )
)]
pub async fn get_master_wallet(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<MasterWalletInfo>>, AppError> {
    success_response(state.wallet.get_master().await?)
}

/// DELETE /api/v1/wallet/master
///
/// 删除主钱包并作废所有已派生链钱包
#[utoipa::path(
    delete,
    path = "/api/v1/wallet/master",
    responses(
        (status = 200, description = "Master wallet deleted"),
        (status = 404, description = "No master wallet")
    )
)]
pub async fn delete_master_wallet(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<()>>, AppError> {
    state.wallet.delete_master().await?;
    success_response(())
}

/// POST /api/v1/wallet/chains/:id/derive
#[utoipa::path(
    post,
    path = "/api/v1/wallet/chains/{id}/derive",
    params(("id" = String, Path, description = "Chain id")),
    responses(
        (status = 200, description = "Chain wallet derived", body = ChainWalletInfo),
        (status = 404, description = "No master wallet")
    )
)]
pub async fn derive_chain_wallet(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<ChainWalletInfo>>, AppError> {
    success_response(state.wallet.derive_chain_wallet(&id).await?)
}

/// GET /api/v1/wallet/chains/:id
#[utoipa::path(
    get,
    path = "/api/v1/wallet/chains/{id}",
    params(("id" = String, Path, description = "Chain id")),
    responses(
        (status = 200, description = "Chain wallet info", body = ChainWalletInfo),
        (status = 404, description = "Not derived yet")
    )
)]
pub async fn get_chain_wallet(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<ChainWalletInfo>>, AppError> {
    success_response(state.wallet.get_chain_wallet(&id).await?)
}

/// GET /api/v1/wallet/starters/:starter_type
///
/// 单次只揭示一个助记词；互斥展示是消费方契约
#[utoipa::path(
    get,
    path = "/api/v1/wallet/starters/{starter_type}",
    params(("starter_type" = String, Path, description = "master | layer1 | thunder | bitnames | zside")),
    responses(
        (status = 200, description = "One revealed mnemonic", body = StarterReveal),
        (status = 404, description = "No master wallet")
    )
)]
pub async fn get_wallet_starter(
    State(state): State<Arc<AppState>>,
    Path(starter_type): Path<String>,
) -> Result<Json<ApiResponse<StarterReveal>>, AppError> {
    success_response(state.wallet.get_wallet_starter(&starter_type).await?)
}

/// POST /api/v1/wallet/preview
///
/// 预览：不持久化任何内容
#[utoipa::path(
    post,
    path = "/api/v1/wallet/preview",
    request_body = AdvancedWalletOptions,
    responses(
        (status = 200, description = "Wallet preview", body = WalletPreview)
    )
)]
pub async fn preview_wallet(
    State(state): State<Arc<AppState>>,
    body: Option<Json<AdvancedWalletOptions>>,
) -> Result<Json<ApiResponse<WalletPreview>>, AppError> {
    let options = body.map(|Json(b)| b).unwrap_or_default();
    success_response(state.wallet.preview_wallet(options).await?)
}

/// POST /api/v1/wallet/advanced
#[utoipa::path(
    post,
    path = "/api/v1/wallet/advanced",
    request_body = AdvancedWalletOptions,
    responses(
        (status = 200, description = "Master wallet created from chosen parameters", body = MasterWalletInfo),
        (status = 409, description = "Master wallet already exists")
    )
)]
pub async fn create_advanced_wallet(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AdvancedWalletOptions>,
) -> Result<Json<ApiResponse<MasterWalletInfo>>, AppError> {
    success_response(state.wallet.create_advanced_wallet(body).await?)
}

/// GET /api/v1/wallet/entropy
#[utoipa::path(
    get,
    path = "/api/v1/wallet/entropy",
    responses(
        (status = 200, description = "16 bytes of fresh entropy (hex)")
    )
)]
pub async fn generate_random_entropy(
    State(_state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    success_response(serde_json::json!({
        "entropy": WalletEngine::generate_random_entropy()
    }))
}
