//! 链编排 API
//!
//! 下载/启动/停止/重置链，查询状态与区块高度

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    api::response::{success_response, ApiResponse},
    app_state::AppState,
    error::AppError,
    service::download_manager::DownloadInfo,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 请求/响应模型
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize, ToSchema)]
pub struct ChainOverview {
    pub id: String,
    pub display_name: String,
    pub chain_type: String,
    pub dependencies: Vec<String>,
    pub repo_url: String,
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChainStatusResponse {
    pub chain_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BlockCountResponse {
    pub chain_id: String,
    pub block_count: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChainDirsResponse {
    pub chain_id: String,
    pub data_dir: String,
    pub wallet_dir: String,
    pub binary_dir: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct StartChainRequest {
    /// 追加在链基础参数之后的启动参数
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct StopChainRequest {
    /// 有运行中依赖方时需显式确认；依赖方不会被级联停止
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AckResponse {
    pub chain_id: String,
    pub accepted: bool,
}

fn ack(chain_id: &str) -> Result<Json<ApiResponse<AckResponse>>, AppError> {
    success_response(AckResponse {
        chain_id: chain_id.to_string(),
        accepted: true,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// GET /api/v1/chains
///
/// 列出所有受管链及当前状态
#[utoipa::path(
    get,
    path = "/api/v1/chains",
    responses(
        (status = 200, description = "Chain catalog", body = [ChainOverview])
    )
)]
pub async fn list_chains(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<ChainOverview>>>, AppError> {
    let snapshot = state.store.snapshot_all().await;

    let chains = state
        .registry
        .list_all()
        .into_iter()
        .map(|def| ChainOverview {
            id: def.id.clone(),
            display_name: def.display_name.clone(),
            chain_type: format!("{:?}", def.chain_type).to_lowercase(),
            dependencies: def.dependencies.clone(),
            repo_url: def.repo_url.clone(),
            status: snapshot
                .get(&def.id)
                .map(|s| s.status.as_str())
                .unwrap_or("not_downloaded")
                .to_string(),
        })
        .collect();

    success_response(chains)
}

/// GET /api/v1/chains/:id/status
#[utoipa::path(
    get,
    path = "/api/v1/chains/{id}/status",
    params(("id" = String, Path, description = "Chain id")),
    responses(
        (status = 200, description = "Chain runtime state", body = ChainStatusResponse),
        (status = 404, description = "Unknown chain")
    )
)]
pub async fn get_chain_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<ChainStatusResponse>>, AppError> {
    let snapshot = state.store.snapshot(&id).await?;
    success_response(ChainStatusResponse {
        chain_id: id,
        status: snapshot.status.as_str().to_string(),
        download_progress: snapshot.download_progress,
        block_height: snapshot.block_height,
    })
}

/// GET /api/v1/chains/:id/block-count
#[utoipa::path(
    get,
    path = "/api/v1/chains/{id}/block-count",
    params(("id" = String, Path, description = "Chain id")),
    responses(
        (status = 200, description = "Current block height", body = BlockCountResponse)
    )
)]
pub async fn get_chain_block_count(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<BlockCountResponse>>, AppError> {
    let block_count = state.chain_block_count(&id).await?;
    success_response(BlockCountResponse {
        chain_id: id,
        block_count,
    })
}

/// GET /api/v1/chains/:id/dirs
#[utoipa::path(
    get,
    path = "/api/v1/chains/{id}/dirs",
    params(("id" = String, Path, description = "Chain id")),
    responses(
        (status = 200, description = "Chain filesystem layout", body = ChainDirsResponse)
    )
)]
pub async fn get_chain_dirs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<ChainDirsResponse>>, AppError> {
    let def = state
        .registry
        .get(&id)
        .ok_or_else(|| AppError::not_found(format!("Unknown chain: {}", id)))?;
    let base = &state.config.paths.base_dir;

    success_response(ChainDirsResponse {
        chain_id: id.clone(),
        data_dir: def.data_dir(base).display().to_string(),
        wallet_dir: base.join("wallets").display().to_string(),
        binary_dir: def.binary_dir(base).display().to_string(),
    })
}

/// POST /api/v1/chains/:id/download
#[utoipa::path(
    post,
    path = "/api/v1/chains/{id}/download",
    params(("id" = String, Path, description = "Chain id")),
    responses(
        (status = 200, description = "Download started", body = AckResponse),
        (status = 409, description = "Already in progress or state conflict")
    )
)]
pub async fn download_chain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AckResponse>>, AppError> {
    state.downloads.start(&id).await?;
    ack(&id)
}

/// POST /api/v1/chains/:id/download/pause
#[utoipa::path(
    post,
    path = "/api/v1/chains/{id}/download/pause",
    params(("id" = String, Path, description = "Chain id")),
    responses(
        (status = 200, description = "Download paused", body = AckResponse),
        (status = 404, description = "No such download")
    )
)]
pub async fn pause_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AckResponse>>, AppError> {
    state.downloads.pause(&id).await?;
    ack(&id)
}

/// POST /api/v1/chains/:id/download/resume
#[utoipa::path(
    post,
    path = "/api/v1/chains/{id}/download/resume",
    params(("id" = String, Path, description = "Chain id")),
    responses(
        (status = 200, description = "Download resumed", body = AckResponse),
        (status = 404, description = "No such download")
    )
)]
pub async fn resume_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AckResponse>>, AppError> {
    state.downloads.resume(&id).await?;
    ack(&id)
}

/// GET /api/v1/downloads
#[utoipa::path(
    get,
    path = "/api/v1/downloads",
    responses(
        (status = 200, description = "Active downloads", body = [DownloadInfo])
    )
)]
pub async fn get_downloads(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<DownloadInfo>>>, AppError> {
    success_response(state.downloads.list_active().await)
}

/// POST /api/v1/chains/:id/start
#[utoipa::path(
    post,
    path = "/api/v1/chains/{id}/start",
    params(("id" = String, Path, description = "Chain id")),
    request_body = StartChainRequest,
    responses(
        (status = 200, description = "Chain starting", body = AckResponse),
        (status = 409, description = "Missing dependencies")
    )
)]
pub async fn start_chain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<StartChainRequest>>,
) -> Result<Json<ApiResponse<AckResponse>>, AppError> {
    let args = body.map(|Json(b)| b.args).unwrap_or_default();
    state.supervisor.start(&id, args).await?;
    ack(&id)
}

/// POST /api/v1/chains/:id/stop
#[utoipa::path(
    post,
    path = "/api/v1/chains/{id}/stop",
    params(("id" = String, Path, description = "Chain id")),
    request_body = StopChainRequest,
    responses(
        (status = 200, description = "Chain stopping", body = AckResponse),
        (status = 409, description = "Blocked by dependents")
    )
)]
pub async fn stop_chain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<StopChainRequest>>,
) -> Result<Json<ApiResponse<AckResponse>>, AppError> {
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    state.supervisor.stop(&id, force).await?;
    ack(&id)
}

/// POST /api/v1/chains/:id/reset
#[utoipa::path(
    post,
    path = "/api/v1/chains/{id}/reset",
    params(("id" = String, Path, description = "Chain id")),
    responses(
        (status = 200, description = "Chain reset", body = AckResponse),
        (status = 409, description = "State conflict (reset mid-transition)")
    )
)]
pub async fn reset_chain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AckResponse>>, AppError> {
    state.reset_chain(&id).await?;
    ack(&id)
}
