use std::{sync::Arc, time::Instant};

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::from_fn,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::Level;
use utoipa::OpenApi;
use uuid::Uuid;

use crate::app_state::AppState;

pub mod chain_api;
pub mod events_api;
pub mod response; // 统一响应格式
pub mod wallet_api;
pub mod withdrawal_api;

#[derive(OpenApi)]
#[openapi(
    paths(
        chain_api::list_chains,
        chain_api::get_chain_status,
        chain_api::get_chain_block_count,
        chain_api::get_chain_dirs,
        chain_api::download_chain,
        chain_api::pause_download,
        chain_api::resume_download,
        chain_api::get_downloads,
        chain_api::start_chain,
        chain_api::stop_chain,
        chain_api::reset_chain,
        wallet_api::create_master_wallet,
        wallet_api::import_master_wallet,
        wallet_api::get_master_wallet,
        wallet_api::delete_master_wallet,
        wallet_api::derive_chain_wallet,
        wallet_api::get_chain_wallet,
        wallet_api::get_wallet_starter,
        wallet_api::preview_wallet,
        wallet_api::create_advanced_wallet,
        wallet_api::generate_random_entropy,
        withdrawal_api::request_withdrawal,
        withdrawal_api::notify_payment_complete,
        withdrawal_api::get_withdrawal,
        withdrawal_api::list_withdrawals,
        events_api::subscribe_events,
        events_api::get_event_history,
    ),
    components(
        schemas(
            chain_api::ChainOverview,
            chain_api::ChainStatusResponse,
            chain_api::BlockCountResponse,
            chain_api::ChainDirsResponse,
            chain_api::StartChainRequest,
            chain_api::StopChainRequest,
            chain_api::AckResponse,
            wallet_api::CreateMasterRequest,
            wallet_api::ImportMasterRequest,
            withdrawal_api::RequestWithdrawalBody,
            withdrawal_api::NotifyPaymentBody,
            crate::service::download_manager::DownloadInfo,
            crate::service::wallet_engine::MasterWalletInfo,
            crate::service::wallet_engine::ChainWalletInfo,
            crate::service::wallet_engine::WalletPreview,
            crate::service::wallet_engine::StarterReveal,
            crate::service::wallet_engine::AdvancedWalletOptions,
            crate::service::fast_withdrawal::WithdrawalReceipt,
            crate::service::fast_withdrawal::CompletionMessage,
        )
    ),
    tags(
        (name = "DriveCore API", description = "Sidechain node orchestration daemon")
    )
)]
struct ApiDoc;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        // 链编排
        .route("/api/v1/chains", get(chain_api::list_chains))
        .route("/api/v1/chains/:id/status", get(chain_api::get_chain_status))
        .route(
            "/api/v1/chains/:id/block-count",
            get(chain_api::get_chain_block_count),
        )
        .route("/api/v1/chains/:id/dirs", get(chain_api::get_chain_dirs))
        .route("/api/v1/chains/:id/download", post(chain_api::download_chain))
        .route(
            "/api/v1/chains/:id/download/pause",
            post(chain_api::pause_download),
        )
        .route(
            "/api/v1/chains/:id/download/resume",
            post(chain_api::resume_download),
        )
        .route("/api/v1/downloads", get(chain_api::get_downloads))
        .route("/api/v1/chains/:id/start", post(chain_api::start_chain))
        .route("/api/v1/chains/:id/stop", post(chain_api::stop_chain))
        .route("/api/v1/chains/:id/reset", post(chain_api::reset_chain))
        // 钱包
        .route(
            "/api/v1/wallet/master",
            post(wallet_api::create_master_wallet)
                .get(wallet_api::get_master_wallet)
                .delete(wallet_api::delete_master_wallet),
        )
        .route(
            "/api/v1/wallet/master/import",
            post(wallet_api::import_master_wallet),
        )
        .route(
            "/api/v1/wallet/chains/:id/derive",
            post(wallet_api::derive_chain_wallet),
        )
        .route("/api/v1/wallet/chains/:id", get(wallet_api::get_chain_wallet))
        .route(
            "/api/v1/wallet/starters/:starter_type",
            get(wallet_api::get_wallet_starter),
        )
        .route("/api/v1/wallet/preview", post(wallet_api::preview_wallet))
        .route(
            "/api/v1/wallet/advanced",
            post(wallet_api::create_advanced_wallet),
        )
        .route(
            "/api/v1/wallet/entropy",
            get(wallet_api::generate_random_entropy),
        )
        // 快速提现
        .route(
            "/api/v1/withdrawals",
            post(withdrawal_api::request_withdrawal).get(withdrawal_api::list_withdrawals),
        )
        .route(
            "/api/v1/withdrawals/:hash",
            get(withdrawal_api::get_withdrawal),
        )
        .route(
            "/api/v1/withdrawals/:hash/complete",
            post(withdrawal_api::notify_payment_complete),
        )
        // 事件推送
        .route("/api/v1/events", get(events_api::subscribe_events))
        .route("/api/v1/events/history", get(events_api::get_event_history))
        // 健康检查
        .route("/health", get(health))
        .merge(utoipa_swagger_ui::SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        // 观测中间件
        .layer(
            ServiceBuilder::new()
                .layer(from_fn(set_request_id))
                .layer(from_fn(trace_log)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "drivecore",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn set_request_id(mut req: Request, next: axum::middleware::Next) -> Response {
    let req_id = Uuid::new_v4().to_string();
    req.headers_mut().insert(
        "x-request-id",
        HeaderValue::from_str(&req_id).unwrap_or(HeaderValue::from_static("gen-failed")),
    );
    let mut resp = next.run(req).await;
    resp.headers_mut().insert(
        "x-request-id",
        HeaderValue::from_str(&req_id).unwrap_or(HeaderValue::from_static("gen-failed")),
    );
    resp
}

async fn trace_log(req: Request, next: axum::middleware::Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let req_id = req
        .headers()
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let resp = next.run(req).await;
    let status = resp.status();
    let elapsed = start.elapsed().as_millis();
    tracing::event!(Level::INFO, request_id=%req_id, method=%method, path=%path, status=%status.as_u16(), elapsed_ms=%elapsed, "http_request");
    resp
}
