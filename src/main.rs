//! DriveCore 主入口
//! 侧链节点编排守护进程

use std::sync::Arc;

use anyhow::{Context, Result};
use drivecore::{api, app_state::AppState, config::Config, infrastructure::logging};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载环境变量与配置（配置文件优先级更高）
    dotenvy::dotenv().ok();
    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = Config::from_env_and_file(config_path.as_deref())
        .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // 2. 初始化日志
    logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!("Starting DriveCore orchestration daemon");

    // 3. 初始化应用状态
    // 注册表校验失败（依赖环、未知依赖）在这里直接拒绝启动
    let config = Arc::new(config);
    let state = Arc::new(AppState::new(config.clone()).await?);
    tracing::info!(
        chains = state.registry.ids().len(),
        base_dir = %config.paths.base_dir.display(),
        "Chain registry loaded"
    );

    // 4. 启动 HTTP 服务
    let app = api::routes(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    tracing::info!(addr = %config.server.bind_addr, "DriveCore listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .context("Server error")?;

    // 5. 退出前按依赖反序停掉所有活跃链
    tracing::info!("Shutting down, stopping managed chains");
    state.supervisor.shutdown_all().await;
    tracing::info!("DriveCore stopped");

    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install shutdown handler: {}", e);
        return;
    }

    // 进行中的下载在退出前显式告知
    let downloads = state.downloads.list_active().await;
    if !downloads.is_empty() {
        for d in &downloads {
            tracing::warn!(
                chain_id = %d.chain_id,
                percent = d.percent,
                "Download in progress will be interrupted by shutdown"
            );
        }
    }

    tracing::info!("Shutdown signal received");
}
