//! 测试辅助模块
//! 提供测试环境构建和模拟服务

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::post, Json, Router};
use drivecore::app_state::AppState;
use drivecore::config::{
    Config, DownloadConfig, LoggingConfig, PathsConfig, ServerConfig, SettlementConfig,
};
use drivecore::domain::lifecycle::ChainStatus;
use serde_json::{json, Value};
use tempfile::TempDir;

/// 测试环境：AppState + 独立的临时基目录
pub struct TestEnv {
    pub state: Arc<AppState>,
    // 保持临时目录存活到测试结束
    pub _base_dir: TempDir,
}

/// 构建指向模拟服务的测试应用状态
pub async fn test_state(settlement_url: &str, release_url: &str) -> TestEnv {
    let base_dir = tempfile::tempdir().expect("Failed to create temp dir");

    let config = Config {
        server: ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
        },
        logging: LoggingConfig {
            level: "info".into(),
            format: "text".into(),
        },
        settlement: SettlementConfig {
            base_url: settlement_url.into(),
            connect_timeout_secs: 5,
        },
        downloads: DownloadConfig {
            release_base_url: release_url.into(),
            max_retries: 2,
            retry_delay_ms: 50,
        },
        paths: PathsConfig {
            base_dir: base_dir.path().to_path_buf(),
        },
    };

    let state = AppState::new(Arc::new(config))
        .await
        .expect("Failed to build AppState");

    TestEnv {
        state: Arc::new(state),
        _base_dir: base_dir,
    }
}

/// 通过状态机把链驱动到 running（不真正起进程）
pub async fn drive_to_running(state: &AppState, chain_id: &str) {
    for status in [
        ChainStatus::Downloading,
        ChainStatus::Extracting,
        ChainStatus::Downloaded,
        ChainStatus::Starting,
        ChainStatus::Running,
    ] {
        state.store.transition(chain_id, status).await.unwrap();
    }
}

/// 轮询等待链到达目标状态
pub async fn wait_for_status(
    state: &AppState,
    chain_id: &str,
    expected: ChainStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if state.store.status(chain_id).await.unwrap() == expected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// 模拟结算服务状态
#[derive(Default)]
pub struct MockSettlement {
    pub complete_calls: AtomicUsize,
}

/// 启动模拟结算服务，返回 (base_url, 调用计数)
pub async fn mock_settlement_server() -> (String, Arc<MockSettlement>) {
    let mock = Arc::new(MockSettlement::default());

    async fn request_withdrawal(Json(body): Json<Value>) -> Json<Value> {
        assert!(body.get("destination").is_some());
        Json(json!({
            "hash": "test-withdrawal-hash",
            "server_l2_address": { "info": "l2-server-address" },
            "server_fee_sats": 2000u64,
        }))
    }

    async fn notify_complete(
        State(mock): State<Arc<MockSettlement>>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        assert!(body.get("txid").is_some());
        mock.complete_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Json(json!({ "message": { "info": "Withdrawal paid out on L1" } }))
    }

    async fn blockchain_info() -> Json<Value> {
        Json(json!({ "blocks": 4242i64, "chain": "signet" }))
    }

    let app = Router::new()
        .route(
            "/fastwithdraw.v1.FastWithdrawalService/RequestWithdrawal",
            post(request_withdrawal),
        )
        .route(
            "/fastwithdraw.v1.FastWithdrawalService/NotifyPaymentComplete",
            post(notify_complete),
        )
        .route(
            "/bitcoind.v1.BitcoindService/GetBlockchainInfo",
            post(blockchain_info),
        )
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock settlement server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (format!("http://{}", addr), mock)
}

/// 构造内存中的 tar.gz 发布归档，内含一个可执行文件
pub fn make_release_archive(binary_name: &str, content: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let encoder = flate2::write::GzEncoder::new(&mut buf, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, binary_name, content)
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }
    buf
}

/// 启动模拟发布服务器：任意路径都返回给定归档
pub async fn mock_release_server(archive: Vec<u8>) -> String {
    use axum::routing::get;

    let app = Router::new().route(
        "/*path",
        get(move || {
            let bytes = archive.clone();
            async move { bytes }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock release server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    format!("http://{}", addr)
}

/// 节流发布服务器收到的请求记录：每个请求的 Range 起始偏移
#[derive(Default)]
pub struct MockRelease {
    pub range_offsets: std::sync::Mutex<Vec<Option<u64>>>,
}

/// 生成弱可压缩的伪随机内容（xorshift），保证归档体积可控
pub fn pseudo_random_bytes(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state & 0xff) as u8
        })
        .collect()
}

/// 启动节流发布服务器：按 4KB 块、40ms 间隔流式下发，支持 Range 续传
pub async fn mock_throttled_release_server(archive: Vec<u8>) -> (String, Arc<MockRelease>) {
    use axum::body::Body;
    use axum::http::{header, HeaderMap, Response, StatusCode};
    use axum::routing::get;

    let mock = Arc::new(MockRelease::default());
    let mock_for_handler = mock.clone();

    let app = Router::new().route(
        "/*path",
        get(move |headers: HeaderMap| {
            let mock = mock_for_handler.clone();
            let bytes = archive.clone();
            async move {
                let offset = headers
                    .get(header::RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.strip_prefix("bytes="))
                    .and_then(|s| s.strip_suffix('-'))
                    .and_then(|s| s.parse::<u64>().ok());
                mock.range_offsets.lock().unwrap().push(offset);

                let start = (offset.unwrap_or(0) as usize).min(bytes.len());
                let tail = bytes[start..].to_vec();
                let total = tail.len();

                let stream = futures::stream::unfold((tail, 0usize), |(data, pos)| async move {
                    if pos >= data.len() {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    let end = (pos + 4096).min(data.len());
                    let chunk = data[pos..end].to_vec();
                    Some((Ok::<_, std::io::Error>(chunk), (data, end)))
                });

                let status = if offset.is_some() {
                    StatusCode::PARTIAL_CONTENT
                } else {
                    StatusCode::OK
                };
                Response::builder()
                    .status(status)
                    .header(header::CONTENT_LENGTH, total)
                    .body(Body::from_stream(stream))
                    .unwrap()
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind throttled release server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (format!("http://{}", addr), mock)
}
