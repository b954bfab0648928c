//! 下载管理器
//!
//! 拉取链的二进制发布包：按块流式写入暂存文件，支持块间协作式
//! 暂停/恢复（HTTP Range 续传），完成后解包并校验二进制。
//! 不同链的下载并发进行，互不影响，无全局上限。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::header::RANGE;
use reqwest::StatusCode;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::DownloadConfig;
use crate::domain::chain_registry::{ChainDefinition, ChainRegistry};
use crate::domain::lifecycle::ChainStatus;
use crate::error::AppError;
use crate::infrastructure::event_bus::{EventBus, OrchestratorEvent};
use crate::service::chain_state::ChainStateStore;

/// 暂停轮询间隔
const PAUSE_POLL_MS: u64 = 250;

/// 单个下载任务的共享句柄
#[derive(Clone)]
struct DownloadHandle {
    total_bytes: Arc<AtomicU64>,
    received_bytes: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl DownloadHandle {
    fn new() -> Self {
        Self {
            total_bytes: Arc::new(AtomicU64::new(0)),
            received_bytes: Arc::new(AtomicU64::new(0)),
            paused: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn percent(&self) -> u8 {
        let total = self.total_bytes.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let received = self.received_bytes.load(Ordering::Relaxed);
        ((received.saturating_mul(100)) / total).min(100) as u8
    }
}

/// 活跃下载的对外视图
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct DownloadInfo {
    pub chain_id: String,
    pub percent: u8,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub paused: bool,
}

#[derive(Clone)]
pub struct DownloadManager {
    registry: Arc<ChainRegistry>,
    store: Arc<ChainStateStore>,
    events: Arc<EventBus>,
    config: DownloadConfig,
    base_dir: PathBuf,
    http: reqwest::Client,
    tasks: Arc<Mutex<HashMap<String, DownloadHandle>>>,
}

impl DownloadManager {
    pub fn new(
        registry: Arc<ChainRegistry>,
        store: Arc<ChainStateStore>,
        events: Arc<EventBus>,
        config: DownloadConfig,
        base_dir: PathBuf,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            registry,
            store,
            events,
            config,
            base_dir,
            http,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 启动一条链的下载
    pub async fn start(&self, chain_id: &str) -> Result<(), AppError> {
        let def = self
            .registry
            .get(chain_id)
            .ok_or_else(|| AppError::not_found(format!("Unknown chain: {}", chain_id)))?
            .clone();

        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(chain_id) {
            return Err(AppError::already_in_progress(format!(
                "Download already in progress for chain '{}'",
                chain_id
            )));
        }

        // not_downloaded -> downloading；其余状态发起下载属于冲突
        self.store
            .transition(chain_id, ChainStatus::Downloading)
            .await?;

        let staging = self.staging_path(&def);
        if let Some(parent) = staging.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                let _ = self
                    .store
                    .transition(chain_id, ChainStatus::NotDownloaded)
                    .await;
                return Err(AppError::internal(format!(
                    "Failed to create binary dir: {}",
                    e
                )));
            }
        }
        // 全新下载，清掉历史残留
        let _ = tokio::fs::remove_file(&staging).await;

        let handle = DownloadHandle::new();
        tasks.insert(chain_id.to_string(), handle.clone());
        drop(tasks);

        self.events
            .publish(OrchestratorEvent::DownloadStarted {
                chain_id: chain_id.to_string(),
            })
            .await;

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_transfer(def, handle).await;
        });

        Ok(())
    }

    /// 暂停下载：字节停止传输但状态保持 downloading，可恢复
    pub async fn pause(&self, chain_id: &str) -> Result<(), AppError> {
        let tasks = self.tasks.lock().await;
        let handle = tasks
            .get(chain_id)
            .ok_or_else(|| AppError::no_such_download(format!("No download for '{}'", chain_id)))?;
        handle.paused.store(true, Ordering::Relaxed);
        tracing::info!(chain_id = %chain_id, "Download paused");
        Ok(())
    }

    /// 恢复下载：从上次接收的字节偏移继续
    pub async fn resume(&self, chain_id: &str) -> Result<(), AppError> {
        let tasks = self.tasks.lock().await;
        let handle = tasks
            .get(chain_id)
            .ok_or_else(|| AppError::no_such_download(format!("No download for '{}'", chain_id)))?;
        handle.paused.store(false, Ordering::Relaxed);
        tracing::info!(chain_id = %chain_id, "Download resumed");
        Ok(())
    }

    /// 取消下载（无任务时为幂等空操作，重置流程会调用）
    pub async fn cancel(&self, chain_id: &str) {
        let tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.get(chain_id) {
            handle.cancelled.store(true, Ordering::Relaxed);
            // 确保暂停等待中的任务也能观察到取消
            handle.paused.store(false, Ordering::Relaxed);
        }
    }

    /// 列出活跃下载
    pub async fn list_active(&self) -> Vec<DownloadInfo> {
        let tasks = self.tasks.lock().await;
        tasks
            .iter()
            .map(|(id, h)| DownloadInfo {
                chain_id: id.clone(),
                percent: h.percent(),
                received_bytes: h.received_bytes.load(Ordering::Relaxed),
                total_bytes: h.total_bytes.load(Ordering::Relaxed),
                paused: h.paused.load(Ordering::Relaxed),
            })
            .collect()
    }

    fn staging_path(&self, def: &ChainDefinition) -> PathBuf {
        def.binary_dir(&self.base_dir)
            .join(format!("{}.partial", def.archive_name()))
    }

    /// 传输主循环
    ///
    /// 外层循环负责（重新）发起请求：暂停恢复与块级重试都回到这里，
    /// 带 Range 头从当前偏移继续。内层循环逐块写入并在块间检查
    /// 暂停/取消标志。
    async fn run_transfer(self, def: ChainDefinition, handle: DownloadHandle) {
        let url = def.download_url(&self.config.release_base_url);
        let staging = self.staging_path(&def);
        let mut attempts: u32 = 0;
        let mut last_percent: u8 = 0;

        'outer: loop {
            // 暂停等待；取消随时生效
            while handle.paused.load(Ordering::Relaxed) {
                if handle.cancelled.load(Ordering::Relaxed) {
                    self.abort_transfer(&def, &staging).await;
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(PAUSE_POLL_MS)).await;
            }
            if handle.cancelled.load(Ordering::Relaxed) {
                self.abort_transfer(&def, &staging).await;
                return;
            }

            let offset = handle.received_bytes.load(Ordering::Relaxed);
            let mut request = self.http.get(&url);
            if offset > 0 {
                request = request.header(RANGE, format!("bytes={}-", offset));
            }

            let response = match request.send().await {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    attempts += 1;
                    tracing::warn!(
                        chain_id = %def.id,
                        status = %resp.status(),
                        attempt = attempts,
                        "Release server returned error status"
                    );
                    if attempts >= self.config.max_retries {
                        self.fail_transfer(&def, &staging, format!("HTTP {}", resp.status()))
                            .await;
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.config.retry_delay_ms,
                    ))
                    .await;
                    continue 'outer;
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(chain_id = %def.id, error = %e, attempt = attempts, "Chunk fetch failed");
                    if attempts >= self.config.max_retries {
                        self.fail_transfer(&def, &staging, e.to_string()).await;
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.config.retry_delay_ms,
                    ))
                    .await;
                    continue 'outer;
                }
            };

            // 服务器支持 Range 续传则追加，否则从零重来
            let resumed = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
            let mut file = if resumed {
                match tokio::fs::OpenOptions::new().append(true).open(&staging).await {
                    Ok(f) => f,
                    Err(e) => {
                        self.fail_transfer(&def, &staging, format!("Staging file error: {}", e))
                            .await;
                        return;
                    }
                }
            } else {
                handle.received_bytes.store(0, Ordering::Relaxed);
                match tokio::fs::File::create(&staging).await {
                    Ok(f) => f,
                    Err(e) => {
                        self.fail_transfer(&def, &staging, format!("Staging file error: {}", e))
                            .await;
                        return;
                    }
                }
            };

            let base = handle.received_bytes.load(Ordering::Relaxed);
            if let Some(len) = response.content_length() {
                handle.total_bytes.store(base + len, Ordering::Relaxed);
            }

            let mut response = response;
            loop {
                if handle.cancelled.load(Ordering::Relaxed) {
                    self.abort_transfer(&def, &staging).await;
                    return;
                }
                if handle.paused.load(Ordering::Relaxed) {
                    // 块间协作式暂停，恢复后带 Range 重新请求
                    let _ = file.flush().await;
                    continue 'outer;
                }

                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        attempts = 0;
                        if let Err(e) = file.write_all(&chunk).await {
                            self.fail_transfer(&def, &staging, format!("Write failed: {}", e))
                                .await;
                            return;
                        }
                        handle
                            .received_bytes
                            .fetch_add(chunk.len() as u64, Ordering::Relaxed);

                        let percent = handle.percent();
                        if percent > last_percent {
                            last_percent = percent;
                            let _ = self.store.set_download_progress(&def.id, percent).await;
                            self.events
                                .publish(OrchestratorEvent::DownloadProgress {
                                    chain_id: def.id.clone(),
                                    percent,
                                    received_bytes: handle
                                        .received_bytes
                                        .load(Ordering::Relaxed),
                                    total_bytes: handle.total_bytes.load(Ordering::Relaxed),
                                })
                                .await;
                        }
                    }
                    Ok(None) => {
                        // 传输完成
                        let _ = file.flush().await;
                        drop(file);
                        let received = handle.received_bytes.load(Ordering::Relaxed);
                        handle.total_bytes.store(received, Ordering::Relaxed);
                        let _ = self.store.set_download_progress(&def.id, 100).await;
                        self.finalize_transfer(&def, &staging).await;
                        return;
                    }
                    Err(e) => {
                        attempts += 1;
                        tracing::warn!(chain_id = %def.id, error = %e, attempt = attempts, "Chunk fetch failed");
                        if attempts >= self.config.max_retries {
                            self.fail_transfer(&def, &staging, e.to_string()).await;
                            return;
                        }
                        let _ = file.flush().await;
                        tokio::time::sleep(std::time::Duration::from_millis(
                            self.config.retry_delay_ms,
                        ))
                        .await;
                        continue 'outer;
                    }
                }
            }
        }
    }

    /// 下载完成：解包、校验、落位
    async fn finalize_transfer(&self, def: &ChainDefinition, staging: &Path) {
        self.events
            .publish(OrchestratorEvent::DownloadComplete {
                chain_id: def.id.clone(),
            })
            .await;

        if self
            .store
            .transition(&def.id, ChainStatus::Extracting)
            .await
            .is_err()
        {
            self.remove_task(&def.id).await;
            return;
        }

        let archive = def.binary_dir(&self.base_dir).join(def.archive_name());
        let dest = def.binary_dir(&self.base_dir);
        let binary = def.binary_path(&self.base_dir);

        let result: Result<()> = async {
            tokio::fs::rename(staging, &archive)
                .await
                .context("Failed to move archive out of staging")?;

            let archive_path = archive.clone();
            let dest_path = dest.clone();
            tokio::task::spawn_blocking(move || extract_archive(&archive_path, &dest_path))
                .await
                .context("Extraction task panicked")??;

            if !binary.exists() {
                anyhow::bail!(
                    "Archive did not contain expected binary '{}'",
                    def.binary_name
                );
            }

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))
                    .context("Failed to mark binary executable")?;
            }

            tokio::fs::remove_file(&archive).await.ok();
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                let _ = self.store.transition(&def.id, ChainStatus::Downloaded).await;
                tracing::info!(chain_id = %def.id, "Download complete, binary extracted");
            }
            Err(e) => {
                // 数据完整性失败：清掉产物，强制整包重下（不可续传）
                let err = AppError::download_corrupt(format!("Corrupt download: {}", e));
                tracing::error!(chain_id = %def.id, error = %err, "Extraction failed, download must be retried");
                tokio::fs::remove_file(&archive).await.ok();
                tokio::fs::remove_file(staging).await.ok();
                let _ = self
                    .store
                    .transition(&def.id, ChainStatus::NotDownloaded)
                    .await;
                self.events
                    .publish(OrchestratorEvent::DownloadFailed {
                        chain_id: def.id.clone(),
                        code: err.code.as_str().to_string(),
                        reason: err.message,
                    })
                    .await;
            }
        }

        self.remove_task(&def.id).await;
    }

    /// 取消：清理暂存产物并回到 not_downloaded
    async fn abort_transfer(&self, def: &ChainDefinition, staging: &Path) {
        tokio::fs::remove_file(staging).await.ok();
        let _ = self
            .store
            .transition(&def.id, ChainStatus::NotDownloaded)
            .await;
        self.remove_task(&def.id).await;
        tracing::info!(chain_id = %def.id, "Download cancelled");
    }

    /// 有界重试耗尽后的失败路径（瞬态网络错误，可重新发起）
    async fn fail_transfer(&self, def: &ChainDefinition, staging: &Path, reason: String) {
        let err = AppError::network(reason);
        tokio::fs::remove_file(staging).await.ok();
        let _ = self
            .store
            .transition(&def.id, ChainStatus::NotDownloaded)
            .await;
        self.events
            .publish(OrchestratorEvent::DownloadFailed {
                chain_id: def.id.clone(),
                code: err.code.as_str().to_string(),
                reason: err.message.clone(),
            })
            .await;
        self.remove_task(&def.id).await;
        tracing::error!(chain_id = %def.id, reason = %err.message, "Download failed");
    }

    async fn remove_task(&self, chain_id: &str) {
        self.tasks.lock().await.remove(chain_id);
    }
}

/// 解包 tar.gz 归档到目标目录
pub(crate) fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive).context("Failed to open archive")?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    tar.unpack(dest).context("Failed to unpack archive")?;
    Ok(())
}
