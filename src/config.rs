//! 配置管理模块
//! 支持从环境变量和配置文件加载配置

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 应用配置结构体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub settlement: SettlementConfig,
    pub downloads: DownloadConfig,
    pub paths: PathsConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

/// 结算服务客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// 本地回环 Connect-RPC 端点
    pub base_url: String,
    /// 连通性探测超时（秒），探测间隔固定 1s
    pub connect_timeout_secs: u64,
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 二进制发布包根地址，链归档名拼接其后
    pub release_base_url: String,
    /// 单块拉取失败的有界重试次数
    pub max_retries: u32,
    /// 重试间隔（毫秒）
    pub retry_delay_ms: u64,
}

/// 文件系统布局配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// 所有链目录（data/wallets/binaries）的根目录
    pub base_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8170".into()),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("SETTLEMENT_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080".into()),
            connect_timeout_secs: std::env::var("SETTLEMENT_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            release_base_url: std::env::var("RELEASE_BASE_URL")
                .unwrap_or_else(|_| "https://releases.drivechain.info".into()),
            max_retries: std::env::var("DOWNLOAD_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            retry_delay_ms: std::env::var("DOWNLOAD_RETRY_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = std::env::var("DRIVECORE_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".drivecore"))
                    .unwrap_or_else(|_| PathBuf::from("./drivecore-data"))
            });
        Self { base_dir: base }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            settlement: SettlementConfig::default(),
            downloads: DownloadConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Ok(Self::default())
    }

    /// 从配置文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// 从环境变量和配置文件合并加载（配置文件优先级更高）
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = Self::from_env()?;

        if let Some(path) = path {
            if path.as_ref().exists() {
                config = Self::from_file(path)?;
            }
        }

        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        // 验证日志级别
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("LOG_LEVEL must be one of: {:?}", valid_levels);
        }

        // 验证日志格式
        if self.logging.format != "json" && self.logging.format != "text" {
            anyhow::bail!("LOG_FORMAT must be 'json' or 'text'");
        }

        // 验证结算端点
        if !self.settlement.base_url.starts_with("http://")
            && !self.settlement.base_url.starts_with("https://")
        {
            anyhow::bail!("SETTLEMENT_BASE_URL must start with http:// or https://");
        }

        if self.downloads.max_retries == 0 {
            anyhow::bail!("DOWNLOAD_MAX_RETRIES must be at least 1");
        }

        Ok(())
    }
}
