use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppErrorCode {
    // HTTP 基础错误码
    BadRequest,
    NotFound,
    Timeout,
    Network,
    Internal,

    // 编排错误码
    MissingDependencies,
    BlockedByDependents,
    StateConflict,
    AlreadyInProgress,
    NoSuchDownload,
    DownloadCorrupt,
    ChainNotSupported,

    // 钱包错误码
    AlreadyExists,
    WalletNotFound,
    InvalidMnemonic,

    // 提现错误码
    InvalidAmount,
    InvalidAddress,
    InvalidServerResponse,
    SettlementUnavailable,
}

impl AppErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppErrorCode::BadRequest => "bad_request",
            AppErrorCode::NotFound => "not_found",
            AppErrorCode::Timeout => "timeout",
            AppErrorCode::Network => "network",
            AppErrorCode::Internal => "internal",
            AppErrorCode::MissingDependencies => "missing_dependencies",
            AppErrorCode::BlockedByDependents => "blocked_by_dependents",
            AppErrorCode::StateConflict => "state_conflict",
            AppErrorCode::AlreadyInProgress => "already_in_progress",
            AppErrorCode::NoSuchDownload => "no_such_download",
            AppErrorCode::DownloadCorrupt => "download_corrupt",
            AppErrorCode::ChainNotSupported => "chain_not_supported",
            AppErrorCode::AlreadyExists => "already_exists",
            AppErrorCode::WalletNotFound => "wallet_not_found",
            AppErrorCode::InvalidMnemonic => "invalid_mnemonic",
            AppErrorCode::InvalidAmount => "invalid_amount",
            AppErrorCode::InvalidAddress => "invalid_address",
            AppErrorCode::InvalidServerResponse => "invalid_server_response",
            AppErrorCode::SettlementUnavailable => "settlement_unavailable",
        }
    }
}

/// 应用统一错误类型
///
/// 前置条件失败（依赖缺失、被依赖阻塞等）作为结构化结果返回，
/// `details` 携带机器可读的附加信息（如缺失依赖的 id 列表）。
#[derive(Debug, Clone)]
pub struct AppError {
    pub code: AppErrorCode,
    pub message: String,
    pub status: StatusCode,
    pub details: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code.as_str(),
            message: &self.message,
            details: self.details.as_ref(),
        };
        (self.status, Json(body)).into_response()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for AppError {}

impl AppError {
    fn new(code: AppErrorCode, status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
            status,
            details: None,
        }
    }

    /// 附加机器可读细节
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::BadRequest, StatusCode::BAD_REQUEST, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::NotFound, StatusCode::NOT_FOUND, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::Internal, StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::Timeout, StatusCode::GATEWAY_TIMEOUT, msg)
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::Network, StatusCode::BAD_GATEWAY, msg)
    }

    // 编排错误辅助函数
    pub fn missing_dependencies(chain_id: &str, missing: &[String]) -> Self {
        Self::new(
            AppErrorCode::MissingDependencies,
            StatusCode::CONFLICT,
            format!(
                "Chain '{}' is missing dependencies: {}",
                chain_id,
                missing.join(", ")
            ),
        )
        .with_details(serde_json::json!({ "missing": missing }))
    }

    pub fn blocked_by_dependents(chain_id: &str, dependents: &[String]) -> Self {
        Self::new(
            AppErrorCode::BlockedByDependents,
            StatusCode::CONFLICT,
            format!(
                "Chain '{}' has running dependents: {}",
                chain_id,
                dependents.join(", ")
            ),
        )
        .with_details(serde_json::json!({ "dependents": dependents }))
    }

    pub fn state_conflict(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::StateConflict, StatusCode::CONFLICT, msg)
    }

    pub fn already_in_progress(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::AlreadyInProgress, StatusCode::CONFLICT, msg)
    }

    pub fn no_such_download(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::NoSuchDownload, StatusCode::NOT_FOUND, msg)
    }

    pub fn download_corrupt(msg: impl Into<String>) -> Self {
        Self::new(
            AppErrorCode::DownloadCorrupt,
            StatusCode::UNPROCESSABLE_ENTITY,
            msg,
        )
    }

    pub fn chain_not_supported(msg: impl Into<String>) -> Self {
        Self::new(
            AppErrorCode::ChainNotSupported,
            StatusCode::BAD_REQUEST,
            msg,
        )
    }

    // 钱包错误辅助函数
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::AlreadyExists, StatusCode::CONFLICT, msg)
    }

    pub fn wallet_not_found(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::WalletNotFound, StatusCode::NOT_FOUND, msg)
    }

    pub fn invalid_mnemonic(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::InvalidMnemonic, StatusCode::BAD_REQUEST, msg)
    }

    // 提现错误辅助函数
    pub fn invalid_amount(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::InvalidAmount, StatusCode::BAD_REQUEST, msg)
    }

    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::new(AppErrorCode::InvalidAddress, StatusCode::BAD_REQUEST, msg)
    }

    pub fn invalid_server_response(msg: impl Into<String>) -> Self {
        Self::new(
            AppErrorCode::InvalidServerResponse,
            StatusCode::BAD_GATEWAY,
            msg,
        )
    }

    pub fn settlement_unavailable(msg: impl Into<String>) -> Self {
        Self::new(
            AppErrorCode::SettlementUnavailable,
            StatusCode::SERVICE_UNAVAILABLE,
            msg,
        )
    }
}

// 从 serde_json 错误转换
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request(format!("JSON serialization error: {}", err))
    }
}

// 从 reqwest 错误转换
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(format!("Request timed out: {}", err))
        } else {
            Self::network(format!("Network error: {}", err))
        }
    }
}

// 从 anyhow 错误转换
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_dependencies_details() {
        let err = AppError::missing_dependencies(
            "thunder",
            &["enforcer".to_string(), "bitcoin".to_string()],
        );
        assert_eq!(err.code, AppErrorCode::MissingDependencies);
        assert_eq!(err.status, StatusCode::CONFLICT);
        let details = err.details.unwrap();
        assert_eq!(details["missing"][0], "enforcer");
        assert_eq!(details["missing"][1], "bitcoin");
    }

    #[test]
    fn test_error_code_strings() {
        assert_eq!(AppErrorCode::StateConflict.as_str(), "state_conflict");
        assert_eq!(AppErrorCode::NoSuchDownload.as_str(), "no_such_download");
        assert_eq!(
            AppErrorCode::BlockedByDependents.as_str(),
            "blocked_by_dependents"
        );
    }
}
