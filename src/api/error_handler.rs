use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChatError {
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },
    #[error("Network error: {message}")]
    NetworkError { message: String },
    #[error("Storage error: {message}")]
    StorageError { message: String },
    #[error("Validation error: {message}")]
    ValidationError { message: String },
    #[error("Stream error: {message}")]
    StreamError { message: String },
    #[error("Delivery error: {message}")]
    DeliveryError { message: String },
}

impl ChatError {
    /// 映射到 HTTP 状态码：校验失败 400，其余 500
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::ValidationError { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn from_reqwest(context: &str, e: reqwest::Error) -> Self {
        // 区分超时和其他网络错误，日志里更好排查
        let message = if e.is_timeout() {
            format!("{}: timed out: {}", context, e)
        } else if e.is_connect() {
            format!("{}: connection failed: {}", context, e)
        } else {
            format!("{}: {}", context, e)
        };
        ChatError::NetworkError { message }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
