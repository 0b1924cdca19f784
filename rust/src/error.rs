use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Failures of the command-streaming handler.
///
/// The first three variants happen before any frame is written and are
/// answered with a JSON error body. `ChildSignaled` and `StreamingInterrupted`
/// only occur once streaming has begun; they are reported through the
/// trailer frame and the logs instead.
#[derive(Debug)]
pub enum ProxyError {
    InvalidArgument {
        field: &'static str,
        reason: String,
    },
    LaunchFailed {
        program: String,
        source: std::io::Error,
    },
    UploadFailed(String),
    ChildSignaled {
        signal: i32,
    },
    StreamingInterrupted,
}

impl ProxyError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::LaunchFailed { .. } => "launch_failed",
            Self::UploadFailed(_) => "upload_failed",
            Self::ChildSignaled { .. } => "child_signaled",
            Self::StreamingInterrupted => "streaming_interrupted",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            Self::LaunchFailed { .. } | Self::UploadFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // Stream-time outcomes; the response status is already 200 by then.
            Self::ChildSignaled { .. } | Self::StreamingInterrupted => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { field, reason } => {
                write!(f, "Invalid argument '{field}': {reason}")
            }
            Self::LaunchFailed { program, source } => {
                write!(f, "Failed to launch {program}: {source}")
            }
            Self::UploadFailed(msg) => write!(f, "Upload failed: {msg}"),
            Self::ChildSignaled { signal } => {
                write!(f, "Child process terminated by signal {signal}")
            }
            Self::StreamingInterrupted => write!(f, "Client disconnected mid-stream"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::LaunchFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut error = serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let Self::InvalidArgument { field, .. } = &self {
            error["field"] = serde_json::Value::String((*field).to_string());
        }
        (self.status_code(), Json(serde_json::json!({ "error": error }))).into_response()
    }
}
