use serde::ser::Serializer;
use serde::Serialize;
use thiserror::Error;

/// Conditions the auth layer classifies as ending the session. They are never
/// retried by the engine.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionFatalKind {
    ForceUpdate,
    UserBlocked,
    SessionExpired,
}

impl SessionFatalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ForceUpdate => "force update required",
            Self::UserBlocked => "user blocked",
            Self::SessionExpired => "session expired",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("network unavailable")]
    Connectivity,
    #[error("service error ({status}): {message}")]
    Service { status: u16, message: String },
    #[error("stream decode error: {0}")]
    StreamDecode(String),
    #[error("session halted: {}", .0.as_str())]
    SessionFatal(SessionFatalKind),
    #[error("no wallet session is running")]
    SessionNotRunning,
    #[error("telemetry error: {0}")]
    Telemetry(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("decimal parse error: {0}")]
    Decimal(#[from] rust_decimal::Error),
}

impl AppError {
    pub fn fatal_kind(&self) -> Option<SessionFatalKind> {
        match self {
            Self::SessionFatal(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
