use serde::Serialize;
use thiserror::Error;

use crate::render::RenderError;
use crate::store::StoreError;

pub type GateResult<T> = Result<T, GateError>;

/// Coarse classification of a rejected or failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Malformed,
    Expired,
    InvalidSignature,
    Config,
    MethodNotAllowed,
    InFlight,
    Upstream,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("{0}")]
    Malformed(String),

    #[error("Invalid or expired timestamp in \"expireAt\" parameter.")]
    Expired,

    #[error("Invalid signature.")]
    InvalidSignature,

    #[error("server misconfiguration: {0}")]
    Config(String),

    #[error("Unsupported method.")]
    MethodNotAllowed,

    #[error("a render for {0} is already in progress")]
    InFlight(String),

    #[error("blob store failure: {0}")]
    Store(#[from] StoreError),

    #[error("renderer failure: {0}")]
    Render(#[from] RenderError),
}

impl GateError {
    pub fn malformed<M: Into<String>>(message: M) -> Self {
        GateError::Malformed(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::Malformed(_) => ErrorKind::Malformed,
            GateError::Expired => ErrorKind::Expired,
            GateError::InvalidSignature => ErrorKind::InvalidSignature,
            GateError::Config(_) => ErrorKind::Config,
            GateError::MethodNotAllowed => ErrorKind::MethodNotAllowed,
            GateError::InFlight(_) => ErrorKind::InFlight,
            GateError::Store(_) | GateError::Render(_) => ErrorKind::Upstream,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Malformed | ErrorKind::Expired => 400,
            ErrorKind::InvalidSignature => 403,
            ErrorKind::MethodNotAllowed => 405,
            ErrorKind::InFlight => 409,
            ErrorKind::Config => 500,
            ErrorKind::Upstream => 502,
        }
    }

    /// Message safe to return to the caller. Collaborator details stay in logs.
    pub fn message(&self) -> String {
        match self {
            GateError::Config(_) => "Server misconfiguration.".to_string(),
            GateError::Store(_) => "Storage backend unavailable.".to_string(),
            GateError::Render(_) => "Screenshot rendering failed.".to_string(),
            other => other.to_string(),
        }
    }
}
