use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use url::Url;

use crate::request::Viewport;

/// What the renderer is asked to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSpec {
    pub url: Url,
    pub viewport: Viewport,
    pub full_page: bool,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer unreachable: {0}")]
    Unreachable(String),

    #[error("renderer returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("renderer returned an empty image")]
    Empty,
}

/// Headless-browser screenshot service. Timeouts and retries are the
/// implementation's business.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, spec: &RenderSpec) -> Result<Bytes, RenderError>;
}
