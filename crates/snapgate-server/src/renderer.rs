use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::ACCEPT, Client};
use serde::Serialize;
use snapgate_core::{RenderError, RenderSpec, Renderer};
use url::Url;

use crate::config::RendererConfig;

const ERROR_BODY_LIMIT: usize = 512;

/// Client for a remote headless-browser screenshot endpoint.
pub struct HttpRenderer {
    client: Client,
    endpoint: Url,
    user_agent: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotBody<'a> {
    url: &'a str,
    options: ScreenshotOptions,
    viewport: ViewportBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotOptions {
    #[serde(rename = "type")]
    image_type: &'static str,
    full_page: bool,
}

#[derive(Debug, Serialize)]
struct ViewportBody {
    width: u32,
    height: u32,
}

impl HttpRenderer {
    pub fn new(config: &RendererConfig) -> Result<Self, RenderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| RenderError::Unreachable(format!("failed to build client: {err}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            user_agent: config.user_agent.clone(),
        })
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn render(&self, spec: &RenderSpec) -> Result<Bytes, RenderError> {
        let body = ScreenshotBody {
            url: spec.url.as_str(),
            options: ScreenshotOptions {
                image_type: "webp",
                full_page: spec.full_page,
            },
            viewport: ViewportBody {
                width: spec.viewport.width,
                height: spec.viewport.height,
            },
            user_agent: self.user_agent.as_deref(),
        };

        tracing::debug!("requesting screenshot of {} from {}", spec.url, self.endpoint);

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(ACCEPT, "image/webp")
            .json(&body)
            .send()
            .await
            .map_err(|err| RenderError::Unreachable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            if text.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(RenderError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| RenderError::Unreachable(format!("failed to read image: {err}")))?;
        if bytes.is_empty() {
            return Err(RenderError::Empty);
        }
        Ok(bytes)
    }
}
