use serde::{Deserialize, Serialize};
use url::{form_urlencoded, Url};

use crate::error::{GateError, GateResult};

pub const SITE_PARAM: &str = "site";
pub const SIGNATURE_PARAM: &str = "sig";
pub const EXPIRE_AT_PARAM: &str = "expireAt";
pub const FULL_PAGE_PARAM: &str = "fullPage";
pub const WIDTH_PARAM: &str = "width";
pub const HEIGHT_PARAM: &str = "height";

/// Upper bound for either viewport dimension.
pub const MAX_DIMENSION: u32 = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
        }
    }
}

/// Query pairs decoded exactly once, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn parse(raw_query: &str) -> Self {
        let raw = raw_query.strip_prefix('?').unwrap_or(raw_query);
        form_urlencoded::parse(raw.as_bytes()).into_owned().collect()
    }

    /// First value for `key`, mirroring how browsers resolve repeated keys.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn push<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.pairs.push((key.into(), value.into()));
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }
}

impl FromIterator<(String, String)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

/// One inbound screenshot request, validated and immutable.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    target_url: Url,
    full_page: bool,
    viewport: Viewport,
    expire_at: Option<String>,
    signature: Option<String>,
    params: QueryParams,
}

impl RenderRequest {
    pub fn from_query(raw_query: &str, default_viewport: Viewport) -> GateResult<Self> {
        Self::from_params(QueryParams::parse(raw_query), default_viewport)
    }

    pub fn from_params(params: QueryParams, default_viewport: Viewport) -> GateResult<Self> {
        let site = non_empty(params.get(SITE_PARAM)).ok_or_else(|| {
            GateError::malformed("\"site\" parameter is required (?site=<>)")
        })?;
        let target_url = parse_target(site)?;

        let width = parse_dimension(&params, WIDTH_PARAM)?.unwrap_or(default_viewport.width);
        let height = parse_dimension(&params, HEIGHT_PARAM)?.unwrap_or(default_viewport.height);
        let full_page = params.get(FULL_PAGE_PARAM) == Some("true");

        let expire_at = non_empty(params.get(EXPIRE_AT_PARAM)).map(str::to_string);
        let signature = non_empty(params.get(SIGNATURE_PARAM)).map(str::to_string);

        Ok(Self {
            target_url,
            full_page,
            viewport: Viewport { width, height },
            expire_at,
            signature,
            params,
        })
    }

    pub fn target_url(&self) -> &Url {
        &self.target_url
    }

    pub fn full_page(&self) -> bool {
        self.full_page
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn expire_at(&self) -> Option<&str> {
        self.expire_at.as_deref()
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn params(&self) -> &QueryParams {
        &self.params
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

fn parse_target(site: &str) -> GateResult<Url> {
    let url = Url::parse(site)
        .map_err(|err| GateError::malformed(format!("\"site\" must be an absolute URL: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(GateError::malformed(format!(
            "\"site\" must use http or https, got '{other}'"
        ))),
    }
}

fn parse_dimension(params: &QueryParams, key: &str) -> GateResult<Option<u32>> {
    let Some(raw) = non_empty(params.get(key)) else {
        return Ok(None);
    };

    let invalid = || {
        GateError::malformed(format!(
            "\"{key}\" must be an integer between 1 and {MAX_DIMENSION}"
        ))
    };

    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: u32 = raw.parse().map_err(|_| invalid())?;
    if value == 0 || value > MAX_DIMENSION {
        return Err(invalid());
    }
    Ok(Some(value))
}
