use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use snapgate_core::{GateConfig, KeyScope, Viewport};
use url::Url;

use crate::fs_store::is_plain_relative_path;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_CORS_ORIGIN: &str = "*";
pub const DEFAULT_KEY_PREFIX: &str = "screenshots";
pub const DEFAULT_RENDERER_URL: &str = "http://127.0.0.1:3000/screenshot";
pub const DEFAULT_STORE_DIR: &str = "snapgate-data";
const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CLAIM_TTL_SECS: u64 = 120;

pub const ENV_SECRET: &str = "SNAPGATE_SECRET";
pub const ENV_CORS_ORIGIN: &str = "SNAPGATE_CORS_ORIGIN";
pub const ENV_KEY_PREFIX: &str = "SNAPGATE_KEY_PREFIX";
pub const ENV_USER_AGENT: &str = "SNAPGATE_USER_AGENT";
pub const ENV_RENDERER_URL: &str = "SNAPGATE_RENDERER_URL";

/// Fully resolved, immutable settings for one server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
    pub store_dir: PathBuf,
    pub renderer: RendererConfig,
    pub gate: GateConfig,
}

#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub endpoint: Url,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct CliOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub secret: Option<String>,
    pub require_signature: Option<bool>,
    pub key_prefix: Option<String>,
    pub cors_origin: Option<String>,
    pub user_agent: Option<String>,
    pub renderer_url: Option<String>,
    pub store_dir: Option<PathBuf>,
    pub key_includes_viewport: Option<bool>,
}

/// Values taken from `SNAPGATE_*` environment variables.
#[derive(Debug, Default, Clone)]
pub struct EnvOptions {
    pub secret: Option<String>,
    pub cors_origin: Option<String>,
    pub key_prefix: Option<String>,
    pub user_agent: Option<String>,
    pub renderer_url: Option<String>,
}

impl EnvOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        Self {
            secret: get(ENV_SECRET),
            cors_origin: get(ENV_CORS_ORIGIN),
            key_prefix: get(ENV_KEY_PREFIX),
            user_agent: get(ENV_USER_AGENT),
            renderer_url: get(ENV_RENDERER_URL),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub secret: Option<String>,
    pub require_signature: Option<bool>,
    pub key_prefix: Option<String>,
    pub cors_origin: Option<String>,
    pub user_agent: Option<String>,
    pub key_scope: Option<KeyScope>,
    pub clock_skew_ms: Option<u64>,
    pub claim_ttl_secs: Option<u64>,
    pub default_viewport: Option<Viewport>,
    pub renderer_url: Option<String>,
    pub renderer_timeout_secs: Option<u64>,
    pub store_dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct RootConfig {
    #[serde(default)]
    snapgate: Option<RawFileConfig>,
}

#[derive(Deserialize, Default)]
struct RawFileConfig {
    host: Option<String>,
    port: Option<u16>,
    secret: Option<String>,
    require_signature: Option<bool>,
    key_prefix: Option<String>,
    cors_origin: Option<String>,
    user_agent: Option<String>,
    key_scope: Option<KeyScope>,
    clock_skew_ms: Option<u64>,
    claim_ttl_secs: Option<u64>,
    default_viewport: Option<Viewport>,
    renderer: Option<RawRendererConfig>,
    store: Option<RawStoreConfig>,
}

#[derive(Deserialize, Default)]
struct RawRendererConfig {
    url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct RawStoreConfig {
    dir: Option<String>,
}

pub fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    let Some(path) = path else {
        return Ok(None);
    };

    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapgate config from {}", path.display()))?;
    let parsed: RootConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;

    Ok(parsed
        .snapgate
        .map(|raw| raw.into_runtime_config(path.parent().unwrap_or(Path::new(".")))))
}

/// Merge every source, CLI first, then environment, then file, then defaults.
pub fn resolve(
    cli: &CliOptions,
    env: &EnvOptions,
    file_cfg: Option<&FileConfig>,
    working_dir: &Path,
) -> Result<ServerConfig> {
    let host = cli
        .host
        .clone()
        .or_else(|| file_cfg.and_then(|cfg| cfg.host.clone()))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = cli
        .port
        .or_else(|| file_cfg.and_then(|cfg| cfg.port))
        .unwrap_or(DEFAULT_PORT);

    let secret = cli
        .secret
        .clone()
        .or_else(|| env.secret.clone())
        .or_else(|| file_cfg.and_then(|cfg| cfg.secret.clone()))
        .filter(|secret| !secret.is_empty());

    let require_signature = cli
        .require_signature
        .or_else(|| file_cfg.and_then(|cfg| cfg.require_signature))
        .unwrap_or(false);

    if require_signature && secret.is_none() {
        tracing::warn!("signed requests are required but no secret is configured; cache misses will fail");
    }

    let key_prefix = cli
        .key_prefix
        .clone()
        .or_else(|| env.key_prefix.clone())
        .or_else(|| file_cfg.and_then(|cfg| cfg.key_prefix.clone()))
        .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());

    if !is_plain_relative_path(Path::new(key_prefix.trim_matches('/'))) {
        return Err(anyhow!(
            "key prefix '{}' must be plain relative path segments (no '.', '..' or drive prefixes)",
            key_prefix
        ));
    }

    let cors_origin = cli
        .cors_origin
        .clone()
        .or_else(|| env.cors_origin.clone())
        .or_else(|| file_cfg.and_then(|cfg| cfg.cors_origin.clone()))
        .unwrap_or_else(|| DEFAULT_CORS_ORIGIN.to_string());

    let user_agent = cli
        .user_agent
        .clone()
        .or_else(|| env.user_agent.clone())
        .or_else(|| file_cfg.and_then(|cfg| cfg.user_agent.clone()));

    let key_scope = match cli.key_includes_viewport {
        Some(true) => KeyScope::UrlAndViewport,
        Some(false) => KeyScope::Url,
        None => file_cfg.and_then(|cfg| cfg.key_scope).unwrap_or_default(),
    };

    let default_viewport = file_cfg
        .and_then(|cfg| cfg.default_viewport)
        .unwrap_or_default();
    if default_viewport.width == 0 || default_viewport.height == 0 {
        return Err(anyhow!(
            "default viewport must be non-zero, got {}x{}",
            default_viewport.width,
            default_viewport.height
        ));
    }

    let renderer_raw = cli
        .renderer_url
        .clone()
        .or_else(|| env.renderer_url.clone())
        .or_else(|| file_cfg.and_then(|cfg| cfg.renderer_url.clone()))
        .unwrap_or_else(|| DEFAULT_RENDERER_URL.to_string());
    let endpoint = Url::parse(&renderer_raw)
        .with_context(|| format!("Invalid renderer URL '{}'", renderer_raw))?;

    let timeout = Duration::from_secs(
        file_cfg
            .and_then(|cfg| cfg.renderer_timeout_secs)
            .unwrap_or(DEFAULT_RENDER_TIMEOUT_SECS),
    );

    let store_dir = cli
        .store_dir
        .as_ref()
        .map(|path| resolve_relative(working_dir, path))
        .or_else(|| file_cfg.and_then(|cfg| cfg.store_dir.clone()))
        .unwrap_or_else(|| working_dir.join(DEFAULT_STORE_DIR));

    let gate = GateConfig {
        secret,
        require_signature,
        key_prefix,
        default_viewport,
        key_scope,
        clock_skew_ms: file_cfg.and_then(|cfg| cfg.clock_skew_ms).unwrap_or(0),
        claim_ttl: Duration::from_secs(
            file_cfg
                .and_then(|cfg| cfg.claim_ttl_secs)
                .unwrap_or(DEFAULT_CLAIM_TTL_SECS),
        ),
    };

    Ok(ServerConfig {
        host,
        port,
        cors_origin,
        store_dir,
        renderer: RendererConfig {
            endpoint,
            timeout,
            user_agent,
        },
        gate,
    })
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl RawFileConfig {
    fn into_runtime_config(self, base: &Path) -> FileConfig {
        let renderer = self.renderer.unwrap_or_default();
        let store_dir = self
            .store
            .and_then(|store| store.dir)
            .map(|dir| resolve_relative(base, Path::new(&dir)));

        FileConfig {
            host: self.host,
            port: self.port,
            secret: self.secret,
            require_signature: self.require_signature,
            key_prefix: self.key_prefix,
            cors_origin: self.cors_origin,
            user_agent: self.user_agent,
            key_scope: self.key_scope,
            clock_skew_ms: self.clock_skew_ms,
            claim_ttl_secs: self.claim_ttl_secs,
            default_viewport: self.default_viewport,
            renderer_url: renderer.url,
            renderer_timeout_secs: renderer.timeout_secs,
            store_dir,
        }
    }
}
