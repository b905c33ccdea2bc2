use std::{env, io, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use snapgate_core::{sign_query, Clock, SystemClock};
use snapgate_server::config::{self, CliOptions, EnvOptions};
use tracing_subscriber::EnvFilter;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "snapgate", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to snapgate.toml
    #[arg(long = "config", value_name = "FILE", global = true)]
    config_path: Option<PathBuf>,

    /// Optional log filter (e.g. info, debug, snapgate_core=trace)
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gate (default)
    Serve(ServeArgs),
    /// Print a signed query string for a site
    Sign(SignArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Host binding
    #[arg(long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Port binding
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Shared signing secret (enables signature checks on cache misses)
    #[arg(long = "secret", value_name = "SECRET")]
    secret: Option<String>,

    /// Fail cache misses with a configuration error when no secret is set
    #[arg(long = "require-signature", action = ArgAction::SetTrue)]
    require_signature: bool,

    /// Object name prefix in the blob store
    #[arg(long = "key-prefix", value_name = "PREFIX")]
    key_prefix: Option<String>,

    /// Access-Control-Allow-Origin value
    #[arg(long = "cors-origin", value_name = "ORIGIN")]
    cors_origin: Option<String>,

    /// User agent forwarded to the renderer
    #[arg(long = "user-agent", value_name = "UA")]
    user_agent: Option<String>,

    /// Screenshot endpoint of the headless browser service
    #[arg(long = "renderer-url", value_name = "URL")]
    renderer_url: Option<String>,

    /// Directory holding stored screenshots
    #[arg(long = "store-dir", value_name = "PATH")]
    store_dir: Option<PathBuf>,

    /// Give each viewport/fullPage combination its own cache entry
    #[arg(long = "key-includes-viewport", action = ArgAction::SetTrue)]
    key_includes_viewport: bool,
}

#[derive(Args, Debug)]
struct SignArgs {
    /// Target URL to authorize
    #[arg(long = "site", value_name = "URL")]
    site: String,

    /// Validity window in seconds
    #[arg(long = "ttl-secs", value_name = "SECS", default_value_t = 3600)]
    ttl_secs: u64,

    #[arg(long = "full-page", action = ArgAction::SetTrue)]
    full_page: bool,

    #[arg(long = "width", value_name = "PX")]
    width: Option<u32>,

    #[arg(long = "height", value_name = "PX")]
    height: Option<u32>,

    /// Signing secret (falls back to SNAPGATE_SECRET, then the config file)
    #[arg(long = "secret", value_name = "SECRET")]
    secret: Option<String>,

    /// Prefix the output with this gate URL
    #[arg(long = "base-url", value_name = "URL")]
    base_url: Option<String>,
}

impl ServeArgs {
    fn into_cli_options(self) -> CliOptions {
        CliOptions {
            host: self.host,
            port: self.port,
            secret: self.secret,
            require_signature: self.require_signature.then_some(true),
            key_prefix: self.key_prefix,
            cors_origin: self.cors_origin,
            user_agent: self.user_agent,
            renderer_url: self.renderer_url,
            store_dir: self.store_dir,
            key_includes_viewport: self.key_includes_viewport.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_deref());

    let file_cfg = config::load_file_config(cli.config_path.as_deref())?;
    let env_opts = EnvOptions::from_env();

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => {
            tracing::info!(
                "{}",
                snapgate_build_info::formatted_banner("snapgate", SERVER_VERSION)
            );
            let working_dir = env::current_dir().context("Failed to read current directory")?;
            let server_config = config::resolve(
                &args.into_cli_options(),
                &env_opts,
                file_cfg.as_ref(),
                &working_dir,
            )?;
            snapgate_server::serve(server_config).await
        }
        Command::Sign(args) => {
            let query = sign_command(args, &env_opts, file_cfg.as_ref())?;
            println!("{query}");
            Ok(())
        }
    }
}

fn sign_command(
    args: SignArgs,
    env_opts: &EnvOptions,
    file_cfg: Option<&config::FileConfig>,
) -> Result<String> {
    let secret = args
        .secret
        .or_else(|| env_opts.secret.clone())
        .or_else(|| file_cfg.and_then(|cfg| cfg.secret.clone()))
        .filter(|secret| !secret.is_empty())
        .ok_or_else(|| anyhow!("No signing secret: pass --secret or set {}", config::ENV_SECRET))?;

    url::Url::parse(&args.site)
        .with_context(|| format!("--site must be an absolute URL, got '{}'", args.site))?;

    let ttl_ms = i64::try_from(args.ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    let expire_at = SystemClock.now_millis().saturating_add(ttl_ms);

    let width = args.width.map(|w| w.to_string());
    let height = args.height.map(|h| h.to_string());
    let mut extra: Vec<(&str, &str)> = Vec::new();
    if args.full_page {
        extra.push(("fullPage", "true"));
    }
    if let Some(width) = width.as_deref() {
        extra.push(("width", width));
    }
    if let Some(height) = height.as_deref() {
        extra.push(("height", height));
    }

    let query = sign_query(&args.site, expire_at, &extra, &secret)
        .map_err(|err| anyhow!("Failed to sign request: {err}"))?;

    Ok(match args.base_url {
        Some(base) => format!("{}?{}", base.trim_end_matches('?'), query),
        None => query,
    })
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    let _ = builder.try_init();
}
