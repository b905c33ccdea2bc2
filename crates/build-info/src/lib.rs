//! Build metadata stamped by `build.rs`, shown in the start-up banner and on
//! the health endpoint.

use once_cell::sync::Lazy;

#[derive(Debug)]
struct BuildStamp {
    id: &'static str,
    revision: &'static str,
}

static STAMP: Lazy<BuildStamp> = Lazy::new(|| BuildStamp {
    id: option_env!("SNAPGATE_BUILD_ID").unwrap_or("unknown build"),
    revision: option_env!("SNAPGATE_BUILD_REVISION").unwrap_or("unknown revision"),
});

/// Revision and build time, e.g. `v0.1.0-3-g8a4f1d2 (2026-10-15T09:12:44Z)`.
pub fn build_id() -> &'static str {
    STAMP.id
}

/// `git describe` output at build time.
pub fn revision() -> &'static str {
    STAMP.revision
}

pub fn formatted_banner(package: &str, version: &str) -> String {
    format!("{package} {version} | {}", build_id())
}
