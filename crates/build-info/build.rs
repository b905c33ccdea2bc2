use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::Utc;

const OVERRIDE_VAR: &str = "SNAPGATE_BUILD_ID_OVERRIDE";

fn main() {
    println!("cargo:rerun-if-env-changed={OVERRIDE_VAR}");

    let git_dir = Path::new("../../.git");
    if let Some(head) = head_ref_path(git_dir) {
        println!("cargo:rerun-if-changed={head}");
    }

    let built_at = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let revision = git_revision().unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var(OVERRIDE_VAR).unwrap_or_else(|_| format!("{revision} ({built_at})"));

    println!("cargo:rustc-env=SNAPGATE_BUILD_ID={build_id}");
    println!("cargo:rustc-env=SNAPGATE_BUILD_REVISION={revision}");
}

fn head_ref_path(git_dir: &Path) -> Option<String> {
    let head = git_dir.join("HEAD");
    let contents = fs::read_to_string(&head).ok()?;
    let target = contents
        .strip_prefix("ref: ")
        .map(|reference| git_dir.join(reference.trim()))
        .filter(|path| path.exists())
        .unwrap_or(head);
    Some(target.display().to_string())
}

fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!label.is_empty()).then_some(label)
}
