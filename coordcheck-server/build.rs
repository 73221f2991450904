//! Build script for coordcheck-server
//!
//! Stamps the binary with the repository revision (plus a dirty marker
//! when the working tree has local changes), the UTC build time, and the
//! cargo profile. The startup banner and /build_info report these values.

use std::process::Command;

fn main() {
    let rev = git_revision().unwrap_or_else(|| "unreleased".to_string());
    let built_at = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    let profile = std::env::var("PROFILE").unwrap_or_default();

    println!("cargo:rustc-env=BUILD_GIT_REV={}", rev);
    println!("cargo:rustc-env=BUILD_TIME_UTC={}", built_at);
    println!(
        "cargo:rustc-env=BUILD_PROFILE={}",
        if profile.is_empty() { "unknown" } else { &profile }
    );

    // Intentionally no rerun-if-changed directives: the script runs on
    // every build so the stamp tracks the tree, not a file list
}

/// Current revision as `<12-hex>` or `<12-hex>+dirty`, None outside a repo
fn git_revision() -> Option<String> {
    let head = git(&["rev-parse", "--short=12", "HEAD"])?;
    match git(&["status", "--porcelain"]) {
        Some(status) if !status.is_empty() => Some(format!("{}+dirty", head)),
        _ => Some(head),
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    Some(text.trim().to_string())
}
