//! Stamps the build with the commit and time reported by `--version` and
//! `/health`.
//!
//! Builds outside a git checkout can pass the commit in
//! `ARENA_RELAY_GIT_COMMIT`. `SOURCE_DATE_EPOCH` pins the timestamp for
//! reproducible builds.

use std::env;
use std::process::Command;

use chrono::{DateTime, Utc};

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-env-changed=ARENA_RELAY_GIT_COMMIT");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    let commit = env::var("ARENA_RELAY_GIT_COMMIT")
        .ok()
        .filter(|c| !c.trim().is_empty())
        .or_else(git_commit)
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=ARENA_RELAY_GIT_COMMIT={}", commit);

    let built = build_time().format("%Y-%m-%dT%H:%M:%SZ");
    println!("cargo:rustc-env=ARENA_RELAY_BUILD_TIMESTAMP={}", built);
}

fn build_time() -> DateTime<Utc> {
    env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

/// Short hash of HEAD, with `-dirty` when tracked files have changes.
fn git_commit() -> Option<String> {
    let hash = git(&["rev-parse", "--short", "HEAD"])?;
    let dirty = git(&["status", "--porcelain", "--untracked-files=no"])
        .is_some_and(|status| !status.is_empty());
    Some(if dirty { format!("{}-dirty", hash) } else { hash })
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    Some(text.trim().to_string())
}
