use std::process::Command;

const UNKNOWN_COMMIT: &str = "unknown";
const COMMIT_OVERRIDE_VARS: [&str; 2] = ["HARVEST_SOURCE_COMMIT", "SOURCE_COMMIT_HASH"];

fn main() {
    for var in COMMIT_OVERRIDE_VARS {
        println!("cargo:rerun-if-env-changed={var}");
    }
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads");

    let commit_hash = COMMIT_OVERRIDE_VARS
        .iter()
        .find_map(|var| non_empty(std::env::var(var).ok()))
        .or_else(git_head_commit)
        .unwrap_or_else(|| UNKNOWN_COMMIT.to_string());

    println!("cargo:rustc-env=HARVEST_WORKER_GIT_COMMIT_HASH={commit_hash}");
}

fn git_head_commit() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    non_empty(String::from_utf8(output.stdout).ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
