/// Build identity reported by the CLI, the bootstrap log event and `/metrics`.
pub const SERVICE_NAME: &str = "harvest_worker";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_COMMIT_HASH: &str = env!("HARVEST_WORKER_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("HARVEST_WORKER_GIT_COMMIT_HASH")
);

const SHORT_HASH_LEN: usize = 12;

/// Returns the first 12 characters of the commit hash, or `"unknown"` when the build had no git
/// metadata.
pub fn short_commit_hash() -> &'static str {
    GIT_COMMIT_HASH
        .get(..SHORT_HASH_LEN)
        .unwrap_or(GIT_COMMIT_HASH)
}

#[cfg(test)]
mod tests {
    use super::{short_commit_hash, GIT_COMMIT_HASH, VERSION, VERSION_WITH_COMMIT};

    #[test]
    fn version_with_commit_is_semver_plus_hash() {
        let (semver, hash) = VERSION_WITH_COMMIT
            .split_once('+')
            .expect("version string should include semver+commit separator");
        assert_eq!(semver, VERSION);
        assert_eq!(hash, GIT_COMMIT_HASH);
    }

    #[test]
    fn short_hash_is_a_prefix_of_the_full_hash() {
        assert!(!GIT_COMMIT_HASH.is_empty());
        assert!(GIT_COMMIT_HASH.starts_with(short_commit_hash()));
        assert!(short_commit_hash().len() <= 12);
    }
}
