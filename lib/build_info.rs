//! Build identity reported in logs, the CLI version string and the `build_info` metric.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_COMMIT_HASH: &str = env!("CHAIN_EXPORTER_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("CHAIN_EXPORTER_GIT_COMMIT_HASH")
);

/// First 12 characters of the commit hash, or `"unknown"` for builds outside git.
pub fn short_commit_hash() -> &'static str {
    let short_len = 12usize.min(GIT_COMMIT_HASH.len());
    GIT_COMMIT_HASH.get(..short_len).unwrap_or(GIT_COMMIT_HASH)
}
