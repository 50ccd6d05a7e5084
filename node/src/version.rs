/// Crate version baked in at compile time.
pub const PINNET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git commit hash injected by the build environment, if any.
pub fn git_commit_hash() -> &'static str {
    option_env!("GIT_COMMIT_HASH").unwrap_or("unknown")
}
