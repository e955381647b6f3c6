//! Build metadata embedded by the build script.

/// Short commit hash, or `unknown` outside a git checkout.
pub const GIT_HASH: &str = env!("BURN_GIT_HASH");

/// `debug` or `release`.
pub const BUILD_PROFILE: &str = env!("BURN_BUILD_PROFILE");

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `"0.1.0 (abc1234, debug)"`, for `--version` and the startup log line.
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BURN_GIT_HASH"),
    ", ",
    env!("BURN_BUILD_PROFILE"),
    ")"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_version_carries_the_parts() {
        assert!(LONG_VERSION.starts_with(VERSION));
        assert!(LONG_VERSION.contains(GIT_HASH));
        assert!(!GIT_HASH.is_empty());
    }

    #[test]
    fn test_build_profile() {
        assert_eq!(BUILD_PROFILE, "debug");
    }
}
