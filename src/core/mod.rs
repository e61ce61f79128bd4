pub mod catalog;
pub mod executor;
pub mod job;
pub mod metrics;
pub mod ports;
pub mod scheduler;

use std::path::PathBuf;

const UNKNOWN: &str = "unknown";

pub fn version() -> &'static str {
    let author = clap::crate_authors!();

    Box::leak(Box::new(format!(
        "{} ({})\nBranch: {}\nCommit: {}\nTarget: {}\nAuthors: {author}",
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or(UNKNOWN),
        option_env!("VERGEN_GIT_BRANCH").unwrap_or(UNKNOWN),
        option_env!("VERGEN_GIT_SHA").unwrap_or(UNKNOWN),
        option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or(UNKNOWN),
    )))
}

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("slotrun"))
}

pub fn get_data_dir() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get data directory"))
        .map(|p| p.join("slotrun"))
}

pub fn get_runtime_dir() -> anyhow::Result<PathBuf> {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to get runtime or cache directory"))
        .map(|p| p.join("slotrun"))
}

/// Where sanitized job configs are written when no staging directory is
/// configured.
pub fn default_staging_dir() -> anyhow::Result<PathBuf> {
    get_runtime_dir().map(|p| p.join("staging"))
}

pub fn get_log_dir() -> anyhow::Result<PathBuf> {
    get_data_dir().map(|p| p.join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_mentions_package_version() {
        assert!(version().starts_with(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_dirs_are_namespaced() {
        if let Ok(dir) = get_config_dir() {
            assert!(dir.ends_with("slotrun"));
        }
        if let Ok(dir) = default_staging_dir() {
            assert!(dir.ends_with("slotrun/staging"));
        }
        if let Ok(dir) = get_log_dir() {
            assert!(dir.ends_with("slotrun/logs"));
        }
    }
}
