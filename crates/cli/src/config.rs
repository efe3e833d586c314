//! Bridge configuration loading and validation.

use anyhow::{Context, Result};
use mtbridge_core::BridgeConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// Load the bridge configuration.
///
/// Starts from the TOML file when one is given (missing keys keep their
/// defaults), then applies the directory override from the command line or
/// `MTBRIDGE_DIR`.
pub fn load_config(path: Option<&Path>, dir_override: Option<PathBuf>) -> Result<BridgeConfig> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        }
        None => BridgeConfig::default(),
    };

    if let Some(dir) = dir_override {
        config.base_dir = dir;
    }

    validate_config(&config)?;

    info!(
        dir = %config.base_dir.display(),
        submit_ms = config.submit_interval_ms,
        collect_ms = config.collect_interval_ms,
        "Configuration loaded"
    );

    Ok(config)
}

fn validate_config(config: &BridgeConfig) -> Result<()> {
    anyhow::ensure!(
        !config.command_file.trim().is_empty() && !config.response_file.trim().is_empty(),
        "command_file and response_file must be set"
    );
    anyhow::ensure!(
        config.command_file != config.response_file,
        "command_file and response_file must differ (both are {})",
        config.command_file
    );

    anyhow::ensure!(
        config.submit_interval_ms > 0 && config.collect_interval_ms > 0,
        "Poll intervals must be > 0"
    );
    anyhow::ensure!(
        config.collect_interval_ms < config.submit_interval_ms,
        "collect_interval_ms ({}) must be shorter than submit_interval_ms ({})",
        config.collect_interval_ms,
        config.submit_interval_ms
    );

    let timeouts = &config.timeouts;
    anyhow::ensure!(timeouts.default_ms > 0, "timeouts.default_ms must be > 0");
    anyhow::ensure!(
        timeouts.query_ms != Some(0) && timeouts.trade_ms != Some(0),
        "Family timeouts must be > 0 when set"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_dir_override_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mtbridge.toml");
        fs::write(&path, "base_dir = \"/from/file\"\nkeep_alive = true\n").unwrap();

        let config = load_config(Some(&path), Some(PathBuf::from("/from/flag"))).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/from/flag"));
        assert!(config.keep_alive);
    }

    #[test]
    fn test_collect_must_be_faster_than_submit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mtbridge.toml");
        fs::write(&path, "submit_interval_ms = 100\ncollect_interval_ms = 100\n").unwrap();

        let err = load_config(Some(&path), None).unwrap_err();
        assert!(err.to_string().contains("collect_interval_ms"));
    }

    #[test]
    fn test_same_file_names_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mtbridge.toml");
        fs::write(&path, "command_file = \"bridge.json\"\nresponse_file = \"bridge.json\"\n").unwrap();

        assert!(load_config(Some(&path), None).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/mtbridge.toml")), None).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
