//! Configuration file resolution and loading
//!
//! Services never fail to start because a config file is missing: resolution
//! falls through to compiled defaults and a warning is logged instead.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Config file path resolution in priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. Platform config directory (`<config_dir>/onair/<file_name>`), if it exists
///
/// Returns `None` when nothing applies; callers then use compiled defaults.
pub fn resolve_config_path(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    file_name: &str,
) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    dirs::config_dir()
        .map(|d| d.join("onair").join(file_name))
        .filter(|p| p.exists())
}

/// Load a TOML config file into `T`, falling back to `T::default()`
///
/// A missing file (or no path at all) yields defaults with a warning. A file that
/// exists but cannot be read or parsed is an error: silently ignoring a typo in
/// an operator's config would hide it.
pub fn load_toml_or_default<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        warn!("No config file found, using compiled defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        warn!("Config file {} not found, using compiled defaults", path.display());
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// OS-dependent default data folder for a module
///
/// - Linux: `~/.local/share/onair/<module>` (or `/var/lib/onair/<module>`)
/// - macOS: `~/Library/Application Support/onair/<module>`
/// - Windows: `%LOCALAPPDATA%\onair\<module>`
pub fn default_data_dir(module: &str) -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("onair").join(module))
        .unwrap_or_else(|| {
            if cfg!(target_os = "windows") {
                PathBuf::from("C:\\ProgramData\\onair").join(module)
            } else {
                PathBuf::from("/var/lib/onair").join(module)
            }
        })
}

/// Ensure a directory exists, creating it (and parents) if needed
pub fn ensure_dir(path: &Path) -> Result<()> {
    if path.exists() && !path.is_dir() {
        return Err(Error::Config(format!(
            "{} exists but is not a directory",
            path.display()
        )));
    }
    std::fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        port: u16,
        name: String,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                port: 5790,
                name: "default".to_string(),
            }
        }
    }

    #[test]
    #[serial]
    fn test_cli_arg_wins_over_env() {
        std::env::set_var("ONAIR_TEST_CONFIG", "/tmp/from-env.toml");
        let resolved = resolve_config_path(
            Some(Path::new("/tmp/from-cli.toml")),
            "ONAIR_TEST_CONFIG",
            "sync.toml",
        );
        std::env::remove_var("ONAIR_TEST_CONFIG");

        assert_eq!(resolved, Some(PathBuf::from("/tmp/from-cli.toml")));
    }

    #[test]
    #[serial]
    fn test_env_var_used_without_cli_arg() {
        std::env::set_var("ONAIR_TEST_CONFIG", "/tmp/from-env.toml");
        let resolved = resolve_config_path(None, "ONAIR_TEST_CONFIG", "sync.toml");
        std::env::remove_var("ONAIR_TEST_CONFIG");

        assert_eq!(resolved, Some(PathBuf::from("/tmp/from-env.toml")));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let loaded: Sample =
            load_toml_or_default(Some(Path::new("/nonexistent/onair/sync.toml"))).unwrap();
        assert_eq!(loaded, Sample::default());

        let loaded: Sample = load_toml_or_default(None).unwrap();
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "port = 6000\n").unwrap();

        let loaded: Sample = load_toml_or_default(Some(&path)).unwrap();
        assert_eq!(loaded.port, 6000);
        assert_eq!(loaded.name, "default");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "port = \"not a number\"\n").unwrap();

        let result: Result<Sample> = load_toml_or_default(Some(&path));
        assert!(matches!(result, Err(Error::TomlParse(_))));
    }

    #[test]
    fn test_ensure_dir_rejects_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, "x").unwrap();

        assert!(matches!(ensure_dir(&file), Err(Error::Config(_))));
        assert!(ensure_dir(&dir.path().join("a/b/c")).is_ok());
    }

    #[test]
    fn test_default_data_dir_ends_with_module() {
        let path = default_data_dir("sync");
        assert!(path.ends_with(Path::new("onair").join("sync")));
    }
}
