//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&str>, env_var_name: &str) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    // Priority 2: Environment variable
    if let Some(path) = env_string(env_var_name) {
        return PathBuf::from(path);
    }

    // Priority 3: OS-dependent compiled default
    get_default_root_folder()
}

/// Get OS-dependent default root folder path
fn get_default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/payproof (or /var/lib/payproof for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("payproof"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/payproof"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("payproof"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/payproof"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("payproof"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\payproof"))
    } else {
        PathBuf::from("./payproof_data")
    }
}

/// Create the root folder if missing and return the database path inside it
pub fn prepare_root_folder(root: &Path, db_file_name: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(root).map_err(|e| {
        Error::Config(format!(
            "Failed to create root folder {}: {}",
            root.display(),
            e
        ))
    })?;
    Ok(root.join(db_file_name))
}

/// Load a TOML file into `T`
///
/// A missing file yields `T::default()`; a present but unparsable file is an error.
pub fn load_toml_file<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "Config file not found, using defaults");
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
}

/// Read an environment variable, ignoring empty or whitespace-only values
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read and parse an environment variable
///
/// Returns `Ok(None)` when unset; a set but unparsable value is a config error
/// rather than silently falling back.
pub fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_string(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("Invalid value for {}: {:?}", name, raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;
    use std::io::Write;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Sample {
        #[serde(default)]
        name: String,
        #[serde(default)]
        limit: u32,
    }

    #[test]
    #[serial]
    fn test_cli_arg_wins_over_env() {
        std::env::set_var("PAYPROOF_TEST_ROOT", "/from/env");
        let root = resolve_root_folder(Some("/from/cli"), "PAYPROOF_TEST_ROOT");
        assert_eq!(root, PathBuf::from("/from/cli"));

        let root = resolve_root_folder(None, "PAYPROOF_TEST_ROOT");
        assert_eq!(root, PathBuf::from("/from/env"));
        std::env::remove_var("PAYPROOF_TEST_ROOT");
    }

    #[test]
    #[serial]
    fn test_blank_env_is_ignored() {
        std::env::set_var("PAYPROOF_TEST_BLANK", "   ");
        assert_eq!(env_string("PAYPROOF_TEST_BLANK"), None);
        std::env::remove_var("PAYPROOF_TEST_BLANK");
    }

    #[test]
    #[serial]
    fn test_env_parse_rejects_garbage() {
        std::env::set_var("PAYPROOF_TEST_NUM", "twelve");
        assert!(env_parse::<u32>("PAYPROOF_TEST_NUM").is_err());
        std::env::set_var("PAYPROOF_TEST_NUM", "12");
        assert_eq!(env_parse::<u32>("PAYPROOF_TEST_NUM").unwrap(), Some(12));
        std::env::remove_var("PAYPROOF_TEST_NUM");
    }

    #[test]
    fn test_missing_toml_gives_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Sample = load_toml_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn test_toml_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "name = \"society\"\nlimit = 7").unwrap();

        let loaded: Sample = load_toml_file(&path).unwrap();
        assert_eq!(loaded.name, "society");
        assert_eq!(loaded.limit, 7);
    }

    #[test]
    fn test_prepare_root_folder_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("root");
        let db = prepare_root_folder(&root, "payproof.db").unwrap();
        assert!(root.is_dir());
        assert_eq!(db, root.join("payproof.db"));
    }
}
