//! Configuration loading from `~/.netron/config.toml` with defaults.

use netron_types::NetronConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load node configuration from a TOML file, with defaults.
///
/// A missing file yields the defaults. A file that cannot be read, parsed or
/// validated is logged and the defaults are used instead.
pub fn load_config(path: Option<&Path>) -> NetronConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match NetronConfig::from_toml_str(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    return config;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
    }

    NetronConfig::default()
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    netron_home().join("config.toml")
}

/// Get the default Netron home directory.
pub fn netron_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".netron")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/netron.toml")));
        assert_eq!(config.node_name, "netron-node");
        assert_eq!(config.response_timeout, None);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
node_id = "node-a"
node_name = "relay"
listen_addr = "0.0.0.0:4200"
response_timeout_ms = 1500
"#
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.node_name, "relay");
        assert_eq!(config.listen_addr.port(), 4200);
        assert_eq!(config.response_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_load_config_invalid_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "node_id = [not toml").unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.node_name, "netron-node");
    }

    #[test]
    fn test_default_path() {
        let path = default_config_path();
        assert!(path.ends_with(".netron/config.toml"));
    }
}
