use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::TetherConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["tether.toml", "tether.yaml", "tether.yml", "tether.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<TetherConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./tether.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/tether/tether.{toml,yaml,yml,json}` (user-global)
///
/// Returns `TetherConfig::default()` if no config file is found.
pub fn discover_and_load() -> TetherConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    TetherConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    // Project-local
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    // User-global: ~/.config/tether/
    if let Some(dirs) = directories::ProjectDirs::from("", "", "tether") {
        let config_dir = dirs.config_dir();
        for name in CONFIG_FILENAMES {
            let p = config_dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Returns the user-global config directory (`~/.config/tether/`).
pub fn config_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "tether")
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns the data directory (device identity, pairing store, transcripts).
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "tether")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<TetherConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");
        std::fs::write(&path, "[auth]\ntoken = \"tok_test_123\"\n").unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.auth.token.as_deref(), Some("tok_test_123"));
    }

    #[test]
    fn loads_yaml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.yaml");
        std::fs::write(&path, "gateway:\n  port: 9001\n").unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.gateway.port, 9001);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(load_config(&path).is_err());
    }
}
