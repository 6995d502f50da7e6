//! Locating and layering pipwarden config files.
//!
//! Two layers, the later overriding the earlier section by section:
//! 1. `config.toml` in the user config directory
//! 2. `pipwarden.toml` in the project directory
//!
//! A layer that is missing is skipped. A layer that cannot be read or parsed
//! is skipped with a warning, so loading itself never fails.

use std::path::{Path, PathBuf};

use crate::{ConfigError, PipwardenConfig, Result};

const PROJECT_CONFIG_FILE: &str = "pipwarden.toml";
const USER_CONFIG_FILE: &str = "config.toml";

/// Overrides the user config directory.
const CONFIG_DIR_ENV: &str = "PIPWARDEN_CONFIG_DIR";

/// One config layer that was looked for.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    pub loaded: bool,
}

/// Merged configuration plus how it was assembled.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub config: PipwardenConfig,
    /// Layers looked for, lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// Skipped layers and dropped allowlist entries.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Load the user layer and the project layer of `project_dir` (default: the
/// current directory).
pub fn load_config(project_dir: Option<&Path>) -> LoadedConfig {
    load_config_with_options(project_dir, None)
}

/// Like [`load_config`], with `config_dir` replacing the user config directory.
pub fn load_config_with_options(project_dir: Option<&Path>, config_dir: Option<&Path>) -> LoadedConfig {
    let mut loaded = LoadedConfig::default();

    let user_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => user_config_path(),
    };
    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));

    for path in user_path.into_iter().chain([project_path]) {
        let layer = if path.is_file() {
            match load_config_file(&path) {
                Ok(layer) => Some(layer),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Skipping config layer");
                    loaded.warnings.push(format!("Failed to load {}: {e}", path.display()));
                    None
                }
            }
        } else {
            None
        };
        let found = layer.is_some();
        if let Some(layer) = layer {
            loaded.config.merge(layer);
        }
        loaded.sources.push(ConfigSource { path, loaded: found });
    }

    let warnings = &mut loaded.warnings;
    loaded.config.allowlist.retain(|entry| match entry.validate() {
        Ok(()) => true,
        Err(e) => {
            warnings.push(format!("Ignoring {e}"));
            false
        }
    });
    loaded
}

/// Parse one config file.
pub fn load_config_file(path: &Path) -> Result<PipwardenConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    PipwardenConfig::from_toml(&contents)
}

/// `config.toml` inside [`user_config_dir`].
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// `$PIPWARDEN_CONFIG_DIR` when set, else `<platform config dir>/pipwarden`.
pub fn user_config_dir() -> Option<PathBuf> {
    match std::env::var_os(CONFIG_DIR_ENV) {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|d| d.join("pipwarden")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
