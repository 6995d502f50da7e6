//! Configuration system for the pipwarden sandbox engine.
//!
//! Provides TOML-based configuration with:
//! - Sandbox policy defaults (`[sandbox]`)
//! - File-access allowlist entries (`[[allowlist]]`)
//! - Root jail and external/VM execution settings (`[jail]`, `[external]`, `[vm]`)
//! - Config file layering (user config dir + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
