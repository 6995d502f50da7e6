//! CLI command handlers.

pub mod config;
pub mod exec;
pub mod journal;
pub mod manifest;

use pipwarden_config::LoadedConfig;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// Configuration resolved at startup.
    pub config: LoadedConfig,
}
