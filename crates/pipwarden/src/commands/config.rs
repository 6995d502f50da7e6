//! Config command - show resolved configuration.

use anyhow::Result;
use clap::{Args, Subcommand};
use console::Style;

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: Option<ConfigCommand>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show resolved configuration (default)
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Show the user configuration file path
    Path,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command.unwrap_or(ConfigCommand::Show) {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
        ConfigCommand::Path => cmd_path(ctx),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = &ctx.config;
    let config = &loaded.config;

    if ctx.json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "sources": loaded
                    .loaded_from()
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>(),
                "config": config,
                "warnings": loaded.warnings,
            }))?
        );
        return Ok(());
    }

    println!("# pipwarden configuration\n");

    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("No config files loaded (using defaults)\n");
    } else {
        println!("Config files:");
        for source in &sources {
            println!("  {}", source.display());
        }
        println!();
    }

    let sandbox = config.sandbox_or_default();
    println!("Sandbox:");
    println!("  kind: {:?}", sandbox.kind);
    println!("  default policy: {:?}", sandbox.default_policy);
    println!("  drought timeout: {}s", sandbox.drought_timeout_secs);
    println!();

    if !config.allowlist.is_empty() {
        println!("Allowlist:");
        for entry in &config.allowlist {
            let tool = entry
                .tool_path
                .as_ref()
                .map(|p| p.display().to_string())
                .or_else(|| entry.tool_name.clone())
                .unwrap_or_default();
            let caching = if entry.allow_caching {
                "cacheable"
            } else {
                "not cacheable"
            };
            println!(
                "  {:<16} {} {} ({caching})",
                entry.name,
                tool,
                entry.path_regex.as_deref().unwrap_or("*")
            );
        }
        println!();
    }

    if let Some(vm) = &config.vm {
        println!("VM:");
        println!("  proxy: {}", vm.proxy_path.display());
        println!("  io dir: {}", vm.io_dir.display());
        println!();
    } else if let Some(external) = &config.external {
        println!("External helper:");
        println!("  helper: {}", external.helper_path.display());
        println!("  timeout: {}s", external.timeout_secs);
        println!();
    }

    if !loaded.warnings.is_empty() {
        let yellow = Style::new().yellow();
        println!("Warnings:");
        for w in &loaded.warnings {
            println!("  {} {}", yellow.apply_to("⚠"), w);
        }
        println!();
    }

    if ctx.verbose {
        println!("---\nRaw config:\n");
        if let Ok(toml_str) = config.to_toml() {
            println!("{}", toml_str);
        }
    }

    Ok(())
}

fn cmd_which(ctx: &Context) -> Result<()> {
    if ctx.json_output {
        let sources: Vec<_> = ctx
            .config
            .sources
            .iter()
            .map(|s| serde_json::json!({ "path": s.path.display().to_string(), "loaded": s.loaded }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&sources)?);
        return Ok(());
    }

    println!("Config file search order (later overrides earlier):\n");
    for source in &ctx.config.sources {
        let status = if source.loaded {
            "✓ loaded"
        } else {
            "· not found"
        };
        println!("  {} {}", status, source.path.display());
    }
    println!();
    Ok(())
}

fn cmd_path(ctx: &Context) -> Result<()> {
    let path = pipwarden_config::user_config_path();
    if ctx.json_output {
        let path = path.map(|p| p.display().to_string());
        println!("{}", serde_json::to_string_pretty(&path)?);
        return Ok(());
    }
    match path {
        Some(path) => println!("{}", path.display()),
        None => anyhow::bail!("no user config directory on this platform"),
    }
    Ok(())
}
