//! Manifest command - build or inspect an encoded file access manifest.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use console::{Style, style};
use serde::Serialize;

use pipwarden_sandbox::FileAccessManifest;
use pipwarden_types::{FileAccessPolicy, PipId};

use super::Context;

/// Arguments for the manifest command.
#[derive(Args, Debug)]
pub struct ManifestArgs {
    #[command(subcommand)]
    pub command: ManifestCommand,
}

#[derive(Subcommand, Debug)]
pub enum ManifestCommand {
    /// Build a manifest from declared paths and write its encoding
    Encode {
        /// Pip id the manifest belongs to
        #[arg(long, default_value_t = 0)]
        pip: u64,

        /// Declared input cone (read, probe, enumerate)
        #[arg(long = "read", value_name = "PATH")]
        reads: Vec<PathBuf>,

        /// Declared output cone (read and write)
        #[arg(long = "write", value_name = "PATH")]
        writes: Vec<PathBuf>,

        /// Directory translation, `FROM=TO`
        #[arg(long = "translate", value_name = "FROM=TO")]
        translations: Vec<String>,

        /// Child process allowed to break away, by executable name
        #[arg(long = "breakaway", value_name = "TOOL")]
        breakaway: Vec<String>,

        /// Output file for the encoded manifest
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Decode a manifest and print its contents
    Inspect {
        /// Encoded manifest file
        file: PathBuf,
    },
}

/// Run the manifest command.
pub async fn run(args: ManifestArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ManifestCommand::Encode {
            pip,
            reads,
            writes,
            translations,
            breakaway,
            output,
        } => {
            let spec = EncodeSpec {
                pip: PipId::new(pip),
                reads,
                writes,
                translations,
                breakaway,
            };
            cmd_encode(spec, &output, ctx)
        }
        ManifestCommand::Inspect { file } => cmd_inspect(&file, ctx),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encode
// ─────────────────────────────────────────────────────────────────────────────

struct EncodeSpec {
    pip: PipId,
    reads: Vec<PathBuf>,
    writes: Vec<PathBuf>,
    translations: Vec<String>,
    breakaway: Vec<String>,
}

fn build_manifest(spec: EncodeSpec, ctx: &Context) -> Result<FileAccessManifest> {
    let sandbox = ctx.config.config.sandbox_or_default();
    let mut manifest = FileAccessManifest::from_config(spec.pip, &sandbox);

    for path in &spec.reads {
        manifest
            .add_scope(path, FileAccessPolicy::ALLOW_READ_ONLY)
            .with_context(|| format!("invalid read path {}", path.display()))?;
    }
    for path in &spec.writes {
        manifest
            .add_scope(path, FileAccessPolicy::ALLOW_ALL)
            .with_context(|| format!("invalid write path {}", path.display()))?;
    }
    for rule in &spec.translations {
        let (from, to) = rule
            .split_once('=')
            .with_context(|| format!("translation must be FROM=TO: {rule}"))?;
        manifest
            .add_translation(from, to)
            .with_context(|| format!("invalid translation {rule}"))?;
    }
    for tool in spec.breakaway {
        manifest.add_breakaway(tool, None)?;
    }
    Ok(manifest)
}

fn cmd_encode(spec: EncodeSpec, output: &std::path::Path, ctx: &Context) -> Result<()> {
    let mut manifest = build_manifest(spec, ctx)?;
    let bytes = manifest.encode()?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(output, &bytes)
        .with_context(|| format!("failed to write {}", output.display()))?;

    tracing::info!(
        pip_id = %manifest.pip_id(),
        bytes = bytes.len(),
        output = %output.display(),
        "Wrote manifest"
    );
    if ctx.json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "pip_id": manifest.pip_id().to_string(),
                "bytes": bytes.len(),
                "output": output.display().to_string(),
            }))?
        );
    } else {
        println!("Wrote {} bytes to {}", bytes.len(), output.display());
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Inspect
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ManifestDump {
    pip_id: String,
    flags: u32,
    default_policy: u16,
    translations: Vec<(String, String)>,
    breakaway: Vec<String>,
    declared: Vec<DeclaredDump>,
}

#[derive(Debug, Serialize)]
struct DeclaredDump {
    path: String,
    node_policy: Option<u16>,
    cone_policy: Option<u16>,
}

fn dump(manifest: &FileAccessManifest) -> ManifestDump {
    ManifestDump {
        pip_id: manifest.pip_id().to_string(),
        flags: manifest.flags().bits(),
        default_policy: manifest.default_policy().bits(),
        translations: manifest
            .translator()
            .rules()
            .iter()
            .map(|(from, to)| (from.display().to_string(), to.display().to_string()))
            .collect(),
        breakaway: manifest
            .breakaway_processes()
            .iter()
            .map(|b| match &b.required_args {
                Some(args) => format!("{} ({args})", b.tool_name),
                None => b.tool_name.clone(),
            })
            .collect(),
        declared: manifest
            .declared_policies()
            .into_iter()
            .map(|(path, node, cone)| DeclaredDump {
                path: path.display().to_string(),
                node_policy: node.map(FileAccessPolicy::bits),
                cone_policy: cone.map(FileAccessPolicy::bits),
            })
            .collect(),
    }
}

fn cmd_inspect(file: &std::path::Path, ctx: &Context) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let manifest = FileAccessManifest::decode(&data)
        .with_context(|| format!("failed to decode manifest {}", file.display()))?;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&dump(&manifest))?);
        return Ok(());
    }

    let dim = Style::new().dim();
    println!();
    println!("{}", style(format!("Manifest {}", manifest.pip_id())).bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!("  {} {:?}", dim.apply_to("Flags:"), manifest.flags());
    println!(
        "  {} {:?}",
        dim.apply_to("Default policy:"),
        manifest.default_policy()
    );

    let rules = manifest.translator().rules();
    if !rules.is_empty() {
        println!();
        println!("Translations:");
        for (from, to) in rules {
            println!("  {} -> {}", from.display(), to.display());
        }
    }

    if !manifest.breakaway_processes().is_empty() {
        println!();
        println!("Breakaway processes:");
        for process in manifest.breakaway_processes() {
            match &process.required_args {
                Some(args) => println!("  {} (args containing {args:?})", process.tool_name),
                None => println!("  {}", process.tool_name),
            }
        }
    }

    println!();
    println!("Declared paths:");
    let declared = manifest.declared_policies();
    if declared.is_empty() {
        println!("  {}", dim.apply_to("(none)"));
    }
    for (path, node, cone) in declared {
        print!("  {}", path.display());
        if let Some(policy) = node {
            print!("  node={policy:?}");
        }
        if let Some(policy) = cone {
            print!("  cone={policy:?}");
        }
        println!();
    }
    println!();
    Ok(())
}
