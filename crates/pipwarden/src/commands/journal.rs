//! Journal command - replay a shared opaque output journal.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use console::Style;

use super::Context;

/// Arguments for the journal command.
#[derive(Args, Debug)]
pub struct JournalArgs {
    /// Journal file to read
    pub file: PathBuf,

    /// Sort paths instead of keeping write order
    #[arg(long)]
    pub sort: bool,

    /// Drop repeated paths, keeping the first occurrence
    #[arg(long)]
    pub dedupe: bool,
}

/// Run the journal command.
pub async fn run(args: JournalArgs, ctx: &Context) -> Result<()> {
    let recorded = pipwarden_sandbox::read_journal(&args.file)
        .with_context(|| format!("failed to read journal {}", args.file.display()))?;
    let total = recorded.len();
    let paths = arrange(recorded, args.sort, args.dedupe);

    if ctx.json_output {
        let paths: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        println!("{}", serde_json::to_string_pretty(&paths)?);
        return Ok(());
    }

    for path in &paths {
        println!("{}", path.display());
    }
    if ctx.verbose {
        let dim = Style::new().dim();
        eprintln!(
            "{}",
            dim.apply_to(format!("{} of {total} records", paths.len()))
        );
    }
    Ok(())
}

fn arrange(mut paths: Vec<PathBuf>, sort: bool, dedupe: bool) -> Vec<PathBuf> {
    if dedupe {
        let mut seen = HashSet::new();
        paths.retain(|p| seen.insert(p.clone()));
    }
    if sort {
        paths.sort();
    }
    paths
}
