//! Exec command - the external helper entry point.
//!
//! Runs the invocation described by `--info` and writes the sandboxed
//! process result to `--result`. Exits 0 whenever the result file was
//! written, whatever the tool's own exit code was.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use super::Context;

/// Arguments for the exec command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Serialized invocation info (JSON)
    #[arg(long)]
    pub info: PathBuf,

    /// Where to write the sandboxed process result (JSON)
    #[arg(long)]
    pub result: PathBuf,
}

/// Run the exec command.
pub async fn run(args: ExecArgs, ctx: &Context) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, killing tool");
            on_signal.cancel();
        }
    });

    let outcome = pipwarden_exec::executor::execute_files(&args.info, &args.result, &cancel).await;
    signal.abort();

    let result = outcome.with_context(|| {
        format!(
            "failed to execute invocation from {}",
            args.info.display()
        )
    })?;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if ctx.verbose {
        eprintln!(
            "{} exited with code {} (result: {})",
            result.pip_id,
            result.exit_code,
            args.result.display()
        );
    }

    Ok(())
}
