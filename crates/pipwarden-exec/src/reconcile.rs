//! Layered result reconciliation.
//!
//! An external invocation is a stack of wrapping layers: the external helper
//! alone, or a VM command proxy around the tool it ran. Layers are checked
//! outermost first and the first failing layer decides the failure class.
//! Only when every layer succeeded is the sandboxed result file read, and a
//! file that cannot be read is a malformed-result failure. A file reporting
//! that the tool was killed or timed out is an inner-tool failure.

use std::path::Path;

use crate::info::{SandboxedProcessResult, read_json};
use crate::process::ProcessOutput;
use crate::result::{ExternalExecutionResult, FailureClass};

/// One wrapping layer and how it ended.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Used in hints, e.g. `"vm proxy"`.
    pub name: String,
    /// Class reported when this layer failed.
    pub class: FailureClass,
    pub output: ProcessOutput,
    /// Set when the layer exited cleanly but its output broke the contract.
    pub violation: Option<String>,
}

impl Layer {
    pub fn new(name: impl Into<String>, class: FailureClass, output: ProcessOutput) -> Self {
        Self {
            name: name.into(),
            class,
            output,
            violation: None,
        }
    }

    pub fn with_violation(mut self, violation: impl Into<String>) -> Self {
        self.violation = Some(violation.into());
        self
    }

    pub fn failed(&self) -> bool {
        !self.output.success() || self.violation.is_some()
    }

    /// The failure this layer produces, if it failed.
    pub fn failure(&self) -> Option<ExternalExecutionResult> {
        if !self.failed() {
            return None;
        }
        let hint = self.hint();
        tracing::debug!(class = %self.class, hint = %hint, "Invocation failed");
        Some(ExternalExecutionResult::failure(self.class, &self.output, hint))
    }

    fn hint(&self) -> String {
        if let Some(violation) = &self.violation {
            return format!("{}: {violation}", self.name);
        }
        if self.output.timed_out {
            format!("{} timed out", self.name)
        } else if self.output.killed {
            format!("{} was killed", self.name)
        } else {
            match self.output.exit_code {
                Some(code) => format!("{} exited with code {code}", self.name),
                None => format!("{} ended without an exit code", self.name),
            }
        }
    }
}

/// Reconcile `layers` (outermost first) and the result file.
pub fn reconcile(layers: &[Layer], result_file: &Path) -> ExternalExecutionResult {
    if let Some(failure) = layers.iter().find_map(Layer::failure) {
        return failure;
    }

    match read_json::<SandboxedProcessResult>(result_file) {
        Ok(result) if result.killed || result.timed_out => {
            tracing::debug!(pip_id = %result.pip_id, timed_out = result.timed_out, "Tool was killed");
            ExternalExecutionResult::tool_killed(result)
        }
        Ok(result) => ExternalExecutionResult::success(result),
        Err(e) => {
            tracing::debug!(error = %e, "Sandboxed result unusable");
            let output = layers.last().map(|l| l.output.clone()).unwrap_or_default();
            ExternalExecutionResult::failure(FailureClass::MalformedResult, &output, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::write_json;
    use chrono::Utc;
    use pipwarden_config::SandboxKind;
    use pipwarden_types::PipId;

    fn ok(stdout: &str) -> ProcessOutput {
        ProcessOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    fn exited(code: i32, stdout: &str) -> ProcessOutput {
        ProcessOutput {
            exit_code: Some(code),
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    fn result_file(dir: &Path, exit_code: i32) -> std::path::PathBuf {
        write_result(dir, exit_code, false)
    }

    fn write_result(dir: &Path, exit_code: i32, timed_out: bool) -> std::path::PathBuf {
        let path = dir.join("result.json");
        let now = Utc::now();
        write_json(
            &path,
            &SandboxedProcessResult {
                pip_id: PipId::new(1),
                exit_code,
                killed: timed_out,
                timed_out,
                stdout: "tool out".into(),
                stderr: String::new(),
                sandbox_kind: SandboxKind::Native,
                accesses: Vec::new(),
                processes: Vec::new(),
                started_at: now,
                finished_at: now,
            },
        )
        .unwrap();
        path
    }

    #[test]
    fn test_outer_layer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let file = result_file(dir.path(), 0);
        let layers = [
            Layer::new("vm proxy", FailureClass::ProxyFailure, exited(2, "proxy out")),
            Layer::new("inner tool", FailureClass::InnerToolFailure, exited(7, "tool out")),
        ];
        let result = reconcile(&layers, &file);
        assert_eq!(result.failure, Some(FailureClass::ProxyFailure));
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.stdout, "proxy out");
        assert_eq!(result.hint.as_deref(), Some("vm proxy exited with code 2"));
    }

    #[test]
    fn test_inner_failure_uses_inner_output() {
        let dir = tempfile::tempdir().unwrap();
        let file = result_file(dir.path(), 0);
        let layers = [
            Layer::new("vm proxy", FailureClass::ProxyFailure, ok("proxy out")),
            Layer::new("inner tool", FailureClass::InnerToolFailure, exited(7, "inner out")),
        ];
        let result = reconcile(&layers, &file);
        assert_eq!(result.failure, Some(FailureClass::InnerToolFailure));
        assert_eq!(result.exit_code, Some(7));
        assert_eq!(result.stdout, "inner out");
    }

    #[test]
    fn test_violation_fails_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let layers = [Layer::new("vm proxy", FailureClass::ProxyFailure, ok(""))
            .with_violation("unreadable run result")];
        let result = reconcile(&layers, &dir.path().join("none.json"));
        assert_eq!(result.failure, Some(FailureClass::ProxyFailure));
        assert_eq!(result.hint.as_deref(), Some("vm proxy: unreadable run result"));
    }

    #[test]
    fn test_killed_layer_hint() {
        let dir = tempfile::tempdir().unwrap();
        let output = ProcessOutput {
            killed: true,
            timed_out: true,
            ..Default::default()
        };
        let result = reconcile(
            &[Layer::new("external helper", FailureClass::ProxyFailure, output)],
            &dir.path().join("r.json"),
        );
        assert!(result.killed);
        assert!(result.timed_out);
        assert_eq!(result.hint.as_deref(), Some("external helper timed out"));
    }

    #[test]
    fn test_all_layers_ok_reads_result() {
        let dir = tempfile::tempdir().unwrap();
        let file = result_file(dir.path(), 3);
        let result = reconcile(
            &[Layer::new("external helper", FailureClass::ProxyFailure, ok(""))],
            &file,
        );
        assert!(result.is_success());
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout, "tool out");
        assert_eq!(result.result.unwrap().pip_id, PipId::new(1));
    }

    #[test]
    fn test_missing_or_bad_result_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let layers = [Layer::new("external helper", FailureClass::ProxyFailure, ok("helper"))];

        let missing = reconcile(&layers, &dir.path().join("missing.json"));
        assert_eq!(missing.failure, Some(FailureClass::MalformedResult));
        assert_eq!(missing.stdout, "helper");

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"pip_id": 1}"#).unwrap();
        let malformed = reconcile(&layers, &bad);
        assert_eq!(malformed.failure, Some(FailureClass::MalformedResult));
    }

    #[test]
    fn test_timed_out_tool_in_result_is_not_success() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_result(dir.path(), -1, true);
        let result = reconcile(
            &[Layer::new("external helper", FailureClass::ProxyFailure, ok(""))],
            &file,
        );
        assert!(!result.is_success());
        assert_eq!(result.failure, Some(FailureClass::InnerToolFailure));
        assert!(result.killed);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.stdout, "tool out");
        assert_eq!(result.hint.as_deref(), Some("tool timed out"));
    }
}
