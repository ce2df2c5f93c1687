//! Quality gates: pass/fail checks run in the working directory after the
//! agent exits. A run commits only when every gate passes.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::config::GateSpec;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub output_tail: String,
}

#[derive(Debug, Clone, Default)]
pub struct GateOutcome {
    pub passed: bool,
    pub results: Vec<GateResult>,
}

impl GateOutcome {
    pub fn all_passed() -> Self {
        Self {
            passed: true,
            results: Vec::new(),
        }
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GateRunner {
    gates: Vec<GateSpec>,
}

impl GateRunner {
    pub fn new(gates: Vec<GateSpec>) -> Self {
        Self { gates }
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Run every configured gate in `workdir`. Gates run in order and all of
    /// them run even after a failure, so the outcome lists every broken gate.
    pub async fn run(&self, workdir: &Path) -> Result<GateOutcome> {
        let mut outcome = GateOutcome {
            passed: true,
            results: Vec::new(),
        };

        for gate in &self.gates {
            tracing::info!(gate = %gate.name, "Running quality gate");
            let output = Command::new("sh")
                .arg("-c")
                .arg(&gate.command)
                .current_dir(workdir)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await?;

            let passed = output.status.success();
            let mut tail = String::from_utf8_lossy(&output.stderr).to_string();
            if tail.is_empty() {
                tail = String::from_utf8_lossy(&output.stdout).to_string();
            }
            let tail: String = tail
                .lines()
                .rev()
                .take(20)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");

            if !passed {
                tracing::warn!(
                    gate = %gate.name,
                    exit_code = ?output.status.code(),
                    "Quality gate failed"
                );
                outcome.passed = false;
            }
            outcome.results.push(GateResult {
                name: gate.name.clone(),
                passed,
                exit_code: output.status.code(),
                output_tail: tail,
            });
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(specs: &[(&str, &str)]) -> GateRunner {
        GateRunner::new(
            specs
                .iter()
                .map(|(name, command)| GateSpec {
                    name: name.to_string(),
                    command: command.to_string(),
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn empty_runner_passes() {
        let outcome = runner(&[]).run(Path::new(".")).await.unwrap();
        assert!(outcome.passed);
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn failing_gate_fails_the_outcome() {
        let outcome = runner(&[("ok", "true"), ("broken", "exit 3")])
            .run(Path::new("."))
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.failed_names(), vec!["broken"]);
        assert_eq!(outcome.results[1].exit_code, Some(3));
    }

    #[tokio::test]
    async fn gate_runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "here").unwrap();
        let outcome = runner(&[("marker exists", "test -f marker")])
            .run(dir.path())
            .await
            .unwrap();
        assert!(outcome.passed);
    }
}
