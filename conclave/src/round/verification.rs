//! Verification phase — runs the configured test and lint commands with a
//! timeout, capturing exit codes and output tails.
//!
//! Commands are split on whitespace and executed without a shell, in the
//! task's execution root. A missing binary or an expired timeout is an
//! observable result, not an error.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gateway::adapter::split_args;
use crate::guards::CommandEvidence;
use crate::task::GateReason;

const OUTPUT_TAIL_BYTES: usize = 4096;

/// Result of the verification phase for one round.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    /// Whether any command actually ran.
    pub executed: bool,
    pub commands: Vec<CommandEvidence>,
    /// All executed commands exited zero.
    pub success: bool,
    pub timed_out: bool,
    pub command_not_found: bool,
    pub canceled: bool,
}

impl VerificationReport {
    /// Gate reason when verification did not succeed.
    pub fn failure_reason(&self) -> Option<GateReason> {
        if self.success && self.executed {
            return None;
        }
        if self.canceled {
            return Some(GateReason::ForceFailed);
        }
        if self.timed_out {
            return Some(GateReason::CommandTimeout);
        }
        if self.command_not_found {
            return Some(GateReason::CommandNotFound);
        }
        Some(GateReason::VerificationFailed)
    }

    /// Combined output text, for evidence path extraction.
    pub fn combined_output(&self) -> String {
        self.commands
            .iter()
            .map(|c| c.output_tail.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Run the configured commands in order, stopping at the first failure.
pub async fn run_verification(
    root: &Path,
    test_command: Option<&str>,
    lint_command: Option<&str>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> VerificationReport {
    let mut report = VerificationReport::default();
    let commands: Vec<&str> = [test_command, lint_command].into_iter().flatten().collect();
    if commands.is_empty() {
        return report;
    }

    report.success = true;
    for command in commands {
        if cancel.is_cancelled() {
            report.canceled = true;
            report.success = false;
            break;
        }
        report.executed = true;
        let evidence = run_one(root, command, timeout, cancel, &mut report).await;
        let failed = evidence.exit_code != Some(0);
        report.commands.push(evidence);
        if failed {
            report.success = false;
            break;
        }
    }
    report
}

async fn run_one(
    root: &Path,
    command: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    report: &mut VerificationReport,
) -> CommandEvidence {
    let argv = split_args(command);
    let Some((program, args)) = argv.split_first() else {
        return CommandEvidence {
            command: command.to_string(),
            exit_code: None,
            output_tail: "empty command".to_string(),
        };
    };

    debug!(command, root = %root.display(), "running verification command");
    let spawned = Command::new(program)
        .args(args)
        .current_dir(root)
        .kill_on_drop(true)
        .output();

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            report.canceled = true;
            return CommandEvidence {
                command: command.to_string(),
                exit_code: None,
                output_tail: "canceled".to_string(),
            };
        }
        result = tokio::time::timeout(timeout, spawned) => result,
    };

    match outcome {
        Err(_) => {
            warn!(command, timeout_secs = timeout.as_secs(), "verification command timed out");
            report.timed_out = true;
            CommandEvidence {
                command: command.to_string(),
                exit_code: None,
                output_tail: format!("timed out after {}s", timeout.as_secs()),
            }
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            report.command_not_found = true;
            CommandEvidence {
                command: command.to_string(),
                exit_code: None,
                output_tail: format!("{}: not found", program),
            }
        }
        Ok(Err(e)) => CommandEvidence {
            command: command.to_string(),
            exit_code: None,
            output_tail: format!("spawn failed: {}", e),
        },
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            CommandEvidence {
                command: command.to_string(),
                exit_code: output.status.code(),
                output_tail: tail(&combined, OUTPUT_TAIL_BYTES),
            }
        }
    }
}

fn tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
