//! CLI adapter — spawns participant binaries and classifies their exits.
//!
//! Executables are resolved by explicit PATH lookup, never through a shell.
//! The prompt is written to the child's stdin; stdout is consumed line by
//! line so stream chunks can be forwarded while the call is in flight.
//! Cancellation and the phase deadline both kill the child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::outcome::{InvokeOutcome, InvokeRequest, StreamEvent};
use super::ParticipantGateway;
use crate::task::Provider;

const STDERR_TAIL_BYTES: usize = 4096;

/// Gateway implementation that shells out to provider CLIs.
pub struct CliGateway {
    provider_limit_pattern: Regex,
}

impl CliGateway {
    pub fn new() -> Self {
        Self {
            // Quota and rate signals the known providers print to stderr.
            provider_limit_pattern: Regex::new(
                r"(?i)rate.?limit|quota|too many requests|usage limit|resource.?exhausted|overloaded|\b429\b",
            )
            .expect("provider limit regex should compile"),
        }
    }

    /// Binary name for a provider.
    fn binary_name(provider: &Provider) -> String {
        match provider {
            Provider::Claude => "claude".to_string(),
            Provider::Codex => "codex".to_string(),
            Provider::Gemini => "gemini".to_string(),
            Provider::Extension(name) => name.clone(),
        }
    }

    /// Base arguments for non-interactive invocation, per provider.
    fn base_args(provider: &Provider) -> Vec<String> {
        match provider {
            Provider::Claude => vec!["-p".to_string()],
            Provider::Codex => vec!["exec".to_string()],
            Provider::Gemini | Provider::Extension(_) => Vec::new(),
        }
    }

    fn classify_failure(&self, stderr: &str) -> InvokeOutcome {
        let tail = tail_str(stderr, STDERR_TAIL_BYTES);
        if self.provider_limit_pattern.is_match(stderr) {
            InvokeOutcome::ProviderLimit { detail: tail }
        } else {
            InvokeOutcome::RuntimeError { detail: tail }
        }
    }
}

impl Default for CliGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ParticipantGateway for CliGateway {
    async fn invoke(&self, request: InvokeRequest, cancel: &CancellationToken) -> InvokeOutcome {
        let program = Self::binary_name(&request.participant.provider);
        let Some(resolved) = resolve_executable(&program) else {
            warn!(participant = %request.participant, %program, "participant executable not on PATH");
            return InvokeOutcome::NotFound;
        };

        let mut args = Self::base_args(&request.participant.provider);
        if let Some(model) = &request.overrides.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(extra) = &request.overrides.extra_args {
            args.extend(split_args(extra));
        }

        debug!(
            participant = %request.participant,
            phase = %request.phase,
            program = %resolved.display(),
            "invoking participant"
        );

        let mut child = match Command::new(&resolved)
            .args(&args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return InvokeOutcome::NotFound,
            Err(e) => {
                return InvokeOutcome::RuntimeError {
                    detail: format!("spawn failed: {}", e),
                }
            }
        };

        // Feed the prompt and close stdin so the CLI runs one-shot.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                let _ = child.kill().await;
                return InvokeOutcome::RuntimeError {
                    detail: format!("stdin write failed: {}", e),
                };
            }
            drop(stdin);
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let collect = async {
            let mut text = String::new();
            let mut stream_events = Vec::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if request.stream {
                                stream_events.push(StreamEvent {
                                    chunk: line.clone(),
                                    at: Utc::now(),
                                });
                            }
                            text.push_str(&line);
                            text.push('\n');
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "stdout read error");
                            break;
                        }
                    }
                }
            }
            let mut err_buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut err_buf).await;
            }
            let status = child.wait().await;
            (text, stream_events, err_buf, status)
        };

        let deadline_secs = request.deadline.as_secs();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(participant = %request.participant, "invocation canceled");
                // kill_on_drop tears the child down within the grace window.
                InvokeOutcome::Timeout { after_secs: 0 }
            }
            result = tokio::time::timeout(request.deadline, collect) => {
                match result {
                    Err(_) => {
                        warn!(participant = %request.participant, deadline_secs, "phase deadline exceeded");
                        InvokeOutcome::Timeout { after_secs: deadline_secs }
                    }
                    Ok((text, stream_events, err_buf, status)) => match status {
                        Ok(status) if status.success() => InvokeOutcome::Ok { text, stream_events },
                        Ok(_) => self.classify_failure(&err_buf),
                        Err(e) => InvokeOutcome::RuntimeError {
                            detail: format!("wait failed: {}", e),
                        },
                    },
                }
            }
        }
    }
}

/// Resolve a program name against PATH without involving a shell.
pub fn resolve_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        // Explicit path given; accept it as-is when it exists.
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in split_search_path(&path_var) {
        let direct = dir.join(program);
        if direct.is_file() {
            return Some(direct);
        }
        if cfg!(windows) {
            for ext in ["exe", "cmd", "bat"] {
                let with_ext = dir.join(format!("{}.{}", program, ext));
                if with_ext.is_file() {
                    return Some(with_ext);
                }
            }
        }
    }
    None
}

/// Split a PATH-style list into entries.
///
/// Windows lists use `;`, but tooling occasionally hands over `:`-joined
/// lists there too; in that case a bare drive letter must be re-joined with
/// the path component that follows it (`C` + `\bin` → `C:\bin`).
pub fn split_search_path(path_var: &str) -> Vec<PathBuf> {
    if cfg!(windows) {
        if path_var.contains(';') {
            return path_var
                .split(';')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        let mut entries: Vec<String> = Vec::new();
        for token in path_var.split(':') {
            let is_drive = token.len() == 1 && token.chars().all(|c| c.is_ascii_alphabetic());
            if is_drive {
                entries.push(format!("{}:", token));
            } else if entries
                .last()
                .map(|prev| prev.ends_with(':'))
                .unwrap_or(false)
            {
                let prev = entries.pop().unwrap_or_default();
                entries.push(format!("{}{}", prev, token));
            } else if !token.is_empty() {
                entries.push(token.to_string());
            }
        }
        entries.into_iter().map(PathBuf::from).collect()
    } else {
        std::env::split_paths(path_var).collect()
    }
}

/// Split an `extra_args` override into argv tokens. Whitespace separated;
/// no quoting or expansion, matching the no-shell invocation policy.
pub fn split_args(extra: &str) -> Vec<String> {
    extra
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

fn tail_str(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_names() {
        assert_eq!(CliGateway::binary_name(&Provider::Claude), "claude");
        assert_eq!(
            CliGateway::binary_name(&Provider::Extension("aider".to_string())),
            "aider"
        );
    }

    #[test]
    fn test_split_args_whitespace_only() {
        assert_eq!(
            split_args("--flag  value\t--other"),
            vec!["--flag", "value", "--other"]
        );
        assert!(split_args("   ").is_empty());
    }

    #[test]
    fn test_classify_provider_limit() {
        let gateway = CliGateway::new();
        let outcome = gateway.classify_failure("error: Rate limit exceeded, retry later");
        assert!(matches!(outcome, InvokeOutcome::ProviderLimit { .. }));

        let outcome = gateway.classify_failure("panic: index out of bounds");
        assert!(matches!(outcome, InvokeOutcome::RuntimeError { .. }));
    }

    #[test]
    fn test_tail_str_char_boundary() {
        let s = "ααααα";
        let tail = tail_str(s, 3);
        assert!(s.ends_with(&tail));
    }

    #[cfg(unix)]
    #[test]
    fn test_split_search_path_unix() {
        let entries = split_search_path("/usr/bin:/usr/local/bin");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], PathBuf::from("/usr/bin"));
    }

    #[cfg(windows)]
    #[test]
    fn test_split_search_path_preserves_drive_letters() {
        let entries = split_search_path(r"C:\bin:D:\tools");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], PathBuf::from(r"C:\bin"));
        assert_eq!(entries[1], PathBuf::from(r"D:\tools"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_executable_is_not_found() {
        use crate::task::{ParticipantId, ParticipantOverride};

        let gateway = CliGateway::new();
        let request = InvokeRequest {
            participant: ParticipantId::parse("conclave-no-such-binary#x").unwrap(),
            phase: super::super::Phase::Review,
            prompt: "hello".to_string(),
            working_dir: std::env::temp_dir(),
            overrides: ParticipantOverride::default(),
            deadline: Duration::from_secs(5),
            stream: false,
        };
        let cancel = CancellationToken::new();
        let outcome = gateway.invoke(request, &cancel).await;
        assert!(matches!(outcome, InvokeOutcome::NotFound));
    }
}
