//! Real implementations of the collaborator traits.
//!
//! These run external processes and read real files. They implement the
//! same traits as the mocks in [`crate::testing`], so the state machine is
//! assembled the same way in production and in tests.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

use crate::audit::AuditLogger;
use crate::config::{BackendConfig, VerifierConfig, VerifyLevel};
use crate::testing::{
    ErrorLearner, Generation, LanguageModel, ModelContext, PlanTracker, Verification, Verifier,
};

/// Output kept from a failing verification command.
const MAX_OUTPUT_CHARS: usize = 4000;

/// Environment variable carrying the JSON [`ModelContext`] to the backend.
pub const CONTEXT_ENV: &str = "AUTOPATCH_CONTEXT";

// ============================================================================
// Shell
// ============================================================================

/// Captured result of a shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// Exit code; `None` if killed by a signal or timed out.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ShellOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    /// stderr and stdout, trimmed and joined.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut out = self.stderr.trim().to_string();
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(stdout);
        }
        out
    }
}

/// Run `command` through `sh -c` in `dir`, killing it after `timeout`.
///
/// # Errors
///
/// Returns an error if the shell cannot be spawned.
pub async fn run_shell(command: &str, dir: &Path, timeout: Duration) -> Result<ShellOutput> {
    debug!("sh -c {}", command);
    let child = AsyncCommand::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn `{command}`"))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output.with_context(|| format!("Failed to wait for `{command}`"))?;
            Ok(ShellOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
            })
        }
        Err(_) => Ok(ShellOutput {
            code: None,
            stdout: String::new(),
            stderr: format!("timed out after {}s", timeout.as_secs()),
            timed_out: true,
        }),
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skipped: String = text.chars().skip(count - max_chars).collect();
    format!("...{skipped}")
}

// ============================================================================
// Backend
// ============================================================================

/// Backend that runs a configured command per request.
///
/// The prompt is written to the command's stdin and the [`ModelContext`] is
/// passed as JSON in `AUTOPATCH_CONTEXT`. The command prints a JSON object
/// `{text, operations: [{name, arguments}], success, delegated}` on stdout.
/// Output that is not JSON is treated as free text with no operations.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    project_dir: PathBuf,
    timeout: Duration,
}

impl CommandBackend {
    #[must_use]
    pub fn new(program: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            project_dir: project_dir.into(),
            timeout: Duration::from_secs(600),
        }
    }

    /// Build from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no backend command is configured.
    pub fn from_config(config: &BackendConfig, project_dir: impl Into<PathBuf>) -> Result<Self> {
        let Some(program) = &config.command else {
            bail!("No backend command configured (set [backend].command)");
        };
        Ok(Self::new(program.clone(), project_dir).with_args(config.args.clone()))
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parse backend stdout. Accepts a bare JSON object or a last line that
    /// is one.
    #[must_use]
    pub fn parse_output(stdout: &str) -> Generation {
        let trimmed = stdout.trim();
        if let Ok(generation) = serde_json::from_str::<Generation>(trimmed) {
            return generation;
        }
        if let Some(generation) = trimmed
            .lines()
            .rev()
            .map(str::trim)
            .filter(|l| l.starts_with('{'))
            .find_map(|l| serde_json::from_str::<Generation>(l).ok())
        {
            return generation;
        }
        Generation::text_only(trimmed)
    }
}

#[async_trait]
impl LanguageModel for CommandBackend {
    async fn generate(&self, prompt: &str, context: &ModelContext) -> Result<Generation> {
        debug!("Running backend {}", self.program);

        let mut child = AsyncCommand::new(&self.program)
            .args(&self.args)
            .current_dir(&self.project_dir)
            .env(CONTEXT_ENV, serde_json::to_string(context)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn backend `{}`", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.flush().await?;
            drop(stdin);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("Backend timed out after {}s", self.timeout.as_secs()))?
            .context("Failed to read backend output")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Backend exited with {}: {}",
                output.status.code().map_or("signal".to_string(), |c| c.to_string()),
                tail(stderr.trim(), MAX_OUTPUT_CHARS)
            );
        }

        Ok(Self::parse_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// Verifier that runs configured shell commands.
///
/// Levels are cumulative: `lint` runs the syntax commands first, `full`
/// runs syntax, lint, then tests. The first failing command stops the run.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    project_dir: PathBuf,
    config: VerifierConfig,
}

impl CommandVerifier {
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>, config: VerifierConfig) -> Self {
        Self {
            project_dir: project_dir.into(),
            config,
        }
    }

    /// Commands for a level, in run order.
    #[must_use]
    pub fn commands(&self, level: VerifyLevel) -> Vec<&str> {
        let mut commands: Vec<&str> = self.config.syntax.iter().map(String::as_str).collect();
        if level >= VerifyLevel::Lint {
            commands.extend(self.config.lint.iter().map(String::as_str));
        }
        if level >= VerifyLevel::Full {
            commands.extend(self.config.test.iter().map(String::as_str));
        }
        commands
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn verify_project(&self, level: VerifyLevel) -> Result<Verification> {
        let commands = self.commands(level);
        if commands.is_empty() {
            debug!("No verification commands configured for level {}", level);
            return Ok(Verification::pass());
        }

        let timeout = Duration::from_secs(self.config.timeout_secs.unwrap_or(600));
        for command in commands {
            let output = run_shell(command, &self.project_dir, timeout).await?;
            if !output.success() {
                let status = if output.timed_out {
                    "timed out".to_string()
                } else {
                    format!(
                        "exit {}",
                        output.code.map_or("signal".to_string(), |c| c.to_string())
                    )
                };
                return Ok(Verification::fail(format!(
                    "`{command}` failed ({status}):\n{}",
                    tail(&output.combined(), MAX_OUTPUT_CHARS)
                )));
            }
        }
        Ok(Verification::pass())
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Markdown checklist plan.
///
/// Complete when the file has at least one checkbox item and none of them
/// is unchecked. A missing file is never complete.
#[derive(Debug, Clone)]
pub struct MarkdownPlan {
    path: PathBuf,
}

impl MarkdownPlan {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `(done, total)` checkbox counts in `content`.
    #[must_use]
    pub fn count_items(content: &str) -> (usize, usize) {
        let Ok(re) = Regex::new(r"^\s*[-*+]\s+\[( |x|X)\]") else {
            return (0, 0);
        };
        content
            .lines()
            .filter_map(|line| re.captures(line))
            .fold((0, 0), |(done, total), caps| {
                let checked = caps.get(1).is_some_and(|m| m.as_str() != " ");
                (done + usize::from(checked), total + 1)
            })
    }
}

impl PlanTracker for MarkdownPlan {
    fn is_complete(&self) -> Result<bool> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        let (done, total) = Self::count_items(&content);
        Ok(total > 0 && done == total)
    }
}

// ============================================================================
// Learner
// ============================================================================

/// Learner that appends error patterns to the audit log.
#[derive(Debug, Clone)]
pub struct AuditLearner {
    audit: Option<Arc<AuditLogger>>,
    session_id: String,
}

impl AuditLearner {
    #[must_use]
    pub fn new(audit: Option<Arc<AuditLogger>>, session_id: impl Into<String>) -> Self {
        Self {
            audit,
            session_id: session_id.into(),
        }
    }
}

impl ErrorLearner for AuditLearner {
    fn record_failure(&self, signature: &str, message: &str) -> Result<()> {
        match &self.audit {
            Some(audit) => {
                audit
                    .log_error_pattern(&self.session_id, signature, message)
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
            }
            None => warn!("Verification failure {}: {}", signature, message),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEventType;
    use tempfile::TempDir;

    #[test]
    fn test_parse_output_json() {
        let generation = CommandBackend::parse_output(
            r#"{"text":"ok","operations":[{"name":"write_file","arguments":{"path":"a.py","content":"x"}}],"success":true}"#,
        );
        assert_eq!(generation.text, "ok");
        assert_eq!(generation.operations.len(), 1);
    }

    #[test]
    fn test_parse_output_last_json_line() {
        let generation = CommandBackend::parse_output(
            "thinking...\n{\"text\":\"done\",\"operations\":[],\"delegated\":true}\n",
        );
        assert!(generation.delegated);
        assert_eq!(generation.text, "done");
    }

    #[test]
    fn test_parse_output_plain_text() {
        let generation = CommandBackend::parse_output("I could not find the file.");
        assert!(generation.success);
        assert!(generation.operations.is_empty());
        assert_eq!(generation.text, "I could not find the file.");
    }

    #[tokio::test]
    async fn test_command_backend_round_trip() {
        let temp = TempDir::new().unwrap();
        let backend = CommandBackend::new("sh", temp.path()).with_args(vec![
            "-c".into(),
            r#"read -r line; printf '{"text":"%s","operations":[]}' "$line""#.into(),
        ]);

        let generation = backend
            .generate("hello\n", &ModelContext::default())
            .await
            .unwrap();
        assert_eq!(generation.text, "hello");
    }

    #[tokio::test]
    async fn test_command_backend_failure() {
        let temp = TempDir::new().unwrap();
        let backend = CommandBackend::new("sh", temp.path())
            .with_args(vec!["-c".into(), "echo nope >&2; exit 3".into()]);

        let err = backend
            .generate("", &ModelContext::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with 3"));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_backend_from_config_requires_command() {
        assert!(CommandBackend::from_config(&BackendConfig::default(), ".").is_err());
    }

    #[tokio::test]
    async fn test_run_shell_timeout() {
        let temp = TempDir::new().unwrap();
        let output = run_shell("sleep 5", temp.path(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_verifier_levels_are_cumulative() {
        let temp = TempDir::new().unwrap();
        let config = VerifierConfig {
            syntax: vec!["true".into()],
            lint: vec!["echo lint >> ran.txt".into()],
            test: vec!["echo 'SyntaxError line 4' >&2; exit 1".into()],
            timeout_secs: Some(10),
        };
        let verifier = CommandVerifier::new(temp.path(), config);

        assert_eq!(verifier.commands(VerifyLevel::Syntax).len(), 1);
        assert!(verifier.verify_project(VerifyLevel::Lint).await.unwrap().passed);

        let result = verifier.verify_project(VerifyLevel::Full).await.unwrap();
        assert!(!result.passed);
        assert!(result.message.contains("SyntaxError line 4"));
        assert!(result.message.contains("exit 1"));
    }

    #[tokio::test]
    async fn test_verifier_without_commands_passes() {
        let verifier = CommandVerifier::new(".", VerifierConfig::default());
        assert!(verifier.verify_project(VerifyLevel::Full).await.unwrap().passed);
    }

    #[test]
    fn test_markdown_plan() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("PLAN.md");
        let plan = MarkdownPlan::new(&path);
        assert!(!plan.is_complete().unwrap());

        std::fs::write(&path, "# Plan\n\nNo items yet\n").unwrap();
        assert!(!plan.is_complete().unwrap());

        std::fs::write(&path, "- [x] one\n- [ ] two\n").unwrap();
        assert!(!plan.is_complete().unwrap());

        std::fs::write(&path, "- [x] one\n  * [X] two\n").unwrap();
        assert!(plan.is_complete().unwrap());
        assert_eq!(MarkdownPlan::count_items("- [x] a\n- [ ] b\ntext"), (1, 2));
    }

    #[test]
    fn test_audit_learner_writes_pattern() {
        let temp = TempDir::new().unwrap();
        let audit = Arc::new(AuditLogger::new(temp.path().to_path_buf()).unwrap());
        let learner = AuditLearner::new(Some(Arc::clone(&audit)), "run");

        learner.record_failure("abc123", "SyntaxError line 4").unwrap();
        let entries = audit.read_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, AuditEventType::ErrorPattern);
    }
}
