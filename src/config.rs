//! Configuration management for autopatch.
//!
//! Configuration is read from TOML files at two levels (user, then project)
//! and deep-merged over built-in defaults. See [`resolution`] for the merge
//! rules and [`validation`] for field checks.

pub mod resolution;
pub mod validation;

pub use resolution::{ConfigLevel, ConfigLoader, ConfigSource, InheritanceChain};
pub use validation::{validate, ValidationReport};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory (relative to the project root) holding all persisted state.
pub const STATE_DIR: &str = ".autopatch";

/// Project configuration file name inside [`STATE_DIR`].
pub const CONFIG_FILE: &str = "config.toml";

/// Full configuration for one project.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutopatchConfig {
    /// Orchestration loop limits.
    #[serde(rename = "loop")]
    pub loop_config: LoopConfig,
    /// Shadow-mode guard classification rules.
    pub guard: GuardConfig,
    /// Circuit breaker and hourly call budget.
    pub circuit: CircuitConfig,
    /// Verification commands.
    pub verifier: VerifierConfig,
    /// Language-model backend command.
    pub backend: BackendConfig,
    /// Limits for `run_command` operations.
    pub commands: CommandConfig,
}

impl AutopatchConfig {
    /// Load configuration for a project using the default user/project chain.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load(project_dir: &Path) -> anyhow::Result<Self> {
        ConfigLoader::new().load(project_dir)
    }

    /// Path of the project-level config file.
    pub fn project_path(project_dir: &Path) -> PathBuf {
        Self::state_dir(project_dir).join(CONFIG_FILE)
    }

    /// Directory holding persisted state for a project.
    pub fn state_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR)
    }
}

/// Limits for the orchestration loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Recovery retries before giving up.
    pub max_retries: u32,
    /// Consecutive loops with identical errors that count as a deadlock.
    pub deadlock_threshold: u32,
    /// Hard ceiling on loop iterations.
    pub max_loops: u32,
    /// Wall-clock budget for one task.
    pub task_timeout_secs: u64,
    /// Base backoff before retrying a backend failure.
    pub backoff_base_ms: u64,
    /// Backoff cap.
    pub backoff_max_ms: u64,
    /// Plan file checked by the default plan tracker.
    pub plan_file: String,
    /// Verification level requested after patching.
    pub verify_level: VerifyLevel,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            deadlock_threshold: 3,
            max_loops: 25,
            task_timeout_secs: 1800,
            backoff_base_ms: 2000,
            backoff_max_ms: 30_000,
            plan_file: "IMPLEMENTATION_PLAN.md".to_string(),
            verify_level: VerifyLevel::Full,
        }
    }
}

/// Depth of project verification.
///
/// Each level includes the commands of the levels before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyLevel {
    /// Syntax / compile checks only.
    Syntax,
    /// Syntax plus linters.
    Lint,
    /// Syntax, lint and tests.
    Full,
}

impl std::fmt::Display for VerifyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::Lint => write!(f, "lint"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// Classification rules for the shadow-mode guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuardConfig {
    /// Changed-content size (bytes) above which an edit is a LARGE_EDIT.
    pub large_edit_threshold: usize,
    /// Absolute path globs that are never written without approval.
    pub protected_paths: Vec<String>,
    /// File name globs for secrets and credentials.
    pub sensitive_patterns: Vec<String>,
    /// File name globs for configuration files.
    pub config_patterns: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            large_edit_threshold: 4000,
            protected_paths: DEFAULT_PROTECTED_PATHS.iter().map(|s| s.to_string()).collect(),
            sensitive_patterns: DEFAULT_SENSITIVE_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            config_patterns: DEFAULT_CONFIG_PATTERNS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Circuit breaker and call budget settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures after which the circuit opens.
    pub failure_threshold: u32,
    /// Seconds before an open circuit allows a trial call.
    pub cooldown_secs: u64,
    /// Model calls allowed per clock hour.
    pub hourly_quota: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 300,
            hourly_quota: 100,
        }
    }
}

/// Commands run by the default verifier, grouped by level.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifierConfig {
    pub syntax: Vec<String>,
    pub lint: Vec<String>,
    pub test: Vec<String>,
    /// Per-command timeout.
    pub timeout_secs: Option<u64>,
}

/// External command that answers model requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
}

/// Limits for commands proposed by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandConfig {
    pub timeout_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

/// Absolute locations that must never be written by the agent unattended.
pub const DEFAULT_PROTECTED_PATHS: &[&str] = &[
    "/etc/**",
    "/usr/**",
    "/bin/**",
    "/sbin/**",
    "/boot/**",
    "/var/**",
    "/root/.ssh/**",
    "/home/*/.ssh/**",
    "**/.git/**",
];

/// File name patterns that hold secrets or credentials.
pub const DEFAULT_SENSITIVE_PATTERNS: &[&str] = &[
    "**/.env",
    "**/.env.*",
    "**/*.pem",
    "**/*.key",
    "**/id_rsa*",
    "**/id_ed25519*",
    "**/*credentials*",
    "**/*secret*",
    "**/.npmrc",
    "**/.pypirc",
    "**/.netrc",
];

/// File name patterns for configuration files.
pub const DEFAULT_CONFIG_PATTERNS: &[&str] = &[
    "**/*.toml",
    "**/*.yaml",
    "**/*.yml",
    "**/*.ini",
    "**/*.cfg",
    "**/*.conf",
    "**/package.json",
    "**/tsconfig.json",
    "**/Dockerfile",
    "**/Makefile",
    "**/.github/workflows/*",
];

/// Dangerous command patterns; a `run_command` containing one is always critical.
pub const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "rm -rf /*",
    ":(){:|:&};:",
    "dd if=/dev/zero",
    "mkfs.",
    "> /dev/sd",
    "chmod 777",
    "chmod -R 777",
    "sudo rm",
    "sudo dd",
];

/// Credential-looking lines, matched one line at a time and redacted from
/// previews. Capture group 1, when present, is the part kept verbatim.
pub const SECRET_PATTERNS: &[&str] = &[
    r#"(?i)^(\s*(?:export\s+)?["']?[\w.-]*(?:api[_-]?key|apikey|password|passwd|pwd|secret|token|credential|private[_-]?key|access[_-]?key)[\w.-]*["']?\s*[:=]\s*)\S.*$"#,
    r"(?i)(aws[_-]?access[_-]?key|aws[_-]?secret)",
    r"-----BEGIN (RSA |DSA |EC |OPENSSH )?PRIVATE KEY-----",
];
