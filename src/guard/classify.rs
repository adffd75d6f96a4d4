//! Risk classification for proposed operations.
//!
//! Rules are evaluated in a fixed order and the first match wins:
//!
//! 1. protected absolute path            -> `PROTECTED_PATH`, critical
//! 2. sensitive file name                -> `SENSITIVE_CHANGE`, critical
//! 3. shell command with a known-dangerous pattern -> `SHELL_COMMAND`, critical
//! 4. deletion                           -> `DELETE`, high
//! 5. shell command                      -> `SHELL_COMMAND`, high
//! 6. configuration file                 -> `CONFIG_CHANGE`, high
//! 7. changed content over the threshold -> `LARGE_EDIT`, medium
//! 8. anything else                      -> `WRITE`, low
//!
//! Operations whose arguments are malformed skip rules 3-7 and land on
//! `WRITE`/low; path rules still apply to whatever path could be read.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use super::{OperationType, Severity};
use crate::config::{GuardConfig, DANGEROUS_PATTERNS};
use crate::error::{AutopatchError, Result};
use crate::operation::{resolve_target, Operation, OperationKind};

/// Outcome of classifying one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub operation_type: OperationType,
    pub severity: Severity,
    /// Path as the operation named it, or empty for commands.
    pub file_path: String,
    /// Which rule matched.
    pub reason: String,
    /// Arguments were missing or unreadable.
    pub malformed: bool,
}

impl Classification {
    fn new(operation_type: OperationType, severity: Severity, file_path: &str, reason: String) -> Self {
        Self {
            operation_type,
            severity,
            file_path: file_path.to_string(),
            reason,
            malformed: false,
        }
    }
}

/// Compiled classification rules for one project root.
#[derive(Debug, Clone)]
pub struct RiskClassifier {
    root: PathBuf,
    protected: GlobSet,
    sensitive: GlobSet,
    config: GlobSet,
    large_edit_threshold: usize,
}

impl RiskClassifier {
    /// Compile the glob lists from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::InvalidConfig`] naming the first glob that
    /// does not parse.
    pub fn new(root: impl Into<PathBuf>, config: &GuardConfig) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            protected: build_set("guard.protected_paths", &config.protected_paths)?,
            sensitive: build_set("guard.sensitive_patterns", &config.sensitive_patterns)?,
            config: build_set("guard.config_patterns", &config.config_patterns)?,
            large_edit_threshold: config.large_edit_threshold,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` names a sensitive file.
    #[must_use]
    pub fn is_sensitive(&self, path: &str) -> bool {
        self.matches(&self.sensitive, path)
    }

    /// Classify one operation.
    #[must_use]
    pub fn classify(&self, op: &Operation) -> Classification {
        let path = op.target_path().unwrap_or_default();

        if !path.is_empty() {
            let resolved = resolve_target(&self.root, path);
            if self.protected.is_match(&resolved) {
                return Classification::new(
                    OperationType::ProtectedPath,
                    Severity::Critical,
                    path,
                    format!("{} is a protected location", resolved.display()),
                );
            }
            if self.matches(&self.sensitive, path) {
                return Classification::new(
                    OperationType::SensitiveChange,
                    Severity::Critical,
                    path,
                    format!("{path} matches a sensitive file pattern"),
                );
            }
        }

        if let Err(problem) = op.validate() {
            let mut class = Classification::new(
                OperationType::Write,
                Severity::Low,
                path,
                format!("malformed operation: {problem}"),
            );
            class.malformed = true;
            return class;
        }

        match op.kind() {
            OperationKind::RunCommand => {
                let command = op.command().unwrap_or_default();
                if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| command.contains(**p)) {
                    return Classification::new(
                        OperationType::ShellCommand,
                        Severity::Critical,
                        "",
                        format!("command contains dangerous pattern '{pattern}'"),
                    );
                }
                Classification::new(
                    OperationType::ShellCommand,
                    Severity::High,
                    "",
                    "shell command execution".to_string(),
                )
            }
            OperationKind::DeleteFile => Classification::new(
                OperationType::Delete,
                Severity::High,
                path,
                format!("deletes {path}"),
            ),
            OperationKind::WriteFile | OperationKind::ReplaceInFile
                if self.matches(&self.config, path) =>
            {
                Classification::new(
                    OperationType::ConfigChange,
                    Severity::High,
                    path,
                    format!("{path} is a configuration file"),
                )
            }
            OperationKind::WriteFile | OperationKind::ReplaceInFile
                if op.changed_size() > self.large_edit_threshold =>
            {
                Classification::new(
                    OperationType::LargeEdit,
                    Severity::Medium,
                    path,
                    format!(
                        "{} bytes exceeds the {} byte edit threshold",
                        op.changed_size(),
                        self.large_edit_threshold
                    ),
                )
            }
            _ => Classification::new(
                OperationType::Write,
                Severity::Low,
                path,
                "ordinary edit".to_string(),
            ),
        }
    }

    /// Match against the resolved absolute path, the path as written, and
    /// the bare file name, so both `**/x` and `x` patterns work.
    fn matches(&self, set: &GlobSet, path: &str) -> bool {
        let resolved = resolve_target(&self.root, path);
        if set.is_match(&resolved) || set.is_match(path) {
            return true;
        }
        resolved
            .file_name()
            .is_some_and(|name| set.is_match(Path::new(name)))
    }
}

fn build_set(field: &str, patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| AutopatchError::InvalidConfig {
                field: field.to_string(),
                reason: format!("invalid glob '{pattern}': {e}"),
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| AutopatchError::InvalidConfig {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classifier() -> RiskClassifier {
        RiskClassifier::new("/work/project", &GuardConfig::default()).unwrap()
    }

    fn classify(name: &str, args: serde_json::Value) -> Classification {
        classifier().classify(&Operation::new(name, args))
    }

    #[test]
    fn test_protected_path_is_critical() {
        let class = classify("write_file", json!({"path": "/etc/hosts", "content": "x"}));
        assert_eq!(class.operation_type, OperationType::ProtectedPath);
        assert_eq!(class.severity, Severity::Critical);

        let class = classify("write_file", json!({"path": ".git/config", "content": "x"}));
        assert_eq!(class.operation_type, OperationType::ProtectedPath);
    }

    #[test]
    fn test_sensitive_file_is_critical() {
        for path in [".env", "deploy/.env.production", "keys/server.pem", "config/secrets.yaml"] {
            let class = classify("write_file", json!({"path": path, "content": "K=v"}));
            assert_eq!(class.operation_type, OperationType::SensitiveChange, "{path}");
            assert_eq!(class.severity, Severity::Critical);
        }
    }

    #[test]
    fn test_sensitive_beats_delete() {
        let class = classify("delete_file", json!({"path": ".env"}));
        assert_eq!(class.operation_type, OperationType::SensitiveChange);
    }

    #[test]
    fn test_shell_commands() {
        let class = classify("run_command", json!({"command": "pytest -q"}));
        assert_eq!(class.operation_type, OperationType::ShellCommand);
        assert_eq!(class.severity, Severity::High);

        let class = classify("run_command", json!({"command": "sudo rm -rf build"}));
        assert_eq!(class.severity, Severity::Critical);
        assert!(class.reason.contains("sudo rm"));
    }

    #[test]
    fn test_delete_is_high() {
        let class = classify("delete_file", json!({"path": "a.py"}));
        assert_eq!(class.operation_type, OperationType::Delete);
        assert_eq!(class.severity, Severity::High);
        assert_eq!(class.file_path, "a.py");
    }

    #[test]
    fn test_config_change_is_high() {
        let class = classify("write_file", json!({"path": "Cargo.toml", "content": "[package]"}));
        assert_eq!(class.operation_type, OperationType::ConfigChange);
        assert_eq!(class.severity, Severity::High);

        let class = classify(
            "replace_in_file",
            json!({"path": ".github/workflows/ci.yml", "search": "a", "replace": "b"}),
        );
        assert_eq!(class.operation_type, OperationType::ConfigChange);
    }

    #[test]
    fn test_large_edit_threshold() {
        let mut config = GuardConfig::default();
        config.large_edit_threshold = 10;
        let classifier = RiskClassifier::new("/work/project", &config).unwrap();

        let small = Operation::new("write_file", json!({"path": "a.py", "content": "0123456789"}));
        assert_eq!(classifier.classify(&small).severity, Severity::Low);

        let large = Operation::new("write_file", json!({"path": "a.py", "content": "0123456789x"}));
        let class = classifier.classify(&large);
        assert_eq!(class.operation_type, OperationType::LargeEdit);
        assert_eq!(class.severity, Severity::Medium);
    }

    #[test]
    fn test_ordinary_write_is_low() {
        let class = classify("write_file", json!({"path": "src/lib.py", "content": "x = 1"}));
        assert_eq!(class.operation_type, OperationType::Write);
        assert_eq!(class.severity, Severity::Low);
        assert!(!class.malformed);
    }

    #[test]
    fn test_malformed_is_low() {
        let class = classify("delete_file", json!({"paht": "a.py"}));
        assert_eq!(class.severity, Severity::Low);
        assert!(class.malformed);

        let class = classify("run_command", json!({"cmdline": "rm -rf /"}));
        assert_eq!(class.severity, Severity::Low);
        assert!(class.malformed);
    }

    #[test]
    fn test_malformed_sensitive_path_is_still_critical() {
        let class = classify("write_file", json!({"path": ".env"}));
        assert_eq!(class.operation_type, OperationType::SensitiveChange);
    }

    #[test]
    fn test_invalid_glob_is_config_error() {
        let mut config = GuardConfig::default();
        config.config_patterns.push("[oops".to_string());
        let err = RiskClassifier::new("/", &config).unwrap_err();
        assert!(matches!(err, AutopatchError::InvalidConfig { .. }));
    }
}
