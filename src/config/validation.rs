//! Configuration validation.
//!
//! # Example
//!
//! ```rust,ignore
//! use autopatch::config::{validate, AutopatchConfig};
//!
//! let report = validate(&AutopatchConfig::load(project_dir)?);
//! if !report.is_valid() {
//!     for error in &report.errors {
//!         eprintln!("Error: {}", error);
//!     }
//!     std::process::exit(report.exit_code());
//! }
//! ```

use globset::Glob;

use super::AutopatchConfig;

/// Result of configuration validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Errors that prevent the configuration from being used.
    pub errors: Vec<String>,
    /// Warnings that don't prevent validity but indicate potential issues.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Create a new empty validation report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the configuration is valid (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns 0 if valid, 1 if invalid.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_valid() {
            0
        } else {
            1
        }
    }

    /// Generate a human-readable summary of the validation result.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.is_valid() {
            if self.warnings.is_empty() {
                "Configuration is valid.".to_string()
            } else {
                format!(
                    "Configuration is valid with {} warning(s).",
                    self.warnings.len()
                )
            }
        } else {
            format!(
                "Configuration is invalid with {} error(s).",
                self.errors.len()
            )
        }
    }
}

/// Check every field with a constrained range.
#[must_use]
pub fn validate(config: &AutopatchConfig) -> ValidationReport {
    let mut report = ValidationReport::new();
    let l = &config.loop_config;

    if l.deadlock_threshold < 2 {
        report.errors.push(format!(
            "loop.deadlock_threshold must be at least 2 (got {})",
            l.deadlock_threshold
        ));
    }
    if l.max_loops == 0 {
        report.errors.push("loop.max_loops must be positive".to_string());
    }
    if l.task_timeout_secs == 0 {
        report
            .errors
            .push("loop.task_timeout_secs must be positive".to_string());
    }
    if l.backoff_base_ms > l.backoff_max_ms {
        report.errors.push(format!(
            "loop.backoff_base_ms ({}) exceeds loop.backoff_max_ms ({})",
            l.backoff_base_ms, l.backoff_max_ms
        ));
    }
    if l.max_retries >= l.max_loops {
        report.warnings.push(format!(
            "loop.max_retries ({}) is not below loop.max_loops ({}); the loop ceiling will end runs first",
            l.max_retries, l.max_loops
        ));
    }

    if config.guard.large_edit_threshold == 0 {
        report.warnings.push(
            "guard.large_edit_threshold is 0; every edit will be classified LARGE_EDIT"
                .to_string(),
        );
    }
    let globs = config
        .guard
        .protected_paths
        .iter()
        .map(|g| ("guard.protected_paths", g))
        .chain(
            config
                .guard
                .sensitive_patterns
                .iter()
                .map(|g| ("guard.sensitive_patterns", g)),
        )
        .chain(
            config
                .guard
                .config_patterns
                .iter()
                .map(|g| ("guard.config_patterns", g)),
        );
    for (field, glob) in globs {
        if let Err(e) = Glob::new(glob) {
            report
                .errors
                .push(format!("{field}: invalid glob '{glob}': {e}"));
        }
    }

    if config.circuit.failure_threshold == 0 {
        report
            .errors
            .push("circuit.failure_threshold must be positive".to_string());
    }
    if config.circuit.hourly_quota == 0 {
        report
            .warnings
            .push("circuit.hourly_quota is 0; no model calls will be allowed".to_string());
    }

    if config.backend.command.is_none() {
        report
            .warnings
            .push("backend.command is not set; `run` requires --backend".to_string());
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let report = validate(&AutopatchConfig::default());
        assert!(report.is_valid(), "{:?}", report.errors);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_deadlock_threshold_too_small() {
        let mut config = AutopatchConfig::default();
        config.loop_config.deadlock_threshold = 1;
        let report = validate(&config);
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("deadlock_threshold"));
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_invalid_glob_reported() {
        let mut config = AutopatchConfig::default();
        config.guard.sensitive_patterns.push("**/[unclosed".to_string());
        let report = validate(&config);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("guard.sensitive_patterns")));
    }

    #[test]
    fn test_summary_mentions_warnings() {
        let report = validate(&AutopatchConfig::default());
        assert!(report.summary().contains("warning"));
    }
}
