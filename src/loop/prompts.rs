//! Prompt builders.
//!
//! All functions here are pure: they take the error class and text and
//! return the prompt, with no access to loop state.

use std::sync::OnceLock;

use regex::Regex;

use super::context::ErrorKind;

/// Error text beyond this many characters is truncated.
pub const MAX_ERROR_CHARS: usize = 4000;

/// Recovery prompt for the dominant error class of a failed loop.
#[must_use]
pub fn recovery_prompt(kind: ErrorKind, error: &str) -> String {
    match kind {
        ErrorKind::Format => format_error_prompt(error),
        ErrorKind::Verification => verification_error_prompt(error),
        ErrorKind::Patch => patch_error_prompt(error),
        ErrorKind::Backend | ErrorKind::Timeout => backend_error_prompt(error),
    }
}

/// The backend's output could not be turned into operations.
#[must_use]
pub fn format_error_prompt(error: &str) -> String {
    let mut prompt = header("Malformed Response", error);
    prompt.push_str("### Recovery Strategy\n\n");
    prompt.push_str("Your previous response could not be applied:\n");
    prompt.push_str("1. Respond with operations, not only prose\n");
    prompt.push_str("2. Use only write_file, replace_in_file, delete_file, run_command, report_status\n");
    prompt.push_str("3. Supply every required argument (path, content, search, replace, command)\n");
    prompt
}

/// The project failed verification after patching.
#[must_use]
pub fn verification_error_prompt(error: &str) -> String {
    let mut prompt = header("Verification Failed", error);
    prompt.push_str("### Recovery Strategy\n\n");
    prompt.push_str("Your changes were rolled back. Focus ONLY on this error:\n");
    prompt.push_str("1. Read the error message carefully\n");
    prompt.push_str("2. Navigate to the exact location\n");
    prompt.push_str("3. Make the minimal change needed to fix it\n");
    prompt.push_str("4. Do NOT refactor or improve surrounding code\n");
    prompt
}

/// One or more operations could not be applied.
#[must_use]
pub fn patch_error_prompt(error: &str) -> String {
    let mut prompt = header("Patch Not Applied", error);
    prompt.push_str("### Recovery Strategy\n\n");
    prompt.push_str("Some operations did not reach disk:\n");
    prompt.push_str("1. Re-read the current file before editing it\n");
    prompt.push_str("2. Make search text match the file exactly\n");
    prompt.push_str("3. Keep every path inside the project\n");
    prompt.push_str("4. Operations awaiting approval will not run; choose another approach\n");
    prompt
}

/// The backend failed, timed out, or was blocked.
#[must_use]
pub fn backend_error_prompt(error: &str) -> String {
    let mut prompt = header("Backend Failure", error);
    prompt.push_str("### Recovery Strategy\n\n");
    prompt.push_str("This may be a transient failure. Continue the task from where it stopped.\n");
    prompt
}

/// Prompt for one Thinking request.
#[must_use]
pub fn task_prompt(task: &str, recovery: Option<&str>, blocked: &[String]) -> String {
    let mut prompt = format!("## Task\n\n{}\n", task.trim());
    if !blocked.is_empty() {
        prompt.push_str("\n## Awaiting Approval\n\n");
        prompt.push_str("These operations are queued for human review and were not applied:\n");
        for op in blocked {
            prompt.push_str(&format!("- {op}\n"));
        }
    }
    if let Some(recovery) = recovery {
        prompt.push('\n');
        prompt.push_str(recovery);
    }
    prompt
}

fn header(title: &str, error: &str) -> String {
    let mut prompt = format!("## Retry: {title}\n\n### Failure Details\n\n");
    if let Some(location) = extract_location(error) {
        prompt.push_str(&format!("**Location**: {location}\n\n"));
    }
    prompt.push_str("```\n");
    prompt.push_str(&truncate(error));
    prompt.push_str("\n```\n\n");
    prompt
}

fn truncate(error: &str) -> String {
    let trimmed = error.trim();
    if trimmed.chars().count() <= MAX_ERROR_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_ERROR_CHARS).collect();
    out.push_str("\n... (truncated)");
    out
}

/// First `file:line` or `line N` reference in an error message.
#[must_use]
pub fn extract_location(error: &str) -> Option<String> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r#"File "([^"]+)", line (\d+)"#,
            r"([\w./-]+\.\w+):(\d+)(?::\d+)?",
            r"\b[Ll]ine (\d+)\b",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    patterns.iter().find_map(|re| {
        let caps = re.captures(error)?;
        match (caps.get(1), caps.get(2)) {
            (Some(file), Some(line)) => Some(format!("{}:{}", file.as_str(), line.as_str())),
            (Some(line), None) => Some(format!("line {}", line.as_str())),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_prompt_picks_builder() {
        assert!(recovery_prompt(ErrorKind::Format, "x").contains("Malformed Response"));
        assert!(recovery_prompt(ErrorKind::Verification, "x").contains("Verification Failed"));
        assert!(recovery_prompt(ErrorKind::Patch, "x").contains("Patch Not Applied"));
        assert!(recovery_prompt(ErrorKind::Backend, "x").contains("Backend Failure"));
        assert!(recovery_prompt(ErrorKind::Timeout, "x").contains("Backend Failure"));
    }

    #[test]
    fn test_prompt_contains_error_and_location() {
        let prompt = verification_error_prompt("SyntaxError line 4");
        assert!(prompt.contains("SyntaxError line 4"));
        assert!(prompt.contains("**Location**: line 4"));
    }

    #[test]
    fn test_extract_location_variants() {
        assert_eq!(
            extract_location(r#"File "app/main.py", line 12, in <module>"#).as_deref(),
            Some("app/main.py:12")
        );
        assert_eq!(
            extract_location("src/lib.rs:40:5: error").as_deref(),
            Some("src/lib.rs:40")
        );
        assert_eq!(extract_location("something broke"), None);
    }

    #[test]
    fn test_long_errors_truncated() {
        let error = "e".repeat(MAX_ERROR_CHARS + 10);
        let prompt = patch_error_prompt(&error);
        assert!(prompt.contains("(truncated)"));
        assert!(prompt.len() < error.len() + 1000);
    }

    #[test]
    fn test_task_prompt_lists_blocked_and_recovery() {
        let prompt = task_prompt(
            "Fix the build",
            Some("## Retry: Patch Not Applied"),
            &["abc delete_file a.py".to_string()],
        );
        assert!(prompt.starts_with("## Task\n\nFix the build"));
        assert!(prompt.contains("- abc delete_file a.py"));
        assert!(prompt.ends_with("## Retry: Patch Not Applied"));
    }
}
