//! Proposed operations emitted by the language-model backend.
//!
//! The backend speaks in `{name, arguments}` pairs ([`RawOperation`]). They
//! are mapped once, at the boundary, onto a closed set of
//! [`OperationKind`]s so the guard and the patcher can match exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Argument keys accepted for the target path, in lookup order.
const PATH_KEYS: &[&str] = &["path", "file_path", "target", "file"];

/// An operation exactly as the backend produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOperation {
    pub name: String,
    #[serde(default, alias = "args", alias = "input")]
    pub arguments: Map<String, Value>,
}

impl RawOperation {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Closed set of operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    WriteFile,
    ReplaceInFile,
    DeleteFile,
    RunCommand,
    ReportStatus,
    /// A name the core does not recognise.
    Other,
}

impl OperationKind {
    /// Map a backend tool name onto a kind. Matching is case-insensitive and
    /// accepts the common aliases used by tool-calling models.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "write_file" | "create_file" | "write" => Self::WriteFile,
            "replace_in_file" | "edit_file" | "str_replace" | "replace" => Self::ReplaceInFile,
            "delete_file" | "remove_file" | "delete" => Self::DeleteFile,
            "run_command" | "shell" | "bash" | "execute_command" | "exec" => Self::RunCommand,
            "report_status" | "status" | "report" => Self::ReportStatus,
            _ => Self::Other,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WriteFile => "write_file",
            Self::ReplaceInFile => "replace_in_file",
            Self::DeleteFile => "delete_file",
            Self::RunCommand => "run_command",
            Self::ReportStatus => "report_status",
            Self::Other => "other",
        }
    }

    /// Whether applying this kind changes files on disk.
    #[must_use]
    pub fn mutates_files(&self) -> bool {
        matches!(self, Self::WriteFile | Self::ReplaceInFile | Self::DeleteFile)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single proposed action. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    name: String,
    kind: OperationKind,
    target_path: Option<String>,
    payload: Map<String, Value>,
}

impl Operation {
    /// Build an operation from backend output. Never fails: unknown names
    /// become [`OperationKind::Other`] and missing arguments are reported by
    /// [`Operation::validate`].
    #[must_use]
    pub fn from_raw(raw: RawOperation) -> Self {
        let kind = OperationKind::from_name(&raw.name);
        let target_path = PATH_KEYS
            .iter()
            .find_map(|k| raw.arguments.get(*k).and_then(Value::as_str))
            .map(str::to_string);

        Self {
            name: raw.name,
            kind,
            target_path,
            payload: raw.arguments,
        }
    }

    /// Convenience constructor for callers that already know the shape.
    #[must_use]
    pub fn new(name: &str, arguments: Value) -> Self {
        Self::from_raw(RawOperation::new(name, arguments))
    }

    /// The name the backend used.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    #[must_use]
    pub fn target_path(&self) -> Option<&str> {
        self.target_path.as_deref()
    }

    #[must_use]
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    fn str_arg(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|k| self.payload.get(*k).and_then(Value::as_str))
    }

    /// New file content for `write_file`.
    #[must_use]
    pub fn content(&self) -> Option<&str> {
        self.str_arg(&["content", "contents", "text"])
    }

    /// Text to find for `replace_in_file`.
    #[must_use]
    pub fn search(&self) -> Option<&str> {
        self.str_arg(&["search", "old", "old_string", "find"])
    }

    /// Replacement text for `replace_in_file`.
    #[must_use]
    pub fn replacement(&self) -> Option<&str> {
        self.str_arg(&["replace", "new", "new_string", "replacement"])
    }

    /// Command line for `run_command`.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        self.str_arg(&["command", "cmd"])
    }

    /// Status text for `report_status`.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.str_arg(&["message", "status", "text"])
    }

    /// Size in bytes of the content this operation would write.
    #[must_use]
    pub fn changed_size(&self) -> usize {
        match self.kind {
            OperationKind::WriteFile => self.content().map_or(0, str::len),
            OperationKind::ReplaceInFile => {
                let search = self.search().map_or(0, str::len);
                let replace = self.replacement().map_or(0, str::len);
                search.max(replace)
            }
            _ => 0,
        }
    }

    /// The text a reviewer would want to see for this operation.
    #[must_use]
    pub fn preview_source(&self) -> String {
        match self.kind {
            OperationKind::WriteFile => self.content().unwrap_or_default().to_string(),
            OperationKind::ReplaceInFile => format!(
                "- {}\n+ {}",
                self.search().unwrap_or_default(),
                self.replacement().unwrap_or_default()
            ),
            OperationKind::RunCommand => self.command().unwrap_or_default().to_string(),
            OperationKind::ReportStatus => self.message().unwrap_or_default().to_string(),
            OperationKind::DeleteFile | OperationKind::Other => String::new(),
        }
    }

    /// Check that the arguments required by this kind are present.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of what is missing.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let missing = |what: &str| Err(format!("{} is missing '{}'", self.name, what));
        match self.kind {
            OperationKind::Other => Err(format!("unknown operation '{}'", self.name)),
            OperationKind::WriteFile => {
                if self.target_path.is_none() {
                    return missing("path");
                }
                if self.content().is_none() {
                    return missing("content");
                }
                Ok(())
            }
            OperationKind::ReplaceInFile => {
                if self.target_path.is_none() {
                    return missing("path");
                }
                if self.search().is_none() {
                    return missing("search");
                }
                if self.replacement().is_none() {
                    return missing("replace");
                }
                Ok(())
            }
            OperationKind::DeleteFile => {
                if self.target_path.is_none() {
                    return missing("path");
                }
                Ok(())
            }
            OperationKind::RunCommand => {
                if self.command().is_none() {
                    return missing("command");
                }
                Ok(())
            }
            OperationKind::ReportStatus => Ok(()),
        }
    }

    /// Stable digest identifying this exact operation, independent of the
    /// order the backend emitted top-level arguments in.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let sorted: BTreeMap<&String, &Value> = self.payload.iter().collect();
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.target_path.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        for (key, value) in sorted {
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// One-line description for logs and approval queues.
    #[must_use]
    pub fn describe(&self) -> String {
        match self.kind {
            OperationKind::RunCommand => {
                format!("run_command `{}`", self.command().unwrap_or("<missing>"))
            }
            OperationKind::ReportStatus => {
                format!("report_status: {}", self.message().unwrap_or_default())
            }
            OperationKind::Other => format!("{} (unrecognised)", self.name),
            _ => format!(
                "{} {} ({} bytes)",
                self.kind,
                self.target_path.as_deref().unwrap_or("<missing path>"),
                self.changed_size()
            ),
        }
    }
}

/// Join `target` onto `root` (unless already absolute) and fold `.` and
/// `..` components lexically. The filesystem is not consulted, so the
/// result is meaningful for paths that do not exist yet.
#[must_use]
pub fn resolve_target(root: &Path, target: &str) -> PathBuf {
    let path = Path::new(target);
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&root.join(path))
    }
}

/// Whether `path` (already normalized) lies inside `root`.
#[must_use]
pub fn is_within(root: &Path, path: &Path) -> bool {
    path.starts_with(normalize(root))
        && !path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Whether `path` (already normalized) still lies inside `root` once
/// symlinks are followed. The deepest ancestor of `path` that exists on disk
/// is canonicalized, so a link inside the project that points elsewhere is
/// caught even when the final file does not exist yet. A dangling link is
/// treated as outside.
#[must_use]
pub fn stays_within(root: &Path, path: &Path) -> bool {
    if !is_within(root, path) {
        return false;
    }
    let Ok(real_root) = root.canonicalize() else {
        return false;
    };
    let existing = path
        .ancestors()
        .map(|p| if p.as_os_str().is_empty() { Path::new(".") } else { p })
        .find(|p| p.symlink_metadata().is_ok());
    match existing.map(Path::canonicalize) {
        Some(Ok(real)) => real.starts_with(&real_root),
        _ => false,
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_aliases() {
        assert_eq!(OperationKind::from_name("write_file"), OperationKind::WriteFile);
        assert_eq!(OperationKind::from_name("Edit-File"), OperationKind::ReplaceInFile);
        assert_eq!(OperationKind::from_name("bash"), OperationKind::RunCommand);
        assert_eq!(OperationKind::from_name("remove_file"), OperationKind::DeleteFile);
        assert_eq!(OperationKind::from_name("launch_rocket"), OperationKind::Other);
    }

    #[test]
    fn test_from_raw_extracts_path() {
        let op = Operation::new("write_file", json!({"file_path": "src/a.py", "content": "x"}));
        assert_eq!(op.kind(), OperationKind::WriteFile);
        assert_eq!(op.target_path(), Some("src/a.py"));
        assert_eq!(op.content(), Some("x"));
        assert!(op.validate().is_ok());
    }

    #[test]
    fn test_non_object_arguments_become_empty() {
        let op = Operation::new("write_file", json!("nonsense"));
        assert!(op.payload().is_empty());
        assert!(op.target_path().is_none());
        assert!(op.validate().unwrap_err().contains("path"));
    }

    #[test]
    fn test_validate_reports_missing_arguments() {
        let op = Operation::new("replace_in_file", json!({"path": "a.rs", "search": "x"}));
        assert!(op.validate().unwrap_err().contains("replace"));

        let op = Operation::new("run_command", json!({}));
        assert!(op.validate().unwrap_err().contains("command"));

        let op = Operation::new("frobnicate", json!({}));
        assert!(op.validate().unwrap_err().contains("unknown"));
    }

    #[test]
    fn test_fingerprint_ignores_argument_order() {
        let a: RawOperation =
            serde_json::from_str(r#"{"name":"write_file","arguments":{"path":"a","content":"b"}}"#)
                .unwrap();
        let b: RawOperation =
            serde_json::from_str(r#"{"name":"write_file","arguments":{"content":"b","path":"a"}}"#)
                .unwrap();
        assert_eq!(
            Operation::from_raw(a).fingerprint(),
            Operation::from_raw(b).fingerprint()
        );
    }

    #[test]
    fn test_fingerprint_differs_on_content() {
        let a = Operation::new("write_file", json!({"path": "a", "content": "1"}));
        let b = Operation::new("write_file", json!({"path": "a", "content": "2"}));
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_changed_size() {
        let op = Operation::new(
            "replace_in_file",
            json!({"path": "a", "search": "abc", "replace": "abcdef"}),
        );
        assert_eq!(op.changed_size(), 6);
        let op = Operation::new("delete_file", json!({"path": "a"}));
        assert_eq!(op.changed_size(), 0);
    }

    #[test]
    fn test_raw_operation_args_alias() {
        let raw: RawOperation =
            serde_json::from_str(r#"{"name":"delete_file","args":{"path":"x"}}"#).unwrap();
        assert_eq!(raw.arguments.get("path"), Some(&json!("x")));
    }

    #[test]
    fn test_resolve_target_folds_parent_components() {
        let root = Path::new("/work/project");
        assert_eq!(
            resolve_target(root, "src/../lib/./a.rs"),
            PathBuf::from("/work/project/lib/a.rs")
        );
        assert_eq!(resolve_target(root, "/etc/passwd"), PathBuf::from("/etc/passwd"));
    }

    #[test]
    fn test_is_within() {
        let root = Path::new("/work/project");
        assert!(is_within(root, &resolve_target(root, "a/b.rs")));
        assert!(!is_within(root, &resolve_target(root, "../other/b.rs")));
        assert!(!is_within(root, &resolve_target(root, "/work/project-evil/x")));

        let relative = Path::new(".");
        assert!(is_within(relative, &resolve_target(relative, "a.py")));
        assert!(!is_within(relative, &resolve_target(relative, "../a.py")));
    }

    #[cfg(unix)]
    #[test]
    fn test_stays_within_follows_symlinks() {
        let project = tempfile::TempDir::new().unwrap();
        let outside = tempfile::TempDir::new().unwrap();
        let root = project.path();
        std::fs::create_dir(root.join("src")).unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("vendor")).unwrap();
        std::os::unix::fs::symlink(root.join("src"), root.join("lib")).unwrap();
        std::os::unix::fs::symlink(root.join("gone"), root.join("dangling")).unwrap();

        assert!(stays_within(root, &resolve_target(root, "src/a.py")));
        assert!(stays_within(root, &resolve_target(root, "new/dir/a.py")));
        assert!(stays_within(root, &resolve_target(root, "lib/a.py")));
        assert!(!stays_within(root, &resolve_target(root, "vendor/pwned.py")));
        assert!(!stays_within(root, &resolve_target(root, "vendor")));
        assert!(!stays_within(root, &resolve_target(root, "dangling")));
        assert!(!stays_within(root, &resolve_target(root, "../a.py")));
    }
}
