//! Thin wrapper over the `git` CLI.
//!
//! Every invocation runs non-interactively (`GIT_TERMINAL_PROMPT=0`,
//! `GIT_ASKPASS=echo`) in the project directory, and paths under the state
//! directory are excluded from status, stash and clean so transaction
//! bookkeeping never rolls itself back.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use tracing::debug;

use crate::config::STATE_DIR;
use crate::error::{AutopatchError, Result};

/// Git CLI bound to one working tree.
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
}

impl Git {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Check that a `git` binary is on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::MissingTool`] if it is not.
    pub fn ensure_available() -> Result<()> {
        which::which("git").map(|_| ()).map_err(|_| AutopatchError::MissingTool {
            tool: "git".to_string(),
        })
    }

    fn state_exclude() -> String {
        format!(":(exclude){STATE_DIR}")
    }

    /// Run git and return trimmed stdout.
    fn run(&self, operation: &str, args: &[&str]) -> Result<String> {
        debug!("git {}", args.join(" "));
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_ASKPASS", "echo")
            .output()
            .with_context(|| format!("Failed to execute git {operation}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AutopatchError::git(operation, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    /// Whether the directory is inside a work tree.
    #[must_use]
    pub fn is_repo(&self) -> bool {
        self.run("rev-parse", &["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.trim() == "true")
            .unwrap_or(false)
    }

    /// Current HEAD commit hash.
    ///
    /// # Errors
    ///
    /// Fails in a repository with no commits.
    pub fn head(&self) -> Result<String> {
        Ok(self.run("rev-parse", &["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// `git status --porcelain` lines, excluding the state directory.
    ///
    /// # Errors
    ///
    /// Returns an error if git fails.
    pub fn changes(&self) -> Result<Vec<String>> {
        let exclude = Self::state_exclude();
        let out = self.run(
            "status",
            &["status", "--porcelain", "--untracked-files=all", "--", ".", exclude.as_str()],
        )?;
        Ok(out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Tracked plus untracked, non-ignored files, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if git fails.
    pub fn files(&self) -> Result<Vec<String>> {
        let exclude = Self::state_exclude();
        let out = self.run(
            "ls-files",
            &[
                "ls-files",
                "--cached",
                "--others",
                "--exclude-standard",
                "--",
                ".",
                exclude.as_str(),
            ],
        )?;
        let mut files: Vec<String> = out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        // Deleted-but-tracked files are still listed by --cached.
        files.retain(|f| self.dir.join(f).exists());
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Stash all changes including untracked files, then re-apply them so
    /// the working tree is unchanged. Returns the stash commit hash.
    ///
    /// # Errors
    ///
    /// Returns an error if git fails.
    pub fn snapshot_to_stash(&self, message: &str) -> Result<String> {
        let exclude = Self::state_exclude();
        self.run(
            "stash push",
            &[
                "stash",
                "push",
                "--include-untracked",
                "-m",
                message,
                "--",
                ".",
                exclude.as_str(),
            ],
        )?;
        let hash = self
            .run("rev-parse", &["rev-parse", "stash@{0}"])?
            .trim()
            .to_string();
        self.run("stash apply", &["stash", "apply", "stash@{0}"])?;
        Ok(hash)
    }

    /// Position of a stash commit in the stash list, as `stash@{n}`.
    ///
    /// # Errors
    ///
    /// Returns an error if git fails.
    pub fn find_stash(&self, hash: &str) -> Result<Option<String>> {
        let out = self.run("stash list", &["stash", "list", "--format=%H"])?;
        Ok(out
            .lines()
            .position(|line| line.trim() == hash)
            .map(|n| format!("stash@{{{n}}}")))
    }

    /// # Errors
    ///
    /// Returns an error if git fails.
    pub fn stash_pop(&self, stash_ref: &str) -> Result<()> {
        self.run("stash pop", &["stash", "pop", stash_ref]).map(|_| ())
    }

    /// # Errors
    ///
    /// Returns an error if git fails.
    pub fn stash_drop(&self, stash_ref: &str) -> Result<()> {
        self.run("stash drop", &["stash", "drop", stash_ref]).map(|_| ())
    }

    /// # Errors
    ///
    /// Returns an error if git fails.
    pub fn reset_hard(&self, revision: &str) -> Result<()> {
        self.run("reset", &["reset", "--hard", revision]).map(|_| ())
    }

    /// Remove untracked files and directories outside the state directory.
    ///
    /// # Errors
    ///
    /// Returns an error if git fails.
    pub fn clean(&self) -> Result<()> {
        self.run("clean", &["clean", "-fd", "-e", STATE_DIR]).map(|_| ())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{git, setup_git_repo};
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_repo() {
        let repo = setup_git_repo();
        assert!(Git::new(repo.path()).is_repo());

        let plain = TempDir::new().unwrap();
        assert!(!Git::new(plain.path()).is_repo());
    }

    #[test]
    fn test_head_matches_rev_parse() {
        let repo = setup_git_repo();
        let expected = git(repo.path(), &["rev-parse", "HEAD"]);
        assert_eq!(Git::new(repo.path()).head().unwrap(), expected);
    }

    #[test]
    fn test_files_and_changes_skip_state_dir() {
        let repo = setup_git_repo();
        std::fs::create_dir_all(repo.path().join(STATE_DIR)).unwrap();
        std::fs::write(repo.path().join(STATE_DIR).join("guard_mode"), "STRICT").unwrap();
        std::fs::write(repo.path().join("new.txt"), "x").unwrap();

        let git = Git::new(repo.path());
        assert_eq!(git.files().unwrap(), vec!["README.md", "a.py", "new.txt"]);
        assert_eq!(git.changes().unwrap(), vec!["?? new.txt"]);
    }

    #[test]
    fn test_snapshot_keeps_working_tree() {
        let repo = setup_git_repo();
        std::fs::write(repo.path().join("a.py"), "print('edited')\n").unwrap();

        let git = Git::new(repo.path());
        let hash = git.snapshot_to_stash("snap").unwrap();

        let content = std::fs::read_to_string(repo.path().join("a.py")).unwrap();
        assert_eq!(content, "print('edited')\n");
        assert_eq!(git.find_stash(&hash).unwrap().as_deref(), Some("stash@{0}"));
        assert_eq!(git.find_stash("deadbeef").unwrap(), None);
    }

    #[test]
    fn test_failure_maps_to_git_error() {
        let repo = setup_git_repo();
        let err = Git::new(repo.path()).reset_hard("no-such-rev").unwrap_err();
        assert!(matches!(err, AutopatchError::Git { ref operation, .. } if operation == "reset"));
    }
}
