//! Test fixtures for creating reproducible project directories.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

use crate::circuit::CircuitBreaker;
use crate::config::{AutopatchConfig, CircuitConfig, GuardConfig, LoopConfig};
use crate::guard::store::MemoryGuardStore;
use crate::guard::ShadowModeGuard;
use crate::r#loop::LoopEnv;
use crate::testing::{LanguageModel, PlanTracker, Verifier};

/// A temporary project directory, removed on drop.
///
/// # Example
///
/// ```rust,ignore
/// let fixture = TestFixture::git_project();
/// assert!(fixture.exists("a.py"));
/// ```
pub struct TestFixture {
    temp_dir: TempDir,
}

impl TestFixture {
    /// An empty directory that is not a git repository.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn plain_project() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        std::fs::write(temp_dir.path().join("a.py"), "print('a')\n").expect("Failed to write a.py");
        Self { temp_dir }
    }

    /// A git repository with `README.md` and `a.py` committed.
    ///
    /// # Panics
    ///
    /// Panics if git initialization fails.
    #[must_use]
    pub fn git_project() -> Self {
        let fixture = Self::plain_project();
        std::fs::write(fixture.path().join("README.md"), "# Test\n")
            .expect("Failed to write README.md");

        fixture.git(&["init"]);
        fixture.git(&["config", "user.email", "test@example.com"]);
        fixture.git(&["config", "user.name", "Test User"]);
        fixture.git(&["add", "."]);
        fixture.git(&["commit", "-m", "Initial commit"]);
        fixture
    }

    /// Run git in the project and return stdout.
    ///
    /// # Panics
    ///
    /// Panics if git cannot be spawned.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .expect("Failed to run git");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    #[must_use]
    pub fn join(&self, rel: &str) -> PathBuf {
        self.path().join(rel)
    }

    #[must_use]
    pub fn exists(&self, rel: &str) -> bool {
        self.join(rel).exists()
    }

    /// # Panics
    ///
    /// Panics if the file cannot be read.
    #[must_use]
    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.join(rel)).expect("Failed to read fixture file")
    }

    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn write(&self, rel: &str, content: &str) {
        let path = self.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        std::fs::write(path, content).expect("Failed to write fixture file");
    }

    /// Guard over an in-memory store with default rules.
    ///
    /// # Panics
    ///
    /// Panics if the default guard rules fail to compile.
    #[must_use]
    pub fn memory_guard(&self) -> ShadowModeGuard {
        ShadowModeGuard::new(
            self.path(),
            &GuardConfig::default(),
            Arc::new(MemoryGuardStore::new()),
        )
        .expect("Default guard rules compile")
    }

    /// Loop environment with fast backoff, an in-memory guard and breaker,
    /// and the given collaborators.
    #[must_use]
    pub fn env(
        &self,
        backend: Arc<dyn LanguageModel>,
        verifier: Arc<dyn Verifier>,
        plan: Arc<dyn PlanTracker>,
    ) -> LoopEnv {
        let config = AutopatchConfig {
            loop_config: LoopConfig {
                backoff_base_ms: 1,
                backoff_max_ms: 5,
                ..LoopConfig::default()
            },
            ..AutopatchConfig::default()
        };
        LoopEnv::new(
            self.path(),
            &config,
            backend,
            verifier,
            Arc::new(self.memory_guard()),
        )
        .with_plan(plan)
        .with_circuit(CircuitBreaker::in_memory(CircuitConfig::default()))
    }
}
