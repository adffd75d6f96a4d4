//! Persistence for guard mode, the pending queue and trust rules.
//!
//! [`FileGuardStore`] keeps three files under the state directory and
//! serializes every read-modify-write with an exclusive lock file, re-reading
//! the current contents before applying a change. Unreadable or corrupt
//! files are treated as empty.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::{GuardMode, PendingOperation, TrustRule};
use crate::error::Result;
use crate::persist::{read_json, with_lock, write_atomic, write_json};

/// Single-line mode file.
pub const MODE_FILE: &str = "guard_mode";
/// JSON array of [`PendingOperation`].
pub const QUEUE_FILE: &str = "pending_operations.json";
/// JSON array of [`TrustRule`].
pub const TRUST_FILE: &str = "trust_rules.json";

const LOCK_FILE: &str = "guard.lock";

/// Storage backend for guard state.
pub trait GuardStore: Send + Sync + std::fmt::Debug {
    /// Stored mode, or `None` if nothing usable is stored.
    fn load_mode(&self) -> Result<Option<GuardMode>>;

    fn save_mode(&self, mode: GuardMode) -> Result<()>;

    fn load_queue(&self) -> Result<Vec<PendingOperation>>;

    /// Apply `f` to the current queue and persist the result.
    fn modify_queue(&self, f: &mut dyn FnMut(&mut Vec<PendingOperation>)) -> Result<()>;

    fn load_trust(&self) -> Result<Vec<TrustRule>>;

    /// Apply `f` to the current trust rules and persist the result.
    fn modify_trust(&self, f: &mut dyn FnMut(&mut Vec<TrustRule>)) -> Result<()>;
}

// ============================================================================
// File store
// ============================================================================

/// Guard state kept in files under a state directory.
#[derive(Debug, Clone)]
pub struct FileGuardStore {
    dir: PathBuf,
}

impl FileGuardStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn modify_list<T>(&self, name: &str, f: &mut dyn FnMut(&mut Vec<T>)) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        with_lock(&self.path(LOCK_FILE), || {
            let path = self.path(name);
            let mut items: Vec<T> = read_json(&path).unwrap_or_default();
            f(&mut items);
            write_json(&path, &items)
        })
    }
}

impl GuardStore for FileGuardStore {
    fn load_mode(&self) -> Result<Option<GuardMode>> {
        let path = self.path(MODE_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!("Unreadable guard mode file {}: {}", path.display(), e);
                return Ok(None);
            }
        };
        match content.trim().parse::<GuardMode>() {
            Ok(mode) => Ok(Some(mode)),
            Err(e) => {
                warn!("Ignoring guard mode file {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    fn save_mode(&self, mode: GuardMode) -> Result<()> {
        with_lock(&self.path(LOCK_FILE), || {
            write_atomic(&self.path(MODE_FILE), format!("{mode}\n").as_bytes())
        })
    }

    fn load_queue(&self) -> Result<Vec<PendingOperation>> {
        Ok(read_json(&self.path(QUEUE_FILE)).unwrap_or_default())
    }

    fn modify_queue(&self, f: &mut dyn FnMut(&mut Vec<PendingOperation>)) -> Result<()> {
        self.modify_list(QUEUE_FILE, f)
    }

    fn load_trust(&self) -> Result<Vec<TrustRule>> {
        Ok(read_json(&self.path(TRUST_FILE)).unwrap_or_default())
    }

    fn modify_trust(&self, f: &mut dyn FnMut(&mut Vec<TrustRule>)) -> Result<()> {
        self.modify_list(TRUST_FILE, f)
    }
}

// ============================================================================
// Memory store
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    mode: Option<GuardMode>,
    queue: Vec<PendingOperation>,
    trust: Vec<TrustRule>,
}

/// In-process guard state, for tests and embedders without a project dir.
#[derive(Debug, Default)]
pub struct MemoryGuardStore {
    state: Mutex<MemoryState>,
}

impl MemoryGuardStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl GuardStore for MemoryGuardStore {
    fn load_mode(&self) -> Result<Option<GuardMode>> {
        Ok(self.state().mode)
    }

    fn save_mode(&self, mode: GuardMode) -> Result<()> {
        self.state().mode = Some(mode);
        Ok(())
    }

    fn load_queue(&self) -> Result<Vec<PendingOperation>> {
        Ok(self.state().queue.clone())
    }

    fn modify_queue(&self, f: &mut dyn FnMut(&mut Vec<PendingOperation>)) -> Result<()> {
        f(&mut self.state().queue);
        Ok(())
    }

    fn load_trust(&self) -> Result<Vec<TrustRule>> {
        Ok(self.state().trust.clone())
    }

    fn modify_trust(&self, f: &mut dyn FnMut(&mut Vec<TrustRule>)) -> Result<()> {
        f(&mut self.state().trust);
        Ok(())
    }
}
