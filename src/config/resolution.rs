//! Configuration inheritance and resolution.
//!
//! Configurations are loaded from two levels with increasing priority:
//!
//! 1. **User** - User-specific settings (e.g., `~/.config/autopatch/config.toml`)
//! 2. **Project** - Project-specific overrides (`.autopatch/config.toml`)
//!
//! Both are merged over the built-in defaults. Tables are merged key by key;
//! arrays and scalars from a higher level replace the lower value.
//!
//! # Example
//!
//! ```rust,ignore
//! use autopatch::config::ConfigLoader;
//! use std::path::Path;
//!
//! let (config, chain) = ConfigLoader::new().load_with_chain(Path::new("."))?;
//! println!("{}", chain.describe());
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use super::AutopatchConfig;

// ============================================================================
// Configuration Level
// ============================================================================

/// Configuration level in the inheritance hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigLevel {
    /// User-specific configuration.
    User,
    /// Project-specific configuration (highest priority).
    Project,
}

impl std::fmt::Display for ConfigLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Project => write!(f, "project"),
        }
    }
}

/// A source in the configuration inheritance chain.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// The level of this config source in the hierarchy.
    pub level: ConfigLevel,
    /// Path to the config file.
    pub path: PathBuf,
    /// Whether the config was found and merged.
    pub loaded: bool,
}

/// The full inheritance chain showing which configs were loaded.
#[derive(Debug, Clone, Default)]
pub struct InheritanceChain {
    /// All config sources in order (user, project).
    pub sources: Vec<ConfigSource>,
}

impl InheritanceChain {
    /// Create a new empty inheritance chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source to the chain.
    pub fn add_source(&mut self, level: ConfigLevel, path: PathBuf, loaded: bool) {
        self.sources.push(ConfigSource {
            level,
            path,
            loaded,
        });
    }

    /// Get the number of successfully loaded sources.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.sources.iter().filter(|s| s.loaded).count()
    }

    /// Get a formatted description of the inheritance chain for logging.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut lines = vec!["Configuration inheritance chain:".to_string()];
        for source in &self.sources {
            let status = if source.loaded { "+" } else { "-" };
            lines.push(format!(
                "  {} [{}] {}",
                status,
                source.level,
                source.path.display()
            ));
        }
        lines.join("\n")
    }
}

// ============================================================================
// Config Loader
// ============================================================================

/// Loads and merges configuration files.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    user_config_path: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a loader using the platform user config directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            user_config_path: dirs::config_dir().map(|d| d.join("autopatch").join("config.toml")),
        }
    }

    /// Set a custom user config path.
    #[must_use]
    pub fn with_user_config_path(mut self, path: PathBuf) -> Self {
        self.user_config_path = Some(path);
        self
    }

    /// Skip the user level entirely.
    #[must_use]
    pub fn without_user_config(mut self) -> Self {
        self.user_config_path = None;
        self
    }

    /// Load configuration with inheritance from the given project directory.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing a config file fails. Missing config files
    /// are silently ignored.
    pub fn load(&self, project_dir: &Path) -> anyhow::Result<AutopatchConfig> {
        let (config, chain) = self.load_with_chain(project_dir)?;
        debug!("{}", chain.describe());
        Ok(config)
    }

    /// Load configuration and return the inheritance chain.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing a config file fails.
    pub fn load_with_chain(
        &self,
        project_dir: &Path,
    ) -> anyhow::Result<(AutopatchConfig, InheritanceChain)> {
        let mut chain = InheritanceChain::new();
        let mut merged = serde_json::to_value(AutopatchConfig::default())?;

        if let Some(ref user_path) = self.user_config_path {
            let loaded = load_and_merge(&mut merged, user_path)?;
            chain.add_source(ConfigLevel::User, user_path.clone(), loaded);
        }

        let project_path = AutopatchConfig::project_path(project_dir);
        let loaded = load_and_merge(&mut merged, &project_path)?;
        chain.add_source(ConfigLevel::Project, project_path, loaded);

        let config: AutopatchConfig = serde_json::from_value(merged)?;
        Ok((config, chain))
    }
}

/// Load a TOML file and merge it into the accumulated config.
///
/// Returns true if the file was loaded, false if it doesn't exist.
fn load_and_merge(accumulated: &mut serde_json::Value, path: &Path) -> anyhow::Result<bool> {
    if !path.exists() {
        return Ok(false);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let table: toml::Table = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    let value = serde_json::to_value(table)?;

    deep_merge(accumulated, value);
    Ok(true)
}

/// Deep merge two JSON values, with child overriding parent.
fn deep_merge(parent: &mut serde_json::Value, child: serde_json::Value) {
    match (parent, child) {
        (serde_json::Value::Object(parent_map), serde_json::Value::Object(child_map)) => {
            for (key, child_value) in child_map {
                match parent_map.get_mut(&key) {
                    Some(parent_value) => deep_merge(parent_value, child_value),
                    None => {
                        parent_map.insert(key, child_value);
                    }
                }
            }
        }
        (parent, child) => {
            *parent = child;
        }
    }
}
