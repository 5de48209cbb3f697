//! Engine configuration
//!
//! Two separate things live here:
//!
//! 1. **`EngineConfig`**: tunables read once when the engine is built
//!    (activation delay, overload policy, sweep pacing, override throttle).
//! 2. **`ConfigStore`**: where toggle values are persisted between runs. The
//!    engine reads it once at startup and writes it only when asked to; no
//!    hook ever touches it.
//!
//! ## Engine config format
//!
//! ```toml
//! activation_delay_ms = 5000
//!
//! [resolver]
//! ambiguity = "first-match"   # or "reject"
//!
//! [sweep]
//! margin = 5
//! budget = 100
//! refresh_interval = 600
//!
//! [frame]
//! default_throttle = 1
//! ```
//!
//! Every key is optional.
//!
//! ## Toggle store format
//!
//! ```toml
//! [toggles]
//! god = true
//! regen = 3
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{AmbiguityPolicy, SweepConfig, ToggleValue};

/// Failure loading or saving configuration
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {}", e),
            Self::Parse(e) => write!(f, "invalid config: {}", e),
            Self::Serialize(e) => write!(f, "cannot serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Serialize(e) => Some(e),
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        Self::Serialize(e)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// What to do when a symbol names several overloads and gives no signature
    pub ambiguity: AmbiguityPolicy,
}

/// Pacing applied to sweeps that do not set their own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepDefaults {
    pub margin: usize,
    pub budget: usize,
    pub refresh_interval: u32,
}

impl Default for SweepDefaults {
    fn default() -> Self {
        Self {
            margin: 5,
            budget: 100,
            refresh_interval: 600,
        }
    }
}

impl SweepDefaults {
    /// As a grid-less `SweepConfig`, for filling in sweep specs.
    pub fn as_sweep_config(&self) -> SweepConfig {
        SweepConfig {
            width: 0,
            height: 0,
            margin: self.margin,
            budget: self.budget.max(1),
            refresh_interval: self.refresh_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Override rules without their own throttle run every this many ticks
    pub default_throttle: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self { default_throttle: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay between `Engine::start` and timer-driven activation
    pub activation_delay_ms: u64,
    pub resolver: ResolverConfig,
    pub sweep: SweepDefaults,
    pub frame: FrameConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            activation_delay_ms: 5000,
            resolver: ResolverConfig::default(),
            sweep: SweepDefaults::default(),
            frame: FrameConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!(target: "hostpatch::config", path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    pub fn activation_delay(&self) -> Duration {
        Duration::from_millis(self.activation_delay_ms)
    }
}

/// Persistent key/value storage for toggle values
pub trait ConfigStore {
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn get_int(&self, key: &str) -> Option<i64>;
    fn set(&mut self, key: &str, value: ToggleValue);
    /// Write pending changes to backing storage.
    fn save(&mut self) -> Result<(), ConfigError>;
    /// Discard in-memory state and re-read backing storage.
    fn reload(&mut self) -> Result<(), ConfigError>;
}

fn bool_of(values: &BTreeMap<String, ToggleValue>, key: &str) -> Option<bool> {
    match values.get(key)? {
        ToggleValue::Bool(b) => Some(*b),
        ToggleValue::Int(_) => None,
    }
}

fn int_of(values: &BTreeMap<String, ToggleValue>, key: &str) -> Option<i64> {
    values.get(key)?.as_int()
}

/// Store that lives only as long as the process
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    values: BTreeMap<String, ToggleValue>,
    saved: BTreeMap<String, ToggleValue>,
    saves: usize,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls.
    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_bool(&self, key: &str) -> Option<bool> {
        bool_of(&self.values, key)
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        int_of(&self.values, key)
    }

    fn set(&mut self, key: &str, value: ToggleValue) {
        self.values.insert(key.to_string(), value);
    }

    fn save(&mut self) -> Result<(), ConfigError> {
        self.saved = self.values.clone();
        self.saves += 1;
        Ok(())
    }

    fn reload(&mut self) -> Result<(), ConfigError> {
        self.values = self.saved.clone();
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ToggleFile {
    #[serde(default)]
    toggles: BTreeMap<String, ToggleValue>,
}

/// Store backed by a TOML file
#[derive(Debug, Clone)]
pub struct TomlConfigStore {
    path: PathBuf,
    values: BTreeMap<String, ToggleValue>,
}

impl TomlConfigStore {
    /// `<config dir>/hostpatch/toggles.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hostpatch").join("toggles.toml"))
    }

    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut store = Self {
            path: path.into(),
            values: BTreeMap::new(),
        };
        store.reload()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for TomlConfigStore {
    fn get_bool(&self, key: &str) -> Option<bool> {
        bool_of(&self.values, key)
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        int_of(&self.values, key)
    }

    fn set(&mut self, key: &str, value: ToggleValue) {
        self.values.insert(key.to_string(), value);
    }

    fn save(&mut self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = ToggleFile {
            toggles: self.values.clone(),
        };
        fs::write(&self.path, toml::to_string(&file)?)?;
        debug!(target: "hostpatch::config", path = %self.path.display(), toggles = self.values.len(), "Saved toggles");
        Ok(())
    }

    fn reload(&mut self) -> Result<(), ConfigError> {
        self.values = match fs::read_to_string(&self.path) {
            Ok(content) => toml::from_str::<ToggleFile>(&content)?.toggles,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(())
    }
}
