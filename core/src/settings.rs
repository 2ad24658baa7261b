// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::backend::companion::CompanionConfig;
use crate::backend::proxy::{DEFAULT_PROXY_HOST, DEFAULT_PROXY_PORT};
use crate::definitions::{
    ArbitrationPolicy, DEFAULT_BRIGHTNESS, DEFAULT_GAMMA, DEFAULT_SMOOTH, MAX_BRIGHTNESS, MAX_GAMMA,
};
use crate::errors::SettingsError;
use crate::protocol::FrameStyle;

/// Overrides the location of the settings file.
pub const SETTINGS_PATH_ENV: &str = "LIGHTBRIDGE_SETTINGS";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Passes over the candidate backends before giving up.
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { attempts: 2, delay_ms: 500 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the proxy socket server listens on.
    pub host: String,
    pub port: u16,
    pub brightness: u8,
    pub gamma: f64,
    pub smooth: u8,
    pub frame_style: FrameStyle,
    pub policy: ArbitrationPolicy,
    pub companion: CompanionConfig,
    pub retry: RetrySettings,
    /// Reconnection attempts while idle; `None` disables them.
    pub ping_interval_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: DEFAULT_PROXY_HOST.to_string(),
            port: DEFAULT_PROXY_PORT,
            brightness: DEFAULT_BRIGHTNESS,
            gamma: DEFAULT_GAMMA,
            smooth: DEFAULT_SMOOTH,
            frame_style: FrameStyle::default(),
            policy: ArbitrationPolicy::default(),
            companion: CompanionConfig::default(),
            retry: RetrySettings::default(),
            ping_interval_ms: Some(5000),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.brightness > MAX_BRIGHTNESS {
            return Err(invalid("brightness", format!("{} exceeds {}", self.brightness, MAX_BRIGHTNESS)));
        }
        if !self.gamma.is_finite() || !(0.0..=MAX_GAMMA).contains(&self.gamma) {
            return Err(invalid("gamma", format!("{} outside 0..={}", self.gamma, MAX_GAMMA)));
        }
        if self.port == 0 {
            return Err(invalid("port", "must not be 0".to_string()));
        }
        if self.companion.port == 0 {
            return Err(invalid("companion.port", "must not be 0".to_string()));
        }
        if self.retry.attempts == 0 {
            return Err(invalid("retry.attempts", "at least one attempt is needed".to_string()));
        }
        if self.ping_interval_ms == Some(0) {
            return Err(invalid("ping_interval_ms", "use null to disable".to_string()));
        }
        Ok(())
    }
}

fn invalid(name: &'static str, reason: String) -> SettingsError {
    SettingsError::Invalid { name, reason }
}

/// Where persisted settings are read from and written back to.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings, SettingsError>;
    fn save(&self, settings: &Settings) -> Result<(), SettingsError>;
}

/// Keeps settings in memory; used when nothing should touch the disk.
#[derive(Default)]
pub struct MemorySettingsStore {
    settings: Mutex<Settings>,
    saves: AtomicUsize,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self { settings: Mutex::new(settings), saves: AtomicUsize::new(0) }
    }

    pub fn current(&self) -> Settings {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Settings, SettingsError> {
        Ok(self.current())
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        settings.validate()?;
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Settings kept as pretty-printed JSON in a single file.
pub struct JsonFileSettingsStore {
    path: PathBuf,
}

impl JsonFileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File named by [`SETTINGS_PATH_ENV`], or `settings.json` in the user's config directory.
    pub fn default_location() -> Self {
        Self::new(default_settings_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileSettingsStore {
    /// A missing file yields the defaults.
    fn load(&self) -> Result<Settings, SettingsError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No settings at {}; using defaults", self.path.display());
                return Ok(Settings::default());
            }
            Err(e) => return Err(e.into()),
        };
        let settings: Settings = serde_json::from_str(&json)?;
        settings.validate()?;
        debug!("Loaded settings from {}", self.path.display());
        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        settings.validate()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, json)?;
        debug!("Saved settings to {}", self.path.display());
        Ok(())
    }
}

pub fn default_settings_path() -> PathBuf {
    if let Ok(path) = std::env::var(SETTINGS_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("lightbridge")
        .join(SETTINGS_FILE_NAME)
}
