use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::db::models::VersionStatus;
use crate::viewport::{
    auto_pan::{clamp_ratio, DEFAULT_RIGHT_PADDING, DEFAULT_TRIGGER_THRESHOLD},
    AutoPanConfig,
};

const DEBUG_SYNC_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportSettings {
    pub default_zoom_x: f64,
    pub default_zoom_y: f64,
    pub auto_pan_enabled: bool,
    pub auto_pan_trigger_threshold: f64,
    pub auto_pan_right_padding: f64,
}

impl Default for ViewportSettings {
    fn default() -> Self {
        Self {
            default_zoom_x: 1.0,
            default_zoom_y: 1.0,
            auto_pan_enabled: true,
            auto_pan_trigger_threshold: DEFAULT_TRIGGER_THRESHOLD,
            auto_pan_right_padding: DEFAULT_RIGHT_PADDING,
        }
    }
}

impl ViewportSettings {
    /// Zoom factors must be positive; ratios are clamped into `[0, 0.95]`.
    fn sanitized(self) -> Self {
        Self {
            default_zoom_x: zoom_factor(self.default_zoom_x),
            default_zoom_y: zoom_factor(self.default_zoom_y),
            auto_pan_enabled: self.auto_pan_enabled,
            auto_pan_trigger_threshold: clamp_ratio(
                self.auto_pan_trigger_threshold,
                DEFAULT_TRIGGER_THRESHOLD,
            ),
            auto_pan_right_padding: clamp_ratio(
                self.auto_pan_right_padding,
                DEFAULT_RIGHT_PADDING,
            ),
        }
    }

    pub fn auto_pan(&self) -> AutoPanConfig {
        AutoPanConfig::new(
            self.auto_pan_enabled,
            self.auto_pan_trigger_threshold,
            self.auto_pan_right_padding,
        )
    }
}

fn zoom_factor(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        1.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Sync right after local edits, besides the interval.
    pub opportunistic: bool,
    pub target_status: VersionStatus,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            request_timeout_secs: 30,
            opportunistic: true,
            target_status: VersionStatus::Active,
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        if debug_mode() {
            return Duration::from_secs(DEBUG_SYNC_INTERVAL_SECS);
        }
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub token: Option<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub viewport: ViewportSettings,
    pub sync: SyncSettings,
    pub api: ApiSettings,
}

fn debug_mode() -> bool {
    std::env::var("PHASEMARK_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<AppSettings>,
}

impl SettingsStore {
    /// Opens the settings file, falling back to defaults when it is missing
    /// or unreadable as JSON.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data: AppSettings = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            AppSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(AppSettings {
                viewport: data.viewport.sanitized(),
                ..data
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, AppSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, AppSettings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self) -> AppSettings {
        self.read().clone()
    }

    pub fn viewport(&self) -> ViewportSettings {
        self.read().viewport.clone()
    }

    pub fn sync(&self) -> SyncSettings {
        self.read().sync.clone()
    }

    pub fn api(&self) -> ApiSettings {
        self.read().api.clone()
    }

    pub fn update_viewport(&self, settings: ViewportSettings) -> Result<ViewportSettings> {
        let sanitized = settings.sanitized();
        let mut guard = self.write();
        guard.viewport = sanitized.clone();
        self.persist(&guard)?;
        Ok(sanitized)
    }

    pub fn update_sync(&self, settings: SyncSettings) -> Result<()> {
        let mut guard = self.write();
        guard.sync = settings;
        self.persist(&guard)
    }

    pub fn update_api(&self, settings: ApiSettings) -> Result<()> {
        let mut guard = self.write();
        guard.api = settings;
        self.persist(&guard)
    }

    fn persist(&self, data: &AppSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let data: AppSettings = serde_json::from_str(&contents)?;
        *self.write() = AppSettings {
            viewport: data.viewport.sanitized(),
            ..data
        };
        Ok(())
    }
}
