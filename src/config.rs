use anyhow::{anyhow, Context, Result};
use chrono::TimeDelta;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::correlate::CorrelationWindow;

const DEFAULT_PANORAMIC_ADDRESS: &str = "192.168.0.101";
const DEFAULT_ZOOM_ADDRESS: &str = "192.168.0.102";
const DEFAULT_FRAME_RATE: u32 = 15;
const DEFAULT_IMAGE_QUALITY: u32 = 80;
const DEFAULT_RING_CAPACITY: usize = 150;
const DEFAULT_CHANNEL_CAPACITY: usize = 300;
const DEFAULT_WINDOW_MIN_MS: i64 = -200;
const DEFAULT_WINDOW_MAX_MS: i64 = 200;
const DEFAULT_PLATE_COOLDOWN_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct GateSyncConfigFile {
    panoramic: Option<CameraConfigFile>,
    zoom: Option<CameraConfigFile>,
    ring: Option<RingConfigFile>,
    channels: Option<ChannelConfigFile>,
    window: Option<WindowConfigFile>,
    plate: Option<PlateConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    address: Option<String>,
    frame_rate: Option<u32>,
    image_quality: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RingConfigFile {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ChannelConfigFile {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct WindowConfigFile {
    min_ms: Option<i64>,
    max_ms: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct PlateConfigFile {
    cooldown_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct GateSyncConfig {
    pub panoramic: CameraSettings,
    pub zoom: CameraSettings,
    pub ring_capacity: usize,
    pub channel_capacity: usize,
    pub window: WindowSettings,
    pub plate_cooldown: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    pub address: String,
    pub frame_rate: u32,
    pub image_quality: u32,
}

impl CameraSettings {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            frame_rate: DEFAULT_FRAME_RATE,
            image_quality: DEFAULT_IMAGE_QUALITY,
        }
    }

    fn from_file(file: Option<CameraConfigFile>, default_address: &str) -> Self {
        let file = file.unwrap_or_default();
        Self {
            address: file
                .address
                .unwrap_or_else(|| default_address.to_string()),
            frame_rate: file.frame_rate.unwrap_or(DEFAULT_FRAME_RATE),
            image_quality: file.image_quality.unwrap_or(DEFAULT_IMAGE_QUALITY),
        }
    }

    fn validate(&self, role: &str) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(anyhow!("{} camera address must not be empty", role));
        }
        if self.frame_rate == 0 {
            return Err(anyhow!("{} camera frame rate must be greater than zero", role));
        }
        if !(1..=100).contains(&self.image_quality) {
            return Err(anyhow!(
                "{} camera image quality must be between 1 and 100, got {}",
                role,
                self.image_quality
            ));
        }
        Ok(())
    }
}

/// Correlation window bounds in milliseconds, relative to the zoom frame time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSettings {
    pub min_ms: i64,
    pub max_ms: i64,
}

impl WindowSettings {
    pub fn correlation_window(&self) -> CorrelationWindow {
        CorrelationWindow::new(
            TimeDelta::milliseconds(self.min_ms),
            TimeDelta::milliseconds(self.max_ms),
        )
    }
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            min_ms: DEFAULT_WINDOW_MIN_MS,
            max_ms: DEFAULT_WINDOW_MAX_MS,
        }
    }
}

impl GateSyncConfig {
    /// Loads `path` (or `GATE_SYNC_CONFIG` when no path is given), then applies
    /// environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("GATE_SYNC_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty());
        let file_cfg = match path.or(env_path.as_deref().map(Path::new)) {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GateSyncConfigFile) -> Self {
        let window = file.window.unwrap_or_default();
        Self {
            panoramic: CameraSettings::from_file(file.panoramic, DEFAULT_PANORAMIC_ADDRESS),
            zoom: CameraSettings::from_file(file.zoom, DEFAULT_ZOOM_ADDRESS),
            ring_capacity: file
                .ring
                .and_then(|ring| ring.capacity)
                .unwrap_or(DEFAULT_RING_CAPACITY),
            channel_capacity: file
                .channels
                .and_then(|channels| channels.capacity)
                .unwrap_or(DEFAULT_CHANNEL_CAPACITY),
            window: WindowSettings {
                min_ms: window.min_ms.unwrap_or(DEFAULT_WINDOW_MIN_MS),
                max_ms: window.max_ms.unwrap_or(DEFAULT_WINDOW_MAX_MS),
            },
            plate_cooldown: Duration::from_secs(
                file.plate
                    .and_then(|plate| plate.cooldown_secs)
                    .unwrap_or(DEFAULT_PLATE_COOLDOWN_SECS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(address) = std::env::var("GATE_SYNC_PAN_ADDRESS") {
            if !address.trim().is_empty() {
                self.panoramic.address = address;
            }
        }
        if let Ok(address) = std::env::var("GATE_SYNC_ZOOM_ADDRESS") {
            if !address.trim().is_empty() {
                self.zoom.address = address;
            }
        }
        if let Ok(capacity) = std::env::var("GATE_SYNC_RING_CAPACITY") {
            self.ring_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("GATE_SYNC_RING_CAPACITY must be a frame count"))?;
        }
        if let Ok(cooldown) = std::env::var("GATE_SYNC_PLATE_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.parse().map_err(|_| {
                anyhow!("GATE_SYNC_PLATE_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.plate_cooldown = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.panoramic.validate("panoramic")?;
        self.zoom.validate("zoom")?;
        if self.ring_capacity == 0 {
            return Err(anyhow!("ring capacity must be greater than zero"));
        }
        if self.channel_capacity == 0 {
            return Err(anyhow!("channel capacity must be greater than zero"));
        }
        if self.window.min_ms > self.window.max_ms {
            return Err(anyhow!(
                "correlation window min ({} ms) exceeds max ({} ms)",
                self.window.min_ms,
                self.window.max_ms
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<GateSyncConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg = serde_json::from_str(&raw)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = GateSyncConfig::from_file(GateSyncConfigFile::default());
        assert_eq!(cfg.panoramic.address, DEFAULT_PANORAMIC_ADDRESS);
        assert_eq!(cfg.zoom.address, DEFAULT_ZOOM_ADDRESS);
        assert_eq!(cfg.panoramic.frame_rate, 15);
        assert_eq!(cfg.zoom.image_quality, 80);
        assert_eq!(cfg.ring_capacity, 150);
        assert_eq!(cfg.channel_capacity, 300);
        assert_eq!(cfg.window, WindowSettings::default());
        assert_eq!(cfg.plate_cooldown, Duration::from_secs(30));
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_inverted_window() {
        let mut cfg = GateSyncConfig::from_file(GateSyncConfigFile::default());
        cfg.window = WindowSettings {
            min_ms: 100,
            max_ms: -100,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_quality() {
        let mut cfg = GateSyncConfig::from_file(GateSyncConfigFile::default());
        cfg.zoom.image_quality = 0;
        assert!(cfg.validate().is_err());
        cfg.zoom.image_quality = 101;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_capacities() {
        let mut cfg = GateSyncConfig::from_file(GateSyncConfigFile::default());
        cfg.ring_capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = GateSyncConfig::from_file(GateSyncConfigFile::default());
        cfg.channel_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn window_settings_convert_to_signed_bounds() {
        let window = WindowSettings::default().correlation_window();
        assert_eq!(window.min(), TimeDelta::milliseconds(-200));
        assert_eq!(window.max(), TimeDelta::milliseconds(200));
    }
}
