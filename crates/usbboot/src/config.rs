//! Daemon configuration management

use crate::adapter::UsbbootOptions;
use crate::boot::BootTiming;
use crate::scanner::MIN_SCAN_DELAY;
use anyhow::{Context, Result, anyhow};
use common::parse_identity_pair;
use protocol::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsbbootConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub scanner: ScannerSettings,
    #[serde(default)]
    pub usbboot: BootSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "DaemonSettings::default_log_level")]
    pub log_level: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl DaemonSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Pause between two scans, at least 500
    #[serde(default = "ScannerSettings::default_scan_interval")]
    pub scan_interval_ms: u64,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            scan_interval_ms: Self::default_scan_interval(),
        }
    }
}

impl ScannerSettings {
    fn default_scan_interval() -> u64 {
        MIN_SCAN_DELAY.as_millis() as u64
    }
}

/// Boot run settings
///
/// # Example Configuration
/// ```toml
/// [usbboot]
/// firmware_dir = "~/rpi/usbboot/msd"
/// max_concurrent_starts = 5
/// extra_identities = ["0x0a5c:0x2711"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSettings {
    /// Directory holding bootcode.bin and the second-stage files
    #[serde(default = "BootSettings::default_firmware_dir")]
    pub firmware_dir: String,
    #[serde(default = "BootSettings::default_max_concurrent_starts")]
    pub max_concurrent_starts: usize,
    #[serde(default = "BootSettings::default_request_delay")]
    pub request_delay_ms: u64,
    #[serde(default = "BootSettings::default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Additional "0xVID:0xPID" boot identities
    #[serde(default)]
    pub extra_identities: Vec<String>,
}

impl Default for BootSettings {
    fn default() -> Self {
        Self {
            firmware_dir: Self::default_firmware_dir(),
            max_concurrent_starts: Self::default_max_concurrent_starts(),
            request_delay_ms: Self::default_request_delay(),
            settle_delay_ms: Self::default_settle_delay(),
            extra_identities: Vec::new(),
        }
    }
}

impl BootSettings {
    fn default_firmware_dir() -> String {
        if let Some(data_dir) = dirs::data_local_dir() {
            data_dir.join("usbboot").join("msd").display().to_string()
        } else {
            "/usr/share/usbboot/msd".to_string()
        }
    }

    fn default_max_concurrent_starts() -> usize {
        5
    }

    fn default_request_delay() -> u64 {
        BootTiming::default().request_delay.as_millis() as u64
    }

    fn default_settle_delay() -> u64 {
        BootTiming::default().settle_delay.as_millis() as u64
    }
}

impl UsbbootConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbboot/usbboot.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: UsbbootConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbboot").join("usbboot.toml")
        } else {
            PathBuf::from(".config/usbboot/usbboot.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.scan_delay() < MIN_SCAN_DELAY {
            return Err(anyhow!(
                "Invalid scan_interval_ms {}, must be at least {}",
                self.scanner.scan_interval_ms,
                MIN_SCAN_DELAY.as_millis()
            ));
        }

        if self.usbboot.max_concurrent_starts == 0 {
            return Err(anyhow!("max_concurrent_starts must be at least 1"));
        }

        if self.usbboot.firmware_dir.trim().is_empty() {
            return Err(anyhow!("firmware_dir must not be empty"));
        }

        self.extra_identities()?;
        Ok(())
    }

    /// Firmware directory with `~` expanded
    pub fn firmware_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.usbboot.firmware_dir).as_ref())
    }

    pub fn scan_delay(&self) -> Duration {
        Duration::from_millis(self.scanner.scan_interval_ms)
    }

    pub fn boot_timing(&self) -> BootTiming {
        BootTiming {
            request_delay: Duration::from_millis(self.usbboot.request_delay_ms),
            settle_delay: Duration::from_millis(self.usbboot.settle_delay_ms),
        }
    }

    /// Parse the configured extra identities
    pub fn extra_identities(&self) -> Result<Vec<DeviceIdentity>> {
        self.usbboot
            .extra_identities
            .iter()
            .map(|entry| {
                parse_identity_pair(entry)
                    .map(|(vid, pid)| DeviceIdentity::new(vid, pid))
                    .with_context(|| format!("Invalid entry in extra_identities: '{}'", entry))
            })
            .collect()
    }

    pub fn usbboot_options(&self) -> Result<UsbbootOptions> {
        Ok(UsbbootOptions {
            max_concurrent_starts: self.usbboot.max_concurrent_starts,
            timing: self.boot_timing(),
            extra_identities: self.extra_identities()?,
        })
    }
}
