//! Integration tests for configuration parsing
//!
//! Covers loading TOML from disk, defaults for omitted sections, validation
//! failures and the save/load cycle.

use std::time::Duration;

use protocol::DeviceIdentity;
use usbboot::UsbbootConfig;

const MINIMAL_CONFIG: &str = r#"
[daemon]
log_level = "info"
"#;

const FULL_CONFIG: &str = r#"
[daemon]
log_level = "debug"

[scanner]
scan_interval_ms = 1500

[usbboot]
firmware_dir = "/opt/rpiboot/msd"
max_concurrent_starts = 2
request_delay_ms = 250
settle_delay_ms = 3000
extra_identities = ["0x0a5c:0x2711", "0x0a5c:0x2712"]
"#;

fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usbboot.toml");
    std::fs::write(&path, content).unwrap();
    (dir, path)
}

mod loading {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let (_dir, path) = write_config(MINIMAL_CONFIG);
        let config = UsbbootConfig::load(Some(path)).unwrap();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.scanner.scan_interval_ms, 500);
        assert_eq!(config.usbboot.max_concurrent_starts, 5);
        assert_eq!(config.usbboot.request_delay_ms, 1000);
        assert_eq!(config.usbboot.settle_delay_ms, 6000);
        assert!(config.usbboot.extra_identities.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let (_dir, path) = write_config(FULL_CONFIG);
        let config = UsbbootConfig::load(Some(path)).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.scan_delay(), Duration::from_millis(1500));
        assert_eq!(
            config.firmware_dir(),
            std::path::PathBuf::from("/opt/rpiboot/msd")
        );

        let timing = config.boot_timing();
        assert_eq!(timing.request_delay, Duration::from_millis(250));
        assert_eq!(timing.settle_delay, Duration::from_secs(3));

        let options = config.usbboot_options().unwrap();
        assert_eq!(options.max_concurrent_starts, 2);
        assert_eq!(
            options.extra_identities,
            vec![
                DeviceIdentity::new(0x0a5c, 0x2711),
                DeviceIdentity::new(0x0a5c, 0x2712)
            ]
        );
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let (_dir, path) = write_config("");
        let config = UsbbootConfig::load(Some(path)).unwrap();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.scanner.scan_interval_ms, 500);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = UsbbootConfig::load(Some(dir.path().join("absent.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_toml_is_error() {
        let (_dir, path) = write_config("[daemon\nlog_level = ");
        assert!(UsbbootConfig::load(Some(path)).is_err());
    }
}

mod validation {
    use super::*;

    fn load(content: &str) -> anyhow::Result<UsbbootConfig> {
        let (_dir, path) = write_config(content);
        UsbbootConfig::load(Some(path))
    }

    #[test]
    fn test_invalid_log_level() {
        let err = load("[daemon]\nlog_level = \"verbose\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid log level"));
    }

    #[test]
    fn test_scan_interval_below_floor() {
        let err = load("[scanner]\nscan_interval_ms = 100\n").unwrap_err();
        assert!(format!("{:#}", err).contains("scan_interval_ms"));
    }

    #[test]
    fn test_zero_start_limit() {
        assert!(load("[usbboot]\nmax_concurrent_starts = 0\n").is_err());
    }

    #[test]
    fn test_invalid_extra_identities() {
        for entry in ["0a5c:2711", "0x0a5c", "0x0a5c:0x2711:0x1", "0xzzzz:0x0001", "0x12345:0x1"] {
            let content = format!("[usbboot]\nextra_identities = [\"{}\"]\n", entry);
            assert!(load(&content).is_err(), "{} should be rejected", entry);
        }
    }

    #[test]
    fn test_valid_log_levels() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            let content = format!("[daemon]\nlog_level = \"{}\"\n", level);
            assert!(load(&content).is_ok(), "{} should be accepted", level);
        }
    }
}

mod saving {
    use super::*;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("usbboot.toml");

        let mut config = UsbbootConfig::default();
        config.daemon.log_level = "warn".to_string();
        config.usbboot.extra_identities = vec!["0x0a5c:0x2711".to_string()];
        config.save(&path).unwrap();

        let loaded = UsbbootConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.daemon.log_level, "warn");
        assert_eq!(loaded.usbboot.extra_identities, vec!["0x0a5c:0x2711"]);
        assert_eq!(loaded.usbboot.firmware_dir, config.usbboot.firmware_dir);
    }

    #[test]
    fn test_default_path_location() {
        let path = UsbbootConfig::default_path();
        assert!(path.ends_with("usbboot/usbboot.toml"));
    }
}
