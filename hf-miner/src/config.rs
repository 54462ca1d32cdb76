//! Runtime configuration.
//!
//! Parses environment variables for the test session and the USB device.
//! Unset or unparsable variables fall back to their defaults.

use std::str::FromStr;
use std::time::Duration;

use crate::transport::usb::DEFAULT_RECEIVE_TIMEOUT;

/// Hash-rate test session parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Hash clock requested in OP_USB_INIT, in MHz.
    pub clockrate: u16,

    /// Leading zero bits a test nonce needs to count as good.
    pub search_difficulty: u8,

    /// Active slots left empty each cycle; any throttle also skips the
    /// pending slots.
    pub throttle: usize,

    /// Delay before OP_USB_INIT is sent again while waiting for the reply.
    pub init_retry: Duration,

    /// Interval between hash-rate reports.
    pub report_interval: Duration,

    /// Fan setting sent once the device has answered.
    pub fan_speed: u16,

    /// Pause between cycles when the daemon drives the session.
    pub cycle_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clockrate: 600,
            search_difficulty: 34,
            throttle: 0,
            init_retry: Duration::from_secs(5),
            report_interval: Duration::from_secs(2),
            fan_speed: 252,
            cycle_delay: Duration::from_millis(1),
        }
    }
}

impl SessionConfig {
    /// Parse configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `HF_CLOCKRATE`: hash clock in MHz (default: 600)
    /// - `HF_SEARCH_DIFFICULTY`: test difficulty in bits (default: 34)
    /// - `HF_THROTTLE`: active slots withheld per cycle (default: 0)
    /// - `HF_INIT_RETRY_SECS`: OP_USB_INIT resend delay, fractional seconds
    ///   (default: 5.0)
    /// - `HF_REPORT_SECS`: hash-rate report interval (default: 2, minimum 1)
    /// - `HF_FAN_SPEED`: fan setting (default: 252)
    /// - `HF_CYCLE_DELAY_MS`: pause between cycles (default: 1)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let init_retry = env_parse::<f64>("HF_INIT_RETRY_SECS")
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|delay| !delay.is_zero())
            .unwrap_or(defaults.init_retry);

        let report_interval = env_parse::<u64>("HF_REPORT_SECS")
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or(defaults.report_interval);

        Self {
            clockrate: env_parse("HF_CLOCKRATE").unwrap_or(defaults.clockrate),
            search_difficulty: env_parse("HF_SEARCH_DIFFICULTY")
                .unwrap_or(defaults.search_difficulty),
            throttle: env_parse("HF_THROTTLE").unwrap_or(defaults.throttle),
            init_retry,
            report_interval,
            fan_speed: env_parse("HF_FAN_SPEED").unwrap_or(defaults.fan_speed),
            cycle_delay: env_parse("HF_CYCLE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.cycle_delay),
        }
    }
}

/// HashFast USB vendor id.
pub const HASHFAST_VID: u16 = 0x297c;

/// Product id of the GN USB interface controller.
pub const HASHFAST_PID: u16 = 0x0001;

/// Which USB device to open and how long a receive may wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbConfig {
    pub vid: u16,
    pub pid: u16,
    pub receive_timeout: Duration,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vid: HASHFAST_VID,
            pid: HASHFAST_PID,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }
}

impl UsbConfig {
    /// Parse `HF_USB_VID` and `HF_USB_PID`, each hex with a `0x` prefix or
    /// decimal.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            vid: env_u16("HF_USB_VID").unwrap_or(defaults.vid),
            pid: env_u16("HF_USB_PID").unwrap_or(defaults.pid),
            ..defaults
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_u16(name: &str) -> Option<u16> {
    let value = std::env::var(name).ok()?;
    let value = value.trim();
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const SESSION_VARS: [&str; 7] = [
        "HF_CLOCKRATE",
        "HF_SEARCH_DIFFICULTY",
        "HF_THROTTLE",
        "HF_INIT_RETRY_SECS",
        "HF_REPORT_SECS",
        "HF_FAN_SPEED",
        "HF_CYCLE_DELAY_MS",
    ];

    fn clear_env() {
        for name in SESSION_VARS.iter().chain(&["HF_USB_VID", "HF_USB_PID"]) {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_when_unset() {
        clear_env();

        assert_eq!(SessionConfig::from_env(), SessionConfig::default());
        assert_eq!(UsbConfig::from_env(), UsbConfig::default());
        assert_eq!(SessionConfig::default().search_difficulty, 34);
    }

    #[test]
    #[serial]
    fn test_session_overrides() {
        clear_env();
        std::env::set_var("HF_CLOCKRATE", "550");
        std::env::set_var("HF_SEARCH_DIFFICULTY", "28");
        std::env::set_var("HF_THROTTLE", "3");
        std::env::set_var("HF_INIT_RETRY_SECS", "0.5");
        std::env::set_var("HF_FAN_SPEED", "128");

        let config = SessionConfig::from_env();
        assert_eq!(config.clockrate, 550);
        assert_eq!(config.search_difficulty, 28);
        assert_eq!(config.throttle, 3);
        assert_eq!(config.init_retry, Duration::from_millis(500));
        assert_eq!(config.fan_speed, 128);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_fall_back() {
        clear_env();
        std::env::set_var("HF_SEARCH_DIFFICULTY", "300");
        std::env::set_var("HF_INIT_RETRY_SECS", "-1");
        std::env::set_var("HF_REPORT_SECS", "0");

        let config = SessionConfig::from_env();
        assert_eq!(config.search_difficulty, 34);
        assert_eq!(config.init_retry, Duration::from_secs(5));
        // Zero is clamped up rather than rejected.
        assert_eq!(config.report_interval, Duration::from_secs(1));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_usb_ids_hex_or_decimal() {
        clear_env();
        std::env::set_var("HF_USB_VID", "0x1234");
        std::env::set_var("HF_USB_PID", "17");

        let config = UsbConfig::from_env();
        assert_eq!(config.vid, 0x1234);
        assert_eq!(config.pid, 17);

        clear_env();
    }
}
