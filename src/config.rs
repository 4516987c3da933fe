// Ports, timeouts, thresholds and the static configuration object
//
// Every component receives its section of `Config` at construction; nothing
// reads configuration after startup.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// Serial link to the microcontroller
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUDRATE: u32 = 115_200;

// Device boot and handshake
pub const BOOT_SETTLE: Duration = Duration::from_millis(2000);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

// Steady-state round trips
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(2000);
pub const STATUS_TIMEOUT: Duration = Duration::from_millis(3000);

// Safety loop frequency (20 Hz -> 50 ms period)
pub const MONITOR_HZ: u64 = 20;

// Highest LED_PATTERN index understood by the firmware
pub const MAX_LED_PATTERN: u8 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, usually loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub motor: MotorConfig,
    pub safety: SafetyConfig,
    pub led: LedConfig,
    pub sensor: SensorConfig,
    pub integration: IntegrationConfig,
    /// Use the simulated device instead of a serial port
    pub simulation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    pub boot_settle_ms: u64,
    pub handshake_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub status_timeout_ms: u64,
    /// Maximum number of callers waiting for the channel
    pub queue_depth: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud: DEFAULT_BAUDRATE,
            boot_settle_ms: BOOT_SETTLE.as_millis() as u64,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
            command_timeout_ms: COMMAND_TIMEOUT.as_millis() as u64,
            status_timeout_ms: STATUS_TIMEOUT.as_millis() as u64,
            queue_depth: 64,
        }
    }
}

impl SerialConfig {
    pub fn boot_settle(&self) -> Duration {
        Duration::from_millis(self.boot_settle_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    pub max_speed: u8,
    pub base_speed: u8,
    /// Floor applied when scaling speed by an expression multiplier
    pub min_speed: u8,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            max_speed: 100,
            base_speed: 40,
            min_speed: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Warning threshold in cm
    pub min_obstacle_distance: f32,
    /// Emergency threshold in cm
    pub emergency_stop_distance: f32,
    pub monitor_hz: u64,
    /// Shortest sleep between two ticks, even when a tick overruns
    pub min_yield_ms: u64,
    /// Age of the last valid reading after which the sensor link is lost
    pub stale_after_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_obstacle_distance: 15.0,
            emergency_stop_distance: 10.0,
            monitor_hz: MONITOR_HZ,
            min_yield_ms: 10,
            stale_after_ms: 2000,
        }
    }
}

impl SafetyConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(1000 / self.monitor_hz.max(1))
    }

    pub fn min_yield(&self) -> Duration {
        Duration::from_millis(self.min_yield_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedConfig {
    pub command_timeout_ms: u64,
    /// Extra time an expression stays up after the movement it accompanies
    pub expression_grace_ms: u64,
    pub brightness: u8,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 3000,
            expression_grace_ms: 500,
            brightness: 5,
        }
    }
}

impl LedConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn expression_grace(&self) -> Duration {
        Duration::from_millis(self.expression_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub read_timeout_ms: u64,
    pub smoothing_window: usize,
    /// Readings beyond this range (cm) are treated as missing
    pub max_distance: f32,
    pub light_dark: f32,
    pub light_bright: f32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 2000,
            smoothing_window: 5,
            max_distance: 400.0,
            light_dark: 300.0,
            light_bright: 700.0,
        }
    }
}

impl SensorConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    /// Pause after motor setup before other subsystems talk to the device
    pub device_settle_ms: u64,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            device_settle_ms: 1000,
        }
    }
}

impl IntegrationConfig {
    pub fn device_settle(&self) -> Duration {
        Duration::from_millis(self.device_settle_ms)
    }
}

impl Config {
    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let safety = &self.safety;
        if safety.emergency_stop_distance >= safety.min_obstacle_distance {
            return Err(ConfigError::Invalid(format!(
                "emergency_stop_distance ({}) must be below min_obstacle_distance ({})",
                safety.emergency_stop_distance, safety.min_obstacle_distance
            )));
        }
        if safety.monitor_hz == 0 {
            return Err(ConfigError::Invalid("monitor_hz must be positive".into()));
        }

        let motor = &self.motor;
        if motor.base_speed > motor.max_speed {
            return Err(ConfigError::Invalid(format!(
                "base_speed ({}) exceeds max_speed ({})",
                motor.base_speed, motor.max_speed
            )));
        }
        if motor.min_speed > motor.max_speed {
            return Err(ConfigError::Invalid(format!(
                "min_speed ({}) exceeds max_speed ({})",
                motor.min_speed, motor.max_speed
            )));
        }

        if self.serial.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be positive".into()));
        }
        Ok(())
    }
}
