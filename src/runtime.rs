// Hardware integration manager
// Brings motor, LED, sensor and safety monitor up on one device channel in a
// fixed order, coordinates movement with expressions, and tears everything
// down in reverse.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, interval};
use tracing::{error, info, warn};

use crate::channel::{Channel, ChannelError, ChannelSettings, SimulatedDevice};
use crate::config::{Config, ConfigError};
use crate::led::{LedController, LedError, LedStatus};
use crate::messages::DeviceStatus;
use crate::motor::{Direction, MotorDriver, MotorError, MotorState};
use crate::safety::{
    SafetyError, SafetyLevel, SafetyMonitor, SafetyStats, SafetyStatus, emergency_asserted,
};
use crate::sensor::{ChannelSensor, SensorError, SensorSnapshot};

/// Where the device lives
pub enum Link {
    Serial { port: String, baud: u32 },
    Simulated(SimulatedDevice),
}

impl Link {
    pub fn from_config(config: &Config) -> Self {
        if config.simulation {
            Link::Simulated(SimulatedDevice::new())
        } else {
            Link::Serial {
                port: config.serial.port.clone(),
                baud: config.serial.baud,
            }
        }
    }
}

/// Initialization steps, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStep {
    Config,
    Channel,
    Motor,
    Led,
    Sensor,
    SelfTest,
    Safety,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("Configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("Device link failed: {0}")]
    Channel(#[from] ChannelError),

    #[error("Motor initialization failed: {0}")]
    Motor(#[from] MotorError),

    #[error("LED initialization failed: {0}")]
    Led(#[from] LedError),

    #[error("Sensor initialization failed: {0}")]
    Sensor(#[from] SensorError),

    #[error("Self-test failed: {0}")]
    SelfTest(String),

    #[error("Safety monitor failed to start: {0}")]
    Safety(#[from] SafetyError),
}

impl InitError {
    /// The step that failed
    pub fn step(&self) -> InitStep {
        match self {
            InitError::Config(_) => InitStep::Config,
            InitError::Channel(_) => InitStep::Channel,
            InitError::Motor(_) => InitStep::Motor,
            InitError::Led(_) => InitStep::Led,
            InitError::Sensor(_) => InitStep::Sensor,
            InitError::SelfTest(_) => InitStep::SelfTest,
            InitError::Safety(_) => InitStep::Safety,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error("Hardware not operational")]
    NotOperational,

    #[error("Motor error: {0}")]
    Motor(#[from] MotorError),

    #[error("LED error: {0}")]
    Led(#[from] LedError),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrationStats {
    pub init_duration: Duration,
    pub total_movements: u64,
    pub total_expressions: u64,
    pub interrupted_movements: u64,
    pub safety_stops: u64,
}

/// Everything known about the hardware, gathered without device I/O
#[derive(Debug, Clone, Serialize)]
pub struct AggregateStatus {
    pub initialized: bool,
    pub operational: bool,
    pub simulation: bool,
    pub stats: IntegrationStats,
    pub motor: Option<MotorState>,
    pub led: Option<LedStatus>,
    pub sensors: Option<SensorSnapshot>,
    pub safety: Option<SafetyStatus>,
    pub safety_stats: Option<SafetyStats>,
}

struct Subsystems {
    channel: Channel,
    motor: Arc<MotorDriver>,
    led: Arc<LedController>,
    sensor: Arc<ChannelSensor>,
    safety: Arc<SafetyMonitor>,
}

pub struct HardwareManager {
    config: Config,
    link: Option<Link>,
    parts: Option<Subsystems>,
    simulation: bool,
    operational: bool,
    stats: Mutex<IntegrationStats>,
}

impl HardwareManager {
    pub fn new(config: Config, link: Link) -> Self {
        let simulation = matches!(link, Link::Simulated(_));
        info!("Hardware manager created (simulation: {})", simulation);
        Self {
            config,
            link: Some(link),
            parts: None,
            simulation,
            operational: false,
            stats: Mutex::new(IntegrationStats::default()),
        }
    }

    /// Validate the configuration, then bring every subsystem up in order:
    /// channel, motor, settle, LED, sensor, self-test, and the safety
    /// monitor last.
    ///
    /// Any failure closes the channel and reports the failing step; nothing
    /// is left half-operational.
    pub async fn initialize(&mut self) -> Result<(), InitError> {
        if self.parts.is_some() {
            warn!("Hardware already initialized");
            return Ok(());
        }
        let started = Instant::now();
        info!("Initializing hardware...");
        if let Err(e) = self.config.validate() {
            error!("Refusing to initialize: {}", e);
            return Err(e.into());
        }

        let channel = self.open_channel().await?;
        let parts = match self.bring_up(channel.clone()).await {
            Ok(parts) => parts,
            Err(e) => {
                error!("Initialization failed at {:?} step: {}", e.step(), e);
                channel.close().await;
                return Err(e);
            }
        };

        self.parts = Some(parts);
        self.operational = true;
        let elapsed = started.elapsed();
        self.stats.lock().init_duration = elapsed;
        info!("Hardware initialized in {:.1}s", elapsed.as_secs_f64());
        Ok(())
    }

    async fn open_channel(&mut self) -> Result<Channel, ChannelError> {
        let settings = ChannelSettings::from(&self.config.serial);
        match self.link.take() {
            Some(Link::Serial { port, baud }) => {
                info!("Opening {} at {} baud", port, baud);
                let result = Channel::open_serial(&port, baud, settings).await;
                self.link = Some(Link::Serial { port, baud });
                result
            }
            Some(Link::Simulated(device)) => {
                info!("Opening simulated device");
                Channel::open_simulated(device, settings).await
            }
            None => {
                warn!("Simulated device already consumed by an earlier session");
                Err(ChannelError::Closed)
            }
        }
    }

    async fn bring_up(&self, channel: Channel) -> Result<Subsystems, InitError> {
        let config = &self.config;

        let motor = Arc::new(
            MotorDriver::new(
                channel.clone(),
                config.motor.clone(),
                config.serial.command_timeout(),
            )
            .with_status_timeout(config.serial.status_timeout()),
        );
        motor.initialize().await?;

        info!("Waiting {:?} for device to settle", config.integration.device_settle());
        tokio::time::sleep(config.integration.device_settle()).await;

        let led = Arc::new(LedController::new(channel.clone(), &config.led));
        led.initialize().await?;

        let sensor = Arc::new(ChannelSensor::new(channel.clone(), config.sensor.clone()));
        sensor.initialize().await?;

        self_test(&motor).await?;

        let safety = Arc::new(
            SafetyMonitor::new(config.safety.clone(), motor.clone(), sensor.clone())
                .with_led(led.clone()),
        );
        safety.start()?;

        Ok(Subsystems {
            channel,
            motor,
            led,
            sensor,
            safety,
        })
    }

    fn operational_parts(&self) -> Result<&Subsystems, IntegrationError> {
        match &self.parts {
            Some(parts) if self.operational => Ok(parts),
            _ => {
                error!("Hardware not operational");
                Err(IntegrationError::NotOperational)
            }
        }
    }

    /// Move at base speed while showing an expression
    pub async fn move_with_expression(
        &self,
        direction: Direction,
        label: &str,
        duration: Duration,
    ) -> Result<bool, IntegrationError> {
        let speed = self.config.motor.base_speed;
        self.move_with_expression_at(direction, label, duration, speed)
            .await
    }

    /// Show `label` for `duration` plus grace while moving for `duration`,
    /// then stop.
    ///
    /// Returns Ok(false) when the safety level forbids motion, when the
    /// emergency latch refuses the move, or when an emergency cuts the hold
    /// short.
    pub async fn move_with_expression_at(
        &self,
        direction: Direction,
        label: &str,
        duration: Duration,
        speed: u8,
    ) -> Result<bool, IntegrationError> {
        let parts = self.operational_parts()?;

        let level = parts.safety.level();
        if level > SafetyLevel::Warning {
            warn!("Movement blocked by safety monitor ({:?})", level);
            return Ok(false);
        }

        if direction == Direction::Stop {
            parts.motor.stop().await?;
            return Ok(true);
        }

        info!(
            "Moving {} with expression '{}' for {:?}",
            direction, label, duration
        );
        let mut levels = parts.safety.subscribe();
        let grace = self.config.led.expression_grace();

        let (shown, moved) = tokio::join!(
            parts.led.show_expression(label, Some(duration + grace)),
            parts.motor.drive(direction, speed),
        );

        match shown {
            Ok(true) => self.stats.lock().total_expressions += 1,
            Ok(false) => warn!("Expression '{}' not acknowledged", label),
            Err(e) => warn!("Expression '{}' failed: {}", label, e),
        }

        match moved {
            Ok(()) => {}
            Err(MotorError::EmergencyStopped) => {
                warn!("Movement refused: emergency stop active");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = emergency_asserted(&mut levels) => true,
        };
        if interrupted {
            self.stats.lock().interrupted_movements += 1;
            warn!("Movement {} interrupted by emergency stop", direction);
            return Ok(false);
        }

        parts.motor.stop().await?;
        self.stats.lock().total_movements += 1;
        info!("Movement completed: {} with '{}'", direction, label);
        Ok(true)
    }

    /// LED-only expression
    pub async fn express(
        &self,
        label: &str,
        duration: Option<Duration>,
    ) -> Result<bool, IntegrationError> {
        let parts = self.operational_parts()?;
        let shown = parts.led.show_expression(label, duration).await?;
        if shown {
            self.stats.lock().total_expressions += 1;
        }
        Ok(shown)
    }

    /// Manual emergency stop through the safety monitor
    pub async fn emergency_stop(&self) -> Result<(), IntegrationError> {
        let parts = self.parts.as_ref().ok_or(IntegrationError::NotOperational)?;
        warn!("Coordinated emergency stop requested");
        parts.safety.manual_emergency_stop().await;
        self.stats.lock().safety_stops += 1;
        Ok(())
    }

    /// Clear the emergency if the path is clear
    pub async fn resume(&self) -> Result<bool, IntegrationError> {
        let parts = self.operational_parts()?;
        Ok(parts.safety.resume().await)
    }

    pub async fn device_status(&self) -> Result<DeviceStatus, IntegrationError> {
        let parts = self.operational_parts()?;
        Ok(parts.motor.query_device_status().await?)
    }

    pub fn status(&self) -> AggregateStatus {
        let parts = self.parts.as_ref();
        AggregateStatus {
            initialized: parts.is_some(),
            operational: self.operational,
            simulation: self.simulation,
            stats: self.stats.lock().clone(),
            motor: parts.map(|p| p.motor.status()),
            led: parts.map(|p| p.led.status()),
            sensors: parts.map(|p| p.sensor.snapshot()),
            safety: parts.map(|p| p.safety.status()),
            safety_stats: parts.map(|p| p.safety.stats()),
        }
    }

    /// Speed for an emotion-layer multiplier, once the motor is up
    pub fn speed_for_multiplier(&self, multiplier: f32) -> Option<u8> {
        self.parts
            .as_ref()
            .map(|p| p.motor.speed_for_multiplier(multiplier))
    }

    pub fn stats(&self) -> IntegrationStats {
        self.stats.lock().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.parts.is_some() && self.operational
    }

    pub fn is_safe(&self) -> bool {
        self.operational
            && self
                .parts
                .as_ref()
                .is_some_and(|p| p.safety.is_safe_to_move())
    }

    /// Reverse of `initialize`: safety, LED, motor, then the channel
    pub async fn shutdown(&mut self) {
        self.operational = false;
        let Some(parts) = self.parts.take() else {
            return;
        };
        info!("Starting coordinated hardware shutdown...");
        parts.safety.shutdown().await;
        parts.led.shutdown().await;
        parts.motor.shutdown().await;
        parts.channel.close().await;
        info!("Hardware shutdown completed");
    }
}

/// The device must answer STATUS with something other than an error
async fn self_test(motor: &MotorDriver) -> Result<(), InitError> {
    info!("Running integration self-test...");
    match motor.query_device_status().await {
        Ok(DeviceStatus::Error(reason)) => Err(InitError::SelfTest(format!(
            "device reported error: {}",
            reason
        ))),
        Ok(status) => {
            info!("Self-test passed: {:?}", status);
            Ok(())
        }
        Err(e) => Err(InitError::SelfTest(e.to_string())),
    }
}

/// Initialize, log the aggregated status once per second until Ctrl-C, then
/// shut down.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let link = Link::from_config(&config);
    let mut manager = HardwareManager::new(config, link);
    manager.initialize().await?;

    let mut tick = interval(Duration::from_secs(1));
    info!("Runtime started, press Ctrl-C to stop");

    let outcome: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
        tokio::select! {
            _ = tick.tick() => {
                match serde_json::to_string(&manager.status()) {
                    Ok(json) => info!("status {}", json),
                    Err(e) => break Err(e.into()),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break signal.map_err(Into::into);
            }
        }
    };

    manager.shutdown().await;
    outcome
}
