// Motor state machine for the wheeled base
//
// Translates move/stop intents into channel commands and keeps the
// authoritative motor state. State changes only after the device
// acknowledges the command that caused them.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelError};
use crate::config::{MotorConfig, STATUS_TIMEOUT};
use crate::messages::{
    ACK_SPEED_SET, ACK_STOP, Command, DeviceStatus, DeviceTelemetry, ERROR_PREFIX, STATUS,
    STATUS_PREFIX, STOP, payload_after,
};

/// Commanded direction of travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

impl Direction {
    /// Command line sent to the device
    pub fn command(self) -> &'static str {
        match self {
            Direction::Forward => "MOVE_FORWARD",
            Direction::Backward => "MOVE_BACKWARD",
            Direction::Left => "TURN_LEFT",
            Direction::Right => "TURN_RIGHT",
            Direction::Stop => STOP,
        }
    }

    /// Substring the device reply must contain
    pub fn ack(self) -> &'static str {
        match self {
            Direction::Forward => "ACTION:MOVE_FORWARD",
            Direction::Backward => "ACTION:MOVE_BACKWARD",
            Direction::Left => "ACTION:TURN_LEFT",
            Direction::Right => "ACTION:TURN_RIGHT",
            Direction::Stop => ACK_STOP,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
            Direction::Left => "left",
            Direction::Right => "right",
            Direction::Stop => "stop",
        };
        f.write_str(name)
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forward" => Ok(Direction::Forward),
            "backward" => Ok(Direction::Backward),
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            "stop" => Ok(Direction::Stop),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// Error types for motor commands
#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("Motion refused: emergency stop is latched")]
    EmergencyStopped,

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("No response to {command} within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Unexpected response to {command}: {response}")]
    UnexpectedResponse { command: String, response: String },

    /// Speed was changed on the device but the direction command failed
    #[error("Speed set to {speed} but direction command failed: {source}")]
    PartiallyApplied {
        speed: u8,
        #[source]
        source: Box<MotorError>,
    },

    #[error("Malformed status payload: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Snapshot of the motor state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotorState {
    pub direction: Direction,
    pub speed: u8,
    pub is_moving: bool,
    pub emergency_stopped: bool,
    #[serde(skip)]
    pub last_command_at: Option<Instant>,
}

impl Default for MotorState {
    fn default() -> Self {
        Self {
            direction: Direction::Stop,
            speed: 0,
            is_moving: false,
            emergency_stopped: false,
            last_command_at: None,
        }
    }
}

/// Motor driver sharing the device channel with LED and sensor code
pub struct MotorDriver {
    channel: Channel,
    config: MotorConfig,
    timeout: Duration,
    status_timeout: Duration,
    state: Mutex<MotorState>,
}

impl MotorDriver {
    /// Attach to an open channel. No commands are sent until `initialize`.
    pub fn new(channel: Channel, config: MotorConfig, timeout: Duration) -> Self {
        Self {
            channel,
            config,
            timeout,
            status_timeout: STATUS_TIMEOUT,
            state: Mutex::new(MotorState::default()),
        }
    }

    /// STATUS replies can take longer than motion acks
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    /// Put the device in a known state: stopped, at base speed
    pub async fn initialize(&self) -> Result<(), MotorError> {
        info!(
            "Initializing motors (base speed {}, max {})",
            self.config.base_speed, self.config.max_speed
        );
        self.stop().await?;
        self.set_speed(self.config.base_speed).await?;
        info!("Motors initialized");
        Ok(())
    }

    /// Send one command and require its acknowledgement token
    async fn command(&self, text: &str, ack: &str) -> Result<(), MotorError> {
        let result = self
            .channel
            .execute(Command::request(text, self.timeout))
            .await?;
        match result.response {
            Some(ref line) if line.contains(ack) => Ok(()),
            Some(line) => Err(MotorError::UnexpectedResponse {
                command: text.to_string(),
                response: line,
            }),
            None => Err(MotorError::Timeout {
                command: text.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    fn clamp_speed(&self, speed: u8) -> u8 {
        speed.min(self.config.max_speed)
    }

    /// Start moving in `direction` at `speed` (clamped to the configured max).
    ///
    /// Refused without touching the channel while the emergency latch is set.
    /// If the speed change is acknowledged but the direction command is not,
    /// the error is `PartiallyApplied` and the new speed is kept in state.
    pub async fn drive(&self, direction: Direction, speed: u8) -> Result<(), MotorError> {
        if direction == Direction::Stop {
            return self.stop().await;
        }
        if self.is_emergency_stopped() {
            warn!("Cannot move {}: emergency stop active", direction);
            return Err(MotorError::EmergencyStopped);
        }

        let speed = self.clamp_speed(speed);
        let speed_changed = speed != self.state.lock().speed;
        if speed_changed {
            self.set_speed(speed).await?;
            // Latch may have been set while the speed command was in flight
            if self.is_emergency_stopped() {
                return Err(MotorError::EmergencyStopped);
            }
        }

        if let Err(e) = self.command(direction.command(), direction.ack()).await {
            warn!("{} command failed: {}", direction.command(), e);
            return Err(if speed_changed {
                MotorError::PartiallyApplied {
                    speed,
                    source: Box::new(e),
                }
            } else {
                e
            });
        }

        let mut state = self.state.lock();
        if state.emergency_stopped {
            // An emergency STOP is queued behind this command
            return Err(MotorError::EmergencyStopped);
        }
        state.direction = direction;
        state.is_moving = true;
        state.last_command_at = Some(Instant::now());
        info!("Moving {} at speed {}", direction, speed);
        Ok(())
    }

    /// Stop the motors. Allowed while latched.
    pub async fn stop(&self) -> Result<(), MotorError> {
        self.command(STOP, ACK_STOP).await?;

        let mut state = self.state.lock();
        state.direction = Direction::Stop;
        state.is_moving = false;
        state.last_command_at = Some(Instant::now());
        debug!("Motors stopped");
        Ok(())
    }

    /// Set the PWM speed (clamped to the configured max)
    pub async fn set_speed(&self, speed: u8) -> Result<(), MotorError> {
        let speed = self.clamp_speed(speed);
        let text = format!("SET_SPEED:{}", speed);
        self.command(&text, ACK_SPEED_SET).await?;

        self.state.lock().speed = speed;
        debug!("Speed set to {}", speed);
        Ok(())
    }

    /// Set the latch in local state. Takes effect before any I/O.
    pub fn engage_latch(&self) {
        let mut state = self.state.lock();
        if !state.emergency_stopped {
            warn!("EMERGENCY STOP latched");
        }
        state.emergency_stopped = true;
        state.is_moving = false;
    }

    /// Latch, then best-effort stop on the device.
    ///
    /// The latch holds even if the STOP round trip fails.
    pub async fn emergency_stop(&self) -> Result<(), MotorError> {
        self.engage_latch();
        let result = self.stop().await;
        if let Err(ref e) = result {
            warn!("Emergency STOP not confirmed by device: {}", e);
        }
        result
    }

    /// Clear the latch. Hazard re-validation is the caller's job.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if state.emergency_stopped {
            info!("Emergency latch cleared");
        }
        state.emergency_stopped = false;
    }

    pub fn status(&self) -> MotorState {
        self.state.lock().clone()
    }

    pub fn is_moving(&self) -> bool {
        self.state.lock().is_moving
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.state.lock().emergency_stopped
    }

    /// Speed for an externally resolved multiplier, kept within [min, max]
    pub fn speed_for_multiplier(&self, multiplier: f32) -> u8 {
        let scaled = (self.config.base_speed as f32 * multiplier).round();
        let min = self.config.min_speed as f32;
        let max = self.config.max_speed as f32;
        // max wins if the bounds are inverted
        scaled.max(min).min(max) as u8
    }

    /// Ask the device for its telemetry
    pub async fn query_device_status(&self) -> Result<DeviceStatus, MotorError> {
        let result = self
            .channel
            .execute(Command::request(STATUS, self.status_timeout))
            .await?;
        let Some(line) = result.response else {
            return Err(MotorError::Timeout {
                command: STATUS.to_string(),
                timeout: self.status_timeout,
            });
        };
        parse_status(&line)
    }

    /// Final stop before the channel goes away
    pub async fn shutdown(&self) {
        info!("Shutting down motors");
        if let Err(e) = self.stop().await {
            warn!("Failed to stop motors on shutdown: {}", e);
        }
    }
}

fn parse_status(line: &str) -> Result<DeviceStatus, MotorError> {
    if let Some(json) = payload_after(line, STATUS_PREFIX) {
        let telemetry: DeviceTelemetry = serde_json::from_str(json)?;
        return Ok(DeviceStatus::Parsed(telemetry));
    }
    if let Some(reason) = payload_after(line, ERROR_PREFIX) {
        return Ok(DeviceStatus::Error(reason.to_string()));
    }
    Ok(DeviceStatus::Raw(line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{SimHandle, SimulatedDevice, test_settings};

    async fn driver() -> (MotorDriver, SimHandle) {
        let device = SimulatedDevice::new();
        let handle = device.handle();
        let channel = Channel::open_simulated(device, test_settings()).await.unwrap();
        let motor = MotorDriver::new(channel, MotorConfig::default(), Duration::from_millis(200));
        (motor, handle)
    }

    #[test]
    fn test_direction_commands() {
        assert_eq!(Direction::Forward.command(), "MOVE_FORWARD");
        assert_eq!(Direction::Left.ack(), "ACTION:TURN_LEFT");
        assert_eq!("Backward".parse::<Direction>(), Ok(Direction::Backward));
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_stops_and_sets_base_speed() {
        let (motor, handle) = driver().await;
        motor.initialize().await.unwrap();

        assert_eq!(handle.written()[1..], ["STOP", "SET_SPEED:40"]);
        assert_eq!(motor.status().speed, 40);
        assert!(!motor.is_moving());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_sets_speed_then_direction() {
        let (motor, handle) = driver().await;
        motor.drive(Direction::Forward, 60).await.unwrap();

        assert_eq!(handle.written()[1..], ["SET_SPEED:60", "MOVE_FORWARD"]);
        let state = motor.status();
        assert_eq!(state.direction, Direction::Forward);
        assert_eq!(state.speed, 60);
        assert!(state.is_moving);
        assert!(state.last_command_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_skips_speed_when_unchanged() {
        let (motor, handle) = driver().await;
        motor.drive(Direction::Left, 50).await.unwrap();
        motor.drive(Direction::Right, 50).await.unwrap();

        assert_eq!(
            handle.written()[1..],
            ["SET_SPEED:50", "TURN_LEFT", "TURN_RIGHT"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_is_clamped_to_max() {
        let (motor, handle) = driver().await;
        motor.drive(Direction::Forward, 250).await.unwrap();

        assert_eq!(handle.speed(), 100);
        assert_eq!(motor.status().speed, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_refused_while_latched_without_io() {
        let (motor, handle) = driver().await;
        motor.emergency_stop().await.unwrap();
        let writes = handle.write_count();

        let result = motor.drive(Direction::Forward, 40).await;

        assert!(matches!(result, Err(MotorError::EmergencyStopped)));
        assert_eq!(handle.write_count(), writes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_allowed_while_latched() {
        let (motor, _handle) = driver().await;
        motor.engage_latch();
        motor.stop().await.unwrap();
        assert!(motor.is_emergency_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latch_holds_when_stop_times_out() {
        let (motor, handle) = driver().await;
        motor.drive(Direction::Forward, 40).await.unwrap();
        handle.mute("STOP");

        let result = motor.emergency_stop().await;

        assert!(matches!(result, Err(MotorError::Timeout { .. })));
        let state = motor.status();
        assert!(state.emergency_stopped);
        assert!(!state.is_moving);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_ack_leaves_state_unchanged() {
        let (motor, handle) = driver().await;
        motor.set_speed(40).await.unwrap();
        handle.override_response("MOVE_FORWARD", "ERROR:MOTOR_FAULT");

        let result = motor.drive(Direction::Forward, 40).await;

        assert!(matches!(
            result,
            Err(MotorError::UnexpectedResponse { .. })
        ));
        assert_eq!(motor.status().direction, Direction::Stop);
        assert!(!motor.is_moving());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_application_is_reported() {
        let (motor, handle) = driver().await;
        handle.mute("MOVE_BACKWARD");

        let result = motor.drive(Direction::Backward, 70).await;

        match result {
            Err(MotorError::PartiallyApplied { speed, source }) => {
                assert_eq!(speed, 70);
                assert!(matches!(*source, MotorError::Timeout { .. }));
            }
            other => panic!("expected PartiallyApplied, got {:?}", other),
        }
        let state = motor.status();
        assert_eq!(state.speed, 70);
        assert!(!state.is_moving);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_clears_latch() {
        let (motor, _handle) = driver().await;
        motor.emergency_stop().await.unwrap();
        motor.resume();
        motor.drive(Direction::Forward, 40).await.unwrap();
        assert!(motor.is_moving());
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_device_status_variants() {
        let (motor, handle) = driver().await;

        match motor.query_device_status().await.unwrap() {
            DeviceStatus::Parsed(telemetry) => assert_eq!(telemetry.free_memory, Some(1500)),
            other => panic!("expected parsed status, got {:?}", other),
        }

        handle.override_response("STATUS", "ERROR:LOW_BATTERY");
        assert_eq!(
            motor.query_device_status().await.unwrap(),
            DeviceStatus::Error("LOW_BATTERY".to_string())
        );

        handle.override_response("STATUS", "BOOTING");
        assert_eq!(
            motor.query_device_status().await.unwrap(),
            DeviceStatus::Raw("BOOTING".to_string())
        );

        handle.override_response("STATUS", "STATUS:{not json");
        assert!(matches!(
            motor.query_device_status().await,
            Err(MotorError::Parse(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_for_multiplier_clamps() {
        let (motor, _handle) = driver().await;
        assert_eq!(motor.speed_for_multiplier(1.0), 40);
        assert_eq!(motor.speed_for_multiplier(1.5), 60);
        assert_eq!(motor.speed_for_multiplier(0.1), 10);
        assert_eq!(motor.speed_for_multiplier(5.0), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_for_multiplier_with_inverted_bounds() {
        let device = SimulatedDevice::new();
        let channel = Channel::open_simulated(device, test_settings()).await.unwrap();
        let config = MotorConfig {
            min_speed: 80,
            max_speed: 50,
            ..MotorConfig::default()
        };
        let motor = MotorDriver::new(channel, config, Duration::from_millis(200));
        assert_eq!(motor.speed_for_multiplier(1.0), 50);
        assert_eq!(motor.speed_for_multiplier(f32::NAN), 50);
    }
}
