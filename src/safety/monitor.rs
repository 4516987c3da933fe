// Real-time safety monitor
//
// Runs a fixed-cadence loop (20 Hz by default) that reads the distance
// source once per tick and maintains a safety level derived from the active
// alerts. Emergencies latch the motor before the alert becomes visible.
//
// Level only ever rises between resumes:
//   Safe -> Warning    obstacle within min_obstacle_distance
//   any  -> Danger     no reading, or no reading for stale_after
//   any  -> Emergency  obstacle within emergency_stop_distance, manual
//                      trigger, or a fault inside a tick
//   any  -> Safe       only through resume(), which re-reads the sensor

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::cadence::Cadence;
use crate::config::SafetyConfig;
use crate::led::{Animation, LedController};
use crate::motor::MotorDriver;
use crate::sensor::{DistanceSource, SensorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Safe,
    Warning,
    Danger,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyAlert {
    ObstacleTooClose,
    SensorFailure,
    CommunicationLost,
    ManualEmergency,
    SystemError,
}

impl fmt::Display for SafetyAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SafetyAlert::ObstacleTooClose => "obstacle_too_close",
            SafetyAlert::SensorFailure => "sensor_failure",
            SafetyAlert::CommunicationLost => "communication_lost",
            SafetyAlert::ManualEmergency => "manual_emergency",
            SafetyAlert::SystemError => "system_error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    #[error("Distance source failed: {0}")]
    Sensor(#[from] SensorError),

    #[error("Distance source returned an invalid value: {0}")]
    InvalidReading(f32),

    #[error("Safety tick panicked: {0}")]
    Panicked(String),

    #[error("Safety monitoring is already running")]
    AlreadyRunning,
}

/// Snapshot of the monitor's view of the world
#[derive(Debug, Clone, Serialize)]
pub struct SafetyStatus {
    pub level: SafetyLevel,
    pub active_alerts: BTreeSet<SafetyAlert>,
    #[serde(skip)]
    pub last_sensor_reading_at: Option<Instant>,
    pub emergency_stop_count: u64,
    pub monitoring_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyStats {
    pub monitoring_loops: u64,
    pub warnings_triggered: u64,
    pub emergency_stops: u64,
    pub uptime_secs: f64,
    pub loops_per_second: f64,
}

struct MonitorState {
    level: SafetyLevel,
    /// Active alerts with the level each one implies
    alerts: BTreeMap<SafetyAlert, SafetyLevel>,
    last_reading_at: Option<Instant>,
    /// Start of the stale window when no reading has arrived yet
    watching_since: Instant,
    emergency_stop_count: u64,
    monitoring_active: bool,
    loops: u64,
    warnings: u64,
    created_at: Instant,
}

struct MonitorTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct SafetyMonitor {
    config: SafetyConfig,
    motor: Arc<MotorDriver>,
    source: Arc<dyn DistanceSource>,
    led: Option<Arc<LedController>>,
    state: Mutex<MonitorState>,
    levels: watch::Sender<SafetyLevel>,
    task: Mutex<Option<MonitorTask>>,
}

impl SafetyMonitor {
    pub fn new(
        config: SafetyConfig,
        motor: Arc<MotorDriver>,
        source: Arc<dyn DistanceSource>,
    ) -> Self {
        info!(
            "Safety thresholds: warning <= {}cm, emergency <= {}cm",
            config.min_obstacle_distance, config.emergency_stop_distance
        );
        let now = Instant::now();
        let (levels, _) = watch::channel(SafetyLevel::Safe);
        Self {
            config,
            motor,
            source,
            led: None,
            state: Mutex::new(MonitorState {
                level: SafetyLevel::Safe,
                alerts: BTreeMap::new(),
                last_reading_at: None,
                watching_since: now,
                emergency_stop_count: 0,
                monitoring_active: false,
                loops: 0,
                warnings: 0,
                created_at: now,
            }),
            levels,
            task: Mutex::new(None),
        }
    }

    /// Signal emergencies, warnings and resumes on the LED matrix
    pub fn with_led(mut self, led: Arc<LedController>) -> Self {
        self.led = Some(led);
        self
    }

    async fn signal(&self, animation: Animation) {
        if let Some(led) = &self.led {
            led.play(animation).await;
        }
    }

    /// Spawn the monitoring loop
    pub fn start(self: &Arc<Self>) -> Result<(), SafetyError> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            warn!("Safety monitoring already active");
            return Err(SafetyError::AlreadyRunning);
        }

        {
            let mut state = self.state.lock();
            state.monitoring_active = true;
            state.watching_since = Instant::now();
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(self.clone().run(stop_rx));
        *task = Some(MonitorTask { stop, handle });
        info!("Safety monitoring started at {:?} period", self.config.period());
        Ok(())
    }

    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let cadence = Cadence::new(self.config.period(), self.config.min_yield());

        loop {
            let started = Instant::now();

            // A panic inside the tick must not end the loop
            let monitor = self.clone();
            let outcome = match tokio::spawn(async move { monitor.tick().await }).await {
                Ok(result) => result,
                Err(e) => Err(SafetyError::Panicked(e.to_string())),
            };
            if let Err(e) = outcome {
                error!("Safety tick failed: {}", e);
                self.escalate(SafetyAlert::SystemError).await;
            }
            self.state.lock().loops += 1;

            tokio::select! {
                _ = stop.changed() => break,
                _ = cadence.wait(started) => {}
            }
        }
        debug!("Safety monitoring loop exited");
    }

    /// One evaluation: read the hazard source once and update alerts
    async fn tick(&self) -> Result<(), SafetyError> {
        let reading = self.source.read_distance().await?;
        if let Some(distance) = reading.filter(|d| !d.is_finite()) {
            return Err(SafetyError::InvalidReading(distance));
        }
        let now = Instant::now();

        let mut raised: Vec<(SafetyAlert, SafetyLevel)> = Vec::new();
        match reading {
            Some(d) if d <= self.config.emergency_stop_distance => {
                warn!(
                    "Obstacle at {:.1}cm (<= {}cm)",
                    d, self.config.emergency_stop_distance
                );
                self.escalate(SafetyAlert::ObstacleTooClose).await;
            }
            Some(d) if d <= self.config.min_obstacle_distance => {
                raised.push((SafetyAlert::ObstacleTooClose, SafetyLevel::Warning));
            }
            Some(_) => {}
            None => raised.push((SafetyAlert::SensorFailure, SafetyLevel::Danger)),
        }

        let (previous, level) = {
            let mut state = self.state.lock();
            if reading.is_some() {
                state.last_reading_at = Some(now);
            }
            let since = state.last_reading_at.unwrap_or(state.watching_since);
            if now.duration_since(since) > self.config.stale_after() {
                raised.push((SafetyAlert::CommunicationLost, SafetyLevel::Danger));
            }

            // Emergency alerts stay until resume; the rest must be re-raised
            state.alerts.retain(|alert, implied| {
                let keep = *implied == SafetyLevel::Emergency
                    || raised.iter().any(|(raised, _)| raised == alert);
                if !keep {
                    info!("Alert cleared: {}", alert);
                }
                keep
            });
            for &(alert, implied) in &raised {
                let entry = state.alerts.entry(alert).or_insert_with(|| {
                    warn!("Alert raised: {} ({:?})", alert, implied);
                    implied
                });
                if *entry < implied {
                    *entry = implied;
                }
            }

            let worst = state
                .alerts
                .values()
                .copied()
                .max()
                .unwrap_or(SafetyLevel::Safe);
            let previous = state.level;
            if worst > previous {
                state.level = worst;
                if worst == SafetyLevel::Warning {
                    state.warnings += 1;
                }
            }
            (previous, state.level)
        };

        if level != previous {
            warn!("Safety level {:?} -> {:?}", previous, level);
            self.levels.send_replace(level);
        }

        if level == SafetyLevel::Emergency && !self.motor.is_emergency_stopped() {
            warn!("Emergency level without motor latch, re-latching");
            self.motor.engage_latch();
        }
        if previous < SafetyLevel::Danger && level == SafetyLevel::Danger && self.motor.is_moving() {
            if let Err(e) = self.motor.stop().await {
                error!("Failed to stop motors on {:?}: {}", level, e);
            }
        }
        if previous < SafetyLevel::Warning && level == SafetyLevel::Warning {
            self.signal(Animation::attention()).await;
        }
        Ok(())
    }

    /// Raise an emergency alert unless it is already active
    async fn escalate(&self, alert: SafetyAlert) {
        let active = self.state.lock().alerts.get(&alert) == Some(&SafetyLevel::Emergency);
        if active {
            self.motor.engage_latch();
        } else {
            self.trigger_emergency(alert).await;
        }
    }

    /// Latch the motor, record the alert, then stop the device.
    ///
    /// The alert is never visible before the motor latch is set.
    pub async fn trigger_emergency(&self, alert: SafetyAlert) {
        self.motor.engage_latch();
        {
            let mut state = self.state.lock();
            // Re-assert in case a concurrent resume cleared it
            self.motor.engage_latch();
            state.alerts.insert(alert, SafetyLevel::Emergency);
            state.level = SafetyLevel::Emergency;
            state.emergency_stop_count += 1;
        }
        self.levels.send_replace(SafetyLevel::Emergency);
        error!("EMERGENCY STOP triggered: {}", alert);

        match self.motor.emergency_stop().await {
            Ok(()) => info!("Emergency stop confirmed by device"),
            Err(e) => error!("Emergency stop not confirmed: {}", e),
        }
        self.signal(Animation::emergency()).await;
    }

    pub async fn manual_emergency_stop(&self) {
        self.trigger_emergency(SafetyAlert::ManualEmergency).await;
    }

    /// Clear all alerts if the hazard source reports a clear path.
    ///
    /// Returns false, leaving level and latch untouched, when the reading
    /// is missing or still within `min_obstacle_distance`.
    pub async fn resume(&self) -> bool {
        // Any emergency raised while the reading is in flight voids it
        let episode = self.state.lock().emergency_stop_count;
        let reading = match self.source.read_distance().await {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Cannot resume: distance source failed: {}", e);
                return false;
            }
        };
        match reading {
            Some(d) if d.is_finite() && d > self.config.min_obstacle_distance => {}
            Some(d) => {
                warn!("Cannot resume: obstacle still at {:.1}cm", d);
                return false;
            }
            None => {
                warn!("Cannot resume: no distance reading");
                return false;
            }
        }

        let previous = {
            let mut state = self.state.lock();
            if state.emergency_stop_count != episode {
                warn!("Cannot resume: emergency raised while checking the path");
                return false;
            }
            state.alerts.clear();
            state.last_reading_at = Some(Instant::now());
            self.motor.resume();
            std::mem::replace(&mut state.level, SafetyLevel::Safe)
        };
        self.levels.send_replace(SafetyLevel::Safe);
        info!("Resumed from {:?}: robot operational", previous);
        self.signal(Animation::celebration()).await;
        true
    }

    pub fn level(&self) -> SafetyLevel {
        self.state.lock().level
    }

    pub fn is_safe_to_move(&self) -> bool {
        self.level() <= SafetyLevel::Warning
    }

    /// Level changes, for tasks that must react to an emergency
    pub fn subscribe(&self) -> watch::Receiver<SafetyLevel> {
        self.levels.subscribe()
    }

    pub fn status(&self) -> SafetyStatus {
        let state = self.state.lock();
        SafetyStatus {
            level: state.level,
            active_alerts: state.alerts.keys().copied().collect(),
            last_sensor_reading_at: state.last_reading_at,
            emergency_stop_count: state.emergency_stop_count,
            monitoring_active: state.monitoring_active,
        }
    }

    pub fn stats(&self) -> SafetyStats {
        let state = self.state.lock();
        let uptime = state.created_at.elapsed().as_secs_f64();
        SafetyStats {
            monitoring_loops: state.loops,
            warnings_triggered: state.warnings,
            emergency_stops: state.emergency_stop_count,
            uptime_secs: uptime,
            loops_per_second: state.loops as f64 / uptime.max(1.0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Stop the loop and wait for it to exit
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop.send_replace(true);
            if let Err(e) = task.handle.await {
                error!("Safety monitoring loop ended abnormally: {}", e);
            }
        }
        self.state.lock().monitoring_active = false;
        info!("Safety monitoring stopped");
    }

    /// Stop monitoring and make sure the motors are not left running
    pub async fn shutdown(&self) {
        info!("Shutting down safety monitor");
        self.stop().await;
        if self.motor.is_moving() {
            if let Err(e) = self.motor.stop().await {
                error!("Final stop failed: {}", e);
            }
        }
    }
}

/// Resolve once the level reaches Emergency
pub async fn emergency_asserted(levels: &mut watch::Receiver<SafetyLevel>) {
    loop {
        if *levels.borrow_and_update() == SafetyLevel::Emergency {
            return;
        }
        if levels.changed().await.is_err() {
            // Monitor gone: nothing will ever assert an emergency
            std::future::pending::<()>().await;
        }
    }
}
