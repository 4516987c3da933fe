// Ultrasonic and photoresistor readings over the shared device channel
//
// The safety monitor consumes raw distances through `DistanceSource`;
// smoothed values are kept only for the status summary, since averaging
// would delay detection of a sudden obstacle.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelError};
use crate::config::SensorConfig;
use crate::messages::{Command, READ_SENSORS, SENSORS_PREFIX, SensorPayload, payload_after};

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Sensor returned no usable reading")]
    NoReading,

    #[error("Sensor source fault: {0}")]
    Fault(String),
}

/// Hazard input for the safety monitor.
///
/// `Ok(None)` means the sensor gave no usable reading this time; `Err` is an
/// unexpected fault in the source itself.
#[async_trait]
pub trait DistanceSource: Send + Sync {
    /// Current obstacle distance in cm
    async fn read_distance(&self) -> Result<Option<f32>, SensorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lighting {
    Dark,
    Normal,
    Bright,
}

/// Last known readings, available without I/O
#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorSnapshot {
    pub distance_cm: Option<f32>,
    pub smoothed_distance_cm: Option<f32>,
    pub light_levels: Option<[f32; 4]>,
    pub lighting: Option<Lighting>,
    pub readings: u64,
    pub failures: u64,
}

struct SensorState {
    distances: VecDeque<f32>,
    light: [VecDeque<f32>; 4],
    snapshot: SensorSnapshot,
}

/// Sensor collaborator reading READ_SENSORS replies
pub struct ChannelSensor {
    channel: Channel,
    config: SensorConfig,
    state: Mutex<SensorState>,
}

fn mean(values: &VecDeque<f32>) -> Option<f32> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}

fn push_window(window: &mut VecDeque<f32>, value: f32, size: usize) {
    window.push_back(value);
    while window.len() > size.max(1) {
        window.pop_front();
    }
}

impl ChannelSensor {
    pub fn new(channel: Channel, config: SensorConfig) -> Self {
        Self {
            channel,
            config,
            state: Mutex::new(SensorState {
                distances: VecDeque::new(),
                light: Default::default(),
                snapshot: SensorSnapshot::default(),
            }),
        }
    }

    /// Probe the sensors once; fails if no distance comes back
    pub async fn initialize(&self) -> Result<(), SensorError> {
        match self.read_distance().await? {
            Some(distance) => {
                info!("Sensors online, distance {:.1}cm", distance);
                Ok(())
            }
            None => Err(SensorError::NoReading),
        }
    }

    fn plausible(&self, distance: f32) -> bool {
        distance.is_finite() && distance >= 0.0 && distance <= self.config.max_distance
    }

    fn classify(&self, light: &[f32; 4]) -> Lighting {
        let avg = light.iter().sum::<f32>() / light.len() as f32;
        if avg < self.config.light_dark {
            Lighting::Dark
        } else if avg > self.config.light_bright {
            Lighting::Bright
        } else {
            Lighting::Normal
        }
    }

    /// One READ_SENSORS round trip; `None` if the reply is missing or garbled
    async fn poll(&self) -> Result<Option<SensorPayload>, SensorError> {
        let result = self
            .channel
            .execute(Command::request(READ_SENSORS, self.config.read_timeout()))
            .await?;

        let Some(line) = result.response else {
            warn!("No sensor reply within {:?}", self.config.read_timeout());
            return Ok(None);
        };
        let Some(json) = payload_after(&line, SENSORS_PREFIX) else {
            warn!("Unexpected sensor reply: {}", line);
            return Ok(None);
        };
        match serde_json::from_str::<SensorPayload>(json) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) => {
                warn!("Malformed sensor payload '{}': {}", json, e);
                Ok(None)
            }
        }
    }

    fn record(&self, payload: Option<SensorPayload>) -> Option<f32> {
        let mut state = self.state.lock();
        let window = self.config.smoothing_window;

        let distance = payload
            .as_ref()
            .and_then(|p| p.distance)
            .filter(|&d| self.plausible(d));

        match distance {
            Some(d) => {
                push_window(&mut state.distances, d, window);
                state.snapshot.readings += 1;
                debug!("Distance {:.1}cm", d);
            }
            None => state.snapshot.failures += 1,
        }
        state.snapshot.distance_cm = distance;
        state.snapshot.smoothed_distance_cm = mean(&state.distances);

        let light = payload
            .as_ref()
            .and_then(|p| <[f32; 4]>::try_from(p.light.as_slice()).ok());
        if let Some(light) = light {
            for (buffer, value) in state.light.iter_mut().zip(light) {
                push_window(buffer, value, window);
            }
            let mut smoothed = [0.0; 4];
            for (slot, buffer) in smoothed.iter_mut().zip(state.light.iter()) {
                *slot = mean(buffer).unwrap_or_default();
            }
            state.snapshot.light_levels = Some(smoothed);
            state.snapshot.lighting = Some(self.classify(&smoothed));
        }

        distance
    }

    /// Smoothed light levels from the latest reading
    pub async fn read_light(&self) -> Result<Option<[f32; 4]>, SensorError> {
        let payload = self.poll().await?;
        self.record(payload);
        Ok(self.state.lock().snapshot.light_levels)
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        self.state.lock().snapshot.clone()
    }
}

#[async_trait]
impl DistanceSource for ChannelSensor {
    async fn read_distance(&self) -> Result<Option<f32>, SensorError> {
        let payload = self.poll().await?;
        Ok(self.record(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{SimHandle, SimulatedDevice, test_settings};

    async fn sensor() -> (ChannelSensor, SimHandle) {
        let device = SimulatedDevice::new();
        let handle = device.handle();
        let channel = Channel::open_simulated(device, test_settings()).await.unwrap();
        (ChannelSensor::new(channel, SensorConfig::default()), handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_raw_distance() {
        let (sensor, handle) = sensor().await;
        assert_eq!(sensor.read_distance().await.unwrap(), Some(150.0));

        handle.set_distance(Some(5.0));
        // Raw, not averaged with the earlier 150
        assert_eq!(sensor.read_distance().await.unwrap(), Some(5.0));

        let snapshot = sensor.snapshot();
        assert_eq!(snapshot.smoothed_distance_cm, Some(77.5));
        assert_eq!(snapshot.readings, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_distance_is_no_reading() {
        let (sensor, handle) = sensor().await;
        handle.set_distance(None);
        assert_eq!(sensor.read_distance().await.unwrap(), None);
        assert!(matches!(
            sensor.initialize().await,
            Err(SensorError::NoReading)
        ));
        assert_eq!(sensor.snapshot().failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_implausible_distance_is_dropped() {
        let (sensor, handle) = sensor().await;
        handle.set_distance(Some(900.0));
        assert_eq!(sensor.read_distance().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbled_reply_is_no_reading() {
        let (sensor, handle) = sensor().await;
        handle.override_response("READ_SENSORS", "SENSORS:{\"distance\":");
        assert_eq!(sensor.read_distance().await.unwrap(), None);

        handle.mute("READ_SENSORS");
        assert_eq!(sensor.read_distance().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_light_levels_and_classification() {
        let (sensor, handle) = sensor().await;
        handle.set_light([100.0, 120.0, 90.0, 110.0]);

        let light = sensor.read_light().await.unwrap().unwrap();

        assert_eq!(light, [100.0, 120.0, 90.0, 110.0]);
        assert_eq!(sensor.snapshot().lighting, Some(Lighting::Dark));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_is_an_error() {
        let (sensor, _handle) = sensor().await;
        sensor.channel.close().await;
        assert!(matches!(
            sensor.read_distance().await,
            Err(SensorError::Channel(ChannelError::Closed))
        ));
    }
}
