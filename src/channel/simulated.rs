// Simulated microcontroller
//
// Answers the same line protocol as the firmware with deterministic canned
// replies and no I/O, so everything above the channel runs unchanged without
// hardware. A `SimHandle` lets tests steer the device and inspect what was
// written to it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{ChannelError, Transport};
use crate::config::MAX_LED_PATTERN;

/// Distance reported until a test changes it (cm)
const DEFAULT_DISTANCE: f32 = 150.0;
const DEFAULT_LIGHT: [f32; 4] = [500.0, 480.0, 520.0, 490.0];
const FREE_MEMORY: u64 = 1500;

struct SimState {
    written: Vec<String>,
    distance: Option<f32>,
    light: [f32; 4],
    speed: u8,
    led_pattern: u8,
    muted: HashSet<String>,
    overrides: HashMap<String, String>,
    booted_at: Instant,
    closed: bool,
}

pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
    outbox: VecDeque<String>,
}

/// Test-side view of a simulated device
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                written: Vec::new(),
                distance: Some(DEFAULT_DISTANCE),
                light: DEFAULT_LIGHT,
                speed: 0,
                led_pattern: 0,
                muted: HashSet::new(),
                overrides: HashMap::new(),
                booted_at: Instant::now(),
                closed: false,
            })),
            outbox: VecDeque::new(),
        }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: self.state.clone(),
        }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Command name without its `:argument` part
fn command_name(line: &str) -> &str {
    line.split_once(':').map_or(line, |(name, _)| name)
}

impl SimState {
    fn respond(&mut self, line: &str) -> Option<String> {
        let name = command_name(line);
        if self.muted.contains(name) {
            return None;
        }
        if let Some(forced) = self.overrides.get(name) {
            return Some(forced.clone());
        }

        let reply = match name {
            "PING" => "PONG".to_string(),
            "MOVE_FORWARD" | "MOVE_BACKWARD" | "TURN_LEFT" | "TURN_RIGHT" => {
                format!("ACTION:{}:SPEED:{}", name, self.speed)
            }
            "STOP" => "ACTION:STOP".to_string(),
            "SET_SPEED" => match line.split_once(':').and_then(|(_, n)| n.parse::<u8>().ok()) {
                Some(speed) => {
                    self.speed = speed;
                    format!("ACTION:SPEED_SET:{}", speed)
                }
                None => "ERROR:INVALID_SPEED".to_string(),
            },
            "LED_PATTERN" => match line.split_once(':').and_then(|(_, n)| n.parse::<u8>().ok()) {
                Some(pattern) if pattern <= MAX_LED_PATTERN => {
                    self.led_pattern = pattern;
                    format!("ACTION:LED_PATTERN:{}", pattern)
                }
                _ => "ERROR:INVALID_PATTERN".to_string(),
            },
            "STATUS" => format!(
                "STATUS:{}",
                json!({
                    "speed": self.speed,
                    "uptime": self.booted_at.elapsed().as_millis() as u64,
                    "free_memory": FREE_MEMORY,
                })
            ),
            "READ_SENSORS" => format!(
                "SENSORS:{}",
                json!({
                    "distance": self.distance,
                    "light": self.light,
                })
            ),
            _ => "ERROR:UNKNOWN_COMMAND".to_string(),
        };
        Some(reply)
    }
}

#[async_trait]
impl Transport for SimulatedDevice {
    async fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        state.written.push(line.to_string());
        if let Some(reply) = state.respond(line) {
            self.outbox.push_back(reply);
        }
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, ChannelError> {
        match self.outbox.pop_front() {
            Some(line) => Ok(Some(line)),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn discard_input(&mut self) -> Result<(), ChannelError> {
        self.outbox.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

impl SimHandle {
    /// Every line written so far, in write order
    pub fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().written.len()
    }

    /// Distance reported by READ_SENSORS; `None` reports a null reading
    pub fn set_distance(&self, distance: Option<f32>) {
        self.state.lock().distance = distance;
    }

    pub fn set_light(&self, light: [f32; 4]) {
        self.state.lock().light = light;
    }

    /// Stop answering a command (by name, e.g. "STOP" or "SET_SPEED")
    pub fn mute(&self, command: &str) {
        self.state.lock().muted.insert(command.to_string());
    }

    pub fn unmute(&self, command: &str) {
        self.state.lock().muted.remove(command);
    }

    /// Answer a command with a fixed line instead of the canned reply
    pub fn override_response(&self, command: &str, response: &str) {
        self.state
            .lock()
            .overrides
            .insert(command.to_string(), response.to_string());
    }

    pub fn speed(&self) -> u8 {
        self.state.lock().speed
    }

    pub fn led_pattern(&self) -> u8 {
        self.state.lock().led_pattern
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
