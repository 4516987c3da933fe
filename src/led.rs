// LED matrix expressions over the shared device channel
//
// Expression labels from the behavior layer map onto the firmware's
// LED_PATTERN indices. Timed expressions and animations run as their own
// task; at most one runs at a time, and it is cancelled and awaited before
// any new pattern is sent.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelError};
use crate::config::LedConfig;
use crate::messages::{ACK_LED_PATTERN, Command};

/// Patterns built into the firmware (LED_PATTERN:0..=10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LedExpression {
    Off = 0,
    Blink = 1,
    Pulse = 2,
    SlowPulse = 3,
    Happy = 4,
    Sad = 5,
    Curious = 6,
    Alert = 7,
    Focused = 8,
    Playful = 9,
    Resting = 10,
}

impl LedExpression {
    /// Map an expression label; unknown labels blink
    pub fn from_label(label: &str) -> Self {
        Self::lookup(label).unwrap_or(LedExpression::Blink)
    }

    fn lookup(label: &str) -> Option<Self> {
        let expression = match label.to_ascii_lowercase().as_str() {
            "off" => LedExpression::Off,
            "curious" => LedExpression::Curious,
            "cautious" | "alert" => LedExpression::Alert,
            "playful" => LedExpression::Playful,
            "focused" => LedExpression::Focused,
            "resting" => LedExpression::Resting,
            "happy" => LedExpression::Happy,
            "sad" => LedExpression::Sad,
            _ => return None,
        };
        Some(expression)
    }

    pub fn pattern(self) -> u8 {
        self as u8
    }
}

/// A fixed sequence of patterns, each held for its duration
#[derive(Debug, Clone, PartialEq)]
pub struct Animation {
    name: &'static str,
    frames: Vec<(LedExpression, Duration)>,
}

impl Animation {
    fn flashing(
        name: &'static str,
        expression: LedExpression,
        on: Duration,
        off: Duration,
        count: u32,
    ) -> Self {
        let frames = (0..count)
            .flat_map(|_| [(expression, on), (LedExpression::Off, off)])
            .collect();
        Self { name, frames }
    }

    /// Blink `count` times, dark for half an interval in between
    pub fn blink(count: u32, interval: Duration) -> Self {
        Self::flashing("blink", LedExpression::Blink, interval, interval / 2, count)
    }

    /// Flash an expression label for emphasis; unknown labels pulse
    pub fn pulse(label: &str, pulses: u32, interval: Duration) -> Self {
        let expression = LedExpression::lookup(label).unwrap_or(LedExpression::Pulse);
        Self::flashing("pulse", expression, interval, interval.mul_f32(0.3), pulses)
    }

    pub fn attention() -> Self {
        Self::flashing(
            "attention",
            LedExpression::Alert,
            Duration::from_millis(300),
            Duration::from_millis(200),
            6,
        )
    }

    /// Fast Alert strobe for an emergency stop
    pub fn emergency() -> Self {
        Self::flashing(
            "emergency",
            LedExpression::Alert,
            Duration::from_millis(100),
            Duration::from_millis(100),
            10,
        )
    }

    pub fn celebration() -> Self {
        let hold = Duration::from_millis(800);
        let mut frames = vec![
            (LedExpression::Happy, hold),
            (LedExpression::Pulse, hold),
            (LedExpression::Blink, hold),
        ];
        frames.extend(
            Self::flashing(
                "celebration",
                LedExpression::Blink,
                Duration::from_millis(200),
                Duration::from_millis(100),
                5,
            )
            .frames,
        );
        Self {
            name: "celebration",
            frames,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn frames(&self) -> &[(LedExpression, Duration)] {
        &self.frames
    }

    pub fn duration(&self) -> Duration {
        self.frames.iter().map(|(_, hold)| *hold).sum()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Device rejected LED pattern {pattern}: {response:?}")]
    Rejected {
        pattern: u8,
        response: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct LedStatus {
    pub current: LedExpression,
    pub animating: bool,
    pub brightness: u8,
}

struct LedShared {
    channel: Channel,
    timeout: Duration,
    current: Mutex<LedExpression>,
}

impl LedShared {
    async fn send(&self, expression: LedExpression) -> Result<bool, LedError> {
        let result = self
            .channel
            .execute(Command::led_pattern(expression.pattern(), self.timeout))
            .await?;
        if result.acknowledged(ACK_LED_PATTERN) {
            *self.current.lock() = expression;
            debug!("LED expression set to {:?}", expression);
            Ok(true)
        } else {
            warn!(
                "LED_PATTERN:{} not acknowledged: {:?}",
                expression.pattern(),
                result.response
            );
            Ok(false)
        }
    }
}

pub struct LedController {
    shared: Arc<LedShared>,
    animation: Mutex<Option<JoinHandle<()>>>,
    brightness: u8,
}

impl LedController {
    pub fn new(channel: Channel, config: &LedConfig) -> Self {
        Self {
            shared: Arc::new(LedShared {
                channel,
                timeout: config.command_timeout(),
                current: Mutex::new(LedExpression::Off),
            }),
            animation: Mutex::new(None),
            brightness: config.brightness,
        }
    }

    /// Blank the matrix; fails if the device does not acknowledge
    pub async fn initialize(&self) -> Result<(), LedError> {
        if self.set(LedExpression::Off).await? {
            info!("LED controller initialized");
            Ok(())
        } else {
            Err(LedError::Rejected {
                pattern: LedExpression::Off.pattern(),
                response: None,
            })
        }
    }

    /// Cancel the running animation and wait until it is gone
    pub async fn cancel_current(&self) {
        let animation = self.animation.lock().take();
        if let Some(animation) = animation {
            Self::finish(animation).await;
        }
    }

    async fn finish(animation: JoinHandle<()>) {
        animation.abort();
        match animation.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => debug!("LED animation cancelled"),
            Err(e) => warn!("LED animation failed: {}", e),
        }
    }

    /// Make `task` the running animation, retiring whatever raced in before it
    async fn install(&self, task: JoinHandle<()>) {
        let previous = self.animation.lock().replace(task);
        if let Some(previous) = previous {
            Self::finish(previous).await;
        }
    }

    /// Run an animation in the background, replacing the current one
    pub async fn play(&self, animation: Animation) {
        self.cancel_current().await;
        info!(
            "Playing LED animation '{}' ({:?})",
            animation.name,
            animation.duration()
        );
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            for (expression, hold) in animation.frames {
                if let Err(e) = shared.send(expression).await {
                    warn!("LED animation '{}' aborted: {}", animation.name, e);
                    return;
                }
                tokio::time::sleep(hold).await;
            }
            debug!("LED animation '{}' finished", animation.name);
        });
        self.install(task).await;
    }

    /// Show a pattern until the next call. Ok(false) if not acknowledged.
    pub async fn set(&self, expression: LedExpression) -> Result<bool, LedError> {
        self.cancel_current().await;
        self.shared.send(expression).await
    }

    /// Show the pattern for an expression label
    pub async fn set_expression(&self, label: &str) -> Result<bool, LedError> {
        let expression = LedExpression::from_label(label);
        info!("Showing expression '{}' as {:?}", label, expression);
        self.set(expression).await
    }

    /// Show an expression, reverting to Off after `duration` if given
    pub async fn show_expression(
        &self,
        label: &str,
        duration: Option<Duration>,
    ) -> Result<bool, LedError> {
        let shown = self.set_expression(label).await?;
        if let (true, Some(duration)) = (shown, duration) {
            let shared = self.shared.clone();
            let task = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if let Err(e) = shared.send(LedExpression::Off).await {
                    warn!("Failed to clear timed expression: {}", e);
                }
            });
            self.install(task).await;
        }
        Ok(shown)
    }

    pub fn current(&self) -> LedExpression {
        *self.shared.current.lock()
    }

    pub fn is_animating(&self) -> bool {
        self.animation
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn status(&self) -> LedStatus {
        LedStatus {
            current: self.current(),
            animating: self.is_animating(),
            brightness: self.brightness,
        }
    }

    /// Cancel animations and blank the matrix
    pub async fn shutdown(&self) {
        info!("Shutting down LED controller");
        match self.set(LedExpression::Off).await {
            Ok(true) => {}
            Ok(false) => warn!("LED Off not acknowledged on shutdown"),
            Err(e) => warn!("Failed to blank LEDs on shutdown: {}", e),
        }
    }
}
