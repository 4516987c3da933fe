// Serial command channel
//
// One worker task owns the transport. Callers hand it requests through a
// bounded mpsc queue and wait on a oneshot for the reply, so commands from
// motor, LED and sensor code are written strictly in arrival order and a
// reply is always read by the caller whose command produced it.

mod serial;
mod simulated;

pub use serial::SerialTransport;
pub use simulated::{SimHandle, SimulatedDevice};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SerialConfig;
use crate::messages::{Command, CommandResult, PING, PONG};

/// Error types for the device link
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device did not answer the handshake (got {response:?})")]
    Handshake { response: Option<String> },

    #[error("Channel is closed")]
    Closed,

    #[error("Command cancelled before it was sent")]
    Cancelled,

    #[error("Device link lost")]
    Disconnected,
}

/// Line-level access to a device. Implementations are driven by exactly one
/// worker task and never see concurrent calls.
#[async_trait]
pub trait Transport: Send {
    /// Write one line; the newline terminator is added by the transport
    async fn write_line(&mut self, line: &str) -> Result<(), ChannelError>;

    /// Wait up to `timeout` for the next non-empty inbound line
    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, ChannelError>;

    /// Drop any inbound bytes not yet read
    async fn discard_input(&mut self) -> Result<(), ChannelError>;

    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Timing used while bringing a channel up
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub boot_settle: Duration,
    pub handshake_timeout: Duration,
    pub queue_depth: usize,
}

impl From<&SerialConfig> for ChannelSettings {
    fn from(config: &SerialConfig) -> Self {
        Self {
            boot_settle: config.boot_settle(),
            handshake_timeout: config.handshake_timeout(),
            queue_depth: config.queue_depth,
        }
    }
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<CommandResult, ChannelError>>,
}

/// Cloneable handle to the single device link
#[derive(Clone)]
pub struct Channel {
    requests: mpsc::Sender<Request>,
    shutdown: Arc<watch::Sender<bool>>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    writes: Arc<AtomicU64>,
}

impl Channel {
    /// Open a serial port and bring the channel up
    pub async fn open_serial(
        port: &str,
        baud: u32,
        settings: ChannelSettings,
    ) -> Result<Self, ChannelError> {
        let transport = SerialTransport::open(port, baud)?;
        Self::open(Box::new(transport), settings).await
    }

    /// Bring the channel up against the simulated device
    pub async fn open_simulated(
        device: SimulatedDevice,
        settings: ChannelSettings,
    ) -> Result<Self, ChannelError> {
        Self::open(Box::new(device), settings).await
    }

    /// Wait for the device to boot, flush stale bytes and handshake.
    ///
    /// The channel is only returned once the device answered PING with PONG.
    pub async fn open(
        mut transport: Box<dyn Transport>,
        settings: ChannelSettings,
    ) -> Result<Self, ChannelError> {
        debug!("Waiting {:?} for device boot", settings.boot_settle);
        tokio::time::sleep(settings.boot_settle).await;
        transport.discard_input().await?;

        let channel = Self::spawn(transport, settings.queue_depth.max(1));

        let result = match channel
            .execute(Command::request(PING, settings.handshake_timeout))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };
        if !result.acknowledged(PONG) {
            warn!("Handshake failed, response: {:?}", result.response);
            channel.close().await;
            return Err(ChannelError::Handshake {
                response: result.response,
            });
        }

        info!("Device link established (PING/PONG in {:?})", result.elapsed);
        Ok(channel)
    }

    fn spawn(transport: Box<dyn Transport>, queue_depth: usize) -> Self {
        let (requests, rx) = mpsc::channel(queue_depth);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let writes = Arc::new(AtomicU64::new(0));

        let worker = tokio::spawn(serve(transport, rx, shutdown_rx, writes.clone()));

        Self {
            requests,
            shutdown: Arc::new(shutdown),
            worker: Arc::new(Mutex::new(Some(worker))),
            writes,
        }
    }

    /// Queue a command and wait for its outcome.
    ///
    /// A missing reply is reported as `response: None`; errors are reserved
    /// for a closed link or a failed write.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request { command, reply })
            .await
            .map_err(|_| ChannelError::Closed)?;

        rx.await.map_err(|_| ChannelError::Cancelled)?
    }

    /// Number of lines written to the device so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.requests.is_closed()
    }

    /// Cancel every queued caller, then release the device.
    ///
    /// A command already being written completes first.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Channel worker ended abnormally: {}", e);
            }
        }
    }
}

async fn serve(
    mut transport: Box<dyn Transport>,
    mut rx: mpsc::Receiver<Request>,
    mut shutdown: watch::Receiver<bool>,
    writes: Arc<AtomicU64>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            request = rx.recv() => match request {
                Some(request) => {
                    let outcome = round_trip(transport.as_mut(), &request.command, &writes).await;
                    // Caller may have stopped waiting; the command was still sent.
                    let _ = request.reply.send(outcome);
                }
                None => break,
            },
        }
    }

    rx.close();
    let mut cancelled = 0;
    while let Ok(request) = rx.try_recv() {
        let _ = request.reply.send(Err(ChannelError::Cancelled));
        cancelled += 1;
    }
    if cancelled > 0 {
        info!("Cancelled {} queued command(s) on close", cancelled);
    }

    if let Err(e) = transport.close().await {
        warn!("Error closing device link: {}", e);
    }
    info!("Device link closed");
}

async fn round_trip(
    transport: &mut dyn Transport,
    command: &Command,
    writes: &AtomicU64,
) -> Result<CommandResult, ChannelError> {
    let started = Instant::now();

    // A late reply to an earlier command must not be read as this one's ack
    transport.discard_input().await?;
    transport.write_line(&command.text).await?;
    writes.fetch_add(1, Ordering::SeqCst);
    debug!("-> {}", command.text);

    let response = if command.expects_response {
        let line = transport.read_line(command.timeout).await?;
        match &line {
            Some(line) => debug!("<- {}", line),
            None => debug!("<- (no response to {} within {:?})", command.text, command.timeout),
        }
        line
    } else {
        None
    };

    Ok(CommandResult {
        response,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
pub(crate) fn test_settings() -> ChannelSettings {
    ChannelSettings {
        boot_settle: Duration::from_millis(10),
        handshake_timeout: Duration::from_millis(500),
        queue_depth: 16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::STOP;

    #[tokio::test(start_paused = true)]
    async fn test_open_performs_handshake() {
        let device = SimulatedDevice::new();
        let handle = device.handle();

        let channel = Channel::open_simulated(device, test_settings()).await.unwrap();

        assert_eq!(handle.written(), vec!["PING".to_string()]);
        assert_eq!(channel.write_count(), 1);
        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_fails_without_pong() {
        let device = SimulatedDevice::new();
        let handle = device.handle();
        handle.mute(PING);

        let result = Channel::open_simulated(device, test_settings()).await;

        assert!(matches!(
            result,
            Err(ChannelError::Handshake { response: None })
        ));
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_none_and_channel_survives() {
        let device = SimulatedDevice::new();
        let handle = device.handle();
        let channel = Channel::open_simulated(device, test_settings()).await.unwrap();

        handle.mute(STOP);
        let result = channel
            .execute(Command::request(STOP, Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(result.timed_out());
        assert!(result.elapsed >= Duration::from_millis(200));

        handle.unmute(STOP);
        let result = channel.execute(Command::new(STOP)).await.unwrap();
        assert!(result.acknowledged("ACTION:STOP"));
        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_only_command_reads_nothing() {
        let device = SimulatedDevice::new();
        let channel = Channel::open_simulated(device, test_settings()).await.unwrap();

        let command = Command {
            text: STOP.to_string(),
            expects_response: false,
            timeout: Duration::from_secs(1),
        };
        let result = channel.execute(command).await.unwrap();
        assert!(result.response.is_none());
        assert!(result.elapsed < Duration::from_secs(1));

        // The unread ACTION:STOP is not taken as the next command's reply
        let result = channel
            .execute(Command::led_pattern(3, Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(result.acknowledged("ACTION:LED_PATTERN"));
        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_served_in_order() {
        let device = SimulatedDevice::new();
        let handle = device.handle();
        let channel = Channel::open_simulated(device, test_settings()).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..10u8 {
            let channel = channel.clone();
            tasks.push(tokio::spawn(async move {
                channel
                    .execute(Command::led_pattern(i, Duration::from_millis(100)))
                    .await
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            let result = task.await.unwrap().unwrap();
            assert_eq!(
                result.response.as_deref(),
                Some(format!("ACTION:LED_PATTERN:{}", i).as_str())
            );
        }

        let expected: Vec<String> = std::iter::once("PING".to_string())
            .chain((0..10).map(|i| format!("LED_PATTERN:{}", i)))
            .collect();
        assert_eq!(handle.written(), expected);
        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_queued_callers() {
        let device = SimulatedDevice::new();
        let handle = device.handle();
        let channel = Channel::open_simulated(device, test_settings()).await.unwrap();

        // First command blocks the worker until its timeout
        handle.mute(STOP);
        let slow = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .execute(Command::request(STOP, Duration::from_secs(1)))
                    .await
            })
        };
        tokio::task::yield_now().await;
        let queued = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.execute(Command::new(PING)).await })
        };
        tokio::task::yield_now().await;

        channel.close().await;

        assert!(slow.await.unwrap().unwrap().timed_out());
        assert!(matches!(
            queued.await.unwrap(),
            Err(ChannelError::Cancelled)
        ));
        assert!(matches!(
            channel.execute(Command::new(PING)).await,
            Err(ChannelError::Closed)
        ));
        assert!(handle.is_closed());
    }
}
