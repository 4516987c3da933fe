// Serial port transport for the microcontroller link
//
// The serialport crate is blocking, so a reader thread turns inbound bytes
// into complete lines and hands them to the async side over an mpsc queue.
// Writes run on the blocking pool.

use async_trait::async_trait;
use parking_lot::Mutex;
use serialport::{ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ChannelError, Transport};

/// Poll interval of the blocking reader; bounds how long close() waits for it
const READ_POLL: Duration = Duration::from_millis(20);

/// Write timeout handed to the OS driver
const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

pub struct SerialTransport {
    port_name: String,
    writer: Arc<Mutex<Box<dyn SerialPort>>>,
    lines: mpsc::UnboundedReceiver<String>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// Open the port and start the line reader
    pub fn open(port_name: &str, baudrate: u32) -> Result<Self, ChannelError> {
        info!("Opening serial port {} at {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(READ_POLL)
            .open()?;
        let reader_port = port.try_clone()?;

        let (tx, lines) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let reader = {
            let running = running.clone();
            let name = port_name.to_string();
            std::thread::Builder::new()
                .name(format!("serial-reader-{}", name))
                .spawn(move || read_lines(reader_port, tx, running))?
        };

        Ok(Self {
            port_name: port_name.to_string(),
            writer: Arc::new(Mutex::new(port)),
            lines,
            running,
            reader: Some(reader),
        })
    }
}

/// Blocking loop: split inbound bytes on '\n' and forward trimmed lines
fn read_lines(
    mut port: Box<dyn SerialPort>,
    tx: mpsc::UnboundedSender<String>,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 256];
    let mut pending: Vec<u8> = Vec::with_capacity(256);

    while running.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(line).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("Serial read failed, stopping reader: {}", e);
                return;
            }
        }
    }
    debug!("Serial reader stopped");
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        let writer = self.writer.clone();
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');

        tokio::task::spawn_blocking(move || -> Result<(), ChannelError> {
            let mut port = writer.lock();
            port.set_timeout(WRITE_TIMEOUT)?;
            port.write_all(&bytes)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| ChannelError::Io(std::io::Error::other(e)))?
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, ChannelError> {
        match tokio::time::timeout(timeout, self.lines.recv()).await {
            Ok(Some(line)) => Ok(Some(line)),
            // Reader thread exited: the port is gone
            Ok(None) => Err(ChannelError::Disconnected),
            Err(_) => Ok(None),
        }
    }

    async fn discard_input(&mut self) -> Result<(), ChannelError> {
        self.writer.lock().clear(ClearBuffer::All)?;
        let mut dropped = 0;
        while let Ok(line) = self.lines.try_recv() {
            debug!("Discarding stale line: {}", line);
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Discarded {} stale line(s)", dropped);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.running.store(false, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            let _ = tokio::task::spawn_blocking(move || reader.join()).await;
        }
        info!("Serial port {} released", self.port_name);
        Ok(())
    }
}
