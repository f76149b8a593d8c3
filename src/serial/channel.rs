//! Command/telemetry channel to the microcontroller.
//!
//! One guard serializes every syscall on the device: command writes from HTTP
//! handlers and the receive loop's poll-and-read never interleave at the byte
//! level. The guard is held for exactly one write or one read, never across a
//! sleep.

use crate::config::SerialSettings;
use crate::serial::link::{open_port, SerialLink};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Prefix of distance telemetry lines.
pub const TELEMETRY_PREFIX: &str = "Dist:";

/// Value reported when no valid distance is known.
pub const UNAVAILABLE: &str = "N/A";

/// Stop directive sent at startup and during shutdown.
pub const STOP_COMMAND: &str = "X";

/// Upper bound on a partial line kept between polls.
const MAX_PENDING_BYTES: usize = 1024;

/// Upper bound on one read call.
const READ_CHUNK: usize = 256;

/// Errors from the serial channel.
#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    /// The port was never opened, or has been closed
    #[error("serial link is not connected")]
    NotConnected,

    /// The device rejected a read or write
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One parsed telemetry line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Telemetry {
    /// Distance reading as sent by the microcontroller
    Distance(String),
    /// Sensor reported an error or sent garbage after the prefix
    Unavailable,
}

/// Parse one line from the microcontroller.
///
/// Returns `None` for lines that are not telemetry at all.
pub fn parse_telemetry(line: &str) -> Option<Telemetry> {
    let value = line.trim().strip_prefix(TELEMETRY_PREFIX)?.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("ERROR") || value.parse::<f64>().is_err() {
        return Some(Telemetry::Unavailable);
    }
    Some(Telemetry::Distance(value.to_string()))
}

struct LinkState {
    port: Box<dyn SerialLink>,
    pending: Vec<u8>,
}

/// Shared handle to the microcontroller link.
pub struct SerialChannel {
    link: Mutex<Option<LinkState>>,
    // Last-write-wins; readers accept a stale value.
    distance: RwLock<Option<String>>,
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel")
            .field("connected", &self.is_connected())
            .field("distance", &self.distance())
            .finish()
    }
}

impl SerialChannel {
    /// Wrap an already opened link, or `None` for a gateway without one.
    pub fn new(link: Option<Box<dyn SerialLink>>) -> Self {
        Self {
            link: Mutex::new(link.map(|port| LinkState {
                port,
                pending: Vec::new(),
            })),
            distance: RwLock::new(None),
        }
    }

    /// A channel with no device behind it.
    pub fn disconnected() -> Self {
        Self::new(None)
    }

    /// Open the configured port.
    ///
    /// Failure is not fatal: the channel comes back disconnected and the
    /// gateway keeps serving video.
    pub fn open(settings: &SerialSettings) -> Self {
        let Some(path) = settings.port.as_deref() else {
            info!("Serial link disabled");
            return Self::disconnected();
        };

        match open_port(path, settings) {
            Ok(port) => {
                info!("Opened serial port {} at {} baud", path, settings.baud_rate);
                let channel = Self::new(Some(Box::new(port)));
                // Start from a known-stopped vehicle.
                let _ = channel.send(STOP_COMMAND);
                channel
            }
            Err(err) => {
                warn!("{}; continuing without microcontroller control", err);
                Self::disconnected()
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock_link().is_some()
    }

    /// Write `line` followed by a newline as one critical section.
    ///
    /// Errors are logged here; callers that must not depend on the
    /// microcontroller are free to ignore the result.
    pub fn send(&self, line: &str) -> Result<(), SerialError> {
        let mut message = Vec::with_capacity(line.len() + 1);
        message.extend_from_slice(line.as_bytes());
        message.push(b'\n');

        let mut guard = self.lock_link();
        let Some(state) = guard.as_mut() else {
            warn!("Serial port not initialized, dropping command '{}'", line);
            return Err(SerialError::NotConnected);
        };

        match state.port.write_all(&message).and_then(|_| state.port.flush()) {
            Ok(()) => {
                debug!("UART: sent '{}'", line);
                Ok(())
            }
            Err(err) => {
                error!("UART error sending '{}': {}", line, err);
                Err(SerialError::Io(err))
            }
        }
    }

    /// Poll the device once and apply any complete telemetry lines.
    ///
    /// Returns the number of complete lines received.
    pub fn poll_once(&self) -> Result<usize, SerialError> {
        let lines = {
            let mut guard = self.lock_link();
            let state = guard.as_mut().ok_or(SerialError::NotConnected)?;
            if state.port.bytes_available()? == 0 {
                return Ok(0);
            }

            let mut buf = [0u8; READ_CHUNK];
            let read = match state.port.read(&mut buf) {
                Ok(read) => read,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    0
                }
                Err(err) => return Err(err.into()),
            };
            state.pending.extend_from_slice(&buf[..read]);
            take_lines(&mut state.pending)
        };

        for line in &lines {
            self.handle_line(line);
        }
        Ok(lines.len())
    }

    fn handle_line(&self, line: &str) {
        match parse_telemetry(line) {
            Some(Telemetry::Distance(value)) => {
                debug!("Distance received: {} cm", value);
                self.store_distance(Some(value));
            }
            Some(Telemetry::Unavailable) => {
                debug!("Distance unavailable: '{}'", line.trim());
                self.store_distance(None);
            }
            None => debug!("Ignoring serial line '{}'", line.trim()),
        }
    }

    /// Latest distance reading, or [`UNAVAILABLE`].
    pub fn distance(&self) -> String {
        let value = match self.distance.read() {
            Ok(value) => value.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        value.unwrap_or_else(|| UNAVAILABLE.to_string())
    }

    fn store_distance(&self, value: Option<String>) {
        match self.distance.write() {
            Ok(mut slot) => *slot = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    /// Start the receive loop on its own thread.
    ///
    /// Returns `None` when there is no device to read from.
    pub fn spawn_receive_loop(
        self: &Arc<Self>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> io::Result<Option<JoinHandle<()>>> {
        if !self.is_connected() {
            info!("Serial reader skipped: serial port not available");
            return Ok(None);
        }
        let channel = Arc::clone(self);
        thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || channel.run_receive_loop(poll_interval, cancel))
            .map(Some)
    }

    /// Poll for telemetry until cancelled, closed or the device fails.
    pub fn run_receive_loop(&self, poll_interval: Duration, cancel: CancellationToken) {
        info!("Serial telemetry reader started");
        while !cancel.is_cancelled() {
            match self.poll_once() {
                Ok(_) => {}
                Err(SerialError::NotConnected) => {
                    debug!("Serial link closed, reader exiting");
                    break;
                }
                Err(err) => {
                    error!("Serial reading error: {}", err);
                    self.store_distance(None);
                    break;
                }
            }
            thread::sleep(poll_interval);
        }
        info!("Serial telemetry reader stopped");
    }

    /// Flush and release the device. Later sends fail with `NotConnected`.
    pub fn close(&self) -> bool {
        let state = self.lock_link().take();
        match state {
            Some(mut state) => {
                if let Err(err) = state.port.flush() {
                    warn!("Failed to flush serial port on close: {}", err);
                }
                info!("Serial port closed");
                true
            }
            None => false,
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<LinkState>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Split complete lines off the front of `pending`.
fn take_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = pending.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(['\r', '\n']);
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    if pending.len() > MAX_PENDING_BYTES {
        warn!("Discarding {} bytes of unterminated serial input", pending.len());
        pending.clear();
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::link::MemoryLink;

    fn channel_with(link: &MemoryLink) -> SerialChannel {
        SerialChannel::new(Some(Box::new(link.clone())))
    }

    #[test]
    fn test_parse_telemetry() {
        assert_eq!(
            parse_telemetry("Dist:123"),
            Some(Telemetry::Distance("123".to_string()))
        );
        assert_eq!(
            parse_telemetry("Dist: 12.5\r"),
            Some(Telemetry::Distance("12.5".to_string()))
        );
        assert_eq!(parse_telemetry("Dist:ERROR"), Some(Telemetry::Unavailable));
        assert_eq!(parse_telemetry("Dist:"), Some(Telemetry::Unavailable));
        assert_eq!(parse_telemetry("Dist:abc"), Some(Telemetry::Unavailable));
        assert_eq!(parse_telemetry("garbage"), None);
        assert_eq!(parse_telemetry("FR:0;LR:0"), None);
    }

    #[test]
    fn test_telemetry_updates_distance() {
        let link = MemoryLink::new();
        let channel = channel_with(&link);
        assert_eq!(channel.distance(), UNAVAILABLE);

        link.push_incoming(b"Dist:123\n");
        assert_eq!(channel.poll_once().unwrap(), 1);
        assert_eq!(channel.distance(), "123");

        link.push_incoming(b"garbage\n");
        channel.poll_once().unwrap();
        assert_eq!(channel.distance(), "123");

        link.push_incoming(b"Dist:ERROR\n");
        channel.poll_once().unwrap();
        assert_eq!(channel.distance(), UNAVAILABLE);
    }

    #[test]
    fn test_partial_lines_survive_between_polls() {
        let link = MemoryLink::new();
        let channel = channel_with(&link);

        link.push_incoming(b"Dis");
        assert_eq!(channel.poll_once().unwrap(), 0);
        link.push_incoming(b"t:77\r\nDist:78");
        assert_eq!(channel.poll_once().unwrap(), 1);
        assert_eq!(channel.distance(), "77");

        link.push_incoming(b"\n");
        channel.poll_once().unwrap();
        assert_eq!(channel.distance(), "78");
    }

    #[test]
    fn test_send_appends_newline() {
        let link = MemoryLink::new();
        let channel = channel_with(&link);

        channel.send("P-3").unwrap();
        channel.send("FR:0;LR:0;UD:0;TLR:0;FC:0").unwrap();

        assert_eq!(link.written(), b"P-3\nFR:0;LR:0;UD:0;TLR:0;FC:0\n");
    }

    #[test]
    fn test_send_without_link_is_not_connected() {
        let channel = SerialChannel::disconnected();
        assert!(!channel.is_connected());
        assert!(matches!(channel.send("X"), Err(SerialError::NotConnected)));
    }

    #[test]
    fn test_send_write_failure_is_reported() {
        let link = MemoryLink::new();
        let channel = channel_with(&link);
        link.fail_writes(true);
        assert!(matches!(channel.send("W"), Err(SerialError::Io(_))));
    }

    #[test]
    fn test_concurrent_sends_do_not_interleave() {
        let link = MemoryLink::new().with_write_chunk(1);
        let channel = Arc::new(channel_with(&link));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let channel = channel.clone();
                thread::spawn(move || {
                    for j in 0..20 {
                        channel
                            .send(&format!("FR:{};LR:{};UD:0;TLR:0;FC:0", i, j))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let lines = link.written_lines();
        assert_eq!(lines.len(), 160);
        for line in &lines {
            let parts: Vec<&str> = line.split(';').collect();
            assert_eq!(parts.len(), 5, "interleaved line: {line}");
            assert!(parts[0].starts_with("FR:"));
            assert_eq!(parts[4], "FC:0");
        }
    }

    #[test]
    fn test_receive_loop_exits_on_read_error() {
        let link = MemoryLink::new();
        let channel = Arc::new(channel_with(&link));
        link.push_incoming(b"Dist:50\n");

        let handle = channel
            .spawn_receive_loop(Duration::from_millis(1), CancellationToken::new())
            .unwrap()
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while channel.distance() != "50" && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(channel.distance(), "50");

        link.fail_reads(true);
        handle.join().unwrap();
        assert_eq!(channel.distance(), UNAVAILABLE);
    }

    #[test]
    fn test_receive_loop_stops_on_cancel_and_close() {
        let link = MemoryLink::new();
        let channel = Arc::new(channel_with(&link));
        let cancel = CancellationToken::new();
        let handle = channel
            .spawn_receive_loop(Duration::from_millis(1), cancel.clone())
            .unwrap()
            .unwrap();

        cancel.cancel();
        handle.join().unwrap();

        assert!(channel.close());
        assert!(!channel.close());
        assert!(matches!(channel.send("X"), Err(SerialError::NotConnected)));
    }

    #[test]
    fn test_receive_loop_skipped_without_link() {
        let channel = Arc::new(SerialChannel::disconnected());
        let handle = channel
            .spawn_receive_loop(Duration::from_millis(1), CancellationToken::new())
            .unwrap();
        assert!(handle.is_none());
    }
}
