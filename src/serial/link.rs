//! Physical serial links.

use crate::config::SerialSettings;
use crate::error::{GatewayError, Result};
use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// A byte pipe to the microcontroller that can be polled without blocking.
pub trait SerialLink: Read + Write + Send {
    /// Number of bytes that can be read right now.
    fn bytes_available(&mut self) -> io::Result<usize>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        self.bytes_to_read()
            .map(|count| count as usize)
            .map_err(io::Error::from)
    }
}

/// Open the configured port as 8N1.
pub fn open_port(path: &str, settings: &SerialSettings) -> Result<Box<dyn SerialPort>> {
    serialport::new(path, settings.baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .timeout(settings.read_timeout())
        .open()
        .map_err(|e| GatewayError::serial_error(format!("Failed to open {}: {}", path, e)))
}

#[derive(Debug, Default)]
struct MemoryLinkState {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    fail_reads: bool,
    fail_writes: bool,
}

/// In-memory link for tests and hardware-free runs.
///
/// Clones share the same buffers, so a test can keep one handle to inject
/// input and inspect output while the channel owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryLink {
    state: Arc<Mutex<MemoryLinkState>>,
    max_write: Option<usize>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept at most `limit` bytes per `write` call.
    pub fn with_write_chunk(mut self, limit: usize) -> Self {
        self.max_write = Some(limit.max(1));
        self
    }

    /// Queue bytes as if the microcontroller had sent them.
    pub fn push_incoming(&self, bytes: &[u8]) {
        self.lock().incoming.extend(bytes);
    }

    /// Everything written to the link so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// Written bytes split into lines.
    pub fn written_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.written())
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryLinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Read for MemoryLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.fail_reads {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        let count = buf.len().min(state.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl Write for MemoryLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.max_write.map_or(buf.len(), |limit| buf.len().min(limit));
        {
            let mut state = self.lock();
            if state.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
            }
            state.written.extend_from_slice(&buf[..count]);
        }
        if self.max_write.is_some() {
            std::thread::yield_now();
        }
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for MemoryLink {
    fn bytes_available(&mut self) -> io::Result<usize> {
        let state = self.lock();
        if state.fail_reads {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        Ok(state.incoming.len())
    }
}
