//! The capture loop: camera → encoder → frame slot.

use crate::capture::camera::{CameraDevice, CameraOpener};
use crate::capture::encode::FrameEncoder;
use crate::config::CaptureSettings;
use crate::error::{GatewayError, Result};
use crate::frame::FrameSlot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest single sleep between cancellation checks.
const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(50);

/// Counters written by the capture loop and read by diagnostic handlers.
///
/// Readers may see slightly stale values; nothing here is used for control.
#[derive(Debug, Default)]
pub struct CaptureStats {
    latency_bits: AtomicU64,
    frames_published: AtomicU64,
    reopen_cycles: AtomicU64,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture + encode time of the most recent frame, in milliseconds.
    pub fn last_latency_ms(&self) -> f64 {
        f64::from_bits(self.latency_bits.load(Ordering::Relaxed))
    }

    pub fn frames_published(&self) -> u64 {
        self.frames_published.load(Ordering::Relaxed)
    }

    /// Number of times the device was released and reopened.
    pub fn reopen_cycles(&self) -> u64 {
        self.reopen_cycles.load(Ordering::Relaxed)
    }

    fn record_frame(&self, latency: Duration) -> u64 {
        let ms = latency.as_secs_f64() * 1000.0;
        self.latency_bits.store(ms.to_bits(), Ordering::Relaxed);
        self.frames_published.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_reopen(&self) {
        self.reopen_cycles.fetch_add(1, Ordering::Relaxed);
    }
}

/// Owns the camera and feeds the frame slot until cancelled.
pub struct CaptureLoop<O: CameraOpener> {
    opener: O,
    settings: CaptureSettings,
    encoder: FrameEncoder,
    slot: Arc<FrameSlot>,
    stats: Arc<CaptureStats>,
}

impl<O: CameraOpener> CaptureLoop<O> {
    pub fn new(
        opener: O,
        settings: CaptureSettings,
        slot: Arc<FrameSlot>,
        stats: Arc<CaptureStats>,
    ) -> Self {
        let encoder = FrameEncoder::new(settings.width, settings.height, settings.jpeg_quality);
        Self {
            opener,
            settings,
            encoder,
            slot,
            stats,
        }
    }

    /// Open the camera for the first time.
    ///
    /// Failure here is fatal to startup, unlike failures inside [`run`](Self::run).
    pub fn open_device(&mut self) -> Result<O::Device> {
        let device = self.opener.open(&self.settings)?;
        let (width, height) = device.resolution();
        info!(
            "Camera {} opened at {}x{}",
            self.opener.describe(&self.settings),
            width,
            height
        );
        Ok(device)
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self, device: O::Device, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("capture".into())
            .spawn(move || self.run(device, cancel))
            .map_err(|e| GatewayError::camera_error(format!("Failed to spawn capture thread: {}", e)))
    }

    /// Capture, encode and publish until `cancel` fires.
    ///
    /// Read failures are retried; more than `failure_threshold` in a row
    /// release the device and reopen it after a fixed backoff, forever.
    pub fn run(mut self, device: O::Device, cancel: CancellationToken) {
        let interval = self.settings.frame_interval();
        let mut device = Some(device);
        let mut consecutive_failures: u32 = 0;

        info!(
            "Capture loop started: {}x{} @ {} fps, quality {}",
            self.settings.width, self.settings.height, self.settings.fps, self.settings.jpeg_quality
        );

        while !cancel.is_cancelled() {
            let started = Instant::now();

            let Some(camera) = device.as_mut() else {
                if pause(self.settings.reopen_backoff(), &cancel) {
                    break;
                }
                device = self.reopen();
                continue;
            };

            let raw = match camera.read_frame() {
                Ok(raw) => raw,
                Err(err) => {
                    consecutive_failures += 1;
                    debug!("Camera read failed ({}): {}", consecutive_failures, err);
                    if consecutive_failures > self.settings.failure_threshold {
                        warn!(
                            "{} consecutive read failures, reopening camera",
                            consecutive_failures
                        );
                        // Release before the backoff so the driver can reset.
                        // Whichever reopen succeeds starts a fresh count.
                        device = None;
                        consecutive_failures = 0;
                        if pause(self.settings.reopen_backoff(), &cancel) {
                            break;
                        }
                        device = self.reopen();
                    } else if pause(self.settings.error_backoff(), &cancel) {
                        break;
                    }
                    continue;
                }
            };
            consecutive_failures = 0;

            let frame = match self.encoder.encode(raw) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("Dropping frame: {}", err);
                    if pause(self.settings.error_backoff(), &cancel) {
                        break;
                    }
                    continue;
                }
            };

            let latency = started.elapsed();
            let generation = self.slot.publish(frame);
            let published = self.stats.record_frame(latency);
            if published % 100 == 0 {
                info!(
                    "Streamed {} frames (generation {}), latency {:.2} ms",
                    published,
                    generation,
                    self.stats.last_latency_ms()
                );
            }

            if pause(interval.saturating_sub(started.elapsed()), &cancel) {
                break;
            }
        }

        info!(
            "Capture loop stopped after {} frames",
            self.stats.frames_published()
        );
    }

    fn reopen(&mut self) -> Option<O::Device> {
        self.stats.record_reopen();
        match self.opener.open(&self.settings) {
            Ok(device) => {
                info!(
                    "Camera {} reopened",
                    self.opener.describe(&self.settings)
                );
                Some(device)
            }
            Err(err) => {
                error!(
                    "Failed to reopen camera {}: {}",
                    self.opener.describe(&self.settings),
                    err
                );
                None
            }
        }
    }
}

/// Sleep for `duration` in short slices; returns `true` if cancelled meanwhile.
fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep((deadline - now).min(CANCEL_CHECK_SLICE));
    }
}
