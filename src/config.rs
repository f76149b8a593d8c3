//! Process configuration.
//!
//! Everything here is fixed at process start. The binary fills these structs
//! from command line flags; library users can build them directly with the
//! `with_*` helpers.

use crate::error::{GatewayError, Result};
use crate::web::WebConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default target frame rate.
pub const DEFAULT_FPS: u32 = 24;

/// Default JPEG quality (1-100).
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Default serial device for the microcontroller.
pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyACM0";

/// Default serial baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Camera capture and encoding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Index of the video device (`/dev/video<N>`)
    pub camera_index: u32,
    /// Target output width in pixels
    pub width: u32,
    /// Target output height in pixels
    pub height: u32,
    /// Target frame rate used for pacing
    pub fps: u32,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// Consecutive read failures tolerated before the device is reopened
    pub failure_threshold: u32,
    /// Pause between releasing the device and reopening it
    pub reopen_backoff_ms: u64,
    /// Pause after a failed read or a frame that could not be encoded
    pub error_backoff_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            camera_index: 0,
            width: 640,
            height: 480,
            fps: DEFAULT_FPS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            failure_threshold: 10,
            reopen_backoff_ms: 1_000,
            error_backoff_ms: 100,
        }
    }
}

impl CaptureSettings {
    /// Set the camera index.
    pub fn with_camera_index(mut self, index: u32) -> Self {
        self.camera_index = index;
        self
    }

    /// Set the target resolution.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target frame rate.
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Set the JPEG quality.
    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    /// Set the failure threshold and reopen backoff.
    pub fn with_recovery(mut self, failure_threshold: u32, reopen_backoff_ms: u64) -> Self {
        self.failure_threshold = failure_threshold;
        self.reopen_backoff_ms = reopen_backoff_ms;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff_ms: u64) -> Self {
        self.error_backoff_ms = error_backoff_ms;
        self
    }

    /// Time budget for one frame at the target rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    pub fn reopen_backoff(&self) -> Duration {
        Duration::from_millis(self.reopen_backoff_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

/// Serial link settings for the microcontroller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Device path; `None` runs the gateway without a microcontroller
    pub port: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout applied to the port
    pub read_timeout_ms: u64,
    /// Sleep between receive polls
    pub poll_interval_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: Some(DEFAULT_SERIAL_PORT.to_string()),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 100,
            poll_interval_ms: 10,
        }
    }
}

impl SerialSettings {
    /// Set the device path, or disable the link with `None`.
    pub fn with_port(mut self, port: Option<String>) -> Self {
        self.port = port;
        self
    }

    /// Set the baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// BCM pin numbers of the directly driven actuators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActuatorPins {
    /// On/off indicator LED
    pub led: u8,
    /// Blink LED, only ever switched off at shutdown
    pub blink_led: u8,
    /// Laser module
    pub laser: u8,
    /// Tilt servo signal
    pub tilt_servo: u8,
}

impl Default for ActuatorPins {
    fn default() -> Self {
        Self {
            led: 6,
            blink_led: 26,
            laser: 27,
            tilt_servo: 18,
        }
    }
}

/// Offset from UTC of the vehicle's home time zone.
pub const DEFAULT_UTC_OFFSET_HOURS: i32 = 7;

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub web: WebConfig,
    pub capture: CaptureSettings,
    pub serial: SerialSettings,
    pub actuators: ActuatorPins,
    /// Offset from UTC used by `/get_time`
    pub utc_offset_hours: i32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new(
            WebConfig::default(),
            CaptureSettings::default(),
            SerialSettings::default(),
        )
    }
}

impl GatewayConfig {
    /// Build a configuration from its parts with the default clock offset.
    pub fn new(web: WebConfig, capture: CaptureSettings, serial: SerialSettings) -> Self {
        Self {
            web,
            capture,
            serial,
            actuators: ActuatorPins::default(),
            utc_offset_hours: DEFAULT_UTC_OFFSET_HOURS,
        }
    }

    /// Set the clock offset used by `/get_time`.
    pub fn with_utc_offset_hours(mut self, hours: i32) -> Self {
        self.utc_offset_hours = hours;
        self
    }

    /// Set the actuator pin assignment.
    pub fn with_actuator_pins(mut self, pins: ActuatorPins) -> Self {
        self.actuators = pins;
        self
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return Err(GatewayError::config_error(format!(
                "Resolution must be non-zero, got {}x{}",
                capture.width, capture.height
            )));
        }
        if capture.fps == 0 {
            return Err(GatewayError::config_error("Frame rate must be positive"));
        }
        if !(1..=100).contains(&capture.jpeg_quality) {
            return Err(GatewayError::config_error(format!(
                "JPEG quality must be within 1..=100, got {}",
                capture.jpeg_quality
            )));
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(GatewayError::config_error(format!(
                "UTC offset out of range: {}",
                self.utc_offset_hours
            )));
        }
        self.web
            .bind_address()
            .parse::<SocketAddr>()
            .map_err(|e| GatewayError::config_error(format!("Invalid bind address: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment() {
        let config = GatewayConfig::new(
            WebConfig::default(),
            CaptureSettings::default(),
            SerialSettings::default(),
        );
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.capture.width, 640);
        assert_eq!(config.capture.height, 480);
        assert_eq!(config.capture.fps, 24);
        assert_eq!(config.capture.jpeg_quality, 80);
        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.utc_offset_hours, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_agrees_with_new() {
        let config = GatewayConfig::default();
        assert_eq!(config.utc_offset_hours, DEFAULT_UTC_OFFSET_HOURS);
        assert_eq!(config.web.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.actuators.tilt_servo, 18);
    }

    #[test]
    fn test_frame_interval() {
        let settings = CaptureSettings::default().with_fps(25);
        assert_eq!(settings.frame_interval(), Duration::from_millis(40));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GatewayConfig::default();
        config.capture = CaptureSettings::default().with_fps(0);
        assert!(config.validate().is_err());

        config.capture = CaptureSettings::default().with_resolution(0, 480);
        assert!(config.validate().is_err());

        config.capture = CaptureSettings::default().with_jpeg_quality(0);
        assert!(config.validate().is_err());

        config.capture = CaptureSettings::default();
        config.web = WebConfig::new("not an address", 8080);
        assert!(config.validate().is_err());

        config.web = WebConfig::new("::", 8080);
        assert!(config.validate().is_ok());
    }
}
