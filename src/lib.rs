//! # Turret Gateway
//!
//! Network gateway for a camera-equipped tracked vehicle, running on a
//! single-board computer. It streams the camera as MJPEG over HTTP, relays
//! drive and turret commands to a microcontroller over a serial link, drives
//! a few local GPIO outputs (LEDs, laser, tilt servo) and exposes the
//! distance telemetry the microcontroller reports.
//!
//! ## Features
//!
//! - **Single-slot frame broadcast**: every viewer gets the newest frame,
//!   slow viewers skip frames, the producer never waits
//! - **Self-healing capture**: the camera is reopened after repeated read
//!   failures, indefinitely
//! - **Serialized serial link**: command writes and telemetry reads never
//!   interleave on the wire
//! - **Graceful drain**: on SIGINT/SIGTERM the vehicle is stopped, outputs
//!   are switched off and open streams end
//! - **Hardware optional**: `v4l` and `gpio` features; a synthetic camera
//!   and in-memory serial link are always available
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use turret_gateway::{Gateway, GatewayConfig, TestPatternOpener, shutdown_signal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::launch(GatewayConfig::default(), TestPatternOpener)?;
//!     gateway.run(shutdown_signal()).await?;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod serial;
pub mod web;

// Re-export public API
pub use capture::{CameraDevice, CameraOpener, CaptureLoop, CaptureStats, TestPatternOpener};
pub use config::{ActuatorPins, CaptureSettings, GatewayConfig, SerialSettings};
pub use control::{Actuators, Command, CommandError, DriveVector, MockActuators};
pub use error::{GatewayError, Result};
pub use frame::{Frame, FrameSlot};
pub use gateway::{shutdown_signal, Gateway, Lifecycle, LifecycleState, ShutdownHandle};
pub use serial::{SerialChannel, SerialError};
pub use web::{create_app, AppState, WebConfig};

#[cfg(feature = "v4l")]
pub use capture::V4lCameraOpener;

#[cfg(feature = "gpio")]
pub use control::RaspberryPiActuators;

/// The default web server port
pub const DEFAULT_WEB_PORT: u16 = 8080;
