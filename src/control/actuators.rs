//! Local GPIO actuators: indicator LEDs, the laser and the tilt servo.
//!
//! Hardware access is feature-gated so the gateway builds on hosts without
//! a Raspberry Pi. Without the `gpio` feature, or when the GPIO chip cannot
//! be opened, the actuators report themselves unavailable and every
//! operation fails with an actuator error.

use crate::control::command::TILT_RANGE_DEGREES;
use crate::config::ActuatorPins;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Servo frame period (50 Hz).
pub const SERVO_PERIOD: Duration = Duration::from_millis(20);

/// Pulse width for a centred servo, in microseconds.
const SERVO_CENTRE_US: f64 = 1500.0;

/// Pulse width change between centre and either end stop, in microseconds.
const SERVO_HALF_SPAN_US: f64 = 500.0;

/// Snapshot of the actuator outputs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActuatorStatus {
    /// Whether GPIO control is available
    pub available: bool,
    pub led_on: bool,
    pub laser_on: bool,
    /// Current tilt angle in degrees
    pub tilt_degrees: f64,
}

impl Default for ActuatorStatus {
    fn default() -> Self {
        Self {
            available: false,
            led_on: false,
            laser_on: false,
            tilt_degrees: 0.0,
        }
    }
}

/// Trait for the locally attached outputs.
pub trait Actuators: Send {
    /// Whether the outputs can be driven at all.
    fn is_available(&self) -> bool;

    /// Switch the on/off indicator LED.
    fn set_led(&mut self, on: bool) -> Result<()>;

    /// Switch the laser module.
    fn set_laser(&mut self, on: bool) -> Result<()>;

    /// Move the tilt servo. The angle is clamped to the servo range and the
    /// applied angle is returned.
    fn set_tilt(&mut self, degrees: f64) -> Result<f64>;

    /// Current tilt angle in degrees.
    fn tilt(&self) -> f64;

    /// Turn every output off. Used on shutdown.
    fn all_off(&mut self) -> Result<()>;

    /// Current output state.
    fn status(&self) -> ActuatorStatus;

    /// Move the tilt servo relative to its current angle.
    fn adjust_tilt(&mut self, delta: f64) -> Result<f64> {
        let target = self.tilt() + delta;
        self.set_tilt(target)
    }
}

/// Clamp a tilt request to the servo range.
pub fn clamp_tilt(degrees: f64) -> f64 {
    if degrees.is_nan() {
        return 0.0;
    }
    degrees.clamp(-TILT_RANGE_DEGREES, TILT_RANGE_DEGREES)
}

/// Servo pulse width for an angle, with ±90° mapping onto 1.0 to 2.0 ms.
pub fn servo_pulse_width(degrees: f64) -> Duration {
    let value = (degrees / 90.0).clamp(-1.0, 1.0);
    Duration::from_micros((SERVO_CENTRE_US + value * SERVO_HALF_SPAN_US).round() as u64)
}

#[cfg(feature = "gpio")]
mod raspberry_pi {
    use super::*;
    use rppal::gpio::{Gpio, OutputPin};

    /// Raspberry Pi outputs driven through rppal.
    pub struct RaspberryPiActuators {
        led: OutputPin,
        blink_led: OutputPin,
        laser: OutputPin,
        tilt_servo: OutputPin,
        tilt_degrees: f64,
    }

    impl RaspberryPiActuators {
        /// Claim the configured pins and centre the tilt servo.
        pub fn new(pins: &ActuatorPins) -> Result<Self> {
            let gpio = Gpio::new().map_err(|e| {
                GatewayError::actuator_error(format!("Failed to initialize GPIO: {}", e))
            })?;

            let output = |pin: u8| -> Result<OutputPin> {
                let mut pin = gpio
                    .get(pin)
                    .map_err(|e| {
                        GatewayError::actuator_error(format!("Failed to claim pin {}: {}", pin, e))
                    })?
                    .into_output();
                pin.set_low();
                Ok(pin)
            };

            let mut actuators = Self {
                led: output(pins.led)?,
                blink_led: output(pins.blink_led)?,
                laser: output(pins.laser)?,
                tilt_servo: output(pins.tilt_servo)?,
                tilt_degrees: 0.0,
            };
            actuators.set_tilt(0.0)?;
            Ok(actuators)
        }
    }

    fn drive(pin: &mut OutputPin, on: bool) {
        if on {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }

    impl Actuators for RaspberryPiActuators {
        fn is_available(&self) -> bool {
            true
        }

        fn set_led(&mut self, on: bool) -> Result<()> {
            drive(&mut self.led, on);
            Ok(())
        }

        fn set_laser(&mut self, on: bool) -> Result<()> {
            drive(&mut self.laser, on);
            Ok(())
        }

        fn set_tilt(&mut self, degrees: f64) -> Result<f64> {
            let degrees = clamp_tilt(degrees);
            self.tilt_servo
                .set_pwm(SERVO_PERIOD, servo_pulse_width(degrees))
                .map_err(|e| {
                    GatewayError::actuator_error(format!("Failed to drive tilt servo: {}", e))
                })?;
            self.tilt_degrees = degrees;
            Ok(degrees)
        }

        fn tilt(&self) -> f64 {
            self.tilt_degrees
        }

        fn all_off(&mut self) -> Result<()> {
            self.led.set_low();
            self.blink_led.set_low();
            self.laser.set_low();
            self.tilt_servo.clear_pwm().map_err(|e| {
                GatewayError::actuator_error(format!("Failed to release tilt servo: {}", e))
            })?;
            self.tilt_servo.set_low();
            Ok(())
        }

        fn status(&self) -> ActuatorStatus {
            ActuatorStatus {
                available: true,
                led_on: self.led.is_set_high(),
                laser_on: self.laser.is_set_high(),
                tilt_degrees: self.tilt_degrees,
            }
        }
    }
}

#[cfg(feature = "gpio")]
pub use raspberry_pi::RaspberryPiActuators;

/// Software stand-in for the GPIO outputs.
///
/// An unavailable mock rejects every operation; a simulated one keeps the
/// output state in memory so the web surface can be exercised off-device.
#[derive(Debug, Clone, Default)]
pub struct MockActuators {
    simulated: bool,
    status: ActuatorStatus,
    all_off_calls: usize,
}

impl MockActuators {
    /// Outputs that are not present on this system.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// In-memory outputs that accept every operation.
    pub fn simulated() -> Self {
        Self {
            simulated: true,
            status: ActuatorStatus {
                available: true,
                ..ActuatorStatus::default()
            },
            all_off_calls: 0,
        }
    }

    /// Number of times [`Actuators::all_off`] succeeded.
    pub fn all_off_calls(&self) -> usize {
        self.all_off_calls
    }

    fn ensure_available(&self) -> Result<()> {
        if self.simulated {
            Ok(())
        } else {
            Err(GatewayError::actuator_error(
                "GPIO control is not available on this system",
            ))
        }
    }
}

impl Actuators for MockActuators {
    fn is_available(&self) -> bool {
        self.simulated
    }

    fn set_led(&mut self, on: bool) -> Result<()> {
        self.ensure_available()?;
        self.status.led_on = on;
        Ok(())
    }

    fn set_laser(&mut self, on: bool) -> Result<()> {
        self.ensure_available()?;
        self.status.laser_on = on;
        Ok(())
    }

    fn set_tilt(&mut self, degrees: f64) -> Result<f64> {
        self.ensure_available()?;
        self.status.tilt_degrees = clamp_tilt(degrees);
        Ok(self.status.tilt_degrees)
    }

    fn tilt(&self) -> f64 {
        self.status.tilt_degrees
    }

    fn all_off(&mut self) -> Result<()> {
        self.ensure_available()?;
        self.status.led_on = false;
        self.status.laser_on = false;
        self.all_off_calls += 1;
        Ok(())
    }

    fn status(&self) -> ActuatorStatus {
        self.status
    }
}

/// Open the board outputs, falling back to unavailable ones on failure.
#[cfg(feature = "gpio")]
pub fn default_actuators(pins: &ActuatorPins) -> Box<dyn Actuators> {
    match RaspberryPiActuators::new(pins) {
        Ok(actuators) => {
            info!(
                led = pins.led,
                laser = pins.laser,
                tilt_servo = pins.tilt_servo,
                "GPIO actuators initialized"
            );
            Box::new(actuators)
        }
        Err(e) => {
            tracing::warn!("GPIO unavailable, actuator endpoints disabled: {}", e);
            Box::new(MockActuators::unavailable())
        }
    }
}

/// Open the board outputs, falling back to unavailable ones on failure.
#[cfg(not(feature = "gpio"))]
pub fn default_actuators(pins: &ActuatorPins) -> Box<dyn Actuators> {
    info!(
        led = pins.led,
        laser = pins.laser,
        "Built without GPIO support, actuator endpoints disabled"
    );
    Box::new(MockActuators::unavailable())
}
