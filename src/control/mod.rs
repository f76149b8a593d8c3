//! Command parsing and the locally attached actuators.

pub mod actuators;
pub mod command;

pub use actuators::{default_actuators, Actuators, ActuatorStatus, MockActuators};
pub use command::{
    pan_steps_for_offset, tilt_for_offset, Command, CommandError, DriveVector, LegacyDirective,
    TurretDirection,
};

#[cfg(feature = "gpio")]
pub use actuators::RaspberryPiActuators;

use std::sync::{Arc, Mutex, MutexGuard};

/// Actuators shared between request handlers and shutdown.
#[derive(Clone)]
pub struct SharedActuators {
    inner: Arc<Mutex<Box<dyn Actuators>>>,
}

impl SharedActuators {
    pub fn new(actuators: Box<dyn Actuators>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(actuators)),
        }
    }

    /// Lock the outputs. A poisoned lock is recovered since the outputs hold
    /// no invariants a panicking holder could break.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Actuators>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_available(&self) -> bool {
        self.lock().is_available()
    }

    pub fn status(&self) -> ActuatorStatus {
        self.lock().status()
    }
}

impl std::fmt::Debug for SharedActuators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedActuators")
            .field("status", &self.status())
            .finish()
    }
}
