//! Serial link to the vehicle microcontroller.
//!
//! Commands go out as newline-terminated ASCII; distance telemetry comes back
//! the same way and is kept as a last-value-wins reading.

pub mod channel;
pub mod link;

// Re-export commonly used items
pub use channel::{
    parse_telemetry, SerialChannel, SerialError, Telemetry, STOP_COMMAND, TELEMETRY_PREFIX,
    UNAVAILABLE,
};
pub use link::{open_port, MemoryLink, SerialLink};
