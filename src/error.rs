//! Error handling for the turret gateway crate.

/// A specialized `Result` type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// The main error type for gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Camera could not be opened, configured or read
    #[error("Camera error: {0}")]
    Camera(String),

    /// Frame conversion or JPEG encoding failed
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Serial link operation failed
    #[error("Serial error: {0}")]
    Serial(String),

    /// Actuator (GPIO) operation failed
    #[error("Actuator error: {0}")]
    Actuator(String),

    /// Web server error
    #[error("Web server error: {0}")]
    WebServer(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Create a new camera error
    pub fn camera_error(msg: impl Into<String>) -> Self {
        Self::Camera(msg.into())
    }

    /// Create a new encoding error
    pub fn encoding_error(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    /// Create a new serial error
    pub fn serial_error(msg: impl Into<String>) -> Self {
        Self::Serial(msg.into())
    }

    /// Create a new actuator error
    pub fn actuator_error(msg: impl Into<String>) -> Self {
        Self::Actuator(msg.into())
    }

    /// Create a new web server error
    pub fn web_server_error(msg: impl Into<String>) -> Self {
        Self::WebServer(msg.into())
    }

    /// Create a new configuration error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::camera_error("device 0 busy");
        assert_eq!(err.to_string(), "Camera error: device 0 busy");

        let err = GatewayError::config_error("fps must be positive");
        assert_eq!(err.to_string(), "Configuration error: fps must be positive");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        let err: GatewayError = io.into();
        assert!(matches!(err, GatewayError::Io(_)));
    }
}
