//! HTTP surface of the gateway: the MJPEG stream, command endpoints for the
//! vehicle and turret, and small plain-text queries used by the control UI.

pub mod config;
pub mod handlers;
pub mod router;
pub mod stream;

pub use config::WebConfig;
pub use router::create_app;

use crate::capture::CaptureStats;
use crate::config::GatewayConfig;
use crate::control::{MockActuators, SharedActuators};
use crate::error::{GatewayError, Result};
use crate::frame::FrameSlot;
use crate::gateway::Lifecycle;
use crate::serial::SerialChannel;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared state handed to every handler.
///
/// Built detached (empty slot, no serial link, no GPIO) and filled in with
/// the `with_*` builders.
#[derive(Clone, Debug)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub slot: Arc<FrameSlot>,
    pub serial: Arc<SerialChannel>,
    pub actuators: SharedActuators,
    pub stats: Arc<CaptureStats>,
    pub lifecycle: Arc<Lifecycle>,
}

impl AppState {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self {
            config,
            slot: Arc::new(FrameSlot::new()),
            serial: Arc::new(SerialChannel::disconnected()),
            actuators: SharedActuators::new(Box::new(MockActuators::unavailable())),
            stats: Arc::new(CaptureStats::new()),
            lifecycle: Arc::new(Lifecycle::new()),
        }
    }

    pub fn with_slot(mut self, slot: Arc<FrameSlot>) -> Self {
        self.slot = slot;
        self
    }

    pub fn with_serial(mut self, serial: Arc<SerialChannel>) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_actuators(mut self, actuators: SharedActuators) -> Self {
        self.actuators = actuators;
        self
    }

    pub fn with_stats(mut self, stats: Arc<CaptureStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<Lifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

/// Serve the gateway routes on `listener` until `shutdown` resolves and
/// every open connection has finished.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .map_err(|e| GatewayError::web_server_error(format!("Listener has no address: {}", e)))?;

    info!("Starting turret gateway on http://{}", addr);
    info!("Video stream: http://{}/stream.mjpg", addr);
    info!("Health endpoint: http://{}/api/health", addr);

    let app = create_app(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| GatewayError::web_server_error(format!("Server error: {}", e)))?;

    info!("Web server shut down gracefully");
    Ok(())
}
