//! Process lifecycle: start the device loops, serve HTTP, drain on signal.
//!
//! States only move forward: `Starting -> Running -> Draining -> Stopped`.
//! A serial port that cannot be opened degrades the gateway to video only;
//! a camera that cannot be opened aborts startup.

use crate::capture::{CameraOpener, CaptureLoop, CaptureStats};
use crate::config::GatewayConfig;
use crate::control::{default_actuators, Actuators, SharedActuators};
use crate::error::{GatewayError, Result};
use crate::frame::FrameSlot;
use crate::serial::{SerialChannel, SerialError, STOP_COMMAND};
use crate::web::{self, AppState};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the gateway is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, forward-only lifecycle state.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` if it lies ahead of the current state.
    ///
    /// Returns `true` when this call performed the transition.
    pub fn advance(&self, next: LifecycleState) -> bool {
        let previous = self.state.fetch_max(next as u8, Ordering::AcqRel);
        previous < next as u8
    }

    /// Whether actuator commands are still accepted.
    pub fn accepts_motion(&self) -> bool {
        self.state() < LifecycleState::Draining
    }
}

/// Everything shutdown has to touch, detached from the gateway itself so it
/// can run inside the HTTP server's shutdown future.
#[derive(Clone)]
pub struct ShutdownHandle {
    lifecycle: Arc<Lifecycle>,
    cancel: CancellationToken,
    serial: Arc<SerialChannel>,
    actuators: SharedActuators,
    slot: Arc<FrameSlot>,
}

impl ShutdownHandle {
    /// Stop the vehicle, switch off the outputs, close the serial port and
    /// end every open stream. Only the first call has any effect.
    pub fn drain(&self) {
        if !self.lifecycle.advance(LifecycleState::Draining) {
            return;
        }
        info!("Draining gateway");

        self.cancel.cancel();

        match self.serial.send(STOP_COMMAND) {
            Ok(()) => info!("Stop directive sent"),
            Err(SerialError::NotConnected) => debug!("No serial link, stop directive skipped"),
            Err(err) => warn!("Failed to send stop directive: {}", err),
        }

        {
            let mut actuators = self.actuators.lock();
            if actuators.is_available() {
                if let Err(err) = actuators.all_off() {
                    warn!("Failed to switch outputs off: {}", err);
                }
            }
        }

        self.serial.close();
        self.slot.close();
    }

    /// [`drain`](Self::drain) on the blocking pool, since the stop directive
    /// is a blocking serial write.
    pub async fn drain_blocking(&self) {
        let handle = self.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || handle.drain()).await {
            warn!("Drain task failed: {}", err);
        }
    }
}

/// Starts one device thread under the given cancellation token.
type Spawner<'a> = Box<dyn FnOnce(CancellationToken) -> Result<Option<JoinHandle<()>>> + 'a>;

/// Spawn the device threads in order. If one fails, the threads already
/// running are cancelled and joined before the error is returned.
fn spawn_workers(
    cancel: &CancellationToken,
    spawners: Vec<Spawner<'_>>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut workers = Vec::new();
    for spawn in spawners {
        match spawn(cancel.child_token()) {
            Ok(worker) => workers.extend(worker),
            Err(err) => {
                cancel.cancel();
                for worker in workers {
                    if worker.join().is_err() {
                        warn!("Device thread panicked during startup rollback");
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(workers)
}

/// A running gateway: capture thread, serial reader and the shared state
/// the HTTP surface reads from.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    slot: Arc<FrameSlot>,
    serial: Arc<SerialChannel>,
    actuators: SharedActuators,
    stats: Arc<CaptureStats>,
    lifecycle: Arc<Lifecycle>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Open the configured serial port and GPIO outputs, then start.
    pub fn launch<O: CameraOpener>(config: GatewayConfig, opener: O) -> Result<Self> {
        let serial = SerialChannel::open(&config.serial);
        let actuators = default_actuators(&config.actuators);
        Self::start(config, opener, serial, actuators)
    }

    /// Start the device loops with explicitly provided backends.
    ///
    /// Fails if the configuration is invalid or the camera cannot be opened.
    pub fn start<O: CameraOpener>(
        config: GatewayConfig,
        opener: O,
        serial: SerialChannel,
        actuators: Box<dyn Actuators>,
    ) -> Result<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let lifecycle = Arc::new(Lifecycle::new());
        let slot = Arc::new(FrameSlot::new());
        let stats = Arc::new(CaptureStats::new());
        let serial = Arc::new(serial);
        let actuators = SharedActuators::new(actuators);
        let cancel = CancellationToken::new();

        let mut capture = CaptureLoop::new(
            opener,
            config.capture.clone(),
            Arc::clone(&slot),
            Arc::clone(&stats),
        );
        let device = capture.open_device()?;

        let reader = Arc::clone(&serial);
        let poll_interval = config.serial.poll_interval();
        let spawners: Vec<Spawner<'_>> = vec![
            Box::new(move |token: CancellationToken| capture.spawn(device, token).map(Some)),
            Box::new(move |token: CancellationToken| {
                reader.spawn_receive_loop(poll_interval, token).map_err(|e| {
                    GatewayError::serial_error(format!("Failed to start reader: {}", e))
                })
            }),
        ];
        let workers = spawn_workers(&cancel, spawners)?;

        lifecycle.advance(LifecycleState::Running);
        info!(
            serial = serial.is_connected(),
            gpio = actuators.is_available(),
            "Gateway running"
        );

        Ok(Self {
            config,
            slot,
            serial,
            actuators,
            stats,
            lifecycle,
            cancel,
            workers,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn frame_slot(&self) -> &Arc<FrameSlot> {
        &self.slot
    }

    pub fn serial(&self) -> &Arc<SerialChannel> {
        &self.serial
    }

    pub fn stats(&self) -> &Arc<CaptureStats> {
        &self.stats
    }

    /// State handed to the HTTP handlers.
    pub fn app_state(&self) -> AppState {
        AppState::new(Arc::clone(&self.config))
            .with_slot(Arc::clone(&self.slot))
            .with_serial(Arc::clone(&self.serial))
            .with_actuators(self.actuators.clone())
            .with_stats(Arc::clone(&self.stats))
            .with_lifecycle(Arc::clone(&self.lifecycle))
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            lifecycle: Arc::clone(&self.lifecycle),
            cancel: self.cancel.clone(),
            serial: Arc::clone(&self.serial),
            actuators: self.actuators.clone(),
            slot: Arc::clone(&self.slot),
        }
    }

    /// Drain without serving; see [`ShutdownHandle::drain`].
    pub fn drain(&self) {
        self.shutdown_handle().drain();
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.web.bind_address();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            GatewayError::web_server_error(format!("Failed to bind to {}: {}", addr, e))
        })?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener, drain once `shutdown` resolves,
    /// then wait for the device threads to finish.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.shutdown_handle();
        let served = web::serve(listener, self.app_state(), async move {
            shutdown.await;
            handle.drain_blocking().await;
        })
        .await;

        // The server may also stop on its own error; drain is idempotent.
        self.shutdown_handle().drain_blocking().await;
        self.stop().await;
        served
    }

    /// Join the device threads and mark the gateway stopped.
    async fn stop(mut self) {
        let workers = std::mem::take(&mut self.workers);
        let joined = tokio::task::spawn_blocking(move || {
            for worker in workers {
                let name = worker.thread().name().unwrap_or("worker").to_string();
                if worker.join().is_err() {
                    warn!("{} thread panicked", name);
                }
            }
        })
        .await;
        if let Err(err) = joined {
            warn!("Failed to join device threads: {}", err);
        }
        self.lifecycle.advance(LifecycleState::Stopped);
        info!("Gateway stopped");
    }
}

/// Resolve on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TestPatternOpener;
    use crate::config::CaptureSettings;
    use crate::control::MockActuators;
    use crate::serial::MemoryLink;
    use std::time::Duration;

    fn small_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.capture = CaptureSettings::default()
            .with_resolution(32, 24)
            .with_fps(50);
        config
    }

    struct BrokenOpener;

    impl CameraOpener for BrokenOpener {
        type Device = <TestPatternOpener as CameraOpener>::Device;

        fn open(&mut self, _settings: &CaptureSettings) -> Result<Self::Device> {
            Err(GatewayError::camera_error("no camera"))
        }

        fn describe(&self, _settings: &CaptureSettings) -> String {
            "broken".to_string()
        }
    }

    #[test]
    fn test_lifecycle_only_moves_forward() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
        assert!(lifecycle.accepts_motion());

        assert!(lifecycle.advance(LifecycleState::Running));
        assert!(lifecycle.advance(LifecycleState::Draining));
        assert!(!lifecycle.advance(LifecycleState::Running));
        assert!(!lifecycle.advance(LifecycleState::Draining));
        assert_eq!(lifecycle.state(), LifecycleState::Draining);
        assert!(!lifecycle.accepts_motion());

        assert!(lifecycle.advance(LifecycleState::Stopped));
        assert_eq!(lifecycle.state().to_string(), "stopped");
    }

    #[test]
    fn test_camera_failure_is_fatal() {
        let result = Gateway::start(
            small_config(),
            BrokenOpener,
            SerialChannel::disconnected(),
            Box::new(MockActuators::unavailable()),
        );
        assert!(matches!(result, Err(GatewayError::Camera(_))));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = small_config();
        config.capture.fps = 0;
        let result = Gateway::start(
            config,
            TestPatternOpener,
            SerialChannel::disconnected(),
            Box::new(MockActuators::unavailable()),
        );
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_without_serial_and_drain() {
        let gateway = Gateway::start(
            small_config(),
            TestPatternOpener,
            SerialChannel::disconnected(),
            Box::new(MockActuators::unavailable()),
        )
        .unwrap();
        assert_eq!(gateway.state(), LifecycleState::Running);

        let slot = Arc::clone(gateway.frame_slot());
        let first = tokio::time::timeout(Duration::from_secs(5), slot.wait_for_next(0))
            .await
            .unwrap();
        assert!(first.is_some());

        gateway.drain();
        assert_eq!(gateway.state(), LifecycleState::Draining);
        assert!(slot.is_closed());
        assert!(slot.wait_for_next(0).await.is_none());

        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_drain_stops_vehicle_and_outputs() {
        let link = MemoryLink::new();
        let probe = link.clone();
        let gateway = Gateway::start(
            small_config(),
            TestPatternOpener,
            SerialChannel::new(Some(Box::new(link))),
            Box::new(MockActuators::simulated()),
        )
        .unwrap();

        {
            let mut actuators = gateway.actuators.lock();
            actuators.set_laser(true).unwrap();
            actuators.set_led(true).unwrap();
        }

        gateway.drain();
        gateway.drain();

        assert_eq!(probe.written_lines(), vec!["X"]);
        assert!(!gateway.serial().is_connected());
        let status = gateway.actuators.status();
        assert!(!status.laser_on);
        assert!(!status.led_on);

        gateway.stop().await;
    }

    #[test]
    fn test_failed_spawn_cancels_running_workers() {
        let cancel = CancellationToken::new();
        let exited = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&exited);

        let spawners: Vec<Spawner<'_>> = vec![
            Box::new(move |token: CancellationToken| {
                let worker = std::thread::spawn(move || {
                    while !token.is_cancelled() {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    flag.store(true, Ordering::SeqCst);
                });
                Ok(Some(worker))
            }),
            Box::new(|_: CancellationToken| -> Result<Option<JoinHandle<()>>> {
                Err(GatewayError::serial_error("reader thread refused"))
            }),
        ];
        let result = spawn_workers(&cancel, spawners);

        assert!(matches!(result, Err(GatewayError::Serial(_))));
        assert!(cancel.is_cancelled());
        assert!(exited.load(Ordering::SeqCst));
    }

    /// Link whose writes take a while, like a congested USB serial adapter.
    struct SlowLink {
        inner: MemoryLink,
        delay: Duration,
    }

    impl std::io::Read for SlowLink {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            std::io::Read::read(&mut self.inner, buf)
        }
    }

    impl std::io::Write for SlowLink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            std::thread::sleep(self.delay);
            std::io::Write::write(&mut self.inner, buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            std::io::Write::flush(&mut self.inner)
        }
    }

    impl crate::serial::SerialLink for SlowLink {
        fn bytes_available(&mut self) -> std::io::Result<usize> {
            crate::serial::SerialLink::bytes_available(&mut self.inner)
        }
    }

    #[tokio::test]
    async fn test_drain_does_not_block_the_runtime() {
        let link = MemoryLink::new();
        let probe = link.clone();
        let gateway = Gateway::start(
            small_config(),
            TestPatternOpener,
            SerialChannel::new(Some(Box::new(SlowLink {
                inner: link,
                delay: Duration::from_millis(300),
            }))),
            Box::new(MockActuators::unavailable()),
        )
        .unwrap();
        let handle = gateway.shutdown_handle();

        // Single-threaded runtime: the ticker only advances if drain yields.
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        handle.drain_blocking().await;
        ticker.abort();

        assert!(ticks.load(Ordering::SeqCst) >= 5);
        assert_eq!(probe.written_lines(), vec!["X"]);
        assert_eq!(gateway.state(), LifecycleState::Draining);

        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_serve_drains_on_shutdown() {
        let gateway = Gateway::start(
            small_config(),
            TestPatternOpener,
            SerialChannel::disconnected(),
            Box::new(MockActuators::unavailable()),
        )
        .unwrap();
        let slot = Arc::clone(gateway.frame_slot());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(gateway.serve(listener, async move {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(slot.is_closed());
    }
}
