//! Turret Gateway binary.
//!
//! Streams the vehicle camera and relays control commands to the
//! microcontroller until interrupted.

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use turret_gateway::config::{
    CaptureSettings, SerialSettings, DEFAULT_BAUD_RATE, DEFAULT_FPS, DEFAULT_JPEG_QUALITY,
    DEFAULT_SERIAL_PORT, DEFAULT_UTC_OFFSET_HOURS,
};
use turret_gateway::{
    shutdown_signal, Gateway, GatewayConfig, TestPatternOpener, WebConfig, DEFAULT_WEB_PORT,
};

#[derive(Parser, Debug)]
#[command(name = "turret_gateway")]
#[command(about = "MJPEG streaming and serial command gateway for a camera turret vehicle")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Web server bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Web server port
    #[arg(short, long, default_value_t = DEFAULT_WEB_PORT)]
    port: u16,

    /// Video device index (/dev/video<N>)
    #[arg(long, default_value_t = 0)]
    camera_index: u32,

    /// Stream width in pixels
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Stream height in pixels
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Target frame rate
    #[arg(long, default_value_t = DEFAULT_FPS)]
    fps: u32,

    /// JPEG quality (1-100)
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    jpeg_quality: u8,

    /// Serial device of the microcontroller
    #[arg(long, default_value = DEFAULT_SERIAL_PORT)]
    serial_port: String,

    /// Serial baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud_rate: u32,

    /// Run without a microcontroller
    #[arg(long)]
    no_serial: bool,

    /// Directory holding the control UI
    #[arg(long)]
    static_dir: Option<String>,

    /// Disable CORS headers
    #[arg(long)]
    no_cors: bool,

    /// Offset from UTC for /get_time
    #[arg(long, default_value_t = DEFAULT_UTC_OFFSET_HOURS, allow_negative_numbers = true)]
    utc_offset_hours: i32,

    /// Use a synthetic camera instead of a video device
    #[arg(long)]
    test_pattern: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn gateway_config(&self) -> GatewayConfig {
        let web = WebConfig::new(&self.host, self.port)
            .with_cors(!self.no_cors)
            .with_static_path(self.static_dir.clone());

        let capture = CaptureSettings::default()
            .with_camera_index(self.camera_index)
            .with_resolution(self.width, self.height)
            .with_fps(self.fps)
            .with_jpeg_quality(self.jpeg_quality);

        let serial = SerialSettings::default()
            .with_port((!self.no_serial).then(|| self.serial_port.clone()))
            .with_baud_rate(self.baud_rate);

        GatewayConfig::new(web, capture, serial).with_utc_offset_hours(self.utc_offset_hours)
    }

    fn log_level(&self) -> Level {
        if self.debug {
            Level::DEBUG
        } else if self.verbose {
            Level::INFO
        } else {
            Level::WARN
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;
    print_banner();

    let config = cli.gateway_config();
    config.validate().context("Invalid configuration")?;

    info!("Gateway configuration:");
    info!("  - Bind address: {}", config.web.bind_address());
    info!(
        "  - Camera: index {} at {}x{}, {} fps, quality {}",
        config.capture.camera_index,
        config.capture.width,
        config.capture.height,
        config.capture.fps,
        config.capture.jpeg_quality
    );
    match &config.serial.port {
        Some(port) => info!("  - Serial: {} @ {} baud", port, config.serial.baud_rate),
        None => info!("  - Serial: disabled"),
    }
    info!("  - CORS enabled: {}", config.web.enable_cors);

    let gateway = launch(&cli, config).context("Failed to start gateway")?;
    gateway
        .run(shutdown_signal())
        .await
        .context("Gateway terminated with an error")?;

    Ok(())
}

#[cfg(feature = "v4l")]
fn launch(cli: &Cli, config: GatewayConfig) -> turret_gateway::Result<Gateway> {
    if cli.test_pattern {
        Gateway::launch(config, TestPatternOpener)
    } else {
        Gateway::launch(config, turret_gateway::V4lCameraOpener)
    }
}

#[cfg(not(feature = "v4l"))]
fn launch(cli: &Cli, config: GatewayConfig) -> turret_gateway::Result<Gateway> {
    if !cli.test_pattern {
        tracing::warn!("Built without v4l support, using the test pattern camera");
    }
    Gateway::launch(config, TestPatternOpener)
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let filter = log_filter(cli.log_level(), std::env::var(EnvFilter::DEFAULT_ENV).ok());

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

/// `RUST_LOG` directives on top of the level picked by `--verbose`/`--debug`.
fn log_filter(level: Level, directives: Option<String>) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .parse_lossy(directives.unwrap_or_default())
}

fn print_banner() {
    println!("Turret Gateway");
    println!("   Version: {}", env!("CARGO_PKG_VERSION"));
    println!("   Stream at /stream.mjpg, stop with Ctrl+C");
    println!();
}
