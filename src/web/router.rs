//! Web application router and middleware setup.

use crate::web::{handlers, stream, AppState};
use axum::{routing::get, Router};
use std::path::PathBuf;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{info, warn};

/// Build the gateway application with every route and middleware layer.
///
/// Paths that match no route fall through to the static UI directory when
/// one is configured, and answer 404 otherwise.
pub fn create_app(state: AppState) -> Router {
    let web = state.config.web.clone();

    let mut app = Router::new()
        .route("/", get(handlers::index_redirect))
        .route("/stream.mjpg", get(stream::mjpeg_stream))
        // Vehicle and turret
        .route("/tank_command", get(handlers::tank_command))
        .route("/set_mouse_pos", get(handlers::set_mouse_pos))
        .route("/turret_move", get(handlers::turret_move))
        .route("/gpio_on", get(handlers::gpio_on))
        .route("/gpio_off", get(handlers::gpio_off))
        .route("/laser_on", get(handlers::laser_on))
        .route("/laser_off", get(handlers::laser_off))
        // Queries
        .route("/get_distance", get(handlers::get_distance))
        .route("/get_latency", get(handlers::get_latency))
        .route("/get_time", get(handlers::get_time))
        .route("/api/health", get(handlers::health_check))
        .with_state(state);

    if let Some(static_path) = &web.static_path {
        let static_path = PathBuf::from(static_path);
        if static_path.is_dir() {
            info!("Serving static files from: {:?}", static_path);
            app = app.fallback_service(ServeDir::new(static_path));
        } else {
            warn!("Static path {:?} does not exist, UI will not be served", static_path);
        }
    }

    if web.enable_cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    app.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}
