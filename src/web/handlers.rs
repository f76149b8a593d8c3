//! HTTP handlers for the command and query endpoints.

use crate::control::{
    pan_steps_for_offset, tilt_for_offset, Actuators, Command, CommandError, TurretDirection,
};
use crate::control::command::{TURRET_PAN_STEP, TURRET_TILT_STEP_DEGREES};
use crate::serial::{SerialChannel, SerialError};
use crate::web::AppState;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{FixedOffset, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

/// Request failures, each mapped to one status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        ApiError::BadRequest(format!("Invalid command: {}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{} {}", status.as_u16(), self);
        } else {
            debug!("{} {}", status.as_u16(), self);
        }
        (status, self.to_string()).into_response()
    }
}

type ApiResult<T = StatusCode> = std::result::Result<T, ApiError>;

fn ensure_accepting_motion(state: &AppState) -> ApiResult<()> {
    if state.lifecycle.accepts_motion() {
        Ok(())
    } else {
        Err(ApiError::Unavailable("Gateway is shutting down".to_string()))
    }
}

/// Run `op` against the GPIO outputs, or answer 503 when there are none.
fn with_actuators<T>(
    state: &AppState,
    op: impl FnOnce(&mut dyn Actuators) -> crate::Result<T>,
) -> ApiResult<T> {
    ensure_accepting_motion(state)?;
    let mut actuators = state.actuators.lock();
    if !actuators.is_available() {
        return Err(ApiError::Unavailable("GPIO control is not available".to_string()));
    }
    op(&mut **actuators).map_err(|e| ApiError::Internal(format!("Error controlling GPIO: {}", e)))
}

fn ensure_actuators(state: &AppState) -> ApiResult<()> {
    with_actuators(state, |_| Ok(()))
}

/// Write one command line off the async runtime.
///
/// A missing link is not an error for the client: the gateway keeps serving
/// video without a microcontroller, so the command is dropped with a log.
async fn forward(serial: &Arc<SerialChannel>, command: Command) -> ApiResult<()> {
    let serial = Arc::clone(serial);
    let wire = command.to_wire();
    let sent = tokio::task::spawn_blocking(move || serial.send(&wire))
        .await
        .map_err(|e| ApiError::Internal(format!("Serial task failed: {}", e)))?;

    match sent {
        Ok(()) => {
            debug!(command = %command, "Command forwarded");
            Ok(())
        }
        Err(SerialError::NotConnected) => {
            debug!(command = %command, "Serial link not available, command dropped");
            Ok(())
        }
        Err(err) => Err(ApiError::Internal(format!("Error sending command: {}", err))),
    }
}

#[derive(Debug, Deserialize)]
pub struct CommandQuery {
    pub cmd: Option<String>,
}

/// `GET /tank_command?cmd=...`
pub async fn tank_command(
    State(state): State<AppState>,
    Query(query): Query<CommandQuery>,
) -> ApiResult {
    ensure_accepting_motion(&state)?;
    let raw = query
        .cmd
        .ok_or_else(|| ApiError::BadRequest("Missing cmd parameter".to_string()))?;
    let command: Command = raw.parse()?;
    forward(&state.serial, command).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct MousePosQuery {
    pub x: i32,
    pub y: i32,
}

/// `GET /set_mouse_pos?x=..&y=..`
///
/// Coordinates are offsets from the frame centre. The horizontal offset
/// becomes a relative pan step over serial, the vertical one a tilt target.
pub async fn set_mouse_pos(
    State(state): State<AppState>,
    Query(pos): Query<MousePosQuery>,
) -> ApiResult {
    ensure_actuators(&state)?;

    let capture = &state.config.capture;
    let steps = pan_steps_for_offset(pos.x, capture.width);
    if steps != 0 {
        forward(&state.serial, Command::PanStep(steps)).await?;
    }

    let target = tilt_for_offset(pos.y, capture.height);
    let applied = with_actuators(&state, |actuators| actuators.set_tilt(target))?;
    debug!(x = pos.x, y = pos.y, steps, tilt = applied, "Pointer moved");
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct TurretQuery {
    pub dir: Option<String>,
}

/// `GET /turret_move?dir=L|R|U|D`
pub async fn turret_move(
    State(state): State<AppState>,
    Query(query): Query<TurretQuery>,
) -> ApiResult {
    ensure_accepting_motion(&state)?;
    let direction: TurretDirection = query.dir.as_deref().unwrap_or_default().parse()?;

    match direction {
        TurretDirection::Left => forward(&state.serial, Command::PanStep(-TURRET_PAN_STEP)).await?,
        TurretDirection::Right => forward(&state.serial, Command::PanStep(TURRET_PAN_STEP)).await?,
        TurretDirection::Up => {
            let tilt = with_actuators(&state, |a| a.adjust_tilt(TURRET_TILT_STEP_DEGREES))?;
            debug!(tilt, "Turret tilted up");
        }
        TurretDirection::Down => {
            let tilt = with_actuators(&state, |a| a.adjust_tilt(-TURRET_TILT_STEP_DEGREES))?;
            debug!(tilt, "Turret tilted down");
        }
    }
    Ok(StatusCode::OK)
}

/// `GET /gpio_on`
pub async fn gpio_on(State(state): State<AppState>) -> ApiResult {
    with_actuators(&state, |a| a.set_led(true))?;
    Ok(StatusCode::OK)
}

/// `GET /gpio_off`
pub async fn gpio_off(State(state): State<AppState>) -> ApiResult {
    with_actuators(&state, |a| a.set_led(false))?;
    Ok(StatusCode::OK)
}

/// `GET /laser_on`
pub async fn laser_on(State(state): State<AppState>) -> ApiResult {
    with_actuators(&state, |a| a.set_laser(true))?;
    Ok(StatusCode::OK)
}

/// `GET /laser_off`
pub async fn laser_off(State(state): State<AppState>) -> ApiResult {
    with_actuators(&state, |a| a.set_laser(false))?;
    Ok(StatusCode::OK)
}

/// `GET /get_distance`: last telemetry value or `N/A`.
pub async fn get_distance(State(state): State<AppState>) -> String {
    state.serial.distance()
}

/// `GET /get_latency`: capture + encode time of the latest frame in ms.
pub async fn get_latency(State(state): State<AppState>) -> String {
    format!("{:.2}", state.stats.last_latency_ms())
}

/// `GET /get_time`: wall clock as `HH:MM:SS` at the configured UTC offset.
pub async fn get_time(State(state): State<AppState>) -> String {
    format_clock(state.config.utc_offset_hours)
}

/// Current time at `offset_hours` from UTC, falling back to UTC for offsets
/// chrono rejects.
pub fn format_clock(offset_hours: i32) -> String {
    match FixedOffset::east_opt(offset_hours.saturating_mul(3600)) {
        Some(offset) => Utc::now().with_timezone(&offset).format("%H:%M:%S").to_string(),
        None => Utc::now().format("%H:%M:%S").to_string(),
    }
}

/// `GET /api/health`
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let lifecycle = state.lifecycle.state();
    Json(json!({
        "status": if state.lifecycle.accepts_motion() { "ok" } else { "draining" },
        "service": "turret-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "state": lifecycle,
        "frames_published": state.stats.frames_published(),
        "camera_reopens": state.stats.reopen_cycles(),
        "stream_viewers": state.slot.waiter_count(),
        "serial_connected": state.serial.is_connected(),
        "actuators": state.actuators.status(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// `GET /`: the control UI lives at `/index.html`.
pub async fn index_redirect() -> impl IntoResponse {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/index.html")],
    )
}
