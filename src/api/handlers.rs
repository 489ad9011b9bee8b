//! API request handlers.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::warn;
use utoipa::ToSchema;

use super::state::ApiState;
use crate::bluetooth::{AdapterStatus, BluetoothError};
use crate::bus::BusError;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Always "ok" if server is responding
    pub status: String,
    /// deskctl version
    pub version: String,
    /// Whether a Bluetooth adapter is under control
    pub bluetooth: bool,
}

/// Generic success response.
#[derive(Debug, Serialize, ToSchema)]
pub struct SuccessResponse {
    /// Whether the operation succeeded
    pub ok: bool,
    /// Optional message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Always false for errors
    pub ok: bool,
    /// Error message
    pub error: String,
}

type ApiResult = Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)>;

fn error_status(err: &BluetoothError) -> StatusCode {
    match err {
        BluetoothError::Disabled | BluetoothError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        BluetoothError::PoweredOff => StatusCode::CONFLICT,
        BluetoothError::Bus(BusError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        BluetoothError::Bus(_) => StatusCode::BAD_GATEWAY,
    }
}

fn respond(result: Result<(), BluetoothError>, message: &str) -> ApiResult {
    match result {
        Ok(()) => Ok(Json(SuccessResponse {
            ok: true,
            message: Some(message.to_string()),
        })),
        Err(e) => {
            warn!("Bluetooth request failed: {}", e);
            Err((
                error_status(&e),
                Json(ErrorResponse {
                    ok: false,
                    error: e.to_string(),
                }),
            ))
        }
    }
}

/// Health check endpoint (no auth required).
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    ),
    tag = "Health"
)]
pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        bluetooth: state.bluetooth.is_enabled(),
    })
}

/// Get the Bluetooth adapter status.
///
/// Served from the cached snapshot; never touches the bus.
#[utoipa::path(
    get,
    path = "/api/v1/bluetooth",
    responses(
        (status = 200, description = "Current adapter status", body = AdapterStatus),
        (status = 401, description = "Unauthorized - missing or invalid API key")
    ),
    security(
        ("api_key" = [])
    ),
    tag = "Bluetooth"
)]
pub async fn bluetooth_status(State(state): State<ApiState>) -> Json<AdapterStatus> {
    Json(state.bluetooth.status())
}

/// Power the adapter on.
#[utoipa::path(
    post,
    path = "/api/v1/bluetooth/power/on",
    responses(
        (status = 200, description = "Adapter powered on", body = SuccessResponse),
        (status = 401, description = "Unauthorized"),
        (status = 502, description = "bluetoothd rejected the request", body = ErrorResponse),
        (status = 503, description = "No adapter available", body = ErrorResponse),
        (status = 504, description = "bluetoothd did not answer in time", body = ErrorResponse)
    ),
    security(
        ("api_key" = [])
    ),
    tag = "Bluetooth"
)]
pub async fn power_on(State(state): State<ApiState>) -> ApiResult {
    respond(state.bluetooth.power_up().await, "Adapter powered on")
}

/// Power the adapter off.
///
/// Also ends any active pairing session.
#[utoipa::path(
    post,
    path = "/api/v1/bluetooth/power/off",
    responses(
        (status = 200, description = "Adapter powered off", body = SuccessResponse),
        (status = 401, description = "Unauthorized"),
        (status = 502, description = "bluetoothd rejected the request", body = ErrorResponse),
        (status = 503, description = "No adapter available", body = ErrorResponse),
        (status = 504, description = "bluetoothd did not answer in time", body = ErrorResponse)
    ),
    security(
        ("api_key" = [])
    ),
    tag = "Bluetooth"
)]
pub async fn power_off(State(state): State<ApiState>) -> ApiResult {
    respond(state.bluetooth.power_down().await, "Adapter powered off")
}

/// Open a pairing session.
///
/// A request made while a session is already open succeeds without
/// starting a second one.
#[utoipa::path(
    post,
    path = "/api/v1/bluetooth/pairing",
    responses(
        (status = 200, description = "Pairing session open", body = SuccessResponse),
        (status = 401, description = "Unauthorized"),
        (status = 409, description = "Adapter powered off while opening the session", body = ErrorResponse),
        (status = 502, description = "bluetoothd rejected the request", body = ErrorResponse),
        (status = 503, description = "No adapter available", body = ErrorResponse),
        (status = 504, description = "bluetoothd did not answer in time", body = ErrorResponse)
    ),
    security(
        ("api_key" = [])
    ),
    tag = "Bluetooth"
)]
pub async fn start_pairing(State(state): State<ApiState>) -> ApiResult {
    respond(state.bluetooth.new_pairing().await, "Pairing session open")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_status_mapping() {
        let timeout = BluetoothError::Bus(BusError::Timeout {
            method: "Set".into(),
            after: Duration::from_secs(5),
        });
        assert_eq!(error_status(&timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            error_status(&BluetoothError::Disabled),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&BluetoothError::Closed),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&BluetoothError::PoweredOff),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&BluetoothError::Bus(BusError::Transport("eof".into()))),
            StatusCode::BAD_GATEWAY
        );
    }
}
