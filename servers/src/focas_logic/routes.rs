use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lib_gateway::{GatewayError, GatewayService};
use serde::Deserialize;
use serde_json::json;

pub type AppState = Arc<GatewayService>;

/// Wraps `GatewayError` so it can be rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::Duplicate { .. } | GatewayError::AlreadyPolling(_) => StatusCode::CONFLICT,
        GatewayError::Transport(_)
        | GatewayError::ProbeFailed { .. }
        | GatewayError::Data(_)
        | GatewayError::Timeout(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() && status != StatusCode::BAD_GATEWAY {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub endpoint: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StartPollingRequest {
    pub session_id: String,
    pub interval_ms: u64,
}

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/connect", post(create_connection).get(list_connections))
        .route("/connect/check", post(check_connection))
        .route("/connect/{id}", get(get_connection).delete(delete_connection))
        .route("/polling/start", post(start_polling))
        .route("/polling/stop", post(stop_polling))
        .route("/snapshot/{id}", get(read_snapshot))
        .route("/status/{id}", get(read_status))
        .route("/program/{id}", get(read_program))
        .with_state(service)
}

async fn create_connection(State(service): State<AppState>, Json(req): Json<ConnectRequest>) -> ApiResult {
    let info = service.create_connection(&req.endpoint).await?;
    Ok((StatusCode::CREATED, Json(info)).into_response())
}

async fn list_connections(State(service): State<AppState>) -> ApiResult {
    Ok(Json(service.get_all_connections().await).into_response())
}

async fn get_connection(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(Json(service.get_connection(&id).await?).into_response())
}

async fn delete_connection(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult {
    service.delete_connection(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn check_connection(State(service): State<AppState>, Json(req): Json<SessionRequest>) -> ApiResult {
    let check = service.check_connection(&req.session_id).await?;
    let body = json!({
        "info": check.info,
        "error": check.probe_error.map(|e| e.to_string()),
    });
    Ok(Json(body).into_response())
}

async fn start_polling(State(service): State<AppState>, Json(req): Json<StartPollingRequest>) -> ApiResult {
    service.start_polling(&req.session_id, req.interval_ms).await?;
    Ok(Json(json!({ "session_id": req.session_id, "polling": true })).into_response())
}

async fn stop_polling(State(service): State<AppState>, Json(req): Json<SessionRequest>) -> ApiResult {
    service.stop_polling(&req.session_id).await?;
    Ok(Json(json!({ "session_id": req.session_id, "polling": false })).into_response())
}

async fn read_snapshot(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(Json(service.read_snapshot(&id).await?).into_response())
}

async fn read_status(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(Json(service.read_status(&id).await?).into_response())
}

async fn read_program(State(service): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(Json(service.read_control_program(&id).await?).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_gateway::driver::{codes, DriverError};

    #[test]
    fn errors_map_to_http_status() {
        assert_eq!(status_for(&GatewayError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&GatewayError::NotFound("s".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&GatewayError::AlreadyPolling("s".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&GatewayError::Duplicate {
                endpoint: "10.0.0.5:8193".into(),
                session_id: "s".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&GatewayError::Transport(DriverError::new("connect", codes::EW_SOCKET))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_for(&GatewayError::FatalStartup("boom".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
