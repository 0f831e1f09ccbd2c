//! HTTP request handlers.

use super::AppState;
use crate::display::{OnlineTimeReading, StatusReading};
use crate::tracker::ConfigError;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;

// ============================================================================
// Devices
// ============================================================================

pub async fn handle_list_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.tracker.registry().list().await)
}

pub async fn handle_get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.tracker.registry().get(&id).await {
        Some(view) => Json(view).into_response(),
        None => not_found(&id),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequest {
    pub name: String,
    pub target: String,
}

pub async fn handle_create_device(
    State(state): State<AppState>,
    Json(req): Json<CreateDeviceRequest>,
) -> impl IntoResponse {
    match state.tracker.setup(&req.name, &req.target).await {
        Ok(device) => (StatusCode::CREATED, Json(device)).into_response(),
        Err(e) => config_error(e),
    }
}

pub async fn handle_delete_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.tracker.remove(&id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => config_error(e),
    }
}

// ============================================================================
// Readings
// ============================================================================

pub async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.tracker.registry().get(&id).await {
        Some(view) => Json(StatusReading::new(&view.device, &view.snapshot)).into_response(),
        None => not_found(&id),
    }
}

pub async fn handle_online_time(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.tracker.registry().get(&id).await {
        Some(view) => Json(OnlineTimeReading::new(&view.device, &view.snapshot)).into_response(),
        None => not_found(&id),
    }
}

// ============================================================================
// Errors
// ============================================================================

fn not_found(id: &str) -> Response {
    (StatusCode::NOT_FOUND, format!("unknown device {:?}", id)).into_response()
}

fn config_error(e: ConfigError) -> Response {
    let status = match &e {
        ConfigError::EmptyName | ConfigError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
        ConfigError::DuplicateName(_) | ConfigError::DuplicateTarget(_, _) => StatusCode::CONFLICT,
        ConfigError::UnknownDevice(_) => StatusCode::NOT_FOUND,
        ConfigError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Device setup failed: {}", e);
    }
    (status, e.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::Store;
    use crate::probe::Prober;
    use crate::scheduler::Scheduler;
    use crate::tracker::{Registry, Tracker};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn app_state(tmp: &NamedTempFile) -> AppState {
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            Prober::new(Duration::from_millis(100)),
            Duration::from_secs(3600),
        ));
        AppState {
            config: ServerConfig::default(),
            tracker: Arc::new(Tracker::new(store, Arc::new(Registry::new()), scheduler)),
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create(name: &str, target: &str) -> Json<CreateDeviceRequest> {
        Json(CreateDeviceRequest {
            name: name.to_string(),
            target: target.to_string(),
        })
    }

    #[tokio::test]
    async fn test_create_device_statuses() {
        let tmp = NamedTempFile::new().unwrap();
        let state = app_state(&tmp);

        let resp = handle_create_device(State(state.clone()), create("TV", "192.0.2.30"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["id"], "tv");
        assert_eq!(body["target"], "192.0.2.30");

        let resp = handle_create_device(State(state.clone()), create("tv", "192.0.2.31"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = handle_create_device(State(state.clone()), create("Radio", "not a target"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_readings_and_delete() {
        let tmp = NamedTempFile::new().unwrap();
        let state = app_state(&tmp);

        handle_create_device(State(state.clone()), create("TV", "192.0.2.30")).await;

        let resp = handle_status(State(state.clone()), Path("tv".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["unique_id"], "tv_status");
        assert_eq!(body["device_class"], "connectivity");

        let resp = handle_online_time(State(state.clone()), Path("tv".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["unique_id"], "tv_online_time");
        assert_eq!(body["unit"], "min");
        assert_eq!(body["value"], 0);

        let resp = handle_list_devices(State(state.clone())).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));
        assert_eq!(body[0]["online_minutes"], 0);

        let resp = handle_delete_device(State(state.clone()), Path("tv".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = handle_get_device(State(state.clone()), Path("tv".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
