use crate::AppState;
use crate::services::gpu::{GpuInfo, detect_gpus};
use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub model: String,
    pub device: String,
    /// Whether the separator can run right now
    pub separator: String,
    pub gpu_available: bool,
    pub gpus: Vec<GpuInfo>,
    pub storage: String,
    pub storage_status: String,
    pub jobs_tracked: usize,
    pub jobs_in_flight: usize,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct BannerResponse {
    pub service: String,
    pub status: String,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service, model and GPU status", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let separator_ready = state.separator.health_check().await;
    let gpus = detect_gpus().await;

    let (storage, storage_status) = match &state.storage {
        Some(storage) => {
            let status = if storage.health_check().await {
                "connected"
            } else {
                "unreachable"
            };
            (storage.backend_name(), status)
        }
        None => ("none", "disabled"),
    };

    Json(HealthResponse {
        status: if separator_ready { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.separator.model_name().to_string(),
        device: state.separator.device().to_string(),
        separator: if separator_ready {
            "available"
        } else {
            "unavailable"
        }
        .to_string(),
        gpu_available: !gpus.is_empty(),
        gpus,
        storage: storage.to_string(),
        storage_status: storage_status.to_string(),
        jobs_tracked: state.registry.len(),
        jobs_in_flight: state.registry.in_flight(),
    })
}

#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service banner", body = BannerResponse)
    ),
    tag = "system"
)]
pub async fn root() -> Json<BannerResponse> {
    Json(BannerResponse {
        service: "Stem Separation API".to_string(),
        status: "running".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
