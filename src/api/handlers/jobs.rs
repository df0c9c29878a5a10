use crate::AppState;
use crate::api::error::AppError;
use crate::models::{Job, JobStatus, Stem};
use axum::{
    Json,
    extract::{Path, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Serialize, Deserialize, ToSchema)]
pub struct StemFileResponse {
    pub stem: Stem,
    pub size: u64,
    pub download_url: String,
    pub remote_url: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
    pub source_filename: String,
    pub stems: Vec<Stem>,
    pub files: Vec<StemFileResponse>,
    /// Download path per stem
    pub output_files: BTreeMap<String, String>,
    /// Object store URL per uploaded stem
    pub remote_files: BTreeMap<String, String>,
    pub error: Option<String>,
    pub source_size: u64,
    pub source_sha256: Option<String>,
    pub duration_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        let message = match job.status {
            JobStatus::Pending => "Job is queued".to_string(),
            JobStatus::Processing => "Separation in progress".to_string(),
            JobStatus::Complete => format!("{} stems ready for download", job.output_files.len()),
            JobStatus::Error => "Separation failed".to_string(),
        };

        let files = job
            .output_files
            .iter()
            .map(|f| StemFileResponse {
                stem: f.stem,
                size: f.size,
                download_url: crate::models::download_path(job.id, f.stem),
                remote_url: f.remote_url.clone(),
            })
            .collect();

        Self {
            job_id: job.id,
            status: job.status,
            message,
            output_files: job.download_manifest(),
            remote_files: job.remote_manifest(),
            files,
            source_filename: job.source_filename,
            stems: job.stems,
            error: job.error,
            source_size: job.source_size,
            source_sha256: job.source_sha256,
            duration_secs: job.duration_secs,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total: usize,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct DeleteJobResponse {
    pub job_id: Uuid,
    pub deleted: bool,
}

/// Job ids arrive as raw path segments so that malformed ids read as unknown jobs.
pub(crate) fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::NotFound("Job not found".to_string()))
}

#[utoipa::path(
    get,
    path = "/jobs",
    responses(
        (status = 200, description = "Tracked jobs, newest first", body = JobListResponse)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(State(state): State<AppState>) -> Json<JobListResponse> {
    let jobs: Vec<JobResponse> = state
        .registry
        .list()
        .into_iter()
        .map(JobResponse::from)
        .collect();

    Json(JobListResponse {
        total: jobs.len(),
        jobs,
    })
}

#[utoipa::path(
    get,
    path = "/jobs/{job_id}",
    params(
        ("job_id" = String, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job status", body = JobResponse),
        (status = 404, description = "Job not found")
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, AppError> {
    let job_id = parse_job_id(&job_id)?;
    let job = state
        .registry
        .get(job_id)
        .ok_or_else(|| AppError::NotFound("Job not found".to_string()))?;

    Ok(Json(job.into()))
}

#[utoipa::path(
    delete,
    path = "/jobs/{job_id}",
    params(
        ("job_id" = String, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job and its files deleted", body = DeleteJobResponse),
        (status = 404, description = "Job not found")
    ),
    tag = "jobs"
)]
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<DeleteJobResponse>, AppError> {
    let job_id = parse_job_id(&job_id)?;
    state.separation_service.delete_job(job_id).await?;

    Ok(Json(DeleteJobResponse {
        job_id,
        deleted: true,
    }))
}
