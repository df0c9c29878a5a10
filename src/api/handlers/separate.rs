use crate::AppState;
use crate::api::error::AppError;
use crate::config::SeparationMode;
use crate::models::{JobStatus, Stem};
use crate::services::separation::StagedUpload;
use crate::utils::validation::parse_stems;
use axum::{
    Json,
    extract::{Multipart, Query, State, multipart::MultipartError},
    http::StatusCode,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::io::StreamReader;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

#[derive(Serialize, Deserialize, ToSchema)]
pub struct SeparateResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub stems: Vec<Stem>,
    /// Download path per stem, empty until the job completes
    pub output_files: BTreeMap<String, String>,
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SeparateQuery {
    /// Comma separated stems, used when the form carries no `stems` field
    pub stems: Option<String>,
}

/// Multipart body accepted by `POST /separate`
#[allow(dead_code)]
#[derive(ToSchema)]
pub struct SeparateForm {
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
    /// Comma separated, e.g. "vocals,drums"
    pub stems: Option<String>,
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
    } else {
        AppError::BadRequest(e.body_text())
    }
}

#[utoipa::path(
    post,
    path = "/separate",
    params(SeparateQuery),
    request_body(content = SeparateForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Separation finished", body = SeparateResponse),
        (status = 202, description = "Separation queued in the background", body = SeparateResponse),
        (status = 400, description = "Invalid file or stem selection"),
        (status = 413, description = "File too large"),
        (status = 500, description = "Separation failed")
    ),
    tag = "separation"
)]
pub async fn separate_audio(
    State(state): State<AppState>,
    Query(query): Query<SeparateQuery>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SeparateResponse>), AppError> {
    let service = &state.separation_service;
    let mut staged: Option<StagedUpload> = None;
    let mut stems_field: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                if let Some(staged) = staged.take() {
                    service.discard(staged).await;
                }
                return Err(multipart_error(e));
            }
        };

        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            "file" if staged.is_none() => {
                let filename = field.file_name().unwrap_or("unnamed").to_string();
                let content_type = field.content_type().map(|s| s.to_string());

                let reader = StreamReader::new(field.map_err(std::io::Error::other));
                staged = Some(
                    service
                        .stage_upload(&filename, content_type.as_deref(), reader)
                        .await?,
                );
            }
            "stems" => match field.text().await {
                Ok(text) => stems_field = Some(text),
                Err(e) => {
                    if let Some(staged) = staged.take() {
                        service.discard(staged).await;
                    }
                    return Err(multipart_error(e));
                }
            },
            _ => {}
        }
    }

    let Some(staged) = staged else {
        return Err(AppError::BadRequest("No file uploaded".to_string()));
    };

    let raw = stems_field
        .filter(|s| !s.trim().is_empty())
        .or(query.stems);
    let stems = match parse_stems(raw.as_deref(), service.supported_stems()) {
        Ok(stems) => stems,
        Err(e) => {
            service.discard(staged).await;
            return Err(AppError::BadRequest(e.to_string()));
        }
    };

    let job = service.register(&staged, stems);
    tracing::info!(
        "🎵 Job {} created for {} with stems {:?}",
        job.id,
        job.source_filename,
        job.stems
    );

    match state.config.separation_mode {
        SeparationMode::Sync => {
            let job = service.run(staged).await?;
            Ok((
                StatusCode::OK,
                Json(SeparateResponse {
                    job_id: job.id,
                    status: job.status,
                    output_files: job.download_manifest(),
                    stems: job.stems,
                }),
            ))
        }
        SeparationMode::Background => {
            service.spawn(staged);
            Ok((
                StatusCode::ACCEPTED,
                Json(SeparateResponse {
                    job_id: job.id,
                    status: JobStatus::Pending,
                    stems: job.stems,
                    output_files: BTreeMap::new(),
                }),
            ))
        }
    }
}
