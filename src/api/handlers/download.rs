use crate::AppState;
use crate::api::error::AppError;
use crate::api::handlers::jobs::parse_job_id;
use crate::models::{JobStatus, Stem};
use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tokio_util::io::ReaderStream;

/// `attachment` disposition with an ASCII fallback and an RFC 5987 UTF-8 name.
pub fn content_disposition(filename: &str) -> String {
    let ascii_filename = filename
        .chars()
        .filter(|c| c.is_ascii() && !c.is_control() && *c != '"' && *c != '\\' && *c != ';')
        .take(64)
        .collect::<String>();
    let fallback_filename = if ascii_filename.is_empty() {
        "stem.wav"
    } else {
        &ascii_filename
    };

    let encoded_filename = utf8_percent_encode(filename, NON_ALPHANUMERIC).to_string();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback_filename, encoded_filename
    )
}

#[utoipa::path(
    get,
    path = "/download/{job_id}/{stem}",
    params(
        ("job_id" = String, Path, description = "Job ID"),
        ("stem" = String, Path, description = "Stem name, e.g. vocals")
    ),
    responses(
        (status = 200, description = "WAV file", content_type = "audio/wav"),
        (status = 404, description = "Job, stem or file not found"),
        (status = 409, description = "Job has not finished yet")
    ),
    tag = "jobs"
)]
pub async fn download_stem(
    State(state): State<AppState>,
    Path((job_id, stem)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let job_id = parse_job_id(&job_id)?;
    let stem: Stem = stem
        .parse()
        .map_err(|_| AppError::NotFound(format!("Unknown stem '{}'", stem)))?;

    let job = state
        .registry
        .get(job_id)
        .ok_or_else(|| AppError::NotFound("Job not found".to_string()))?;

    match job.status {
        JobStatus::Complete => {}
        JobStatus::Error => {
            return Err(AppError::NotFound(format!(
                "Job failed: {}",
                job.error.as_deref().unwrap_or("unknown error")
            )));
        }
        JobStatus::Pending | JobStatus::Processing => {
            return Err(AppError::Conflict(format!(
                "Job is still {}",
                job.status.as_str()
            )));
        }
    }

    let stem_file = job
        .stem_file(stem)
        .ok_or_else(|| AppError::NotFound(format!("Stem '{}' was not produced", stem)))?;

    let file = match tokio::fs::File::open(&stem_file.path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound("Stem file no longer exists".to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let content_length = file.metadata().await?.len();

    tracing::info!("📤 Serving {} for job {}", stem, job_id);

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, "audio/wav".to_string()),
            (
                header::CONTENT_DISPOSITION,
                content_disposition(&job.download_filename(stem)),
            ),
            (header::CONTENT_LENGTH, content_length.to_string()),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition_ascii() {
        assert_eq!(
            content_disposition("song_vocals.wav"),
            "attachment; filename=\"song_vocals.wav\"; filename*=UTF-8''song%5Fvocals%2Ewav"
        );
    }

    #[test]
    fn test_content_disposition_strips_quotes_and_unicode() {
        let value = content_disposition("caf\u{e9} \"live\"_drums.wav");
        assert!(value.starts_with("attachment; filename=\"caf live_drums.wav\""));
        assert!(value.contains("filename*=UTF-8''caf%C3%A9"));
    }
}
