mod common;

use axum::http::{StatusCode, header};
use common::*;
use http_body_util::BodyExt;
use std::sync::Arc;
use stem_separation_service::config::SeparationMode;
use stem_separation_service::models::{Job, Stem};
use stem_separation_service::services::separator::SilentSeparator;
use stem_separation_service::services::worker::BackgroundWorker;
use stem_separation_service::{AppState, create_app};
use uuid::Uuid;

async fn completed_job(app: &axum::Router, stems: &str) -> String {
    let response = upload_wav(app, Some(stems)).await;
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await["job_id"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_download_stem() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, _state) = silent_app(&tmp);
    let job_id = completed_job(&app, "vocals").await;

    let response = send(&app, "GET", &format!("/download/{}/vocals", job_id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/wav");
    let disposition = response.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.starts_with("attachment; filename=\"song_vocals.wav\""));

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..4], b"RIFF");
    assert_eq!(&body[8..12], b"WAVE");
}

#[tokio::test]
async fn test_download_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, _state) = silent_app(&tmp);

    let response = send(&app, "GET", &format!("/download/{}/vocals", Uuid::new_v4())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = json_body(response).await;
    assert_eq!(json["error"], "Job not found");

    let response = send(&app, "GET", "/download/not-a-uuid/vocals").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Stem that was not requested, and a name that is not a stem
    let job_id = completed_job(&app, "vocals").await;
    let response = send(&app, "GET", &format!("/download/{}/drums", job_id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = send(&app, "GET", &format!("/download/{}/kazoo", job_id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // File removed behind the service's back
    std::fs::remove_file(tmp.path().join(&job_id).join("vocals.wav")).unwrap();
    let response = send(&app, "GET", &format!("/download/{}/vocals", job_id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_download_unfinished_job_conflicts() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, state) = silent_app(&tmp);

    let id = Uuid::new_v4();
    std::fs::create_dir_all(state.registry.job_dir(id)).unwrap();
    state
        .registry
        .insert(Job::new(id, "song.mp3".to_string(), vec![Stem::Vocals]));

    let response = send(&app, "GET", &format!("/download/{}/vocals", id)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    state.registry.mark_processing(id);
    let response = send(&app, "GET", &format!("/download/{}/vocals", id)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let json = json_body(send(&app, "GET", &format!("/jobs/{}", id)).await).await;
    assert_eq!(json["status"], "processing");
}

#[tokio::test]
async fn test_delete_job_removes_files() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, _state) = silent_app(&tmp);
    let job_id = completed_job(&app, "vocals,bass").await;
    assert!(tmp.path().join(&job_id).is_dir());

    let response = send(&app, "DELETE", &format!("/jobs/{}", job_id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["deleted"], true);
    assert!(!tmp.path().join(&job_id).exists());

    let response = send(&app, "GET", &format!("/jobs/{}", job_id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = send(&app, "GET", &format!("/download/{}/vocals", job_id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = send(&app, "DELETE", &format!("/jobs/{}", job_id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_job_forgotten_when_directory_vanishes() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, _state) = silent_app(&tmp);
    let job_id = completed_job(&app, "drums").await;

    std::fs::remove_dir_all(tmp.path().join(&job_id)).unwrap();

    let response = send(&app, "GET", &format!("/jobs/{}", job_id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_jobs() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, _state) = silent_app(&tmp);

    let json = json_body(send(&app, "GET", "/jobs").await).await;
    assert_eq!(json["total"], 0);

    let first = completed_job(&app, "vocals").await;
    let second = completed_job(&app, "bass").await;

    let json = json_body(send(&app, "GET", "/jobs").await).await;
    assert_eq!(json["total"], 2);
    let ids: Vec<&str> = json["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["job_id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&first.as_str()));
    assert!(ids.contains(&second.as_str()));
}

#[tokio::test]
async fn test_rehydrates_completed_jobs() {
    let tmp = tempfile::tempdir().unwrap();
    let job_id = {
        let (app, _state) = silent_app(&tmp);
        completed_job(&app, "vocals,other").await
    };

    // A fresh process over the same output directory
    let state = AppState::new(
        test_config(tmp.path(), SeparationMode::Sync),
        Arc::new(SilentSeparator::new("htdemucs")),
        None,
    );
    assert_eq!(state.registry.rehydrate().await.unwrap(), 1);
    let app = create_app(state);

    let json = json_body(send(&app, "GET", &format!("/jobs/{}", job_id)).await).await;
    assert_eq!(json["status"], "complete");
    assert_eq!(json["stems"], serde_json::json!(["vocals", "other"]));

    let response = send(&app, "GET", &format!("/download/{}/other", job_id)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cleanup_removes_expired_jobs() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, state) = silent_app(&tmp);
    let job_id = completed_job(&app, "vocals").await;

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let worker = BackgroundWorker::new(
        state.separation_service.clone(),
        std::time::Duration::from_secs(60),
        Some(chrono::Duration::hours(1)),
        rx,
    );

    // Nothing is old enough yet
    let cutoff = chrono::Utc::now() - chrono::Duration::hours(1);
    assert_eq!(worker.perform_cleanup(cutoff).await, 0);
    assert!(tmp.path().join(&job_id).is_dir());

    let cutoff = chrono::Utc::now() + chrono::Duration::seconds(5);
    assert_eq!(worker.perform_cleanup(cutoff).await, 1);
    assert!(!tmp.path().join(&job_id).exists());

    let response = send(&app, "GET", &format!("/jobs/{}", job_id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cleanup_reaps_abandoned_processing_job() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, state) = silent_app(&tmp);

    let id = Uuid::new_v4();
    state
        .registry
        .insert(Job::new(id, "song.wav".to_string(), vec![Stem::Vocals]));
    std::fs::create_dir_all(tmp.path().join(id.to_string())).unwrap();
    assert!(state.registry.mark_processing(id).is_some());
    assert_eq!(state.registry.in_flight(), 1);

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let worker = BackgroundWorker::new(
        state.separation_service.clone(),
        std::time::Duration::from_secs(60),
        Some(chrono::Duration::days(1)),
        rx,
    );

    let cutoff = chrono::Utc::now() + chrono::Duration::days(30);
    assert_eq!(worker.perform_cleanup(cutoff).await, 1);
    assert_eq!(state.registry.in_flight(), 0);
    assert!(!tmp.path().join(id.to_string()).exists());

    let response = send(&app, "GET", &format!("/jobs/{}", id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_and_banner() {
    let tmp = tempfile::tempdir().unwrap();
    let (app, _state) = silent_app(&tmp);

    let response = send(&app, "GET", "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["model"], "htdemucs");
    assert_eq!(json["separator"], "available");
    assert_eq!(json["storage"], "none");
    assert_eq!(json["jobs_tracked"], 0);
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));

    let response = send(&app, "GET", "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let json = json_body(response).await;
    assert_eq!(json["status"], "running");
}

#[tokio::test]
async fn test_health_reports_unavailable_separator() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(&tmp, SeparationMode::Sync, Arc::new(FailingSeparator), None);
    let app = create_app(state);

    let json = json_body(send(&app, "GET", "/health").await).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["separator"], "unavailable");
    assert_eq!(json["device"], "cuda");
}
