#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response},
};
use http_body_util::BodyExt;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use stem_separation_service::config::{SeparationMode, ServiceConfig};
use stem_separation_service::models::Stem;
use stem_separation_service::services::separator::{
    SeparatedStem, SilentSeparator, StemSeparator,
};
use stem_separation_service::services::storage::{StemStorage, object_key};
use stem_separation_service::{AppState, create_app};
use tempfile::TempDir;
use tokio::sync::Notify;
use tower::ServiceExt;
use uuid::Uuid;

pub const BOUNDARY: &str = "---------------------------123456789012345678901234567";

pub fn test_config(dir: &Path, mode: SeparationMode) -> ServiceConfig {
    ServiceConfig {
        output_dir: dir.to_path_buf(),
        separation_mode: mode,
        ..ServiceConfig::development()
    }
}

pub fn test_state(
    dir: &TempDir,
    mode: SeparationMode,
    separator: Arc<dyn StemSeparator>,
    storage: Option<Arc<dyn StemStorage>>,
) -> AppState {
    AppState::new(test_config(dir.path(), mode), separator, storage)
}

pub fn silent_app(dir: &TempDir) -> (Router, AppState) {
    let state = test_state(
        dir,
        SeparationMode::Sync,
        Arc::new(SilentSeparator::new("htdemucs")),
        None,
    );
    (create_app(state.clone()), state)
}

/// A tenth of a second of stereo silence as a WAV file.
pub fn wav_bytes() -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..4410 * 2 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

pub fn multipart_body(
    filename: &str,
    content_type: &str,
    data: &[u8],
    stems: Option<&str>,
) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(stems) = stems {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"stems\"\r\n\r\n{stems}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
            Content-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn separate_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

pub async fn upload_wav(app: &Router, stems: Option<&str>) -> Response<Body> {
    let body = multipart_body("song.wav", "audio/wav", &wav_bytes(), stems);
    app.clone()
        .oneshot(separate_request("/separate", body))
        .await
        .unwrap()
}

pub async fn send(app: &Router, method: &str, uri: &str) -> Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

/// Writes one stem, then fails like a crashed model run would.
pub struct FailingSeparator;

#[async_trait]
impl StemSeparator for FailingSeparator {
    async fn separate(
        &self,
        _input: &Path,
        stems: &[Stem],
        output_dir: &Path,
    ) -> anyhow::Result<Vec<SeparatedStem>> {
        if let Some(stem) = stems.first() {
            tokio::fs::write(output_dir.join(stem.file_name()), b"partial").await?;
        }
        anyhow::bail!("demucs exited with status 1: CUDA out of memory")
    }

    fn model_name(&self) -> &str {
        "htdemucs"
    }

    fn device(&self) -> &str {
        "cuda"
    }

    fn supported_stems(&self) -> &[Stem] {
        &Stem::STANDARD
    }

    async fn health_check(&self) -> bool {
        false
    }
}

/// Holds every run until the test calls `release`, then writes small stems.
#[derive(Default)]
pub struct GatedSeparator {
    gate: Notify,
    pub started: AtomicUsize,
}

impl GatedSeparator {
    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl StemSeparator for GatedSeparator {
    async fn separate(
        &self,
        _input: &Path,
        stems: &[Stem],
        output_dir: &Path,
    ) -> anyhow::Result<Vec<SeparatedStem>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;

        tokio::fs::create_dir_all(output_dir).await?;
        let mut separated = Vec::with_capacity(stems.len());
        for stem in stems {
            let path = output_dir.join(stem.file_name());
            tokio::fs::write(&path, b"RIFF").await?;
            separated.push(SeparatedStem { stem: *stem, path });
        }
        Ok(separated)
    }

    fn model_name(&self) -> &str {
        "htdemucs"
    }

    fn device(&self) -> &str {
        "cpu"
    }

    fn supported_stems(&self) -> &[Stem] {
        &Stem::STANDARD
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Polls `condition` every 20ms for up to two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    condition()
}

/// Records uploads in memory and hands out CDN-style URLs.
#[derive(Default)]
pub struct MockStorage {
    pub objects: Mutex<HashMap<String, u64>>,
    pub deletes: AtomicUsize,
}

impl MockStorage {
    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StemStorage for MockStorage {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    async fn upload_stem(&self, job_id: Uuid, stem: Stem, path: &Path) -> anyhow::Result<String> {
        let size = tokio::fs::metadata(path).await?.len();
        let key = object_key("stems/", job_id, stem);
        self.objects.lock().unwrap().insert(key.clone(), size);
        Ok(format!("https://cdn.test/{}", key))
    }

    async fn delete_job(&self, job_id: Uuid) -> anyhow::Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let prefix = format!("stems/{}/", job_id);
        self.objects
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
