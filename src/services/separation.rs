use crate::api::error::{AppError, exceeds_length_limit};
use crate::config::ServiceConfig;
use crate::models::{Job, Stem, StemFile};
use crate::services::job_registry::JobRegistry;
use crate::services::separator::StemSeparator;
use crate::services::storage::StemStorage;
use crate::utils::hash::StreamingHasher;
use crate::utils::validation::{
    sanitize_filename, validate_content_type, validate_extension, validate_file_size,
    verify_audio_magic,
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

/// Bytes inspected for format sniffing
const HEADER_LEN: usize = 64;

/// An upload written to its job directory but not yet registered
#[derive(Debug)]
pub struct StagedUpload {
    pub job_id: Uuid,
    pub source_filename: String,
    pub input_path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Turns uploads into jobs and runs them through the separator
pub struct SeparationService {
    registry: Arc<JobRegistry>,
    separator: Arc<dyn StemSeparator>,
    storage: Option<Arc<dyn StemStorage>>,
    config: ServiceConfig,
}

impl SeparationService {
    pub fn new(
        registry: Arc<JobRegistry>,
        separator: Arc<dyn StemSeparator>,
        storage: Option<Arc<dyn StemStorage>>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            registry,
            separator,
            storage,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn supported_stems(&self) -> &[Stem] {
        self.separator.supported_stems()
    }

    /// Validates the upload and streams it to `<job_dir>/input.<ext>`.
    pub async fn stage_upload(
        &self,
        filename: &str,
        content_type: Option<&str>,
        mut reader: impl AsyncRead + Unpin + Send,
    ) -> Result<StagedUpload, AppError> {
        let source_filename =
            sanitize_filename(filename).map_err(|e| AppError::BadRequest(e.to_string()))?;
        let ext = validate_extension(&source_filename, &self.config.allowed_extensions)
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
        validate_content_type(content_type).map_err(|e| AppError::BadRequest(e.to_string()))?;

        // 1. Peek for magic bytes
        let mut header = vec![0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = reader
                .read(&mut header[filled..])
                .await
                .map_err(|e| read_error(&e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        header.truncate(filled);

        verify_audio_magic(&header).map_err(|e| AppError::BadRequest(e.to_string()))?;

        // 2. Stream into the job directory
        let job_id = Uuid::new_v4();
        let job_dir = self.registry.job_dir(job_id);
        tokio::fs::create_dir_all(&job_dir)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create job directory: {}", e)))?;

        let input_path = job_dir.join(format!("input.{}", ext));
        let hasher = match self.write_input(&input_path, &header, &mut reader).await {
            Ok(hasher) => hasher,
            Err(e) => {
                discard_dir(&job_dir).await;
                return Err(e);
            }
        };

        let (sha256, size) = hasher.finalize();
        tracing::info!(
            "📥 Staged upload {} ({} bytes) as job {}",
            source_filename,
            size,
            job_id
        );

        Ok(StagedUpload {
            job_id,
            source_filename,
            input_path,
            size,
            sha256,
        })
    }

    async fn write_input(
        &self,
        path: &Path,
        header: &[u8],
        reader: &mut (impl AsyncRead + Unpin + Send),
    ) -> Result<StreamingHasher, AppError> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut hasher = StreamingHasher::new();

        file.write_all(header).await?;
        hasher.update(header);

        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buffer).await.map_err(|e| read_error(&e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            validate_file_size(hasher.size() as usize, self.config.max_file_size)
                .map_err(|e| AppError::PayloadTooLarge(e.to_string()))?;
            file.write_all(&buffer[..n]).await?;
        }

        file.flush().await?;
        Ok(hasher)
    }

    /// Drops a staged upload that will not become a job.
    pub async fn discard(&self, staged: StagedUpload) {
        discard_dir(&self.registry.job_dir(staged.job_id)).await;
    }

    /// Registers the staged upload as a pending job.
    pub fn register(&self, staged: &StagedUpload, stems: Vec<Stem>) -> Job {
        let mut job = Job::new(staged.job_id, staged.source_filename.clone(), stems);
        job.source_size = staged.size;
        job.source_sha256 = Some(staged.sha256.clone());
        self.registry.insert(job.clone());
        job
    }

    /// Runs the separation on its own task and waits for the finished job.
    /// Dropping the returned future does not cancel the separation.
    pub async fn run(self: &Arc<Self>, staged: StagedUpload) -> Result<Job, AppError> {
        let job_id = staged.job_id;
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move { service.process(staged).await });

        match handle.await {
            Ok(Ok(Some(job))) => Ok(job),
            Ok(Ok(None)) => Err(AppError::NotFound(format!(
                "Job {} was deleted during processing",
                job_id
            ))),
            Ok(Err(e)) => {
                tracing::error!("❌ Separation failed for job {}: {:#}", job_id, e);
                Err(AppError::Internal(format!("Separation failed: {}", e)))
            }
            Err(e) => Err(AppError::Internal(format!(
                "Separation task for job {} aborted: {}",
                job_id, e
            ))),
        }
    }

    /// Hands the separation to a background task.
    pub fn spawn(self: &Arc<Self>, staged: StagedUpload) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let job_id = staged.job_id;
            if let Err(e) = service.process(staged).await {
                tracing::error!("❌ Background separation failed for job {}: {:#}", job_id, e);
            }
        });
    }

    /// Returns `Ok(None)` when the job was deleted while the model ran.
    async fn process(&self, staged: StagedUpload) -> anyhow::Result<Option<Job>> {
        let job_id = staged.job_id;
        let job_dir = self.registry.job_dir(job_id);

        let Some(job) = self.registry.mark_processing(job_id) else {
            discard_dir(&job_dir).await;
            return Ok(None);
        };

        let duration_secs = read_duration(&staged.input_path).await;
        if duration_secs.is_some() {
            self.registry.update(job_id, |j| j.duration_secs = duration_secs);
        }

        let started = std::time::Instant::now();
        let result = self
            .separator
            .separate(&staged.input_path, &job.stems, &job_dir)
            .await;

        if !self.config.keep_input {
            let _ = tokio::fs::remove_file(&staged.input_path).await;
        }

        let separated = match result {
            Ok(separated) => separated,
            Err(e) => {
                remove_stem_files(&job_dir).await;
                if self.registry.fail(job_id, e.to_string()).await.is_none() {
                    discard_dir(&job_dir).await;
                }
                return Err(e);
            }
        };

        tracing::info!(
            "✅ Job {} separated {} stems in {:?}",
            job_id,
            separated.len(),
            started.elapsed()
        );

        let mut files = Vec::with_capacity(separated.len());
        for s in separated {
            let size = tokio::fs::metadata(&s.path).await.map(|m| m.len()).unwrap_or(0);
            files.push(StemFile {
                stem: s.stem,
                path: s.path,
                size,
                remote_url: None,
            });
        }

        if let Some(storage) = &self.storage {
            for file in &mut files {
                match storage.upload_stem(job_id, file.stem, &file.path).await {
                    Ok(url) => {
                        tracing::info!("☁️  Uploaded {} for job {}: {}", file.stem, job_id, url);
                        file.remote_url = Some(url);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to upload {} for job {} to {}: {}",
                            file.stem,
                            job_id,
                            storage.backend_name(),
                            e
                        );
                    }
                }
            }
        }

        match self.registry.complete(job_id, files).await? {
            Some(job) => Ok(Some(job)),
            None => {
                discard_dir(&job_dir).await;
                self.delete_remote(job_id).await;
                Ok(None)
            }
        }
    }

    /// Removes the job, its directory and any uploaded objects.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<(), AppError> {
        let removed = self.registry.remove(job_id).await?;
        if !removed {
            return Err(AppError::NotFound("Job not found".to_string()));
        }

        self.delete_remote(job_id).await;
        tracing::info!("🗑️  Deleted job {}", job_id);
        Ok(())
    }

    async fn delete_remote(&self, job_id: Uuid) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.delete_job(job_id).await {
                tracing::warn!(
                    "Failed to delete {} objects for job {}: {}",
                    storage.backend_name(),
                    job_id,
                    e
                );
            }
        }
    }

    /// Deletes jobs created before `cutoff`, including abandoned unfinished ones.
    /// Returns how many were removed.
    pub async fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for job_id in self.registry.expired(cutoff) {
            match self.delete_job(job_id).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::error!("Failed to expire job {}: {}", job_id, e),
            }
        }
        removed
    }
}

fn read_error(e: &std::io::Error) -> AppError {
    if exceeds_length_limit(e) {
        AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
    } else {
        AppError::BadRequest(format!("Failed to read upload: {}", e))
    }
}

async fn discard_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }
}

/// Removes any `<stem>.wav` left behind by a failed run.
async fn remove_stem_files(job_dir: &Path) {
    for stem in Stem::SIX_SOURCE {
        let _ = tokio::fs::remove_file(job_dir.join(stem.file_name())).await;
    }
}

/// Reads the source duration from its container metadata, if lofty understands it.
async fn read_duration(path: &Path) -> Option<f64> {
    use lofty::file::AudioFile;

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let tagged = lofty::probe::Probe::open(&path)
            .ok()?
            .guess_file_type()
            .ok()?
            .read()
            .ok()?;
        let duration = tagged.properties().duration();
        (!duration.is_zero()).then(|| duration.as_secs_f64())
    })
    .await
    .ok()
    .flatten()
}
