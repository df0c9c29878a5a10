use crate::models::{Job, JobStatus, StemFile};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Name of the per-job manifest written on completion
pub const MANIFEST_FILE: &str = "job.json";

/// Tracks jobs in memory, keyed by id, with one directory per job under `root`.
///
/// Finished jobs are also described by a `job.json` manifest in their
/// directory so they survive a restart.
pub struct JobRegistry {
    jobs: DashMap<Uuid, Job>,
    root: PathBuf,
}

impl JobRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            jobs: DashMap::new(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn insert(&self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    /// Returns a snapshot of the job. Finished jobs whose directory has been
    /// removed from disk are dropped and reported as unknown.
    pub fn get(&self, id: Uuid) -> Option<Job> {
        let job = self.jobs.get(&id).map(|j| j.clone())?;
        if job.status.is_finished() && !self.job_dir(id).is_dir() {
            tracing::warn!("Job {} directory vanished, forgetting job", id);
            self.jobs.remove(&id);
            return None;
        }
        Some(job)
    }

    /// All jobs, newest first
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Number of jobs still pending or processing
    pub fn in_flight(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| !j.value().status.is_finished())
            .count()
    }

    /// Applies `f` to the job in place. Returns the updated snapshot, or `None`
    /// if the job is no longer registered.
    pub fn update<F>(&self, id: Uuid, f: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut entry = self.jobs.get_mut(&id)?;
        f(entry.value_mut());
        Some(entry.value().clone())
    }

    pub fn mark_processing(&self, id: Uuid) -> Option<Job> {
        self.update(id, |job| job.status = JobStatus::Processing)
    }

    /// Records the produced stems and persists the manifest.
    pub async fn complete(&self, id: Uuid, files: Vec<StemFile>) -> Result<Option<Job>> {
        let Some(job) = self.update(id, |job| {
            job.status = JobStatus::Complete;
            job.output_files = files;
            job.error = None;
            job.completed_at = Some(Utc::now());
        }) else {
            return Ok(None);
        };

        self.write_manifest(&job).await?;
        Ok(Some(job))
    }

    pub async fn fail(&self, id: Uuid, error: impl Into<String>) -> Option<Job> {
        let error = error.into();
        let job = self.update(id, |job| {
            job.status = JobStatus::Error;
            job.output_files.clear();
            job.error = Some(error);
            job.completed_at = Some(Utc::now());
        })?;

        if let Err(e) = self.write_manifest(&job).await {
            tracing::warn!("Failed to persist manifest for failed job {}: {}", id, e);
        }
        Some(job)
    }

    /// Forgets the job and deletes its directory. Returns `false` when neither
    /// an entry nor a directory existed.
    pub async fn remove(&self, id: Uuid) -> Result<bool> {
        let removed = self.jobs.remove(&id).is_some();
        let dir = self.job_dir(id);

        let dir_existed = match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", dir.display()));
            }
        };

        if !removed && dir_existed {
            tracing::info!("Removed untracked job directory {}", dir.display());
        }

        Ok(removed || dir_existed)
    }

    /// Ids of jobs created before `cutoff`, finished or not. A job still
    /// unfinished after a whole TTL is treated as abandoned.
    pub fn expired(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        self.jobs
            .iter()
            .filter(|j| j.value().created_at < cutoff)
            .map(|j| *j.key())
            .collect()
    }

    pub async fn write_manifest(&self, job: &Job) -> Result<()> {
        let path = self.job_dir(job.id).join(MANIFEST_FILE);
        let body = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Loads finished jobs from the manifests under `root`. Directories without
    /// a readable manifest are skipped. Returns the number of jobs loaded.
    pub async fn rehydrate(&self) -> Result<usize> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create {}", self.root.display()))?;

        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut loaded = 0;

        while let Some(entry) = entries.next_entry().await? {
            let Ok(id) = entry.file_name().to_string_lossy().parse::<Uuid>() else {
                continue;
            };
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let manifest = entry.path().join(MANIFEST_FILE);
            let job = match tokio::fs::read(&manifest).await {
                Ok(bytes) => match serde_json::from_slice::<Job>(&bytes) {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::warn!("Skipping unreadable manifest {}: {}", manifest.display(), e);
                        continue;
                    }
                },
                Err(_) => continue,
            };

            if job.id != id || !job.status.is_finished() {
                continue;
            }

            let dir = entry.path();
            let mut job = job;
            // Paths are re-rooted in case the output directory moved
            job.output_files.retain_mut(|f| {
                f.path = dir.join(f.stem.file_name());
                f.path.is_file()
            });

            self.jobs.insert(id, job);
            loaded += 1;
        }

        Ok(loaded)
    }

    /// Job directories on disk with no registry entry
    pub async fn untracked_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Ok(id) = entry.file_name().to_string_lossy().parse::<Uuid>() else {
                continue;
            };
            if entry.file_type().await?.is_dir() && !self.contains(id) {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stem;

    async fn registry_with_job(root: &Path) -> (JobRegistry, Uuid) {
        let registry = JobRegistry::new(root);
        let id = Uuid::new_v4();
        tokio::fs::create_dir_all(registry.job_dir(id)).await.unwrap();
        registry.insert(Job::new(id, "song.mp3".to_string(), vec![Stem::Vocals]));
        (registry, id)
    }

    fn vocals_file(registry: &JobRegistry, id: Uuid) -> StemFile {
        let path = registry.job_dir(id).join("vocals.wav");
        std::fs::write(&path, b"RIFF").unwrap();
        StemFile {
            stem: Stem::Vocals,
            path,
            size: 4,
            remote_url: None,
        }
    }

    #[tokio::test]
    async fn test_complete_writes_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, id) = registry_with_job(tmp.path()).await;
        assert_eq!(registry.in_flight(), 1);

        let file = vocals_file(&registry, id);
        let job = registry.complete(id, vec![file]).await.unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.completed_at.is_some());
        assert!(registry.job_dir(id).join(MANIFEST_FILE).is_file());
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_get_forgets_job_whose_files_were_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, id) = registry_with_job(tmp.path()).await;
        let file = vocals_file(&registry, id);
        registry.complete(id, vec![file]).await.unwrap();

        std::fs::remove_dir_all(registry.job_dir(id)).unwrap();
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_deletes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, id) = registry_with_job(tmp.path()).await;

        assert!(registry.remove(id).await.unwrap());
        assert!(!registry.job_dir(id).exists());
        assert!(!registry.remove(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_clears_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, id) = registry_with_job(tmp.path()).await;
        let job = registry.fail(id, "model crashed").await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("model crashed"));
        assert!(job.output_files.is_empty());
    }

    #[tokio::test]
    async fn test_rehydrate_loads_finished_jobs_only() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, done) = registry_with_job(tmp.path()).await;
        let file = vocals_file(&registry, done);
        registry.complete(done, vec![file]).await.unwrap();

        // An in-flight job leaves a directory without a manifest
        let pending = Uuid::new_v4();
        std::fs::create_dir_all(registry.job_dir(pending)).unwrap();
        std::fs::create_dir_all(tmp.path().join("not-a-job")).unwrap();

        let fresh = JobRegistry::new(tmp.path());
        assert_eq!(fresh.rehydrate().await.unwrap(), 1);

        let job = fresh.get(done).unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.output_files.len(), 1);
        assert!(fresh.get(pending).is_none());

        let untracked = fresh.untracked_dirs().await.unwrap();
        assert_eq!(untracked, vec![fresh.job_dir(pending)]);
    }

    #[tokio::test]
    async fn test_expired() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, id) = registry_with_job(tmp.path()).await;

        // Abandoned jobs expire like finished ones
        assert_eq!(
            registry.expired(Utc::now() + chrono::Duration::hours(1)),
            vec![id]
        );

        registry.mark_processing(id);
        assert_eq!(
            registry.expired(Utc::now() + chrono::Duration::hours(1)),
            vec![id]
        );
        assert!(registry.expired(Utc::now() - chrono::Duration::hours(1)).is_empty());
    }
}
