use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// One isolated source track produced by the separator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Stem {
    Vocals,
    Drums,
    Bass,
    Other,
    Guitar,
    Piano,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown stem '{0}'")]
pub struct UnknownStem(pub String);

impl Stem {
    /// Sources produced by the four-stem Demucs models.
    pub const STANDARD: [Stem; 4] = [Stem::Vocals, Stem::Drums, Stem::Bass, Stem::Other];

    /// Sources produced by the `*_6s` models.
    pub const SIX_SOURCE: [Stem; 6] = [
        Stem::Vocals,
        Stem::Drums,
        Stem::Bass,
        Stem::Other,
        Stem::Guitar,
        Stem::Piano,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stem::Vocals => "vocals",
            Stem::Drums => "drums",
            Stem::Bass => "bass",
            Stem::Other => "other",
            Stem::Guitar => "guitar",
            Stem::Piano => "piano",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.wav", self.as_str())
    }

    /// Stems a given Demucs model writes out.
    pub fn for_model(model: &str) -> &'static [Stem] {
        if model.ends_with("_6s") {
            &Self::SIX_SOURCE
        } else {
            &Self::STANDARD
        }
    }
}

impl fmt::Display for Stem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stem {
    type Err = UnknownStem;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vocals" => Ok(Stem::Vocals),
            "drums" => Ok(Stem::Drums),
            "bass" => Ok(Stem::Bass),
            "other" => Ok(Stem::Other),
            "guitar" => Ok(Stem::Guitar),
            "piano" => Ok(Stem::Piano),
            _ => Err(UnknownStem(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Complete,
    Error,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }
}

/// A separated stem stored in the job directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StemFile {
    pub stem: Stem,
    pub path: PathBuf,
    pub size: u64,
    /// Public URL in the object store, when the upload succeeded
    pub remote_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source_filename: String,
    pub stems: Vec<Stem>,
    pub status: JobStatus,
    pub output_files: Vec<StemFile>,
    pub error: Option<String>,
    pub source_size: u64,
    pub source_sha256: Option<String>,
    pub duration_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: Uuid, source_filename: String, stems: Vec<Stem>) -> Self {
        Self {
            id,
            source_filename,
            stems,
            status: JobStatus::Pending,
            output_files: Vec::new(),
            error: None,
            source_size: 0,
            source_sha256: None,
            duration_secs: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn stem_file(&self, stem: Stem) -> Option<&StemFile> {
        self.output_files.iter().find(|f| f.stem == stem)
    }

    /// Download path for each produced stem, keyed by stem name.
    pub fn download_manifest(&self) -> BTreeMap<String, String> {
        self.output_files
            .iter()
            .map(|f| (f.stem.to_string(), download_path(self.id, f.stem)))
            .collect()
    }

    /// Remote object URLs for the stems that were uploaded.
    pub fn remote_manifest(&self) -> BTreeMap<String, String> {
        self.output_files
            .iter()
            .filter_map(|f| f.remote_url.clone().map(|u| (f.stem.to_string(), u)))
            .collect()
    }

    /// Name offered to clients downloading a stem, e.g. `song_vocals.wav`.
    pub fn download_filename(&self, stem: Stem) -> String {
        let base = std::path::Path::new(&self.source_filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("audio");
        format!("{}_{}.wav", base, stem)
    }
}

pub fn download_path(job_id: Uuid, stem: Stem) -> String {
    format!("/download/{}/{}", job_id, stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stem_round_trips_through_name() {
        for stem in Stem::SIX_SOURCE {
            assert_eq!(stem.as_str().parse::<Stem>().unwrap(), stem);
        }
        assert_eq!("DRUMS".parse::<Stem>().unwrap(), Stem::Drums);
        assert!("kazoo".parse::<Stem>().is_err());
    }

    #[test]
    fn test_stems_for_model() {
        assert_eq!(Stem::for_model("htdemucs"), &Stem::STANDARD);
        assert_eq!(Stem::for_model("htdemucs_ft"), &Stem::STANDARD);
        assert_eq!(Stem::for_model("htdemucs_6s"), &Stem::SIX_SOURCE);
    }

    #[test]
    fn test_job_manifests() {
        let id = Uuid::new_v4();
        let mut job = Job::new(id, "My Song.mp3".to_string(), vec![Stem::Vocals, Stem::Bass]);
        job.output_files.push(StemFile {
            stem: Stem::Vocals,
            path: PathBuf::from("/tmp/vocals.wav"),
            size: 10,
            remote_url: Some("https://cdn.example/vocals.wav".to_string()),
        });
        job.output_files.push(StemFile {
            stem: Stem::Bass,
            path: PathBuf::from("/tmp/bass.wav"),
            size: 10,
            remote_url: None,
        });

        let manifest = job.download_manifest();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest["vocals"], format!("/download/{}/vocals", id));
        assert_eq!(job.remote_manifest().len(), 1);
        assert_eq!(job.download_filename(Stem::Bass), "My Song_bass.wav");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Complete).unwrap(),
            "\"complete\""
        );
        assert!(JobStatus::Error.is_finished());
        assert!(!JobStatus::Processing.is_finished());
    }
}
