use crate::utils::validation::{DEFAULT_AUDIO_EXTENSIONS, MAX_FILE_SIZE};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Whether `/separate` waits for the model or hands the job to a background task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparationMode {
    Sync,
    Background,
}

impl FromStr for SeparationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sync" | "synchronous" => Ok(Self::Sync),
            "background" | "async" => Ok(Self::Background),
            other => Err(anyhow::anyhow!("unknown separation mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    None,
    S3,
    Supabase,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" | "disabled" | "local" => Ok(Self::None),
            "s3" | "minio" => Ok(Self::S3),
            "supabase" => Ok(Self::Supabase),
            other => Err(anyhow::anyhow!("unknown storage backend '{}'", other)),
        }
    }
}

/// Object storage settings for the optional stem upload
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Key prefix inside the bucket (default: "")
    pub prefix: String,

    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_bucket: Option<String>,
    /// Base URL that public object URLs are built from
    pub s3_public_url: Option<String>,

    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    /// Supabase storage bucket (default: "stems")
    pub supabase_bucket: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::None,
            prefix: String::new(),
            s3_endpoint: None,
            s3_region: "us-east-1".to_string(),
            s3_access_key: None,
            s3_secret_key: None,
            s3_bucket: None,
            s3_public_url: None,
            supabase_url: None,
            supabase_key: None,
            supabase_bucket: "stems".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            backend: env::var("STORAGE_BACKEND")
                .ok()
                .and_then(|v| match v.parse() {
                    Ok(backend) => Some(backend),
                    Err(e) => {
                        tracing::warn!("{}, object storage disabled", e);
                        None
                    }
                })
                .unwrap_or(default.backend),
            prefix: env::var("STORAGE_PREFIX").unwrap_or(default.prefix),
            s3_endpoint: env::var("S3_ENDPOINT").ok(),
            s3_region: env::var("S3_REGION").unwrap_or(default.s3_region),
            s3_access_key: env::var("S3_ACCESS_KEY").ok(),
            s3_secret_key: env::var("S3_SECRET_KEY").ok(),
            s3_bucket: env::var("S3_BUCKET").ok(),
            s3_public_url: env::var("S3_PUBLIC_URL").ok(),
            supabase_url: env::var("SUPABASE_URL").ok(),
            supabase_key: env::var("SUPABASE_KEY")
                .or_else(|_| env::var("SUPABASE_ANON_KEY"))
                .ok(),
            supabase_bucket: env::var("SUPABASE_BUCKET").unwrap_or(default.supabase_bucket),
        }
    }
}

/// Service configuration, loaded from the environment
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Bind address (default: "0.0.0.0")
    pub host: String,

    /// Bind port (default: 8000)
    pub port: u16,

    /// Root directory holding one sub-directory per job (default: "outputs")
    pub output_dir: PathBuf,

    /// Maximum upload size in bytes (default: 200 MB)
    pub max_file_size: usize,

    /// Accepted upload extensions, lowercase
    pub allowed_extensions: Vec<String>,

    pub separation_mode: SeparationMode,

    /// Separator implementation: "demucs" or "silent" (default: "demucs")
    pub separator_type: String,

    /// Python interpreter with demucs installed (default: "python3")
    pub demucs_python: String,

    /// Demucs model name (default: "htdemucs")
    pub demucs_model: String,

    /// "cuda", "cpu" or "auto" (default: "auto")
    pub demucs_device: String,

    /// Segment length in seconds, lowers GPU memory use
    pub demucs_segment: Option<u32>,

    /// Upper bound for one model run (default: 1800)
    pub separation_timeout_secs: u64,

    /// Keep the uploaded source next to the stems (default: false)
    pub keep_input: bool,

    /// Jobs older than this are removed by the cleanup worker, 0 disables (default: 24)
    pub job_ttl_hours: u64,

    /// Cleanup worker period (default: 600)
    pub cleanup_interval_secs: u64,

    pub storage: StorageConfig,

    /// Allowed CORS origins, "*" for any
    pub allowed_origins: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            output_dir: PathBuf::from("outputs"),
            max_file_size: MAX_FILE_SIZE,
            allowed_extensions: DEFAULT_AUDIO_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            separation_mode: SeparationMode::Sync,
            separator_type: "demucs".to_string(),
            demucs_python: "python3".to_string(),
            demucs_model: "htdemucs".to_string(),
            demucs_device: "auto".to_string(),
            demucs_segment: None,
            separation_timeout_secs: 1800,
            keep_input: false,
            job_ttl_hours: 24,
            cleanup_interval_secs: 600,
            storage: StorageConfig::default(),
            allowed_origins: vec!["*".to_string()],
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            host: env::var("HOST").unwrap_or(default.host),

            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.port),

            // Container images mount a volume at /app
            output_dir: env::var("OUTPUT_DIR").map(PathBuf::from).unwrap_or_else(|_| {
                let app_dir = PathBuf::from("/app");
                if app_dir.is_dir() {
                    app_dir.join("outputs")
                } else {
                    default.output_dir
                }
            }),

            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            allowed_extensions: env::var("ALLOWED_EXTENSIONS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().trim_start_matches('.').to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|v| !v.is_empty())
                .unwrap_or(default.allowed_extensions),

            separation_mode: env::var("SEPARATION_MODE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.separation_mode),

            separator_type: env::var("SEPARATOR").unwrap_or(default.separator_type),

            demucs_python: env::var("DEMUCS_PYTHON").unwrap_or(default.demucs_python),

            demucs_model: env::var("DEMUCS_MODEL").unwrap_or(default.demucs_model),

            demucs_device: env::var("DEMUCS_DEVICE").unwrap_or(default.demucs_device),

            demucs_segment: env::var("DEMUCS_SEGMENT")
                .ok()
                .and_then(|v| v.parse().ok()),

            separation_timeout_secs: env::var("SEPARATION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.separation_timeout_secs),

            keep_input: env::var("KEEP_INPUT")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.keep_input),

            job_ttl_hours: env::var("JOB_TTL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.job_ttl_hours),

            cleanup_interval_secs: env::var("CLEANUP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default.cleanup_interval_secs),

            storage: StorageConfig::from_env(),

            allowed_origins: env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(default.allowed_origins),
        }
    }

    /// Config for local development and tests: no GPU, no object storage, synchronous jobs
    pub fn development() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            separator_type: "silent".to_string(),
            separation_timeout_secs: 60,
            job_ttl_hours: 0,
            ..Self::default()
        }
    }

    pub fn ttl(&self) -> Option<chrono::Duration> {
        if self.job_ttl_hours == 0 {
            None
        } else {
            Some(chrono::Duration::hours(self.job_ttl_hours as i64))
        }
    }
}
