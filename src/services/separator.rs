use crate::config::ServiceConfig;
use crate::models::Stem;
use anyhow::{Context, Result, anyhow, bail};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// A stem written by a separator into the job directory.
#[derive(Debug, Clone)]
pub struct SeparatedStem {
    pub stem: Stem,
    pub path: PathBuf,
}

/// Wrapper around the source-separation model
#[async_trait::async_trait]
pub trait StemSeparator: Send + Sync {
    /// Separates `input` and writes `<stem>.wav` into `output_dir` for every requested stem.
    async fn separate(
        &self,
        input: &Path,
        stems: &[Stem],
        output_dir: &Path,
    ) -> Result<Vec<SeparatedStem>>;

    fn model_name(&self) -> &str;

    fn device(&self) -> &str;

    /// Stems this model can produce
    fn supported_stems(&self) -> &[Stem];

    /// Check if the model runtime is available
    async fn health_check(&self) -> bool;
}

/// Runs Demucs through its command-line entry point.
pub struct DemucsSeparator {
    python: String,
    model: String,
    device: String,
    segment: Option<u32>,
    timeout: Duration,
}

impl DemucsSeparator {
    pub fn new(
        python: impl Into<String>,
        model: impl Into<String>,
        device: impl Into<String>,
        segment: Option<u32>,
        timeout: Duration,
    ) -> Self {
        Self {
            python: python.into(),
            model: model.into(),
            device: device.into(),
            segment,
            timeout,
        }
    }

    /// Builds the separator from config, resolving `auto` to `cuda` when a GPU is visible.
    pub async fn from_config(config: &ServiceConfig) -> Self {
        let device = match config.demucs_device.to_lowercase().as_str() {
            "auto" | "" => {
                if crate::services::gpu::detect_gpus().await.is_empty() {
                    "cpu".to_string()
                } else {
                    "cuda".to_string()
                }
            }
            other => other.to_string(),
        };

        Self::new(
            config.demucs_python.clone(),
            config.demucs_model.clone(),
            device,
            config.demucs_segment,
            Duration::from_secs(config.separation_timeout_secs),
        )
    }

    pub fn command_args(&self, input: &Path, work_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-m".into(),
            "demucs.separate".into(),
            "-n".into(),
            self.model.clone().into(),
            "-d".into(),
            self.device.clone().into(),
            "-o".into(),
            work_dir.as_os_str().to_owned(),
        ];
        if let Some(segment) = self.segment {
            args.push("--segment".into());
            args.push(segment.to_string().into());
        }
        args.push(input.as_os_str().to_owned());
        args
    }

    /// Demucs writes `<out>/<model>/<track>/<stem>.wav`; fall back to the first
    /// track directory it produced if the names don't line up.
    async fn locate_track_dir(&self, work_dir: &Path, input: &Path) -> Result<PathBuf> {
        let model_dir = work_dir.join(&self.model);
        if let Some(track) = input.file_stem() {
            let expected = model_dir.join(track);
            if expected.is_dir() {
                return Ok(expected);
            }
        }

        if let Some(dir) = first_subdir(&model_dir).await {
            return Ok(dir);
        }

        // Some demucs versions name the folder after the model signature
        if let Some(any_model) = first_subdir(work_dir).await {
            if let Some(dir) = first_subdir(&any_model).await {
                return Ok(dir);
            }
        }

        Err(anyhow!("No Demucs output found in {}", work_dir.display()))
    }
}

async fn first_subdir(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            return Some(entry.path());
        }
    }
    None
}

/// Keeps the last few lines of stderr for error reports.
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}

#[async_trait::async_trait]
impl StemSeparator for DemucsSeparator {
    async fn separate(
        &self,
        input: &Path,
        stems: &[Stem],
        output_dir: &Path,
    ) -> Result<Vec<SeparatedStem>> {
        // Same filesystem as the job directory so results can be renamed in place
        let work_dir = tempfile::Builder::new()
            .prefix(".demucs-")
            .tempdir_in(output_dir)
            .context("Failed to create Demucs work directory")?;

        tracing::info!(
            "🎛️  Running Demucs model={} device={} stems={:?} input={}",
            self.model,
            self.device,
            stems,
            input.display()
        );

        let child = Command::new(&self.python)
            .args(self.command_args(input, work_dir.path()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start '{}'", self.python))?;

        let started = std::time::Instant::now();
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res.context("Failed to wait for Demucs")?,
            Err(_) => bail!("Demucs timed out after {}s", self.timeout.as_secs()),
        };

        if !output.status.success() {
            bail!(
                "Demucs exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            );
        }

        tracing::info!("Demucs finished in {:?}", started.elapsed());

        let track_dir = self.locate_track_dir(work_dir.path(), input).await?;
        let mut results = Vec::with_capacity(stems.len());

        for stem in stems {
            let src = track_dir.join(stem.file_name());
            if !src.is_file() {
                bail!("Demucs did not produce the '{}' stem", stem);
            }

            let dest = output_dir.join(stem.file_name());
            tokio::fs::rename(&src, &dest)
                .await
                .with_context(|| format!("Failed to move {} into job directory", src.display()))?;

            results.push(SeparatedStem {
                stem: *stem,
                path: dest,
            });
        }

        Ok(results)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn device(&self) -> &str {
        &self.device
    }

    fn supported_stems(&self) -> &[Stem] {
        Stem::for_model(&self.model)
    }

    async fn health_check(&self) -> bool {
        let check = Command::new(&self.python)
            .args(["-c", "import demucs"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        matches!(
            tokio::time::timeout(Duration::from_secs(30), check).await,
            Ok(Ok(status)) if status.success()
        )
    }
}

/// Writes short silent stems without running a model, for development and tests.
pub struct SilentSeparator {
    model: String,
    duration_ms: u32,
}

impl SilentSeparator {
    pub const SAMPLE_RATE: u32 = 44_100;

    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            duration_ms: 1000,
        }
    }

    fn write_silence(path: &Path, duration_ms: u32) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: Self::SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let frames = Self::SAMPLE_RATE as u64 * duration_ms as u64 / 1000;
        let mut writer = hound::WavWriter::create(path, spec)?;
        for _ in 0..frames * spec.channels as u64 {
            writer.write_sample(0i16)?;
        }
        writer.finalize()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StemSeparator for SilentSeparator {
    async fn separate(
        &self,
        input: &Path,
        stems: &[Stem],
        output_dir: &Path,
    ) -> Result<Vec<SeparatedStem>> {
        tracing::warn!(
            "SilentSeparator: skipping model inference for {} (development mode)",
            input.display()
        );

        let output_dir = output_dir.to_path_buf();
        let stems = stems.to_vec();
        let duration_ms = self.duration_ms;

        tokio::task::spawn_blocking(move || {
            stems
                .into_iter()
                .map(|stem| {
                    let path = output_dir.join(stem.file_name());
                    Self::write_silence(&path, duration_ms)?;
                    Ok(SeparatedStem { stem, path })
                })
                .collect::<Result<Vec<_>>>()
        })
        .await?
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn device(&self) -> &str {
        "none"
    }

    fn supported_stems(&self) -> &[Stem] {
        Stem::for_model(&self.model)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Factory function to create the separator named in the config
pub async fn create_separator(config: &ServiceConfig) -> Box<dyn StemSeparator> {
    match config.separator_type.to_lowercase().as_str() {
        "demucs" => Box::new(DemucsSeparator::from_config(config).await),
        "silent" | "noop" | "none" => Box::new(SilentSeparator::new(config.demucs_model.clone())),
        other => {
            tracing::warn!("Unknown separator type '{}', using Demucs", other);
            Box::new(DemucsSeparator::from_config(config).await)
        }
    }
}
