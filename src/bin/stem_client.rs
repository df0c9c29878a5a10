use anyhow::{Context, Result, bail};
use clap::Parser;
use reqwest::{Client, StatusCode, multipart};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Exercise a running stem separation service", long_about = None)]
struct Args {
    /// Service base URL
    #[arg(long, default_value = "http://localhost:8000")]
    url: String,

    /// Audio file to upload
    #[arg(long)]
    audio: Option<PathBuf>,

    /// Comma separated stems, e.g. "vocals,drums"
    #[arg(long)]
    stems: Option<String>,

    /// Generate a short test tone and upload it
    #[arg(long)]
    create_test: bool,

    /// Number of simultaneous uploads, to observe GPU contention
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Where downloaded stems are written
    #[arg(long, default_value = "downloads")]
    out: PathBuf,

    /// Delete jobs and generated files afterwards
    #[arg(long)]
    cleanup: bool,

    /// Give up polling a background job after this many seconds
    #[arg(long, default_value_t = 1800)]
    poll_timeout: u64,
}

const TEST_AUDIO: &str = "test_audio.wav";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stem_client=info".into()),
        )
        .init();

    let args = Args::parse();
    let base_url = args.url.trim_end_matches('/').to_string();
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(60 * 60))
        .build()?;

    check_health(&client, &base_url).await;

    let audio = if args.create_test {
        let path = PathBuf::from(TEST_AUDIO);
        write_test_tone(&path, 5.0)?;
        info!("✓ Created test audio: {}", path.display());
        Some(path)
    } else {
        args.audio.clone()
    };

    let Some(audio) = audio else {
        info!("No audio file given, health check only");
        return Ok(());
    };
    if !audio.is_file() {
        bail!("Audio file not found: {}", audio.display());
    }

    let runs = (0..args.concurrency.max(1)).map(|i| {
        let client = client.clone();
        let base_url = base_url.clone();
        let audio = audio.clone();
        let args = &args;
        async move {
            let started = Instant::now();
            let result = run_once(&client, &base_url, &audio, args, i).await;
            (i, started.elapsed(), result)
        }
    });

    let mut failures = 0;
    for (i, elapsed, result) in futures::future::join_all(runs).await {
        match result {
            Ok(job_id) => info!("✓ Request {} finished job {} in {:?}", i, job_id, elapsed),
            Err(e) => {
                failures += 1;
                error!("✗ Request {} failed after {:?}: {:#}", i, elapsed, e);
            }
        }
    }

    if args.cleanup && args.create_test {
        let _ = tokio::fs::remove_file(TEST_AUDIO).await;
    }

    if failures > 0 {
        bail!("{} of {} requests failed", failures, args.concurrency.max(1));
    }
    Ok(())
}

async fn check_health(client: &Client, base_url: &str) {
    for path in ["/", "/health"] {
        match client.get(format!("{}{}", base_url, path)).send().await {
            Ok(resp) => {
                let status = resp.status();
                let body: Value = resp.json().await.unwrap_or(Value::Null);
                info!("✓ GET {}: {} {}", path, status, body);
            }
            Err(e) => warn!("✗ GET {} failed: {}", path, e),
        }
    }
}

async fn run_once(
    client: &Client,
    base_url: &str,
    audio: &Path,
    args: &Args,
    index: usize,
) -> Result<String> {
    let bytes = tokio::fs::read(audio)
        .await
        .with_context(|| format!("Failed to read {}", audio.display()))?;
    let filename = audio
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("audio.wav")
        .to_string();

    let mut form = multipart::Form::new().part(
        "file",
        multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str("application/octet-stream")?,
    );
    if let Some(stems) = &args.stems {
        form = form.text("stems", stems.clone());
    }

    info!("[{}] Uploading {}...", index, audio.display());
    let resp = client
        .post(format!("{}/separate", base_url))
        .multipart(form)
        .send()
        .await?;

    let status = resp.status();
    let body: Value = resp.json().await.context("Invalid JSON from /separate")?;
    if !status.is_success() {
        bail!("Separation failed with {}: {}", status, body["error"]);
    }

    let job_id = body["job_id"]
        .as_str()
        .context("Response is missing job_id")?
        .to_string();
    info!("[{}] Job {} accepted with status {}", index, job_id, body["status"]);

    let job = if status == StatusCode::ACCEPTED {
        poll_job(client, base_url, &job_id, Duration::from_secs(args.poll_timeout)).await?
    } else {
        fetch_job(client, base_url, &job_id).await?
    };

    let out_dir = args.out.join(&job_id);
    tokio::fs::create_dir_all(&out_dir).await?;

    if let Some(files) = job["output_files"].as_object() {
        for (stem, path) in files {
            let Some(path) = path.as_str() else { continue };
            let dest = out_dir.join(format!("{}.wav", stem));
            download(client, &format!("{}{}", base_url, path), &dest).await?;
            info!("[{}] ✓ Downloaded {} -> {}", index, stem, dest.display());
        }
    }

    if args.cleanup {
        let resp = client
            .delete(format!("{}/jobs/{}", base_url, job_id))
            .send()
            .await?;
        if resp.status().is_success() {
            info!("[{}] ✓ Job {} deleted", index, job_id);
        } else {
            warn!("[{}] ✗ Failed to delete job {}: {}", index, job_id, resp.status());
        }
        let _ = tokio::fs::remove_dir_all(&out_dir).await;
    }

    Ok(job_id)
}

async fn fetch_job(client: &Client, base_url: &str, job_id: &str) -> Result<Value> {
    let resp = client
        .get(format!("{}/jobs/{}", base_url, job_id))
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.json().await?)
}

async fn poll_job(client: &Client, base_url: &str, job_id: &str, timeout: Duration) -> Result<Value> {
    let started = Instant::now();
    loop {
        let job = fetch_job(client, base_url, job_id).await?;
        match job["status"].as_str() {
            Some("complete") => return Ok(job),
            Some("error") => bail!("Job {} failed: {}", job_id, job["error"]),
            _ => {}
        }
        if started.elapsed() > timeout {
            bail!("Timed out waiting for job {}", job_id);
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

async fn download(client: &Client, url: &str, dest: &Path) -> Result<()> {
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    let resp = client.get(url).send().await?.error_for_status()?;
    let tmp = dest.with_extension("part");
    let mut file = tokio::fs::File::create(&tmp).await?;

    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;

    tokio::fs::rename(&tmp, dest).await?;
    Ok(())
}

/// A stereo mix of three sines, enough for the model to have something to split.
fn write_test_tone(path: &Path, seconds: f32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;

    let total = (spec.sample_rate as f32 * seconds) as u32;
    for n in 0..total {
        let t = n as f32 / spec.sample_rate as f32;
        let v = 0.3 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
            + 0.2 * (2.0 * std::f32::consts::PI * 880.0 * t).sin()
            + 0.1 * (2.0 * std::f32::consts::PI * 220.0 * t).sin();
        let sample = (v / 0.6 * 0.8 * i16::MAX as f32) as i16;
        writer.write_sample(sample)?;
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}
