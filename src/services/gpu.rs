use serde::Serialize;
use std::time::Duration;
use tokio::process::Command;
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct GpuInfo {
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_free_mb: u64,
    pub utilization_percent: Option<u32>,
}

/// Queries `nvidia-smi` for the visible GPUs. Returns an empty list when the
/// tool is missing, fails, or takes longer than a few seconds.
pub async fn detect_gpus() -> Vec<GpuInfo> {
    let query = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,memory.free,utilization.gpu",
            "--format=csv,noheader,nounits",
        ])
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(Duration::from_secs(5), query).await {
        Ok(Ok(output)) if output.status.success() => {
            parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(Ok(output)) => {
            tracing::debug!(
                "nvidia-smi failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Vec::new()
        }
        Ok(Err(e)) => {
            tracing::debug!("nvidia-smi not available: {}", e);
            Vec::new()
        }
        Err(_) => {
            tracing::warn!("nvidia-smi timed out");
            Vec::new()
        }
    }
}

/// Parses `name, total, free, utilization` CSV rows.
pub fn parse_nvidia_smi(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 3 || fields[0].is_empty() {
                return None;
            }
            Some(GpuInfo {
                name: fields[0].to_string(),
                memory_total_mb: fields[1].parse().ok()?,
                memory_free_mb: fields[2].parse().ok()?,
                // "[N/A]" on some virtualized GPUs
                utilization_percent: fields.get(3).and_then(|v| v.parse().ok()),
            })
        })
        .collect()
}
