//! Active quality probing through ffprobe

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::debug;

use super::StreamMetrics;
use crate::config::EngineConfig;
use crate::errors::{ProbeError, ProbeResult};
use crate::utils::UrlUtils;

/// Measures a stream's video properties
#[async_trait]
pub trait QualityProbe: Send + Sync {
    async fn probe(&self, stream_url: &str) -> ProbeResult<StreamMetrics>;
}

/// Runs ffprobe against the stream, limited by its own semaphore so quality
/// probes never eat into the liveness probe budget
pub struct FfprobeQualityProbe {
    ffprobe_command: String,
    probe_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl FfprobeQualityProbe {
    pub fn new(ffprobe_command: impl Into<String>, probe_timeout: Duration, max_concurrent: usize) -> Self {
        Self {
            ffprobe_command: ffprobe_command.into(),
            probe_timeout,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.ffprobe_command.clone(),
            config.quality_probe_timeout,
            config.max_concurrent_quality_probes,
        )
    }

    async fn run(&self, stream_url: &str) -> ProbeResult<StreamMetrics> {
        let mut cmd = Command::new(&self.ffprobe_command);
        cmd.args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=codec_name,width,height,bit_rate,r_frame_rate:format=bit_rate",
            "-analyzeduration",
            "5000000",
            "-probesize",
            "5000000",
            stream_url,
        ]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.probe_timeout, cmd.output())
            .await
            .map_err(|_| ProbeError::Timeout {
                timeout: self.probe_timeout,
            })?
            .map_err(|e| ProbeError::Analysis {
                message: format!("failed to execute ffprobe: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Analysis {
                message: format!(
                    "ffprobe exited with {:?}: {}",
                    output.status.code(),
                    stderr.trim()
                ),
            });
        }

        let data: serde_json::Value =
            serde_json::from_slice(&output.stdout).map_err(|e| ProbeError::Analysis {
                message: format!("failed to parse ffprobe output: {e}"),
            })?;

        parse_metrics(&data)
    }
}

#[async_trait]
impl QualityProbe for FfprobeQualityProbe {
    async fn probe(&self, stream_url: &str) -> ProbeResult<StreamMetrics> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ProbeError::Analysis {
                message: format!("quality probe pool closed: {e}"),
            })?;

        let safe_url = UrlUtils::obfuscate_credentials(stream_url);
        debug!("Probing stream quality: {}", safe_url);

        let metrics = self.run(stream_url).await?;
        debug!(
            "Probed {}: {:?}x{:?} {:?}kbps codec={:?}",
            safe_url, metrics.width, metrics.height, metrics.bitrate_kbps, metrics.codec
        );
        Ok(metrics)
    }
}

/// Extract the first video stream's figures from ffprobe JSON output
pub fn parse_metrics(data: &serde_json::Value) -> ProbeResult<StreamMetrics> {
    let stream = data
        .get("streams")
        .and_then(|v| v.as_array())
        .and_then(|streams| streams.first())
        .ok_or_else(|| ProbeError::Analysis {
            message: "no video stream reported".to_string(),
        })?;

    let bits_per_second = |value: Option<&serde_json::Value>| {
        value
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u64>().ok())
            .map(|bps| (bps / 1000) as u32)
    };

    let bitrate_kbps = bits_per_second(stream.get("bit_rate"))
        .or_else(|| bits_per_second(data.get("format").and_then(|f| f.get("bit_rate"))));

    let fps = stream
        .get("r_frame_rate")
        .and_then(|v| v.as_str())
        .and_then(parse_frame_rate);

    Ok(StreamMetrics {
        width: stream.get("width").and_then(|v| v.as_u64()).map(|v| v as u32),
        height: stream.get("height").and_then(|v| v.as_u64()).map(|v| v as u32),
        bitrate_kbps,
        codec: stream
            .get("codec_name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        fps,
    })
}

/// `"50/1"` or `"30000/1001"` to frames per second
fn parse_frame_rate(rate: &str) -> Option<f32> {
    let (num, den) = rate.split_once('/')?;
    let num: f32 = num.trim().parse().ok()?;
    let den: f32 = den.trim().parse().ok()?;
    (den > 0.0).then(|| num / den)
}
