use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, instrument};

use super::frame::VideoMetadata;
use super::DecodeError;
use crate::SourceConfig;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Reads container-level facts about the input before sampling starts.
#[instrument(skip(cfg))]
pub async fn probe(path: &Path, cfg: &SourceConfig) -> Result<VideoMetadata, DecodeError> {
    let output = Command::new(&cfg.ffprobe_path)
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| DecodeError::Spawn {
            tool: "ffprobe",
            source,
        })?;

    if !output.status.success() {
        return Err(DecodeError::Engine {
            tool: "ffprobe",
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let meta = parse_probe(&output.stdout)?;
    info!(
        duration_secs = meta.duration.as_secs_f64(),
        width = meta.width,
        height = meta.height,
        container = %meta.container,
        "probed input"
    );
    Ok(meta)
}

fn parse_probe(raw: &[u8]) -> Result<VideoMetadata, DecodeError> {
    let parsed: ProbeOutput = serde_json::from_slice(raw)?;

    let (duration, container) = match parsed.format {
        Some(f) => {
            let secs = f
                .duration
                .and_then(|d| d.parse::<f64>().ok())
                .filter(|d| d.is_finite() && *d >= 0.0)
                .unwrap_or(0.0);
            (
                Duration::from_secs_f64(secs),
                f.format_name.unwrap_or_default(),
            )
        }
        None => (Duration::ZERO, String::new()),
    };

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    Ok(VideoMetadata {
        duration,
        width: video.and_then(|s| s.width).unwrap_or(0),
        height: video.and_then(|s| s.height).unwrap_or(0),
        container,
    })
}
