use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, instrument};

use super::DecodeError;
use crate::SourceConfig;

/// Extracts the audio track as mono 16 kHz WAV, the shape the transcription
/// endpoint expects. Fails with the decoder's stderr when the input has no
/// audio stream.
#[instrument(skip(cfg, work_dir))]
pub async fn extract_audio(
    path: &Path,
    work_dir: &Path,
    cfg: &SourceConfig,
) -> Result<PathBuf, DecodeError> {
    let out = work_dir.join("audio.wav");
    let output = Command::new(&cfg.ffmpeg_path)
        .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
        .arg(path)
        .args(["-vn", "-ac", "1", "-ar", "16000"])
        .arg(&out)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| DecodeError::Spawn {
            tool: "ffmpeg",
            source,
        })?;

    if !output.status.success() {
        return Err(DecodeError::Engine {
            tool: "ffmpeg",
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    info!(audio = %out.display(), "audio track extracted");
    Ok(out)
}
