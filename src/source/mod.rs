pub mod audio;
pub mod ffmpeg;
pub mod frame;
pub mod probe;

use async_trait::async_trait;
use thiserror::Error;

pub use audio::extract_audio;
pub use ffmpeg::FfmpegSource;
pub use frame::{Frame, FrameMetadata, PerceptualHash, VideoMetadata};
pub use probe::probe;

/// Ordered frame producer. Implementations wrap the external decoder;
/// `Ok(None)` marks a clean end of stream.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError>;
}

/// Run-fatal failures of the decoder boundary.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    Engine {
        tool: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("{tool} not found on PATH")]
    Missing {
        tool: String,
        #[source]
        source: which::Error,
    },
    #[error("video stream ended mid-frame")]
    TruncatedStream,
    #[error("decoder emitted malformed data before frame {index}")]
    MalformedStream { index: u64 },
    #[error("frame {index} is not a decodable image")]
    BadFrame {
        index: u64,
        #[source]
        source: image::ImageError,
    },
    #[error("sample interval must be positive, got {0}")]
    InvalidInterval(f64),
    #[error("could not parse probe output")]
    Probe(#[from] serde_json::Error),
    #[error("i/o error reading decoder output")]
    Io(#[from] std::io::Error),
}

/// Verifies the external decoder binaries are reachable before a run starts.
pub fn ensure_tools(cfg: &crate::SourceConfig) -> Result<(), DecodeError> {
    for tool in [&cfg.ffmpeg_path, &cfg.ffprobe_path] {
        which::which(tool).map_err(|source| DecodeError::Missing {
            tool: tool.clone(),
            source,
        })?;
    }
    Ok(())
}
