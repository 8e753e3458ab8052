pub mod tesseract;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::source::Frame;

pub use tesseract::TesseractExtractor;

/// Text extraction capability over a decoded frame. Implementations wrap the
/// external OCR engine; test stubs swap in at construction time.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, frame: &Frame) -> Result<OcrResult, OcrError>;
}

/// On-screen text found in one frame. An empty `spans` list means the engine
/// ran and found nothing, which is distinct from an extraction failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OcrResult {
    pub frame_index: u64,
    pub spans: Vec<TextSpan>,
}

impl OcrResult {
    /// Flattens the spans into one whitespace-joined string.
    pub fn joined_text(&self) -> String {
        self.spans
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextSpan {
    pub text: String,
    pub bbox: BoundingBox,
    /// Engine confidence normalized to [0, 1].
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Per-frame OCR failures; retried with fixed backoff before the frame is
/// marked partially failed.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("failed to spawn ocr engine: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("ocr engine exited with {status}: {stderr}")]
    Engine {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("{tool} not found on PATH")]
    Missing {
        tool: String,
        #[source]
        source: which::Error,
    },
    #[error("frame is not a decodable image")]
    BadImage(#[source] image::ImageError),
    #[error("ocr call timed out")]
    Timeout,
    #[error("ocr worker task failed")]
    Worker,
    #[error("i/o error staging ocr input")]
    Io(#[source] std::io::Error),
}
