pub mod gate;
pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::Frame;

pub use gate::RateGate;
pub use openai::OpenAiAnalyzer;

/// Semantic analysis capability over a sampled frame. Implementations wrap
/// the remote reasoning service; test stubs swap in at construction time.
#[async_trait]
pub trait FrameAnalyzer: Send + Sync {
    /// Describes one frame, optionally with text already recognized on screen.
    async fn analyze(
        &self,
        frame: &Frame,
        ocr_context: Option<&str>,
    ) -> Result<AnalysisResult, AnalysisError>;
}

/// Structured semantic description of one frame
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub frame_index: u64,
    pub description: String,
    pub labels: Vec<String>,
    /// Wall-clock latency of the successful remote call.
    #[serde(with = "crate::source::frame::secs_f64")]
    pub raw_latency: Duration,
}

/// Run-level summary produced after aggregation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub overview: String,
    #[serde(default)]
    pub key_moments: Vec<String>,
    #[serde(default)]
    pub mood: String,
}

/// Failure classes of the remote analysis boundary. The class decides the
/// retry treatment: `RateLimited` pauses new submissions, `Transient` is
/// retried with exponential backoff, `Fatal` is never retried.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("transient analysis failure: {source}")]
    Transient {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("fatal analysis failure: {reason}")]
    Fatal { reason: String },
}

impl AnalysisError {
    pub fn transient<E>(source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Transient {
            source: source.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}
