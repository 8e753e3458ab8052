use std::time::Duration;

use serde::Serialize;

use crate::analysis::{AnalysisResult, RunSummary};
use crate::ocr::OcrResult;
use crate::source::VideoMetadata;

/// Pipeline stage named by a partial failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Ocr,
    Analysis,
    Both,
}

/// Why an admitted frame never settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    Cancelled,
    Aborted,
}

/// Final outcome of one surviving frame. `PartialFailure` means a stage
/// exhausted its retries; an empty OCR or analysis result is still
/// `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameStatus {
    Complete,
    PartialFailure(Stage),
    Skipped(SkipReason),
}

/// Aggregate OCR and analysis outcome for one surviving frame
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    /// Dense 0-based position in the surviving-frame sequence, assigned at
    /// admission. The emission buffer and the final contiguity check key on
    /// this, since the next surviving source index is unknowable ahead.
    pub ordinal: u64,
    /// Position in the sampled sequence; gaps where dedup dropped frames.
    pub frame_index: u64,
    #[serde(with = "crate::source::frame::secs_f64")]
    pub timestamp: Duration,
    pub ocr: Option<OcrResult>,
    pub analysis: Option<AnalysisResult>,
    pub status: FrameStatus,
}

impl FrameRecord {
    /// Builds the record for a settled frame, deriving its status from which
    /// stages produced a result.
    pub fn finalized(
        ordinal: u64,
        frame_index: u64,
        timestamp: Duration,
        ocr: Option<OcrResult>,
        analysis: Option<AnalysisResult>,
    ) -> Self {
        let status = match (&ocr, &analysis) {
            (Some(_), Some(_)) => FrameStatus::Complete,
            (None, Some(_)) => FrameStatus::PartialFailure(Stage::Ocr),
            (Some(_), None) => FrameStatus::PartialFailure(Stage::Analysis),
            (None, None) => FrameStatus::PartialFailure(Stage::Both),
        };
        Self {
            ordinal,
            frame_index,
            timestamp,
            ocr,
            analysis,
            status,
        }
    }

    /// Record for a frame abandoned before its stages settled.
    pub fn skipped(ordinal: u64, frame_index: u64, timestamp: Duration, reason: SkipReason) -> Self {
        Self {
            ordinal,
            frame_index,
            timestamp,
            ocr: None,
            analysis: None,
            status: FrameStatus::Skipped(reason),
        }
    }
}

/// Time-ordered outcome of one run
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub video: Option<VideoMetadata>,
    /// Exactly one record per surviving frame, ascending by frame index.
    pub records: Vec<FrameRecord>,
    /// True when the run ended before the source was exhausted.
    pub truncated: bool,
    pub truncation_cause: Option<String>,
    pub frames_sampled: u64,
    pub frames_deduped: u64,
    pub transcript: Option<String>,
    pub summary: Option<RunSummary>,
}
