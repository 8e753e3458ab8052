pub mod analysis;
pub mod ocr;
pub mod pipeline;
pub mod sink;
pub mod source;

use std::fmt;
use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub dedup: DedupConfig,
    pub ocr: OcrConfig,
    pub analysis: AnalysisConfig,
    pub pipeline: PipelineConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Seconds of video between sampled frames.
    pub sample_interval_secs: f64,
    pub max_frames: Option<u64>,
    pub jpeg_quality: u8, // mjpeg -q:v scale, 2 is near-lossless
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Hamming distance below which a frame counts as a near-duplicate.
    pub hamming_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    pub tesseract_path: String,
    pub language_hints: Vec<String>,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<Secret>,
    pub api_base: Option<String>,
    pub model: String,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub call_timeout_secs: u64,
    /// Concurrent analysis submissions; also the pause point for rate limits.
    pub max_concurrency: usize,
    /// Run OCR first and hand its text to the analyzer, at the cost of
    /// serializing the two stages per frame.
    pub feed_ocr_context: bool,
    /// Treat one fatal analysis failure as the end of the run.
    pub fatal_aborts_run: bool,
    pub transcribe_audio: bool,
    pub summarize: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Frames admitted but not yet settled, across both stages.
    pub in_flight_limit: usize,
    pub queue_depth: usize,
    pub cancel_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Where the JSON report lands; stdout when unset.
    pub path: Option<PathBuf>,
    pub pretty: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig {
                ffmpeg_path: "ffmpeg".into(),
                ffprobe_path: "ffprobe".into(),
                sample_interval_secs: 1.0,
                max_frames: None,
                jpeg_quality: 2,
            },
            dedup: DedupConfig {
                hamming_threshold: 10,
            },
            ocr: OcrConfig {
                tesseract_path: "tesseract".into(),
                language_hints: vec!["eng".into()],
                max_attempts: 3,
                retry_delay_ms: 250,
                call_timeout_secs: 30,
            },
            analysis: AnalysisConfig {
                api_key: None,
                api_base: None,
                model: "gpt-4o".into(),
                max_attempts: 3,
                backoff_base_ms: 500,
                call_timeout_secs: 60,
                max_concurrency: 4,
                feed_ocr_context: false,
                fatal_aborts_run: false,
                transcribe_audio: true,
                summarize: true,
            },
            pipeline: PipelineConfig {
                in_flight_limit: 4,
                queue_depth: 8,
                cancel_grace_ms: 2000,
            },
            report: ReportConfig {
                path: None,
                pretty: true,
            },
        }
    }
}

impl Config {
    /// Layered load: built-in defaults, then an optional TOML file, then
    /// `ARGUS__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix("ARGUS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

/// Credential wrapper that stays out of logs and serialized output
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(redacted)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}
