//! Argus video analysis pipeline

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use argus::analysis::OpenAiAnalyzer;
use argus::ocr::TesseractExtractor;
use argus::pipeline::{with_retries, Backoff, Orchestrator, RetryPolicy};
use argus::sink::{JsonReportSink, ReportSink};
use argus::source::{self, FfmpegSource};
use argus::{Config, Secret};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "argus=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Argus launching...");

    // Load configuration: defaults, then optional TOML, then ARGUS__ env
    let mut args = std::env::args_os().skip(1);
    let video: PathBuf = args
        .next()
        .map(Into::into)
        .ok_or_else(|| eyre!("usage: argus <video> [config.toml]"))?;
    let config_path: Option<PathBuf> = args.next().map(Into::into);

    let mut config = Config::load(config_path.as_deref())?;
    if config.analysis.api_key.is_none() {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.analysis.api_key = Some(Secret::from(key));
        }
    }
    argus::CONFIG.store(Arc::new(config.clone()));

    // Verify external tools before any work starts
    source::ensure_tools(&config.source)?;
    let extractor = TesseractExtractor::new(&config.ocr);
    extractor.verify()?;
    let analyzer = Arc::new(OpenAiAnalyzer::new(&config.analysis)?);

    // Probe stream metadata; a probe failure degrades, not aborts
    let video_meta = match source::probe(&video, &config.source).await {
        Ok(meta) => Some(meta),
        Err(err) => {
            warn!(error = %err, "probe failed, continuing without stream metadata");
            None
        }
    };

    // Ctrl-C flips the cancellation watch; the pipeline drains gracefully
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, winding down");
            let _ = cancel_tx.send(true);
        }
    });

    // Run the pipeline
    let frames = FfmpegSource::open(&video, &config.source)?;
    let orchestrator = Orchestrator::new(Arc::new(extractor), Arc::clone(&analyzer), &config);
    let mut report = orchestrator.run(frames, cancel_rx).await?;
    report.video = video_meta;

    // Optional audio transcript; failures degrade to a report without one
    if config.analysis.transcribe_audio {
        report.transcript = transcribe(&analyzer, &video, &config).await;
    }

    // Optional run summary over the settled records
    if config.analysis.summarize && !report.records.is_empty() {
        let policy = RetryPolicy {
            max_attempts: config.analysis.max_attempts.max(1),
            backoff: Backoff::exponential(Duration::from_millis(config.analysis.backoff_base_ms)),
            call_timeout: Duration::from_secs(config.analysis.call_timeout_secs),
        };
        let summary = with_retries(&policy, || {
            analyzer.summarize(&report.records, report.transcript.as_deref())
        })
        .await;
        match summary {
            Ok(summary) => report.summary = Some(summary),
            Err(err) => warn!(error = %err, "summary failed, shipping report without one"),
        }
    }

    // Ship the report
    let sink = JsonReportSink::new(config.report.path.clone(), config.report.pretty);
    sink.write(&report)?;

    info!("Argus shutting down");
    Ok(())
}

/// Pulls the audio track into a temp wav and transcribes it. Every failure
/// here degrades to `None`; the frame records stand on their own.
async fn transcribe(analyzer: &OpenAiAnalyzer, video: &Path, config: &Config) -> Option<String> {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => {
            warn!(error = %err, "no temp dir for audio extraction");
            return None;
        }
    };
    let wav = match source::extract_audio(video, dir.path(), &config.source).await {
        Ok(path) => path,
        Err(err) => {
            warn!(error = %err, "audio extraction failed, skipping transcript");
            return None;
        }
    };
    match analyzer.transcribe(&wav).await {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => None,
        Err(err) => {
            warn!(error = %err, "transcription failed, skipping transcript");
            None
        }
    }
}
