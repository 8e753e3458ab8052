//! Coordinates the frame pipeline: admission under a concurrency bound,
//! per-frame OCR and analysis with retries, ordered emission, cancellation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use super::aggregate::{self, ConsistencyError, RunTotals};
use super::dedup::FrameDeduplicator;
use super::record::{FrameRecord, Report, SkipReason};
use super::retry::{total_call_cap, Backoff, RetryPolicy};
use crate::analysis::{AnalysisError, AnalysisResult, FrameAnalyzer, RateGate};
use crate::ocr::{OcrError, OcrResult, TextExtractor};
use crate::source::{DecodeError, Frame, FrameSource};
use crate::Config;

/// Run-level failures. Per-frame failures never surface here; they degrade
/// the frame's record instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
}

/// Stage machinery shared by every in-flight frame task
struct StageCtx<X, A> {
    extractor: Arc<X>,
    analyzer: Arc<A>,
    gate: RateGate,
    ocr: RetryPolicy,
    analysis: RetryPolicy,
    feed_ocr_context: bool,
}

/// One settled frame coming back from a worker task
struct TaskOutcome {
    record: FrameRecord,
    fatal_analysis: bool,
}

/// How the admission loop ended
#[derive(Clone, Copy)]
enum WindDown {
    Drained,
    Cancelled,
    FatalAbort,
}

pub struct Orchestrator<X, A> {
    ctx: Arc<StageCtx<X, A>>,
    dedup: FrameDeduplicator,
    in_flight_limit: usize,
    queue_depth: usize,
    cancel_grace: Duration,
    fatal_aborts_run: bool,
    record_tap: Option<mpsc::Sender<FrameRecord>>,
}

impl<X, A> Orchestrator<X, A>
where
    X: TextExtractor + 'static,
    A: FrameAnalyzer + 'static,
{
    pub fn new(extractor: Arc<X>, analyzer: Arc<A>, config: &Config) -> Self {
        Self {
            ctx: Arc::new(StageCtx {
                extractor,
                analyzer,
                gate: RateGate::new(config.analysis.max_concurrency),
                ocr: RetryPolicy {
                    max_attempts: config.ocr.max_attempts.max(1),
                    backoff: Backoff::fixed(Duration::from_millis(config.ocr.retry_delay_ms)),
                    call_timeout: Duration::from_secs(config.ocr.call_timeout_secs),
                },
                analysis: RetryPolicy {
                    max_attempts: config.analysis.max_attempts.max(1),
                    backoff: Backoff::exponential(Duration::from_millis(
                        config.analysis.backoff_base_ms,
                    )),
                    call_timeout: Duration::from_secs(config.analysis.call_timeout_secs),
                },
                feed_ocr_context: config.analysis.feed_ocr_context,
            }),
            dedup: FrameDeduplicator::new(config.dedup.hamming_threshold),
            in_flight_limit: config.pipeline.in_flight_limit.max(1),
            queue_depth: config.pipeline.queue_depth.max(1),
            cancel_grace: Duration::from_millis(config.pipeline.cancel_grace_ms),
            fatal_aborts_run: config.analysis.fatal_aborts_run,
            record_tap: None,
        }
    }

    /// Streams each record to `tap` the moment it settles, ahead of the
    /// ordered report. Sends are best-effort: a full or closed tap misses
    /// the copy, never stalls the pipeline.
    pub fn with_record_tap(mut self, tap: mpsc::Sender<FrameRecord>) -> Self {
        self.record_tap = Some(tap);
        self
    }

    /// Runs the pipeline until the source drains, cancellation lands, or a
    /// fatal failure aborts the run. Always yields a report when the
    /// bookkeeping holds; stage failures degrade their records and an early
    /// end is flagged as truncation, not hidden.
    #[instrument(skip_all)]
    pub async fn run<S>(
        mut self,
        source: S,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Report, PipelineError>
    where
        S: FrameSource + 'static,
    {
        let (frame_tx, frame_rx) = flume::bounded(self.queue_depth);
        let feed = tokio::spawn(feed_frames(source, frame_tx));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TaskOutcome>();

        let mut state = RunState::new(self.record_tap.take());
        let mut intake_open = true;
        let mut watch_cancel = true;

        let wind_down = loop {
            if !intake_open && state.in_flight.is_empty() {
                break WindDown::Drained;
            }
            tokio::select! {
                biased;

                changed = cancel.changed(), if watch_cancel => {
                    match changed {
                        Ok(()) => {
                            if *cancel.borrow_and_update() {
                                info!("cancellation requested");
                                break WindDown::Cancelled;
                            }
                        }
                        Err(_) => watch_cancel = false,
                    }
                }

                Some(outcome) = done_rx.recv(), if !state.in_flight.is_empty() => {
                    let fatal = outcome.fatal_analysis;
                    state.settle(outcome);
                    if fatal && self.fatal_aborts_run {
                        warn!("fatal analysis failure, aborting run");
                        break WindDown::FatalAbort;
                    }
                }

                received = frame_rx.recv_async(), if intake_open && state.in_flight.len() < self.in_flight_limit => {
                    match received {
                        Ok(Ok(frame)) => {
                            state.sampled += 1;
                            counter!("frames_sampled").increment(1);
                            if self.dedup.next(&frame) {
                                state.spawn_frame(frame, &self.ctx, &done_tx);
                            } else {
                                state.deduped += 1;
                                counter!("frames_deduped").increment(1);
                                debug!(frame = frame.meta.index, "dropped near-duplicate frame");
                            }
                        }
                        Ok(Err(err)) => {
                            warn!(error = %err, "source failed, finishing admitted frames");
                            state.truncated = true;
                            state.truncation_cause = Some(err.to_string());
                            intake_open = false;
                        }
                        Err(_) => intake_open = false,
                    }
                }
            }
        };

        feed.abort();
        drop(frame_rx);

        if let WindDown::Cancelled | WindDown::FatalAbort = wind_down {
            let reason = match wind_down {
                WindDown::Cancelled => SkipReason::Cancelled,
                _ => SkipReason::Aborted,
            };
            state.truncated = true;
            if state.truncation_cause.is_none() {
                state.truncation_cause = Some(match reason {
                    SkipReason::Cancelled => "run cancelled".to_string(),
                    SkipReason::Aborted => "fatal analysis failure".to_string(),
                });
            }
            let deadline = Instant::now() + self.cancel_grace;
            while !state.in_flight.is_empty() {
                match timeout_at(deadline, done_rx.recv()).await {
                    Ok(Some(outcome)) => state.settle(outcome),
                    Ok(None) | Err(_) => break,
                }
            }
            if !state.in_flight.is_empty() {
                warn!(
                    abandoned = state.in_flight.len(),
                    "grace period expired, recording skipped frames"
                );
                state.abandon_in_flight(reason);
            }
        }

        state.tasks.abort_all();
        let report = aggregate::finalize(
            state.emitter.into_records(),
            RunTotals {
                frames_sampled: state.sampled,
                frames_deduped: state.deduped,
                truncated: state.truncated,
                truncation_cause: state.truncation_cause.take(),
            },
        )?;
        info!(
            records = report.records.len(),
            truncated = report.truncated,
            "pipeline finished"
        );
        Ok(report)
    }
}

/// Mutable run bookkeeping owned by the admission loop
struct RunState {
    in_flight: HashMap<u64, PendingFrame>,
    tasks: JoinSet<()>,
    emitter: OrderedEmitter,
    next_ordinal: u64,
    sampled: u64,
    deduped: u64,
    truncated: bool,
    truncation_cause: Option<String>,
}

struct PendingFrame {
    frame_index: u64,
    timestamp: Duration,
}

impl RunState {
    fn new(tap: Option<mpsc::Sender<FrameRecord>>) -> Self {
        Self {
            in_flight: HashMap::new(),
            tasks: JoinSet::new(),
            emitter: OrderedEmitter::new(tap),
            next_ordinal: 0,
            sampled: 0,
            deduped: 0,
            truncated: false,
            truncation_cause: None,
        }
    }

    fn spawn_frame<X, A>(
        &mut self,
        frame: Frame,
        ctx: &Arc<StageCtx<X, A>>,
        done: &mpsc::UnboundedSender<TaskOutcome>,
    ) where
        X: TextExtractor + 'static,
        A: FrameAnalyzer + 'static,
    {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.in_flight.insert(
            ordinal,
            PendingFrame {
                frame_index: frame.meta.index,
                timestamp: frame.meta.timestamp,
            },
        );
        debug!(frame = frame.meta.index, ordinal, "frame submitted");
        self.tasks
            .spawn(process_frame(ordinal, frame, Arc::clone(ctx), done.clone()));
    }

    fn settle(&mut self, outcome: TaskOutcome) {
        self.in_flight.remove(&outcome.record.ordinal);
        counter!("frames_finalized").increment(1);
        self.emitter.push(outcome.record);
        while self.tasks.try_join_next().is_some() {}
    }

    /// Synthesizes `Skipped` records for frames still in flight so the
    /// ordinal sequence stays gap-free.
    fn abandon_in_flight(&mut self, reason: SkipReason) {
        let mut left: Vec<(u64, PendingFrame)> = self.in_flight.drain().collect();
        left.sort_by_key(|(ordinal, _)| *ordinal);
        for (ordinal, pending) in left {
            self.emitter.push(FrameRecord::skipped(
                ordinal,
                pending.frame_index,
                pending.timestamp,
                reason,
            ));
        }
    }
}

/// Holds settled records until their predecessors settle, so the report
/// comes out in admission order no matter the completion order.
struct OrderedEmitter {
    next: u64,
    pending: BTreeMap<u64, FrameRecord>,
    ordered: Vec<FrameRecord>,
    tap: Option<mpsc::Sender<FrameRecord>>,
}

impl OrderedEmitter {
    fn new(tap: Option<mpsc::Sender<FrameRecord>>) -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
            ordered: Vec::new(),
            tap,
        }
    }

    fn push(&mut self, record: FrameRecord) {
        if let Some(tap) = &self.tap {
            let _ = tap.try_send(record.clone());
        }
        self.pending.insert(record.ordinal, record);
        while let Some(record) = self.pending.remove(&self.next) {
            self.next += 1;
            self.ordered.push(record);
        }
    }

    fn into_records(mut self) -> Vec<FrameRecord> {
        self.ordered.extend(self.pending.into_values());
        self.ordered
    }
}

/// Pulls frames from the source into the bounded queue. Either side ending
/// ends the feed; the orchestrator dropping the receiver stops the pull.
async fn feed_frames<S: FrameSource>(mut source: S, tx: flume::Sender<Result<Frame, DecodeError>>) {
    loop {
        match source.next_frame().await {
            Ok(Some(frame)) => {
                if tx.send_async(Ok(frame)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = tx.send_async(Err(err)).await;
                break;
            }
        }
    }
}

#[instrument(skip_all, fields(frame = frame.meta.index))]
async fn process_frame<X, A>(
    ordinal: u64,
    frame: Frame,
    ctx: Arc<StageCtx<X, A>>,
    done: mpsc::UnboundedSender<TaskOutcome>,
) where
    X: TextExtractor,
    A: FrameAnalyzer,
{
    let started = Instant::now();
    let (ocr, analysis) = if ctx.feed_ocr_context {
        let ocr = run_ocr(&ctx, &frame).await;
        let context = ocr
            .as_ref()
            .ok()
            .map(|result| result.joined_text())
            .filter(|text| !text.is_empty());
        let analysis = run_analysis(&ctx, &frame, context.as_deref()).await;
        (ocr, analysis)
    } else {
        tokio::join!(run_ocr(&ctx, &frame), run_analysis(&ctx, &frame, None))
    };
    histogram!("frame_settle_ms").record(started.elapsed().as_secs_f64() * 1000.0);

    if let Err(err) = &ocr {
        warn!(error = %err, "ocr failed for frame");
    }
    let fatal_analysis = matches!(&analysis, Err(AnalysisError::Fatal { .. }));
    if let Err(err) = &analysis {
        warn!(error = %err, "analysis failed for frame");
    }

    let record = FrameRecord::finalized(
        ordinal,
        frame.meta.index,
        frame.meta.timestamp,
        ocr.ok(),
        analysis.ok(),
    );
    // Receiver gone means the run is tearing down; nothing left to report.
    let _ = done.send(TaskOutcome {
        record,
        fatal_analysis,
    });
}

async fn run_ocr<X: TextExtractor, A>(
    ctx: &StageCtx<X, A>,
    frame: &Frame,
) -> Result<OcrResult, OcrError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let started = Instant::now();
        let err = match timeout(ctx.ocr.call_timeout, ctx.extractor.extract(frame)).await {
            Ok(Ok(result)) => {
                histogram!("ocr_time_ms").record(started.elapsed().as_secs_f64() * 1000.0);
                return Ok(result);
            }
            Ok(Err(err)) => err,
            Err(_) => OcrError::Timeout,
        };
        if attempt >= ctx.ocr.max_attempts {
            return Err(err);
        }
        counter!("ocr_retries").increment(1);
        debug!(attempt, error = %err, "ocr attempt failed, retrying");
        sleep(ctx.ocr.backoff.delay(attempt)).await;
    }
}

async fn run_analysis<X, A: FrameAnalyzer>(
    ctx: &StageCtx<X, A>,
    frame: &Frame,
    ocr_context: Option<&str>,
) -> Result<AnalysisResult, AnalysisError> {
    let mut attempt = 0u32;
    let mut calls = 0u32;
    let cap = total_call_cap(ctx.analysis.max_attempts);
    loop {
        let permit = ctx.gate.admit().await?;
        calls += 1;
        let started = Instant::now();
        let outcome = timeout(
            ctx.analysis.call_timeout,
            ctx.analyzer.analyze(frame, ocr_context),
        )
        .await;
        drop(permit);
        let err = match outcome {
            Ok(Ok(result)) => {
                histogram!("analysis_time_ms").record(started.elapsed().as_secs_f64() * 1000.0);
                return Ok(result);
            }
            Ok(Err(err)) => err,
            Err(elapsed) => AnalysisError::transient(elapsed),
        };
        match err {
            AnalysisError::RateLimited { retry_after } => {
                // Compliance, not failure: pause new submissions run-wide and
                // keep the frame. Only the hard call cap bounds this path.
                if calls >= cap {
                    return Err(AnalysisError::RateLimited { retry_after });
                }
                warn!(
                    pause_ms = retry_after.as_millis() as u64,
                    "analysis rate limited, pausing submissions"
                );
                counter!("analysis_rate_limited").increment(1);
                ctx.gate.suspend(retry_after).await;
            }
            AnalysisError::Fatal { .. } => return Err(err),
            AnalysisError::Transient { .. } => {
                attempt += 1;
                if attempt >= ctx.analysis.max_attempts || calls >= cap {
                    return Err(err);
                }
                counter!("analysis_retries").increment(1);
                let delay = ctx.analysis.backoff.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "analysis attempt failed, retrying");
                sleep(delay).await;
            }
        }
    }
}
