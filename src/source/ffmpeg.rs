use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use super::frame::Frame;
use super::{DecodeError, FrameSource};
use crate::SourceConfig;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on buffered decoder stderr.
const STDERR_CAP: u64 = 16 * 1024;

/// Streams sampled frames out of a single decoder process.
///
/// One ffmpeg run emits an MJPEG stream on stdout at the configured sampling
/// rate; frames are split on JPEG end-of-image markers and hashed as they
/// arrive. The OS pipe provides backpressure: the decoder stalls once the
/// reader stops pulling.
pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    stderr_drain: Option<JoinHandle<Vec<u8>>>,
    buf: Vec<u8>,
    scan: usize,
    index: u64,
    interval_secs: f64,
    max_frames: Option<u64>,
    finished: bool,
}

impl FfmpegSource {
    pub fn open(path: &Path, cfg: &SourceConfig) -> Result<Self, DecodeError> {
        if !(cfg.sample_interval_secs > 0.0) {
            return Err(DecodeError::InvalidInterval(cfg.sample_interval_secs));
        }

        let mut cmd = Command::new(&cfg.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "error"])
            .arg("-i")
            .arg(path)
            .arg("-vf")
            .arg(format!("fps=1/{}", cfg.sample_interval_secs));
        if let Some(max) = cfg.max_frames {
            cmd.arg("-frames:v").arg(max.to_string());
        }
        cmd.args(["-f", "image2pipe", "-vcodec", "mjpeg", "-q:v"])
            .arg(cfg.jpeg_quality.to_string())
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| DecodeError::Spawn {
            tool: "ffmpeg",
            source,
        })?;
        let stdout = child.stdout.take().ok_or_else(|| DecodeError::Spawn {
            tool: "ffmpeg",
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdout not captured"),
        })?;
        let stderr_drain = child.stderr.take().map(|err| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = err.take(STDERR_CAP).read_to_end(&mut buf).await;
                buf
            })
        });

        info!(video = %path.display(), interval_secs = cfg.sample_interval_secs, "decoder started");
        Ok(Self {
            child,
            stdout,
            stderr_drain,
            buf: Vec::with_capacity(64 * 1024),
            scan: 0,
            index: 0,
            interval_secs: cfg.sample_interval_secs,
            max_frames: cfg.max_frames,
            finished: false,
        })
    }

    async fn drained_stderr(&mut self) -> String {
        match self.stderr_drain.take() {
            Some(handle) => {
                let raw = handle.await.unwrap_or_default();
                String::from_utf8_lossy(&raw).trim().to_string()
            }
            None => String::new(),
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    #[instrument(skip(self))]
    async fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        if self.finished {
            return Ok(None);
        }
        if let Some(max) = self.max_frames {
            if self.index >= max {
                self.finished = true;
                let _ = self.child.start_kill();
                return Ok(None);
            }
        }

        loop {
            if let Some(end) = find_eoi(&self.buf, self.scan) {
                let jpeg: Vec<u8> = self.buf.drain(..end + 2).collect();
                self.scan = 0;
                if !jpeg.starts_with(&SOI) {
                    self.finished = true;
                    return Err(DecodeError::MalformedStream { index: self.index });
                }
                let timestamp =
                    Duration::from_secs_f64(self.interval_secs * self.index as f64);
                let frame = Frame::from_jpeg(self.index, timestamp, Bytes::from(jpeg))?;
                self.index += 1;
                debug!(frame = frame.meta.index, bytes = frame.data.len(), "decoded frame");
                return Ok(Some(frame));
            }

            // Keep one byte of overlap so a marker split across reads is still found.
            self.scan = self.buf.len().saturating_sub(1);
            let read = self.stdout.read_buf(&mut self.buf).await?;
            if read == 0 {
                self.finished = true;
                if !self.buf.is_empty() {
                    return Err(DecodeError::TruncatedStream);
                }
                let status = self.child.wait().await?;
                if status.success() {
                    info!(frames = self.index, "decoder finished");
                    return Ok(None);
                }
                let stderr = self.drained_stderr().await;
                return Err(DecodeError::Engine {
                    tool: "ffmpeg",
                    status,
                    stderr,
                });
            }
        }
    }
}

/// Finds the JPEG end-of-image marker at or after `from`.
fn find_eoi(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < 2 || from + 1 >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == EOI)
        .map(|p| from + p)
}
