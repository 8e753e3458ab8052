use std::process::Stdio;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{BoundingBox, OcrError, OcrResult, TextExtractor, TextSpan};
use crate::source::Frame;
use crate::OcrConfig;

/// Wraps the tesseract CLI. Frames are decoded to grayscale PNG in a scratch
/// file and the engine's TSV output is parsed into word-level spans.
pub struct TesseractExtractor {
    bin: String,
    langs: String,
}

impl TesseractExtractor {
    pub fn new(cfg: &OcrConfig) -> Self {
        Self {
            bin: cfg.tesseract_path.clone(),
            langs: cfg.language_hints.join("+"),
        }
    }

    /// Checks the engine binary is reachable before a run starts.
    pub fn verify(&self) -> Result<(), OcrError> {
        which::which(&self.bin).map_err(|source| OcrError::Missing {
            tool: self.bin.clone(),
            source,
        })?;
        Ok(())
    }
}

#[async_trait]
impl TextExtractor for TesseractExtractor {
    #[instrument(skip(self, frame), fields(frame = frame.meta.index))]
    async fn extract(&self, frame: &Frame) -> Result<OcrResult, OcrError> {
        let data = frame.data.clone();
        let input = tokio::task::spawn_blocking(move || stage_input(&data))
            .await
            .map_err(|_| OcrError::Worker)??;

        let output = Command::new(&self.bin)
            .arg(input.path())
            .arg("stdout")
            .args(["-l", &self.langs, "tsv"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(OcrError::Spawn)?;

        if !output.status.success() {
            return Err(OcrError::Engine {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let spans = parse_spans(&String::from_utf8_lossy(&output.stdout));
        debug!(frame = frame.meta.index, spans = spans.len(), "ocr complete");
        Ok(OcrResult {
            frame_index: frame.meta.index,
            spans,
        })
    }
}

/// Decodes the frame and writes a grayscale PNG for the engine. The engine
/// reads text off luminance, so color is dropped up front.
fn stage_input(data: &[u8]) -> Result<NamedTempFile, OcrError> {
    let gray = image::load_from_memory(data)
        .map_err(OcrError::BadImage)?
        .to_luma8();
    let tmp = tempfile::Builder::new()
        .prefix("argus-ocr-")
        .suffix(".png")
        .tempfile()
        .map_err(OcrError::Io)?;
    gray.save(tmp.path()).map_err(OcrError::BadImage)?;
    Ok(tmp)
}

/// Parses tesseract TSV: one word per row, columns
/// `level page block par line word left top width height conf text`.
fn parse_spans(tsv: &str) -> Vec<TextSpan> {
    let mut spans = Vec::new();
    for line in tsv.lines().skip(1) {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() != 12 {
            continue;
        }
        let Ok(conf) = cols[10].parse::<f32>() else {
            continue;
        };
        // Structural rows (page/block/line) carry conf -1 and no text.
        if conf < 0.0 {
            continue;
        }
        let text = cols[11].trim();
        if text.is_empty() {
            continue;
        }
        let Some(bbox) = parse_bbox(&cols[6..10]) else {
            continue;
        };
        spans.push(TextSpan {
            text: text.to_string(),
            bbox,
            confidence: (conf / 100.0).clamp(0.0, 1.0),
        });
    }
    spans
}

fn parse_bbox(cols: &[&str]) -> Option<BoundingBox> {
    Some(BoundingBox {
        x: cols[0].parse().ok()?,
        y: cols[1].parse().ok()?,
        width: cols[2].parse().ok()?,
        height: cols[3].parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn parses_word_rows_only() {
        let tsv = format!(
            "{HEADER}\n\
             1\t1\t0\t0\t0\t0\t0\t0\t640\t480\t-1\t\n\
             5\t1\t1\t1\t1\t1\t10\t20\t80\t24\t96.5\tHello\n\
             5\t1\t1\t1\t1\t2\t100\t20\t90\t24\t88.0\tworld\n"
        );
        let spans = parse_spans(&tsv);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].text, "Hello");
        assert_eq!(
            spans[0].bbox,
            BoundingBox {
                x: 10,
                y: 20,
                width: 80,
                height: 24
            }
        );
        assert!((spans[0].confidence - 0.965).abs() < 1e-6);
        assert_eq!(spans[1].text, "world");
    }

    #[test]
    fn skips_blank_and_malformed_rows() {
        let tsv = format!(
            "{HEADER}\n\
             5\t1\t1\t1\t1\t1\t10\t20\t80\t24\t95.0\t   \n\
             5\t1\t1\t1\t1\t2\t10\t20\t80\t24\tnot-a-number\tx\n\
             garbage line without tabs\n\
             5\t1\t1\t1\t1\t3\tNaNx\t20\t80\t24\t90.0\tok\n"
        );
        assert!(parse_spans(&tsv).is_empty());
    }

    #[test]
    fn clamps_confidence_into_unit_range() {
        let tsv = format!("{HEADER}\n5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t101.0\thigh\n");
        let spans = parse_spans(&tsv);
        assert_eq!(spans[0].confidence, 1.0);
    }

    #[test]
    fn empty_output_yields_no_spans() {
        assert!(parse_spans("").is_empty());
        assert!(parse_spans(HEADER).is_empty());
    }

    #[test]
    fn joined_text_flattens_spans() {
        let tsv = format!(
            "{HEADER}\n\
             5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t90\tSTART\n\
             5\t1\t1\t1\t1\t2\t12\t0\t10\t10\t90\tHERE\n"
        );
        let result = OcrResult {
            frame_index: 0,
            spans: parse_spans(&tsv),
        };
        assert_eq!(result.joined_text(), "START HERE");
    }
}
