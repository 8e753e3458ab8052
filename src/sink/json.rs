use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use tracing::info;

use super::ReportSink;
use crate::pipeline::Report;

/// Writes the report as JSON to a file, or to stdout when no path is set.
pub struct JsonReportSink {
    path: Option<PathBuf>,
    pretty: bool,
}

impl JsonReportSink {
    pub fn new(path: Option<PathBuf>, pretty: bool) -> Self {
        Self { path, pretty }
    }

    fn serialize<W: Write>(&self, writer: W, report: &Report) -> io::Result<()> {
        let result = if self.pretty {
            serde_json::to_writer_pretty(writer, report)
        } else {
            serde_json::to_writer(writer, report)
        };
        result.map_err(io::Error::from)
    }
}

impl ReportSink for JsonReportSink {
    fn write(&self, report: &Report) -> io::Result<()> {
        match &self.path {
            Some(path) => {
                let file = File::create(path)?;
                let mut writer = BufWriter::new(file);
                self.serialize(&mut writer, report)?;
                writer.flush()?;
                info!(path = %path.display(), "report written");
            }
            None => {
                let stdout = io::stdout();
                let mut writer = stdout.lock();
                self.serialize(&mut writer, report)?;
                writeln!(writer)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pipeline::record::FrameRecord;

    fn sample_report() -> Report {
        Report {
            video: None,
            records: vec![FrameRecord::finalized(0, 0, Duration::ZERO, None, None)],
            truncated: false,
            truncation_cause: None,
            frames_sampled: 1,
            frames_deduped: 0,
            transcript: Some("hello".into()),
            summary: None,
        }
    }

    #[test]
    fn writes_parseable_json_to_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let sink = JsonReportSink::new(Some(path.clone()), true);
        sink.write(&sample_report()).unwrap();

        let raw = std::fs::read_to_string(path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["frames_sampled"], 1);
        assert_eq!(value["records"][0]["status"]["PartialFailure"], "Both");
        assert_eq!(value["transcript"], "hello");
    }

    #[test]
    fn timestamps_serialize_as_seconds() {
        let report = Report {
            records: vec![FrameRecord::finalized(
                0,
                3,
                Duration::from_millis(1500),
                None,
                None,
            )],
            ..sample_report()
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["records"][0]["timestamp"], 1.5);
    }
}
