pub mod json;

use crate::pipeline::Report;

pub use json::JsonReportSink;

/// Destination for a finished report. Implementations are thin adapters;
/// everything interesting happened before the report reaches them.
pub trait ReportSink {
    fn write(&self, report: &Report) -> std::io::Result<()>;
}
