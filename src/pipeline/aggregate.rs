use thiserror::Error;

use super::record::{FrameRecord, Report};

/// Run counters carried from the orchestrator into the final merge
#[derive(Debug, Default)]
pub struct RunTotals {
    pub frames_sampled: u64,
    pub frames_deduped: u64,
    pub truncated: bool,
    pub truncation_cause: Option<String>,
}

/// The orchestrator's bookkeeping broke an invariant. Surfaced as a run
/// failure instead of shipping a silently wrong report.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("duplicate record for ordinal {ordinal}")]
    Duplicate { ordinal: u64 },
    #[error("gap in record ordinals: expected {expected}, found {found}")]
    Gap { expected: u64, found: u64 },
    #[error("frame indices not increasing at ordinal {ordinal}")]
    NonMonotonic { ordinal: u64 },
}

/// Merges settled records into a report, validating that the surviving-frame
/// sequence is contiguous and its source indices increase.
pub fn finalize(mut records: Vec<FrameRecord>, totals: RunTotals) -> Result<Report, ConsistencyError> {
    records.sort_by_key(|record| record.ordinal);
    let mut last_frame_index: Option<u64> = None;
    for (position, record) in records.iter().enumerate() {
        let expected = position as u64;
        if record.ordinal < expected {
            return Err(ConsistencyError::Duplicate {
                ordinal: record.ordinal,
            });
        }
        if record.ordinal > expected {
            return Err(ConsistencyError::Gap {
                expected,
                found: record.ordinal,
            });
        }
        if let Some(prev) = last_frame_index {
            if record.frame_index <= prev {
                return Err(ConsistencyError::NonMonotonic {
                    ordinal: record.ordinal,
                });
            }
        }
        last_frame_index = Some(record.frame_index);
    }
    Ok(Report {
        video: None,
        records,
        truncated: totals.truncated,
        truncation_cause: totals.truncation_cause,
        frames_sampled: totals.frames_sampled,
        frames_deduped: totals.frames_deduped,
        transcript: None,
        summary: None,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn record(ordinal: u64, frame_index: u64) -> FrameRecord {
        FrameRecord::finalized(
            ordinal,
            frame_index,
            Duration::from_secs(frame_index),
            None,
            None,
        )
    }

    #[test]
    fn contiguous_records_pass_and_sort() {
        let report = finalize(
            vec![record(2, 5), record(0, 1), record(1, 3)],
            RunTotals {
                frames_sampled: 6,
                frames_deduped: 3,
                ..Default::default()
            },
        )
        .unwrap();
        let indices: Vec<u64> = report.records.iter().map(|r| r.frame_index).collect();
        assert_eq!(indices, vec![1, 3, 5]);
        assert_eq!(report.frames_sampled, 6);
        assert_eq!(report.frames_deduped, 3);
        assert!(!report.truncated);
    }

    #[test]
    fn empty_run_is_valid() {
        let report = finalize(Vec::new(), RunTotals::default()).unwrap();
        assert!(report.records.is_empty());
    }

    #[test]
    fn missing_ordinal_is_a_gap() {
        let err = finalize(vec![record(0, 0), record(2, 2)], RunTotals::default()).unwrap_err();
        assert_eq!(err, ConsistencyError::Gap { expected: 1, found: 2 });
    }

    #[test]
    fn repeated_ordinal_is_a_duplicate() {
        let err = finalize(
            vec![record(0, 0), record(1, 1), record(1, 2)],
            RunTotals::default(),
        )
        .unwrap_err();
        assert_eq!(err, ConsistencyError::Duplicate { ordinal: 1 });
    }

    #[test]
    fn frame_indices_must_increase() {
        let err = finalize(vec![record(0, 4), record(1, 2)], RunTotals::default()).unwrap_err();
        assert_eq!(err, ConsistencyError::NonMonotonic { ordinal: 1 });
    }

    #[test]
    fn truncation_cause_is_carried_through() {
        let report = finalize(
            vec![record(0, 0)],
            RunTotals {
                frames_sampled: 1,
                truncated: true,
                truncation_cause: Some("stream ended early".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(report.truncated);
        assert_eq!(report.truncation_cause.as_deref(), Some("stream ended early"));
    }
}
