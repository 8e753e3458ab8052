use tracing::trace;

use crate::source::{Frame, PerceptualHash};

/// Drops frames perceptually near-identical to the last kept frame.
///
/// A frame survives when nothing has been kept yet, or when the Hamming
/// distance between its hash and the last kept hash is at or above the
/// threshold. Distance exactly at the threshold keeps the frame: losing
/// distinct content costs more than analyzing a near-duplicate.
pub struct FrameDeduplicator {
    threshold: u32,
    last_kept: Option<PerceptualHash>,
}

impl FrameDeduplicator {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            last_kept: None,
        }
    }

    /// Decides whether `frame` survives. Depends only on the sequence of
    /// hashes seen so far, nothing else.
    pub fn next(&mut self, frame: &Frame) -> bool {
        let hash = frame.meta.hash;
        let keep = match self.last_kept {
            None => true,
            Some(last) => {
                let distance = hash.distance(last);
                trace!(frame = frame.meta.index, distance, "dedup distance");
                distance >= self.threshold
            }
        };
        if keep {
            self.last_kept = Some(hash);
        }
        keep
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn frame(index: u64, hash: u64) -> Frame {
        Frame::new(
            index,
            Duration::from_secs(index),
            8,
            8,
            PerceptualHash(hash),
            Bytes::from_static(b"px"),
        )
    }

    fn survivors(threshold: u32, hashes: &[u64]) -> Vec<u64> {
        let mut dedup = FrameDeduplicator::new(threshold);
        hashes
            .iter()
            .enumerate()
            .filter(|(i, &h)| dedup.next(&frame(*i as u64, h)))
            .map(|(i, _)| i as u64)
            .collect()
    }

    #[test]
    fn first_frame_is_always_kept() {
        assert_eq!(survivors(10, &[0]), vec![0]);
    }

    #[test]
    fn near_duplicates_are_dropped() {
        // One flipped bit against the last kept hash.
        assert_eq!(survivors(10, &[0, 1, 0b11, 0]), vec![0]);
    }

    #[test]
    fn distance_at_threshold_keeps_the_frame() {
        let four_bits = 0b1111u64;
        assert_eq!(survivors(4, &[0, four_bits]), vec![0, 1]);
        assert_eq!(survivors(5, &[0, four_bits]), vec![0]);
    }

    #[test]
    fn comparison_is_against_last_kept_not_last_seen() {
        // Second frame is dropped, so the third is measured against the
        // first: distance 4 passes even though it is 2 from the dropped one.
        assert_eq!(survivors(4, &[0, 0b11, 0b1111]), vec![0, 2]);
    }

    #[test]
    fn decision_is_deterministic() {
        let hashes = [0u64, 7, u64::MAX, u64::MAX ^ 0xff, 0, 3];
        assert_eq!(survivors(10, &hashes), survivors(10, &hashes));
    }

    #[test]
    fn kept_sequence_survives_a_second_pass_unchanged() {
        let hashes = [0u64, 1, 0xf0f0, 0xf0f1, u64::MAX, u64::MAX ^ 0b111];
        let kept: Vec<u64> = {
            let mut dedup = FrameDeduplicator::new(8);
            hashes
                .iter()
                .filter(|&&h| dedup.next(&frame(0, h)))
                .copied()
                .collect()
        };
        // Every kept frame was >= threshold from its predecessor, so a fresh
        // pass over just the kept hashes keeps all of them.
        let mut dedup = FrameDeduplicator::new(8);
        let rekept = kept.iter().filter(|&&h| dedup.next(&frame(0, h))).count();
        assert_eq!(rekept, kept.len());
    }
}
