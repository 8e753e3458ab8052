use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::Serialize;

use super::DecodeError;

/// Sampled frame with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Encoded JPEG bytes - can be shared across tasks without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub index: u64,
    pub timestamp: Duration,
    pub width: u32,
    pub height: u32,
    pub hash: PerceptualHash,
}

impl Frame {
    /// Builds a frame from encoded JPEG bytes, computing its perceptual hash.
    pub fn from_jpeg(index: u64, timestamp: Duration, data: Bytes) -> Result<Self, DecodeError> {
        let img = image::load_from_memory(&data)
            .map_err(|source| DecodeError::BadFrame { index, source })?;
        Ok(Self::new(
            index,
            timestamp,
            img.width(),
            img.height(),
            PerceptualHash::of(&img),
            data,
        ))
    }

    pub fn new(
        index: u64,
        timestamp: Duration,
        width: u32,
        height: u32,
        hash: PerceptualHash,
        data: Bytes,
    ) -> Self {
        Self {
            data,
            meta: Arc::new(FrameMetadata {
                index,
                timestamp,
                width,
                height,
                hash,
            }),
        }
    }
}

/// 64-bit mean hash: visually similar frames land within a few bits of each other
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    /// Downsamples to an 8x8 luma grid and sets one bit per cell above the grid mean.
    pub fn of(img: &DynamicImage) -> Self {
        let gray = img.resize_exact(8, 8, FilterType::Triangle).to_luma8();
        let sum: u32 = gray.pixels().map(|p| p.0[0] as u32).sum();
        let mean = sum / 64;

        let mut hash = 0u64;
        for (i, p) in gray.pixels().enumerate() {
            if p.0[0] as u32 > mean {
                hash |= 1 << i;
            }
        }
        Self(hash)
    }

    pub fn distance(self, other: PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

/// Run-level facts about the input, probed before sampling starts
#[derive(Debug, Clone, Serialize)]
pub struct VideoMetadata {
    #[serde(with = "secs_f64")]
    pub duration: Duration,
    pub width: u32,
    pub height: u32,
    pub container: String,
}

/// Serializes a `Duration` as fractional seconds.
pub(crate) mod secs_f64 {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
