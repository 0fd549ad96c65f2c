//! Tracked-frame sources.
//!
//! The detector and tracker run outside this crate. A source hands the
//! pipeline one frame at a time, in stream order: its person detections with
//! stable tracker ids and, when available, the decoded pixels for snapshot
//! crops. `None` from `next_frame` means end of stream.

use anyhow::Result;
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::Detection;

pub mod jsonl;

pub use jsonl::JsonLinesSource;

#[derive(Clone, Debug)]
pub struct TrackedFrame {
    pub index: u64,
    /// Frame pixels; `None` when the producer did not supply them.
    pub image: Option<Arc<RgbImage>>,
    pub detections: Vec<Detection>,
}

impl TrackedFrame {
    pub fn new(index: u64, detections: Vec<Detection>) -> Self {
        Self {
            index,
            image: None,
            detections,
        }
    }

    pub fn with_image(mut self, image: RgbImage) -> Self {
        self.image = Some(Arc::new(image));
        self
    }
}

pub trait DetectionSource {
    /// Blocks until the next frame is available.
    fn next_frame(&mut self) -> Result<Option<TrackedFrame>>;
}

/// Replays frames held in memory.
#[derive(Debug, Default)]
pub struct VecSource {
    frames: VecDeque<TrackedFrame>,
}

impl VecSource {
    pub fn new(frames: Vec<TrackedFrame>) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

impl DetectionSource for VecSource {
    fn next_frame(&mut self) -> Result<Option<TrackedFrame>> {
        Ok(self.frames.pop_front())
    }
}
