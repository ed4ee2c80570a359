use image::DynamicImage;
use std::time::{SystemTime, UNIX_EPOCH};

/// One captured image. Any pixel depth `image` can represent is accepted;
/// the batcher converts to RGB floats.
#[derive(Debug, Clone)]
pub struct Frame {
    sequence: u64,
    captured_at: SystemTime,
    image: DynamicImage,
}

impl Frame {
    pub fn new(sequence: u64, image: DynamicImage) -> Self {
        Self {
            sequence,
            captured_at: SystemTime::now(),
            image,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.captured_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}
