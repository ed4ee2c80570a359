use crate::config::ClassifierConfig;
use crate::frame::Frame;
use image::imageops::FilterType;
use ndarray::{s, Array3, Array4};
use serde::Deserialize;
use std::time::SystemTime;
use thiserror::Error;

/// Numeric range handed to the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// Pixels scaled to [0, 1].
    #[default]
    Unit,
    /// Pixels kept in the byte range [0, 255].
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    #[default]
    Nhwc,
    Nchw,
}

#[derive(Error, Debug, PartialEq)]
pub enum PreprocessError {
    #[error("Frame {sequence} is empty ({width}x{height})")]
    EmptyFrame {
        sequence: u64,
        width: u32,
        height: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMeta {
    pub sequence: u64,
    pub captured_at: SystemTime,
}

/// Exactly `batch_size` preprocessed frames, in push order. Consumed by a
/// single `classify` call.
#[derive(Debug)]
pub struct Batch {
    tensor: Array4<f32>,
    frames: Vec<FrameMeta>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[FrameMeta] {
        &self.frames
    }

    pub fn tensor(&self) -> &Array4<f32> {
        &self.tensor
    }
}

pub struct FrameBatcher {
    batch_size: usize,
    width: u32,
    height: u32,
    normalization: Normalization,
    layout: TensorLayout,
    pending: Vec<(FrameMeta, Array3<f32>)>,
}

impl FrameBatcher {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            width: config.input_width,
            height: config.input_height,
            normalization: config.normalization,
            layout: config.layout,
            pending: Vec::with_capacity(config.batch_size.max(1)),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Preprocesses `frame` and buffers it. Returns the batch once it is
    /// full. A frame that fails preprocessing leaves the buffer untouched.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Batch>, PreprocessError> {
        let pixels = self.preprocess(&frame)?;
        let meta = FrameMeta {
            sequence: frame.sequence(),
            captured_at: frame.captured_at(),
        };
        self.pending.push((meta, pixels));

        if self.pending.len() < self.batch_size {
            return Ok(None);
        }
        Ok(Some(self.assemble()))
    }

    /// Resized HWC pixels in the configured range.
    fn preprocess(&self, frame: &Frame) -> Result<Array3<f32>, PreprocessError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(PreprocessError::EmptyFrame {
                sequence: frame.sequence(),
                width: frame.width(),
                height: frame.height(),
            });
        }

        let resized = frame
            .image()
            .resize_exact(self.width, self.height, FilterType::Triangle)
            .to_rgb32f();
        let scale = match self.normalization {
            Normalization::Unit => 1.0,
            Normalization::Raw => 255.0,
        };

        Ok(Array3::from_shape_fn(
            (self.height as usize, self.width as usize, 3),
            |(y, x, c)| resized.get_pixel(x as u32, y as u32)[c] * scale,
        ))
    }

    fn assemble(&mut self) -> Batch {
        let (h, w) = (self.height as usize, self.width as usize);
        let shape = match self.layout {
            TensorLayout::Nhwc => (self.pending.len(), h, w, 3),
            TensorLayout::Nchw => (self.pending.len(), 3, h, w),
        };
        let mut tensor = Array4::<f32>::zeros(shape);
        let mut frames = Vec::with_capacity(self.pending.len());

        for (i, (meta, pixels)) in self.pending.drain(..).enumerate() {
            let mut slot = tensor.slice_mut(s![i, .., .., ..]);
            match self.layout {
                TensorLayout::Nhwc => slot.assign(&pixels),
                TensorLayout::Nchw => slot.assign(&pixels.view().permuted_axes([2, 0, 1])),
            }
            frames.push(meta);
        }

        Batch { tensor, frames }
    }
}
