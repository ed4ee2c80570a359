use crate::config::{CameraConfig, FrameSourceKind};
use crate::frame::Frame;
use async_trait::async_trait;
use image::{DynamicImage, RgbImage};
use rand::Rng;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to open camera: {0}")]
    OpenCameraFailed(String),
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(String),
    #[error("Failed to decode {path}: {source}")]
    DecodeFailed {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
}

/// A sequential image source. `Ok(None)` means the stream has ended.
///
/// `next_frame` must be cancel safe: a call dropped before completion must
/// not consume a frame.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;
}

pub fn build_frame_source(config: &CameraConfig) -> Result<Box<dyn FrameSource>, CameraError> {
    match config.source {
        FrameSourceKind::Synthetic => Ok(Box::new(SyntheticCamera::new(config))),
        FrameSourceKind::Directory => {
            let directory = config.directory.as_deref().ok_or_else(|| {
                CameraError::OpenCameraFailed("no frame directory configured".into())
            })?;
            Ok(Box::new(DirectoryFrameSource::open(directory)?))
        }
        #[cfg(feature = "opencv")]
        FrameSourceKind::Device => Ok(Box::new(device::DeviceCamera::open(config)?)),
        #[cfg(not(feature = "opencv"))]
        FrameSourceKind::Device => Err(CameraError::OpenCameraFailed(
            "device capture requires the `opencv` feature".into(),
        )),
    }
}

/// Random-noise frames paced at the configured frame rate.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    frame_delay: Duration,
    limit: Option<u64>,
    produced: u64,
}

impl SyntheticCamera {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            frame_delay: config.get_frame_delay(),
            limit: config.frame_limit,
            produced: 0,
        }
    }

    fn render(&self) -> RgbImage {
        let mut pixels = vec![0u8; self.width as usize * self.height as usize * 3];
        rand::rng().fill(&mut pixels[..]);
        RgbImage::from_raw(self.width, self.height, pixels)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }
}

#[async_trait]
impl FrameSource for SyntheticCamera {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(None);
        }
        sleep(self.frame_delay).await;
        let image = DynamicImage::ImageRgb8(self.render());
        self.produced += 1;
        Ok(Some(Frame::new(self.produced, image)))
    }
}

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "tiff"];

/// Replays the images of a directory in file-name order.
pub struct DirectoryFrameSource {
    files: VecDeque<PathBuf>,
    produced: u64,
}

impl DirectoryFrameSource {
    pub fn open(directory: &Path) -> Result<Self, CameraError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(directory)? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()));
            if is_image {
                files.push(path);
            }
        }
        files.sort();
        tracing::info!("Replaying {} frames from {:?}", files.len(), directory);

        Ok(Self {
            files: files.into(),
            produced: 0,
        })
    }
}

#[async_trait]
impl FrameSource for DirectoryFrameSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        let Some(path) = self.files.front().cloned() else {
            return Ok(None);
        };
        let image = tokio::task::spawn_blocking({
            let path = path.clone();
            move || image::open(path)
        })
        .await
        .map_err(|e| CameraError::ReadFrameFailed(e.to_string()))?
        .map_err(|source| CameraError::DecodeFailed { path, source })?;

        self.files.pop_front();
        self.produced += 1;
        Ok(Some(Frame::new(self.produced, image)))
    }
}

#[cfg(feature = "opencv")]
mod device {
    use super::{CameraError, FrameSource};
    use crate::config::CameraConfig;
    use crate::frame::Frame;
    use async_trait::async_trait;
    use image::{DynamicImage, RgbImage};
    use opencv::{core::Mat, imgproc, prelude::*, videoio};

    /// A V4L2/USB camera opened through OpenCV.
    pub struct DeviceCamera {
        capture: videoio::VideoCapture,
        produced: u64,
    }

    impl DeviceCamera {
        pub fn open(config: &CameraConfig) -> Result<Self, CameraError> {
            let mut capture = videoio::VideoCapture::new(config.device_index, videoio::CAP_ANY)
                .map_err(|e| CameraError::OpenCameraFailed(e.to_string()))?;
            if !capture.is_opened()? {
                return Err(CameraError::OpenCameraFailed(format!(
                    "device {} is not available",
                    config.device_index
                )));
            }
            capture.set(videoio::CAP_PROP_FRAME_WIDTH, config.width as f64)?;
            capture.set(videoio::CAP_PROP_FRAME_HEIGHT, config.height as f64)?;
            Ok(Self {
                capture,
                produced: 0,
            })
        }

        fn read(&mut self) -> Result<Option<RgbImage>, CameraError> {
            if !self.capture.is_opened()? {
                return Ok(None);
            }
            let mut frame = Mat::default();
            if !self.capture.read(&mut frame)? || frame.empty() {
                return Err(CameraError::ReadFrameFailed(
                    "device returned no frame".into(),
                ));
            }
            let mut rgb = Mat::default();
            imgproc::cvt_color_def(&frame, &mut rgb, imgproc::COLOR_BGR2RGB)?;
            let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
            let pixels = rgb.data_bytes()?.to_vec();
            RgbImage::from_raw(width, height, pixels)
                .map(Some)
                .ok_or_else(|| CameraError::ReadFrameFailed("unexpected frame layout".into()))
        }
    }

    #[async_trait]
    impl FrameSource for DeviceCamera {
        async fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
            let Some(image) = tokio::task::block_in_place(|| self.read())? else {
                return Ok(None);
            };
            self.produced += 1;
            Ok(Some(Frame::new(self.produced, DynamicImage::ImageRgb8(image))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn synthetic(limit: u64) -> CameraConfig {
        CameraConfig {
            width: 8,
            height: 6,
            fps: 1000,
            frame_limit: Some(limit),
            ..CameraConfig::default()
        }
    }

    #[tokio::test]
    async fn test_synthetic_camera_stops_at_limit() {
        let mut camera = SyntheticCamera::new(&synthetic(2));

        let first = camera.next_frame().await.unwrap().unwrap();
        let second = camera.next_frame().await.unwrap().unwrap();

        assert_eq!((first.width(), first.height()), (8, 6));
        assert_eq!((first.sequence(), second.sequence()), (1, 2));
        assert!(camera.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_synthetic_frame_fills_wide_dimensions() {
        let config = CameraConfig {
            width: 4096,
            height: 3,
            ..synthetic(1)
        };
        let mut camera = SyntheticCamera::new(&config);

        let frame = camera.next_frame().await.unwrap().unwrap();

        assert_eq!((frame.width(), frame.height()), (4096, 3));
    }

    #[tokio::test]
    async fn test_directory_source_replays_in_name_order() {
        let dir = std::env::temp_dir().join(format!("weed_rover_frames_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for (name, shade) in [("b.png", 20u8), ("a.png", 10u8)] {
            let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(4, 4, Rgb([shade, 0, 0]));
            img.save(dir.join(name)).unwrap();
        }
        std::fs::write(dir.join("notes.txt"), "not a frame").unwrap();

        let mut source = DirectoryFrameSource::open(&dir).unwrap();
        let first = source.next_frame().await.unwrap().unwrap();
        let second = source.next_frame().await.unwrap().unwrap();

        assert_eq!(first.image().to_rgb8().get_pixel(0, 0)[0], 10);
        assert_eq!(second.image().to_rgb8().get_pixel(0, 0)[0], 20);
        assert!(source.next_frame().await.unwrap().is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_directory_source_requires_existing_directory() {
        let missing = std::env::temp_dir().join("weed_rover_no_such_dir");
        assert!(matches!(
            DirectoryFrameSource::open(&missing),
            Err(CameraError::Io(_))
        ));
    }

    #[cfg(not(feature = "opencv"))]
    #[test]
    fn test_device_source_needs_opencv_feature() {
        let config = CameraConfig {
            source: FrameSourceKind::Device,
            ..CameraConfig::default()
        };
        assert!(matches!(
            build_frame_source(&config),
            Err(CameraError::OpenCameraFailed(_))
        ));
    }
}
