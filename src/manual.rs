use crate::frame::Frame;
use crate::motion::MoveDirection;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ManualError {
    #[error("Control loop is not running")]
    LoopUnavailable,
    #[error("Move failed: {0}")]
    MoveFailed(String),
    #[error("Capture failed: {0}")]
    CaptureFailed(String),
}

/// Commands executed by the control loop between iterations.
#[derive(Debug)]
pub enum ManualCommand {
    Move {
        direction: MoveDirection,
        reply: oneshot::Sender<Result<(), ManualError>>,
    },
    Capture {
        reply: oneshot::Sender<Result<PathBuf, ManualError>>,
    },
}

/// Entry points for an operator surface. Every request is executed by the
/// control loop itself, on the same motion controller and frame source the
/// autonomous loop uses.
#[derive(Clone, Debug)]
pub struct ManualOverride {
    commands: mpsc::Sender<ManualCommand>,
}

impl ManualOverride {
    pub(crate) fn new(commands: mpsc::Sender<ManualCommand>) -> Self {
        Self { commands }
    }

    pub async fn request_move(&self, direction: MoveDirection) -> Result<(), ManualError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ManualCommand::Move { direction, reply })
            .await
            .map_err(|_| ManualError::LoopUnavailable)?;
        response.await.map_err(|_| ManualError::LoopUnavailable)?
    }

    /// Grabs one frame and stores it under the capture directory.
    pub async fn request_capture(&self) -> Result<PathBuf, ManualError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ManualCommand::Capture { reply })
            .await
            .map_err(|_| ManualError::LoopUnavailable)?;
        response.await.map_err(|_| ManualError::LoopUnavailable)?
    }
}

/// Writes `frame` as `capture_<timestamp>_<sequence>.jpg` into `directory`.
pub async fn save_capture(directory: &Path, frame: Frame) -> Result<PathBuf, ManualError> {
    let path = directory.join(format!(
        "capture_{}_{}.jpg",
        frame.timestamp_ms(),
        frame.sequence()
    ));
    let directory = directory.to_path_buf();
    let target = path.clone();

    tokio::task::spawn_blocking(move || -> Result<(), String> {
        std::fs::create_dir_all(&directory).map_err(|e| e.to_string())?;
        frame
            .image()
            .to_rgb8()
            .save(&target)
            .map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| ManualError::CaptureFailed(e.to_string()))?
    .map_err(ManualError::CaptureFailed)?;

    tracing::info!(path = ?path, "Image captured");
    Ok(path)
}
