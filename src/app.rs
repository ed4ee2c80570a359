use crate::actuator::{initialise_outputs, ActuatorOutput, SimulatedActuator};
use crate::camera::{build_frame_source, FrameSource};
use crate::classifier::ClassifierBackend;
use crate::config::Config;
use crate::control_loop::{ControlError, ControlLoop, LoopReport};
use crate::manual::ManualOverride;
use crate::ort_classifier::OrtClassifier;

use anyhow::{anyhow, Context};
use std::sync::Arc;
use tokio::{signal, sync::broadcast, task::JoinHandle};

/// A running control loop.
pub struct RoverHandle {
    manual: ManualOverride,
    shutdown_tx: broadcast::Sender<()>,
    actuator: Arc<dyn ActuatorOutput>,
    task: JoinHandle<Result<LoopReport, ControlError>>,
}

impl RoverHandle {
    pub fn manual_override(&self) -> ManualOverride {
        self.manual.clone()
    }

    /// Asks the loop to terminate. The loop idles every output on its way out.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn wait(self) -> anyhow::Result<LoopReport> {
        match self.task.await {
            Ok(result) => result.context("control loop terminated with an error"),
            Err(e) => {
                // The loop never reached its own cleanup.
                if let Err(release) = self.actuator.release() {
                    tracing::error!("Failed to release outputs: {}", release);
                }
                Err(anyhow!("control loop task failed: {}", e))
            }
        }
    }
}

pub fn spawn_rover(
    config: Config,
    source: Box<dyn FrameSource>,
    classifier: Arc<dyn ClassifierBackend>,
    actuator: Arc<dyn ActuatorOutput>,
) -> RoverHandle {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let control = ControlLoop::new(config, source, classifier, Arc::clone(&actuator));
    let manual = control.manual_override();
    let task = tokio::spawn(control.run(shutdown_rx));

    RoverHandle {
        manual,
        shutdown_tx,
        actuator,
        task,
    }
}

pub async fn start_app(config: Config) -> anyhow::Result<LoopReport> {
    let classifier = match OrtClassifier::new(&config.classifier) {
        Ok(classifier) => Arc::new(classifier),
        Err(e) => {
            tracing::error!("Failed to initialize classifier: {:?}", e);
            return Err(e).context("failed to load classifier model");
        }
    };

    let source = match build_frame_source(&config.camera) {
        Ok(source) => source,
        Err(e) => {
            tracing::error!("Failed to initialize frame source: {:?}", e);
            return Err(e).context("failed to open frame source");
        }
    };

    let actuator = Arc::new(SimulatedActuator::new(&config));
    if let Err(e) = initialise_outputs(actuator.as_ref(), &config) {
        let _ = actuator.release();
        return Err(e).context("failed to initialise actuator outputs");
    }

    let rover = spawn_rover(config, source, classifier, actuator);
    let shutdown_tx = rover.shutdown_tx.clone();
    let finished = rover.wait();
    tokio::pin!(finished);

    tokio::select! {
        result = &mut finished => return result,
        signal = shutdown_signal() => {
            if let Err(e) = signal {
                tracing::error!("Signal handling failed, stopping anyway: {:?}", e);
            }
            tracing::info!("Shutdown signal received, stopping rover.");
        }
    }

    let _ = shutdown_tx.send(());
    finished.await
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        ctrl_c = signal::ctrl_c() => ctrl_c.context("failed to listen for Ctrl+C")?,
        _ = terminate.recv() => {},
    }
    Ok(())
}
