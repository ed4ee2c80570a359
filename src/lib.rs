pub mod actuator;
pub mod app;
pub mod batcher;
pub mod camera;
pub mod classifier;
pub mod config;
pub mod control_loop;
pub mod frame;
pub mod manual;
pub mod motion;
pub mod ort_classifier;
pub mod servo;

#[cfg(test)]
mod testing;

pub use app::{spawn_rover, start_app, RoverHandle};
