use crate::actuator::PinPair;
use crate::batcher::{Normalization, TensorLayout};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default = "default_motors")]
    pub motors: Vec<MotorConfig>,
    #[serde(default = "default_servos")]
    pub servos: Vec<ServoConfig>,
    #[serde(default)]
    pub pwm: PwmConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("captures")
}

/// One drive motor on an H-bridge: two direction pins and a PWM channel.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MotorConfig {
    pub name: String,
    pub dir_a: u8,
    pub dir_b: u8,
    pub pwm_channel: u8,
}

impl MotorConfig {
    pub fn pin_pair(&self) -> PinPair {
        PinPair {
            a: self.dir_a,
            b: self.dir_b,
        }
    }
}

fn motor(name: &str, dir_a: u8, dir_b: u8, pwm_channel: u8) -> MotorConfig {
    MotorConfig {
        name: name.to_string(),
        dir_a,
        dir_b,
        pwm_channel,
    }
}

// BCM numbering of the rover's motor driver wiring.
fn default_motors() -> Vec<MotorConfig> {
    vec![
        motor("left1", 5, 6, 13),
        motor("left2", 17, 27, 22),
        motor("right1", 11, 9, 10),
        motor("right2", 4, 3, 2),
    ]
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServoConfig {
    pub name: String,
    pub pwm_channel: u8,
    #[serde(default = "default_rest_angle")]
    pub rest_angle: f64,
}

fn default_rest_angle() -> f64 {
    90.0
}

fn default_servos() -> Vec<ServoConfig> {
    vec![
        ServoConfig {
            name: "x_axis".to_string(),
            pwm_channel: 19,
            rest_angle: default_rest_angle(),
        },
        ServoConfig {
            name: "y_axis".to_string(),
            pwm_channel: 26,
            rest_angle: default_rest_angle(),
        },
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct PwmConfig {
    #[serde(default = "default_motor_frequency")]
    pub motor_frequency_hz: f64,
    #[serde(default = "default_servo_frequency")]
    pub servo_frequency_hz: f64,
}

fn default_motor_frequency() -> f64 {
    1000.0
}

fn default_servo_frequency() -> f64 {
    50.0
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            motor_frequency_hz: default_motor_frequency(),
            servo_frequency_hz: default_servo_frequency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriveConfig {
    #[serde(default = "default_drive_speed")]
    pub speed: f64,
    #[serde(default = "default_manual_speed")]
    pub manual_speed: f64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_drive_speed() -> f64 {
    50.0
}

fn default_manual_speed() -> f64 {
    100.0
}

fn default_settle_delay_ms() -> u64 {
    1000
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            speed: default_drive_speed(),
            manual_speed: default_manual_speed(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl DriveConfig {
    pub fn get_settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    pub model_path: PathBuf,
    #[serde(default = "default_input_side")]
    pub input_width: u32,
    #[serde(default = "default_input_side")]
    pub input_height: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub halt_class_index: usize,
    #[serde(default = "default_class_labels")]
    pub class_labels: Vec<String>,
    #[serde(default)]
    pub normalization: Normalization,
    #[serde(default)]
    pub layout: TensorLayout,
    #[serde(default = "default_apply_softmax")]
    pub apply_softmax: bool,
    #[serde(default)]
    pub intra_threads: Option<usize>,
}

fn default_input_side() -> u32 {
    250
}

fn default_batch_size() -> usize {
    1
}

fn default_class_labels() -> Vec<String> {
    ["weed", "crop", "ground"]
        .iter()
        .map(|label| label.to_string())
        .collect()
}

fn default_apply_softmax() -> bool {
    true
}

impl ClassifierConfig {
    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    pub fn halt_label(&self) -> &str {
        self.class_labels
            .get(self.halt_class_index)
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_servo")]
    pub servo: String,
    #[serde(default)]
    pub start_angle: f64,
    #[serde(default = "default_target_angle")]
    pub target_angle: f64,
    #[serde(default = "default_sweep_duration_ms")]
    pub duration_ms: u64,
    #[serde(default = "default_sweep_steps")]
    pub steps: usize,
    #[serde(default = "default_return_pause_ms")]
    pub return_pause_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_sweep_servo() -> String {
    "x_axis".to_string()
}

fn default_target_angle() -> f64 {
    120.0
}

fn default_sweep_duration_ms() -> u64 {
    1000
}

fn default_sweep_steps() -> usize {
    20
}

fn default_return_pause_ms() -> u64 {
    500
}

fn default_shutdown_grace_ms() -> u64 {
    1000
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            servo: default_sweep_servo(),
            start_angle: 0.0,
            target_angle: default_target_angle(),
            duration_ms: default_sweep_duration_ms(),
            steps: default_sweep_steps(),
            return_pause_ms: default_return_pause_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl SweepConfig {
    pub fn get_duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn get_return_pause(&self) -> Duration {
        Duration::from_millis(self.return_pause_ms)
    }

    pub fn get_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FrameSourceKind {
    #[default]
    Synthetic,
    Directory,
    Device,
}

#[derive(Clone, Deserialize, Debug)]
pub struct CameraConfig {
    #[serde(default)]
    pub source: FrameSourceKind,
    #[serde(default)]
    pub device_index: i32,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub frame_limit: Option<u64>,
    #[serde(default = "default_frame_width")]
    pub width: u32,
    #[serde(default = "default_frame_height")]
    pub height: u32,
    #[serde(default = "default_capture_fps")]
    pub fps: u64,
}

fn default_frame_width() -> u32 {
    640
}

fn default_frame_height() -> u32 {
    480
}

fn default_capture_fps() -> u64 {
    30
}

fn fps_to_delay_ms(fps: u64) -> u64 {
    (1000.0 / fps.max(1) as f64).round() as u64
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: FrameSourceKind::default(),
            device_index: 0,
            directory: None,
            frame_limit: None,
            width: default_frame_width(),
            height: default_frame_height(),
            fps: default_capture_fps(),
        }
    }
}

impl CameraConfig {
    pub fn get_frame_delay(&self) -> Duration {
        Duration::from_millis(fps_to_delay_ms(self.fps))
    }
}

impl Config {
    /// Rejects configurations the rover cannot safely run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.motors.is_empty() {
            return invalid("at least one drive motor must be configured");
        }

        // Direction pins and PWM channels are all BCM pin numbers.
        let mut pins = HashSet::new();
        for motor in &self.motors {
            for pin in [motor.dir_a, motor.dir_b, motor.pwm_channel] {
                if !pins.insert(pin) {
                    return invalid(format!("pin {} of motor `{}` is already in use", pin, motor.name));
                }
            }
        }

        let mut servo_names = HashSet::new();
        for servo in &self.servos {
            if !servo_names.insert(servo.name.as_str()) {
                return invalid(format!("servo `{}` is configured twice", servo.name));
            }
            if !pins.insert(servo.pwm_channel) {
                return invalid(format!(
                    "PWM channel {} of servo `{}` is already in use",
                    servo.pwm_channel, servo.name
                ));
            }
            check_angle(&format!("rest angle of servo `{}`", servo.name), servo.rest_angle)?;
        }

        if !(self.pwm.motor_frequency_hz > 0.0) || !(self.pwm.servo_frequency_hz > 0.0) {
            return invalid("PWM frequencies must be positive");
        }

        if !(0.0..=100.0).contains(&self.drive.speed)
            || !(0.0..=100.0).contains(&self.drive.manual_speed)
        {
            return invalid("drive speeds must be within 0..=100");
        }

        let classifier = &self.classifier;
        if classifier.batch_size == 0 {
            return invalid("classifier batch size must be at least 1");
        }
        if classifier.input_width == 0 || classifier.input_height == 0 {
            return invalid("classifier input dimensions must be non-zero");
        }
        if classifier.class_labels.is_empty() {
            return invalid("at least one class label is required");
        }
        if classifier.halt_class_index >= classifier.num_classes() {
            return invalid(format!(
                "halt class index {} is out of range for {} classes",
                classifier.halt_class_index,
                classifier.num_classes()
            ));
        }

        if !servo_names.contains(self.sweep.servo.as_str()) {
            return invalid(format!("sweep servo `{}` is not configured", self.sweep.servo));
        }
        if self.sweep.steps == 0 {
            return invalid("sweep needs at least one step");
        }
        check_angle("sweep start angle", self.sweep.start_angle)?;
        check_angle("sweep target angle", self.sweep.target_angle)?;

        if self.camera.width == 0 || self.camera.height == 0 {
            return invalid("camera dimensions must be non-zero");
        }
        if self.camera.width > MAX_CAMERA_DIMENSION || self.camera.height > MAX_CAMERA_DIMENSION {
            return invalid(format!(
                "camera dimensions {}x{} exceed {}",
                self.camera.width, self.camera.height, MAX_CAMERA_DIMENSION
            ));
        }
        if self.camera.source == FrameSourceKind::Directory && self.camera.directory.is_none() {
            return invalid("directory frame source requires `camera.directory`");
        }

        Ok(())
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize::<Config>()?;
        config.validate()?;
        Ok(config)
    }
}

/// Largest accepted camera width or height, in pixels.
pub const MAX_CAMERA_DIMENSION: u32 = 8192;

fn invalid<T>(message: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(message.into()))
}

fn check_angle(what: &str, angle: f64) -> Result<(), ConfigError> {
    if !(0.0..=180.0).contains(&angle) {
        return invalid(format!("{} {} is outside 0..=180", what, angle));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| ConfigError::Invalid(format!("cannot determine current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(ConfigError::Invalid)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("ROVER")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;
    config.validate()?;

    Ok(config)
}
