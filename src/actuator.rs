use crate::config::Config;
use crate::servo::{angle_to_duty_cycle, duty_cycle_to_angle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActuatorError {
    #[error("Unknown PWM channel: {0}")]
    UnknownChannel(u8),
    #[error("Unknown direction pin: {0}")]
    UnknownPin(u8),
    #[error("Duty cycle {percent} out of range on channel {channel}")]
    InvalidDutyCycle { channel: u8, percent: f64 },
    #[error("Outputs have been released")]
    Released,
    #[error("Hardware unavailable: {0}")]
    Unavailable(String),
}

/// The two direction inputs of one H-bridge channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinPair {
    pub a: u8,
    pub b: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionState {
    /// `a` high, `b` low.
    Forward,
    /// Both low; the bridge coasts.
    Neutral,
}

/// Duty-cycle driven outputs of the rover.
///
/// Implementations are shared between the control loop (motor channels) and
/// servo sweep tasks (one servo channel each), so writes to different
/// channels must not serialize on a single lock.
pub trait ActuatorOutput: Send + Sync {
    fn configure_pwm(
        &self,
        channel: u8,
        frequency_hz: f64,
        initial_duty: f64,
    ) -> Result<(), ActuatorError>;

    fn set_duty_cycle(&self, channel: u8, percent: f64) -> Result<(), ActuatorError>;

    fn set_direction(&self, pins: PinPair, state: DirectionState) -> Result<(), ActuatorError>;

    /// Drives every output to its idle level. Further writes fail.
    fn release(&self) -> Result<(), ActuatorError>;
}

/// Configures every PWM channel for its device class: motors at 0% duty,
/// servos parked at their rest angle.
pub fn initialise_outputs(actuator: &dyn ActuatorOutput, config: &Config) -> Result<(), ActuatorError> {
    for motor in &config.motors {
        actuator.configure_pwm(motor.pwm_channel, config.pwm.motor_frequency_hz, 0.0)?;
        actuator.set_direction(motor.pin_pair(), DirectionState::Neutral)?;
    }
    for servo in &config.servos {
        actuator.configure_pwm(
            servo.pwm_channel,
            config.pwm.servo_frequency_hz,
            angle_to_duty_cycle(servo.rest_angle),
        )?;
    }
    tracing::info!(
        motors = config.motors.len(),
        servos = config.servos.len(),
        "Actuator outputs initialised"
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorDirection {
    Forward,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MotorState {
    pub name: String,
    pub direction: MotorDirection,
    pub speed: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServoState {
    pub name: String,
    pub angle: f64,
}

/// Commanded state of every actuator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActuatorState {
    pub motors: Vec<MotorState>,
    pub servos: Vec<ServoState>,
}

#[derive(Debug, Default, Clone, Copy)]
struct PwmChannel {
    frequency_hz: f64,
    duty: f64,
}

#[derive(Debug, Clone)]
enum Device {
    Motor { name: String, pins: PinPair },
    Servo { name: String },
}

/// Output driver for running without GPIO access.
///
/// Keeps the commanded level of every configured channel and pin and logs
/// each write. Each channel and each pin has its own lock.
pub struct SimulatedActuator {
    channels: HashMap<u8, (Device, Mutex<PwmChannel>)>,
    pins: HashMap<u8, Mutex<bool>>,
    released: AtomicBool,
}

impl SimulatedActuator {
    pub fn new(config: &Config) -> Self {
        let mut channels = HashMap::new();
        let mut pins = HashMap::new();

        for motor in &config.motors {
            let device = Device::Motor {
                name: motor.name.clone(),
                pins: motor.pin_pair(),
            };
            channels.insert(motor.pwm_channel, (device, Mutex::new(PwmChannel::default())));
            pins.insert(motor.dir_a, Mutex::new(false));
            pins.insert(motor.dir_b, Mutex::new(false));
        }
        for servo in &config.servos {
            let device = Device::Servo {
                name: servo.name.clone(),
            };
            channels.insert(servo.pwm_channel, (device, Mutex::new(PwmChannel::default())));
        }

        Self {
            channels,
            pins,
            released: AtomicBool::new(false),
        }
    }

    fn ensure_active(&self) -> Result<(), ActuatorError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(ActuatorError::Released);
        }
        Ok(())
    }

    fn channel(&self, channel: u8) -> Result<&Mutex<PwmChannel>, ActuatorError> {
        self.channels
            .get(&channel)
            .map(|(_, state)| state)
            .ok_or(ActuatorError::UnknownChannel(channel))
    }

    fn pin_level(&self, pin: u8) -> bool {
        self.pins.get(&pin).map(|level| *level.lock()).unwrap_or(false)
    }

    pub fn frequency(&self, channel: u8) -> Option<f64> {
        self.channels
            .get(&channel)
            .map(|(_, state)| state.lock().frequency_hz)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Snapshot of the commanded state, ordered by channel.
    pub fn state(&self) -> ActuatorState {
        let mut entries: Vec<_> = self.channels.iter().collect();
        entries.sort_by_key(|(channel, _)| **channel);

        let mut state = ActuatorState::default();
        for (_, (device, channel)) in entries {
            let duty = channel.lock().duty;
            match device {
                Device::Motor { name, pins } => {
                    let forward = self.pin_level(pins.a) && !self.pin_level(pins.b);
                    let direction = if forward && duty > 0.0 {
                        MotorDirection::Forward
                    } else {
                        MotorDirection::Stopped
                    };
                    state.motors.push(MotorState {
                        name: name.clone(),
                        direction,
                        speed: duty,
                    });
                }
                Device::Servo { name } => state.servos.push(ServoState {
                    name: name.clone(),
                    angle: duty_cycle_to_angle(duty),
                }),
            }
        }
        state
    }
}

impl ActuatorOutput for SimulatedActuator {
    fn configure_pwm(
        &self,
        channel: u8,
        frequency_hz: f64,
        initial_duty: f64,
    ) -> Result<(), ActuatorError> {
        self.ensure_active()?;
        let mut state = self.channel(channel)?.lock();
        state.frequency_hz = frequency_hz;
        state.duty = initial_duty;
        tracing::debug!(channel, frequency_hz, initial_duty, "PWM channel configured");
        Ok(())
    }

    fn set_duty_cycle(&self, channel: u8, percent: f64) -> Result<(), ActuatorError> {
        self.ensure_active()?;
        if !(0.0..=100.0).contains(&percent) {
            return Err(ActuatorError::InvalidDutyCycle { channel, percent });
        }
        self.channel(channel)?.lock().duty = percent;
        tracing::trace!(channel, percent, "Duty cycle set");
        Ok(())
    }

    fn set_direction(&self, pins: PinPair, state: DirectionState) -> Result<(), ActuatorError> {
        self.ensure_active()?;
        let pin_a = self.pins.get(&pins.a).ok_or(ActuatorError::UnknownPin(pins.a))?;
        let pin_b = self.pins.get(&pins.b).ok_or(ActuatorError::UnknownPin(pins.b))?;
        let high = state == DirectionState::Forward;
        *pin_a.lock() = high;
        *pin_b.lock() = false;
        tracing::trace!(pin_a = pins.a, pin_b = pins.b, ?state, "Direction set");
        Ok(())
    }

    fn release(&self) -> Result<(), ActuatorError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for (_, channel) in self.channels.values() {
            channel.lock().duty = 0.0;
        }
        for level in self.pins.values() {
            *level.lock() = false;
        }
        tracing::info!("All outputs released to idle");
        Ok(())
    }
}
