//! outputs.rs
//! Read side of the mixer/servo output arrays.

use parking_lot::RwLock;
use serde::Serialize;

pub const MAX_MOTORS: usize = 12;
pub const MAX_SERVOS: usize = 18;

const MOTOR_IDLE_US: u16 = 1000;
const SERVO_CENTER_US: u16 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OutputKind {
    Motor,
    Servo,
}

impl OutputKind {
    /// Normalise a PWM duty: motors to 0..1, servos to -1..1.
    pub fn normalize(self, pwm_us: u16) -> f32 {
        let pwm = f32::from(pwm_us);
        match self {
            OutputKind::Motor => ((pwm - 1000.0) / 1000.0).clamp(0.0, 1.0),
            OutputKind::Servo => ((pwm - 1500.0) / 500.0).clamp(-1.0, 1.0),
        }
    }
}

/// PWM duty values the flight-control side produced.
pub trait ActuatorSource: Send + Sync {
    /// Duty in microseconds for a 0-based output index.
    fn duty_us(&self, kind: OutputKind, index: usize) -> Option<u16>;
}

/// Plain output arrays written by the control step.
#[derive(Debug)]
pub struct OutputBank {
    motors: RwLock<[u16; MAX_MOTORS]>,
    servos: RwLock<[u16; MAX_SERVOS]>,
}

impl Default for OutputBank {
    fn default() -> Self {
        Self {
            motors: RwLock::new([MOTOR_IDLE_US; MAX_MOTORS]),
            servos: RwLock::new([SERVO_CENTER_US; MAX_SERVOS]),
        }
    }
}

impl OutputBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, kind: OutputKind, index: usize, pwm_us: u16) {
        let slot = match kind {
            OutputKind::Motor => self.motors.write().get_mut(index).map(|s| *s = pwm_us),
            OutputKind::Servo => self.servos.write().get_mut(index).map(|s| *s = pwm_us),
        };
        if slot.is_none() {
            log::debug!("[Outputs] {:?} index {} out of range", kind, index);
        }
    }
}

impl ActuatorSource for OutputBank {
    fn duty_us(&self, kind: OutputKind, index: usize) -> Option<u16> {
        match kind {
            OutputKind::Motor => self.motors.read().get(index).copied(),
            OutputKind::Servo => self.servos.read().get(index).copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_ranges() {
        assert_eq!(OutputKind::Motor.normalize(1000), 0.0);
        assert_eq!(OutputKind::Motor.normalize(1500), 0.5);
        assert_eq!(OutputKind::Motor.normalize(2200), 1.0);
        assert_eq!(OutputKind::Servo.normalize(1500), 0.0);
        assert_eq!(OutputKind::Servo.normalize(1000), -1.0);
        assert_eq!(OutputKind::Servo.normalize(1750), 0.5);
    }

    #[test]
    fn bank_defaults_and_bounds() {
        let bank = OutputBank::new();
        assert_eq!(bank.duty_us(OutputKind::Motor, 0), Some(1000));
        assert_eq!(bank.duty_us(OutputKind::Servo, 3), Some(1500));
        bank.set(OutputKind::Servo, 3, 1800);
        assert_eq!(bank.duty_us(OutputKind::Servo, 3), Some(1800));
        bank.set(OutputKind::Motor, MAX_MOTORS, 1800);
        assert_eq!(bank.duty_us(OutputKind::Motor, MAX_MOTORS), None);
    }
}
