//! Narrow interfaces towards the flight-control application.
//!
//! The bridge only ever pushes sensor values, pushes receiver channels and
//! reads output duty values. The in-process stores here implement those
//! interfaces with last-writer-wins semantics and are what the SITL binary
//! wires together.

pub mod outputs;
pub mod receiver;
pub mod sensors;

use std::sync::Arc;

pub use outputs::{ActuatorSource, OutputBank, OutputKind};
pub use receiver::{RC_CHANNEL_COUNT, RcSink, VirtualReceiver};
pub use sensors::{Attitude, BatteryState, FakeSensors, GpsFix, SensorSink, SensorSnapshot};

/// Handles a simulator backend needs on the flight-control side.
#[derive(Clone)]
pub struct FcLinks {
    pub sensors: Arc<dyn SensorSink>,
    pub receiver: Arc<dyn RcSink>,
    pub outputs: Arc<dyn ActuatorSource>,
}

/// Stand-in control step: RC channels straight to the outputs.
///
/// Servo n follows channel n; every motor follows the throttle channel.
pub fn rc_passthrough(receiver: &VirtualReceiver, outputs: &OutputBank) {
    let channels = receiver.channels();
    for (i, &pwm) in channels.iter().enumerate().take(outputs::MAX_SERVOS) {
        outputs.set(OutputKind::Servo, i, pwm);
    }
    let throttle = channels[receiver::THROTTLE_CHANNEL];
    for i in 0..outputs::MAX_MOTORS {
        outputs.set(OutputKind::Motor, i, throttle);
    }
}
