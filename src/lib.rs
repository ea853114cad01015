//! # SITL bridge
//!
//! Virtual peripherals and simulator links for running flight-control
//! firmware on a desktop host.
//!
//! - `serial`: TCP-backed virtual UARTs with a bounded receive ring
//! - `msp`: MSP v1/v2 codec, resynchronising decoder and the receiver proxy
//! - `sim`: X-Plane, RealFlight and line-protocol simulator clients
//! - `sync`: connection prefetch mailbox and the tick gate
//! - `fc`: the narrow interfaces the bridge uses towards the firmware

pub mod config;
pub mod error;
pub mod fc;
pub mod msp;
pub mod serial;
pub mod sim;
pub mod sync;
pub mod utils;

pub use error::{Result, SitlError};
