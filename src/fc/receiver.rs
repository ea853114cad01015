//! receiver.rs
//! Virtual RC receiver fed by the MSP proxy or a simulator joystick.

use std::{
    sync::atomic::{AtomicU16, AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;

pub const RC_CHANNEL_COUNT: usize = 18;
pub const RC_MID_US: u16 = 1500;
pub const RC_MIN_US: u16 = 1000;
pub const RC_MAX_US: u16 = 2000;
/// AETR order: the third channel carries throttle.
pub const THROTTLE_CHANNEL: usize = 2;

/// Receiver channel setter exposed to the bridge.
pub trait RcSink: Send + Sync {
    /// Replace channels `0..values.len()`; the rest keep their values.
    fn set_channels(&self, values: &[u16]);
    fn set_rssi(&self, rssi: u16);
}

#[derive(Debug)]
struct RcFrame {
    channels: [u16; RC_CHANNEL_COUNT],
    active: usize,
    updated: Option<Instant>,
}

#[derive(Debug)]
pub struct VirtualReceiver {
    frame: Mutex<RcFrame>,
    rssi: AtomicU16,
    frames: AtomicU64,
}

impl Default for VirtualReceiver {
    fn default() -> Self {
        let mut channels = [RC_MID_US; RC_CHANNEL_COUNT];
        // throttle low until something drives it
        channels[THROTTLE_CHANNEL] = RC_MIN_US;
        Self {
            frame: Mutex::new(RcFrame {
                channels,
                active: 0,
                updated: None,
            }),
            rssi: AtomicU16::new(0),
            frames: AtomicU64::new(0),
        }
    }
}

impl VirtualReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels(&self) -> [u16; RC_CHANNEL_COUNT] {
        self.frame.lock().channels
    }

    pub fn channel(&self, index: usize) -> Option<u16> {
        self.frame.lock().channels.get(index).copied()
    }

    /// Number of channels carried by the most recent update.
    pub fn active_channels(&self) -> usize {
        self.frame.lock().active
    }

    pub fn rssi(&self) -> u16 {
        self.rssi.load(Ordering::Relaxed)
    }

    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Time since the last channel update, `None` if never updated.
    pub fn age(&self) -> Option<std::time::Duration> {
        self.frame.lock().updated.map(|t| t.elapsed())
    }
}

impl RcSink for VirtualReceiver {
    fn set_channels(&self, values: &[u16]) {
        let mut frame = self.frame.lock();
        let n = values.len().min(RC_CHANNEL_COUNT);
        frame.channels[..n].copy_from_slice(&values[..n]);
        frame.active = n;
        frame.updated = Some(Instant::now());
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    fn set_rssi(&self, rssi: u16) {
        self.rssi.store(rssi, Ordering::Relaxed);
    }
}

/// Map a stick ratio in -1..1 onto 1000..2000 us.
pub fn stick_to_us(ratio: f32) -> u16 {
    let r = ratio.clamp(-1.0, 1.0);
    (f32::from(RC_MID_US) + r * 500.0).round() as u16
}

/// Map a throttle ratio in 0..1 onto 1000..2000 us.
pub fn throttle_to_us(ratio: f32) -> u16 {
    let r = ratio.clamp(0.0, 1.0);
    (f32::from(RC_MIN_US) + r * 1000.0).round() as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_update_keeps_tail() {
        let rx = VirtualReceiver::new();
        rx.set_channels(&[1100, 1200]);
        let ch = rx.channels();
        assert_eq!(&ch[..3], &[1100, 1200, RC_MIN_US]);
        assert_eq!(rx.active_channels(), 2);
        assert_eq!(rx.frame_count(), 1);
    }

    #[test]
    fn oversized_update_is_truncated() {
        let rx = VirtualReceiver::new();
        rx.set_channels(&[1234; RC_CHANNEL_COUNT + 4]);
        assert_eq!(rx.active_channels(), RC_CHANNEL_COUNT);
    }

    #[test]
    fn stick_mappings() {
        assert_eq!(stick_to_us(0.0), 1500);
        assert_eq!(stick_to_us(-1.0), 1000);
        assert_eq!(stick_to_us(3.0), 2000);
        assert_eq!(throttle_to_us(0.5), 1500);
        assert_eq!(throttle_to_us(-0.2), 1000);
    }
}
