//! xplane.rs
//! X-Plane UDP client: RREF subscriptions in, DREF override writes out.
//!
//! Packet layouts (little-endian):
//! - RREF request, 413 bytes: `"RREF\0"`, i32 frequency, i32 id, 400-byte name
//! - DREF write, 509 bytes: `"DREF\0"`, f32 value, 500-byte name
//! - RREF reply: `"RREF"` + one byte, then repeated (i32 id, f32 value)

use std::{
    net::{SocketAddr, UdpSocket},
    time::Duration,
};

use log::{debug, info, warn};

use super::{SimulatorBackend, SimulatorSession};
use crate::error::{Result, SitlError};
use crate::fc::receiver::{stick_to_us, throttle_to_us};

pub const RREF_PACKET_LEN: usize = 413;
pub const DREF_PACKET_LEN: usize = 509;
const RREF_NAME_LEN: usize = 400;
const DREF_NAME_LEN: usize = 500;
const HEADER_LEN: usize = 5;

pub const DEFAULT_PORT: u16 = 49000;
/// Subscription rate requested from X-Plane, Hz.
const RREF_FREQUENCY_HZ: i32 = 100;
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const INHG_TO_PA: f64 = 3386.39;
/// Output channels this backend drives: throttle, roll, pitch, yaw.
pub const CHANNELS: usize = 4;

/// Subscribed datarefs; the discriminant is the RREF id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DataRef {
    Latitude = 1,
    Longitude,
    Elevation,
    Agl,
    Roll,
    Pitch,
    Heading,
    RollRate,
    PitchRate,
    YawRate,
    GAxial,
    GSide,
    GNormal,
    LocalVx,
    LocalVy,
    LocalVz,
    TrueAirspeed,
    Barometer,
    Groundspeed,
    Hpath,
    JoyRoll,
    JoyPitch,
    JoyYaw,
    JoyThrottle,
    HasCrashed,
    Paused,
}

impl DataRef {
    pub const ALL: [DataRef; 26] = [
        DataRef::Latitude,
        DataRef::Longitude,
        DataRef::Elevation,
        DataRef::Agl,
        DataRef::Roll,
        DataRef::Pitch,
        DataRef::Heading,
        DataRef::RollRate,
        DataRef::PitchRate,
        DataRef::YawRate,
        DataRef::GAxial,
        DataRef::GSide,
        DataRef::GNormal,
        DataRef::LocalVx,
        DataRef::LocalVy,
        DataRef::LocalVz,
        DataRef::TrueAirspeed,
        DataRef::Barometer,
        DataRef::Groundspeed,
        DataRef::Hpath,
        DataRef::JoyRoll,
        DataRef::JoyPitch,
        DataRef::JoyYaw,
        DataRef::JoyThrottle,
        DataRef::HasCrashed,
        DataRef::Paused,
    ];

    pub fn id(self) -> i32 {
        self as i32
    }

    pub fn from_id(id: i32) -> Option<Self> {
        usize::try_from(id - 1).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn name(self) -> &'static str {
        match self {
            DataRef::Latitude => "sim/flightmodel/position/latitude",
            DataRef::Longitude => "sim/flightmodel/position/longitude",
            DataRef::Elevation => "sim/flightmodel/position/elevation",
            DataRef::Agl => "sim/flightmodel/position/y_agl",
            DataRef::Roll => "sim/flightmodel/position/phi",
            DataRef::Pitch => "sim/flightmodel/position/theta",
            DataRef::Heading => "sim/flightmodel/position/psi",
            DataRef::RollRate => "sim/flightmodel/position/P",
            DataRef::PitchRate => "sim/flightmodel/position/Q",
            DataRef::YawRate => "sim/flightmodel/position/R",
            DataRef::GAxial => "sim/flightmodel/forces/g_axil",
            DataRef::GSide => "sim/flightmodel/forces/g_side",
            DataRef::GNormal => "sim/flightmodel/forces/g_nrml",
            DataRef::LocalVx => "sim/flightmodel/position/local_vx",
            DataRef::LocalVy => "sim/flightmodel/position/local_vy",
            DataRef::LocalVz => "sim/flightmodel/position/local_vz",
            DataRef::TrueAirspeed => "sim/flightmodel/position/true_airspeed",
            DataRef::Barometer => "sim/weather/barometer_current_inhg",
            DataRef::Groundspeed => "sim/flightmodel/position/groundspeed",
            DataRef::Hpath => "sim/flightmodel/position/hpath",
            DataRef::JoyRoll => "sim/joystick/joystick_axis_values[0]",
            DataRef::JoyPitch => "sim/joystick/joystick_axis_values[1]",
            DataRef::JoyYaw => "sim/joystick/joystick_axis_values[2]",
            DataRef::JoyThrottle => "sim/joystick/joystick_axis_values[3]",
            DataRef::HasCrashed => "sim/flightmodel2/misc/has_crashed",
            DataRef::Paused => "sim/time/paused",
        }
    }
}

/// Override datarefs written per simulator channel (1-based channel = index + 1).
const CHANNEL_DREFS: [&str; CHANNELS] = [
    "sim/flightmodel/engine/ENGN_thro_use[0]",
    "sim/joystick/yoke_roll_ratio",
    "sim/joystick/yoke_pitch_ratio",
    "sim/joystick/yoke_heading_ratio",
];

const OVERRIDE_DREFS: [&str; 2] = [
    "sim/operation/override/override_joystick",
    "sim/operation/override/override_throttles",
];

// ============================================================================
// Packet codec
// ============================================================================

fn put_name(buf: &mut [u8], name: &str) {
    // keep the terminating NUL
    let n = name.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&name.as_bytes()[..n]);
}

pub fn encode_rref(frequency_hz: i32, id: i32, name: &str) -> [u8; RREF_PACKET_LEN] {
    let mut pkt = [0u8; RREF_PACKET_LEN];
    pkt[..HEADER_LEN].copy_from_slice(b"RREF\0");
    pkt[5..9].copy_from_slice(&frequency_hz.to_le_bytes());
    pkt[9..13].copy_from_slice(&id.to_le_bytes());
    put_name(&mut pkt[13..13 + RREF_NAME_LEN], name);
    pkt
}

pub fn encode_dref(value: f32, name: &str) -> [u8; DREF_PACKET_LEN] {
    let mut pkt = [0u8; DREF_PACKET_LEN];
    pkt[..HEADER_LEN].copy_from_slice(b"DREF\0");
    pkt[5..9].copy_from_slice(&value.to_le_bytes());
    put_name(&mut pkt[9..9 + DREF_NAME_LEN], name);
    pkt
}

/// (id, value) pairs of an RREF reply; a trailing partial pair is ignored.
pub fn parse_rref_reply(datagram: &[u8]) -> Option<Vec<(i32, f32)>> {
    if datagram.len() < HEADER_LEN || &datagram[..4] != b"RREF" {
        return None;
    }
    Some(
        datagram[HEADER_LEN..]
            .chunks_exact(8)
            .map(|c| {
                (
                    i32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                    f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                )
            })
            .collect(),
    )
}

// ============================================================================
// Backend
// ============================================================================

pub struct XPlaneBackend {
    target: SocketAddr,
    socket: Option<UdpSocket>,
    values: [Option<f32>; DataRef::ALL.len()],
    crashed: bool,
    paused: bool,
}

impl XPlaneBackend {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            socket: None,
            values: [None; DataRef::ALL.len()],
            crashed: false,
            paused: false,
        }
    }

    pub fn value(&self, r: DataRef) -> Option<f32> {
        self.values[(r.id() - 1) as usize]
    }

    /// Local address the subscriptions were sent from.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket.as_ref().ok_or(SitlError::Disconnected)
    }

    fn subscribe(&self, frequency_hz: i32) -> Result<()> {
        let socket = self.socket()?;
        for r in DataRef::ALL {
            socket.send(&encode_rref(frequency_hz, r.id(), r.name()))?;
        }
        Ok(())
    }

    fn set_overrides(&self, on: bool) -> Result<()> {
        let socket = self.socket()?;
        let v = if on { 1.0 } else { 0.0 };
        for name in OVERRIDE_DREFS {
            socket.send(&encode_dref(v, name))?;
        }
        Ok(())
    }

    /// Store the pairs of one RREF reply. Returns how many ids were known.
    pub fn handle_datagram(&mut self, datagram: &[u8]) -> usize {
        let Some(pairs) = parse_rref_reply(datagram) else {
            debug!("[XPlane] ignoring {} byte non-RREF datagram", datagram.len());
            return 0;
        };
        let mut known = 0;
        for (id, value) in pairs {
            if let Some(r) = DataRef::from_id(id) {
                self.values[(id - 1) as usize] = Some(value);
                known += 1;
                if r == DataRef::HasCrashed {
                    self.note_crash(value != 0.0);
                } else if r == DataRef::Paused {
                    self.note_pause(value != 0.0);
                }
            }
        }
        known
    }

    fn note_crash(&mut self, crashed: bool) {
        if crashed != self.crashed {
            if crashed {
                warn!("[XPlane] aircraft crashed");
            } else {
                info!("[XPlane] aircraft reset");
            }
        }
        self.crashed = crashed;
    }

    fn note_pause(&mut self, paused: bool) {
        if paused != self.paused {
            info!("[XPlane] simulation {}", if paused { "paused" } else { "resumed" });
        }
        self.paused = paused;
    }

    /// Convert stored values into the session state. Missing values keep the previous state.
    pub fn apply(&self, session: &mut SimulatorSession) {
        let v = |r| self.value(r);
        let s = &mut session.state;

        if let (Some(lat), Some(lon)) = (v(DataRef::Latitude), v(DataRef::Longitude)) {
            s.lat_deg = f64::from(lat);
            s.lon_deg = f64::from(lon);
            s.position_valid = true;
        }
        if let Some(elev) = v(DataRef::Elevation) {
            s.alt_msl_m = f64::from(elev);
        }
        if let Some(agl) = v(DataRef::Agl) {
            s.agl_m = Some(f64::from(agl));
        }
        if let Some(x) = v(DataRef::Roll) {
            s.roll_deg = x;
        }
        if let Some(x) = v(DataRef::Pitch) {
            s.pitch_deg = x;
        }
        if let Some(x) = v(DataRef::Heading) {
            s.yaw_deg = x;
        }
        if let (Some(p), Some(q), Some(r)) = (v(DataRef::RollRate), v(DataRef::PitchRate), v(DataRef::YawRate)) {
            s.rate_dps = [p, q, r];
        }
        if let (Some(ax), Some(side), Some(nrml)) = (v(DataRef::GAxial), v(DataRef::GSide), v(DataRef::GNormal)) {
            s.accel_g = [-ax, side, nrml];
        }
        if let (Some(vx), Some(vy), Some(vz)) = (v(DataRef::LocalVx), v(DataRef::LocalVy), v(DataRef::LocalVz)) {
            // OpenGL frame: x east, y up, z south
            s.vel_ned_ms = [-vz, vx, -vy];
        }
        if let Some(x) = v(DataRef::TrueAirspeed) {
            s.airspeed_ms = x;
        }
        if let Some(inhg) = v(DataRef::Barometer) {
            s.baro_pa = Some(f64::from(inhg) * INHG_TO_PA);
        }

        if let (Some(r), Some(p), Some(y), Some(t)) = (
            v(DataRef::JoyRoll),
            v(DataRef::JoyPitch),
            v(DataRef::JoyYaw),
            v(DataRef::JoyThrottle),
        ) {
            // axes are 0..1, centre 0.5; AETR order
            session.joystick = Some(vec![
                stick_to_us(r * 2.0 - 1.0),
                stick_to_us(p * 2.0 - 1.0),
                throttle_to_us(t),
                stick_to_us(y * 2.0 - 1.0),
            ]);
        }
    }

    pub fn crashed(&self) -> bool {
        self.crashed
    }
}

impl SimulatorBackend for XPlaneBackend {
    fn name(&self) -> &'static str {
        "XPlane"
    }

    fn connect(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        socket.connect(self.target).map_err(|source| SitlError::Connect {
            target: self.target.to_string(),
            source,
        })?;
        self.socket = Some(socket);
        self.set_overrides(true)?;
        self.subscribe(RREF_FREQUENCY_HZ)?;
        info!(
            "[XPlane] subscribed {} datarefs at {} Hz on {}",
            DataRef::ALL.len(),
            RREF_FREQUENCY_HZ,
            self.target
        );
        Ok(())
    }

    fn exchange(&mut self, session: &mut SimulatorSession) -> Result<()> {
        let outputs = session.actuators(CHANNELS);
        {
            let socket = self.socket()?;
            for (value, name) in outputs.iter().zip(CHANNEL_DREFS) {
                socket.send(&encode_dref(*value, name))?;
            }
        }

        let mut buf = [0u8; 2048];
        let n = self.socket()?.recv(&mut buf)?;
        if self.handle_datagram(&buf[..n]) == 0 {
            debug!("[XPlane] {} byte datagram carried no known datarefs", n);
        }
        self.apply(session);
        Ok(())
    }

    /// Only "nothing arrived" is survivable; any other socket error ends the loop.
    fn recoverable(&self, _err: &SitlError) -> bool {
        false
    }
}

impl Drop for XPlaneBackend {
    fn drop(&mut self) {
        if self.socket.is_some() {
            // frequency 0 cancels a subscription
            let _ = self.subscribe(0);
            let _ = self.set_overrides(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fc::{FakeSensors, FcLinks, OutputBank, VirtualReceiver};
    use crate::sim::OutputMapping;
    use std::sync::Arc;

    fn reply(pairs: &[(i32, f32)]) -> Vec<u8> {
        let mut d = b"RREF,".to_vec();
        for (id, v) in pairs {
            d.extend_from_slice(&id.to_le_bytes());
            d.extend_from_slice(&v.to_le_bytes());
        }
        d
    }

    fn session() -> SimulatorSession {
        let links = FcLinks {
            sensors: Arc::new(FakeSensors::new()),
            receiver: Arc::new(VirtualReceiver::new()),
            outputs: Arc::new(OutputBank::new()),
        };
        SimulatorSession::new(links, OutputMapping::default(), true)
    }

    #[test]
    fn rref_layout() {
        let pkt = encode_rref(50, 7, "sim/flightmodel/position/phi");
        assert_eq!(pkt.len(), 413);
        assert_eq!(&pkt[..5], b"RREF\0");
        assert_eq!(i32::from_le_bytes(pkt[5..9].try_into().unwrap()), 50);
        assert_eq!(i32::from_le_bytes(pkt[9..13].try_into().unwrap()), 7);
        assert_eq!(&pkt[13..41], b"sim/flightmodel/position/phi");
        assert_eq!(pkt[41], 0);
    }

    #[test]
    fn dref_layout() {
        let pkt = encode_dref(0.25, "sim/joystick/yoke_roll_ratio");
        assert_eq!(pkt.len(), 509);
        assert_eq!(&pkt[..5], b"DREF\0");
        assert_eq!(f32::from_le_bytes(pkt[5..9].try_into().unwrap()), 0.25);
        assert_eq!(&pkt[9..37], b"sim/joystick/yoke_roll_ratio");
        assert!(pkt[37..].iter().all(|&b| b == 0));
    }

    #[test]
    fn reply_parsing() {
        let mut d = reply(&[(1, 47.5), (99, 1.0)]);
        d.extend_from_slice(&[1, 2, 3]);
        assert_eq!(parse_rref_reply(&d), Some(vec![(1, 47.5), (99, 1.0)]));
        assert_eq!(parse_rref_reply(b"DATA*"), None);
    }

    #[test]
    fn ids_map_to_datarefs() {
        for r in DataRef::ALL {
            assert_eq!(DataRef::from_id(r.id()), Some(r));
        }
        assert_eq!(DataRef::from_id(0), None);
        assert_eq!(DataRef::from_id(27), None);
    }

    #[test]
    fn partial_reply_keeps_previous_values() {
        let mut xp = XPlaneBackend::new("127.0.0.1:49000".parse().unwrap());
        let mut s = session();
        assert_eq!(xp.handle_datagram(&reply(&[(1, 47.0), (2, 8.0), (5, 10.0)])), 3);
        xp.apply(&mut s);
        assert_eq!(xp.handle_datagram(&reply(&[(5, -3.0), (42, 0.0)])), 1);
        xp.apply(&mut s);
        assert_eq!(s.state.lat_deg, 47.0);
        assert_eq!(s.state.roll_deg, -3.0);
        assert!(s.state.position_valid);
    }

    #[test]
    fn unit_conversions() {
        let mut xp = XPlaneBackend::new("127.0.0.1:49000".parse().unwrap());
        let mut s = session();
        xp.handle_datagram(&reply(&[
            (DataRef::LocalVx.id(), 3.0),
            (DataRef::LocalVy.id(), 1.0),
            (DataRef::LocalVz.id(), -4.0),
            (DataRef::GAxial.id(), 0.1),
            (DataRef::GSide.id(), 0.0),
            (DataRef::GNormal.id(), 1.0),
            (DataRef::Barometer.id(), 29.92),
        ]));
        xp.apply(&mut s);
        assert_eq!(s.state.vel_ned_ms, [4.0, 3.0, -1.0]);
        assert_eq!(s.state.accel_g, [-0.1, 0.0, 1.0]);
        let pa = s.state.baro_pa.unwrap();
        assert!((pa - 101_320.8).abs() < 1.0);
    }

    #[test]
    fn joystick_axes_to_rc() {
        let mut xp = XPlaneBackend::new("127.0.0.1:49000".parse().unwrap());
        let mut s = session();
        xp.handle_datagram(&reply(&[
            (DataRef::JoyRoll.id(), 0.5),
            (DataRef::JoyPitch.id(), 1.0),
            (DataRef::JoyYaw.id(), 0.0),
            (DataRef::JoyThrottle.id(), 0.25),
        ]));
        xp.apply(&mut s);
        assert_eq!(s.joystick, Some(vec![1500, 2000, 1250, 1000]));
    }

    #[test]
    fn crash_flag_tracked() {
        let mut xp = XPlaneBackend::new("127.0.0.1:49000".parse().unwrap());
        xp.handle_datagram(&reply(&[(DataRef::HasCrashed.id(), 1.0)]));
        assert!(xp.crashed());
        xp.handle_datagram(&reply(&[(DataRef::HasCrashed.id(), 0.0)]));
        assert!(!xp.crashed());
    }
}
