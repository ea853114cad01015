//! adumsim.rs
//! Line-protocol simulator client.
//!
//! Out, one line per tick: channel values `v1;v2;...;vN\n`.
//! In, one line per tick, fields by position:
//!
//! | idx | field | unit |
//! |---|---|---|
//! | 0 | simulation time | s |
//! | 1, 2 | latitude, longitude | deg |
//! | 3 | altitude MSL | m |
//! | 4 | height above ground | m |
//! | 5..=7 | roll, pitch, yaw | deg |
//! | 8..=10 | p, q, r | deg/s |
//! | 11..=13 | body specific force | g |
//! | 14..=16 | velocity north, east, down | m/s |
//! | 17 | airspeed | m/s |
//! | 18 | static pressure | Pa |
//! | 19, 20 | battery voltage, current | V, A |
//!
//! The exchange is lock-step: a new output line goes out only once the
//! reply to the previous one has been read, so a late reply is consumed
//! on the next tick instead of shifting every later reply by one.

use std::{
    io::{BufRead, BufReader, Write},
    net::{SocketAddr, TcpStream},
    time::Duration,
};

use log::{info, trace};

use super::{SimSensorState, SimulatorBackend, SimulatorSession};
use crate::error::{Result, SitlError};

pub const DEFAULT_PORT: u16 = 5555;
pub const CHANNELS: usize = 16;
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

pub fn format_outputs(values: &[f32]) -> String {
    let mut line = values
        .iter()
        .map(|v| format!("{:.4}", v))
        .collect::<Vec<_>>()
        .join(";");
    line.push('\n');
    line
}

/// Parse one telemetry line into `state`.
///
/// Fields that are missing or fail to parse leave the previous value in
/// place. Returns the number of fields applied.
pub fn parse_line(line: &str, state: &mut SimSensorState) -> usize {
    let fields: Vec<Option<f64>> = line
        .trim_end()
        .split(';')
        .map(|f| f.trim().parse::<f64>().ok())
        .collect();
    let get = |i: usize| fields.get(i).copied().flatten();
    let mut applied = 0;

    let mut set_f64 = |i: usize, slot: &mut f64| {
        if let Some(v) = get(i) {
            *slot = v;
            applied += 1;
        }
    };
    set_f64(0, &mut state.sim_time_s);
    set_f64(1, &mut state.lat_deg);
    set_f64(2, &mut state.lon_deg);
    set_f64(3, &mut state.alt_msl_m);

    let mut set_f32 = |i: usize, slot: &mut f32| {
        if let Some(v) = get(i) {
            *slot = v as f32;
            applied += 1;
        }
    };
    set_f32(5, &mut state.roll_deg);
    set_f32(6, &mut state.pitch_deg);
    set_f32(7, &mut state.yaw_deg);
    for axis in 0..3 {
        set_f32(8 + axis, &mut state.rate_dps[axis]);
        set_f32(11 + axis, &mut state.accel_g[axis]);
        set_f32(14 + axis, &mut state.vel_ned_ms[axis]);
    }
    set_f32(17, &mut state.airspeed_ms);
    set_f32(20, &mut state.battery_a);

    if let Some(agl) = get(4) {
        state.agl_m = Some(agl);
        applied += 1;
    }
    if let Some(pa) = get(18) {
        state.baro_pa = Some(pa);
        applied += 1;
    }
    if let Some(v) = get(19) {
        state.battery_v = Some(v as f32);
        applied += 1;
    }
    if get(1).is_some() && get(2).is_some() {
        state.position_valid = true;
    }
    applied
}

pub struct AdumsimBackend {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    reader: Option<BufReader<TcpStream>>,
    pending: String,
    awaiting_reply: bool,
}

impl AdumsimBackend {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            stream: None,
            reader: None,
            pending: String::new(),
            awaiting_reply: false,
        }
    }
}

impl SimulatorBackend for AdumsimBackend {
    fn name(&self) -> &'static str {
        "Adumsim"
    }

    fn connect(&mut self) -> Result<()> {
        let stream = TcpStream::connect_timeout(&self.addr, CONNECT_TIMEOUT).map_err(|source| {
            SitlError::Connect {
                target: self.addr.to_string(),
                source,
            }
        })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        self.reader = Some(BufReader::new(stream.try_clone()?));
        self.stream = Some(stream);
        self.pending.clear();
        self.awaiting_reply = false;
        info!("[Adumsim] connected to {}", self.addr);
        Ok(())
    }

    fn exchange(&mut self, session: &mut SimulatorSession) -> Result<()> {
        if self.awaiting_reply {
            trace!("[Adumsim] previous reply outstanding, not sending outputs");
        } else {
            let line = format_outputs(&session.actuators(CHANNELS));
            self.stream
                .as_mut()
                .ok_or(SitlError::Disconnected)?
                .write_all(line.as_bytes())?;
            self.awaiting_reply = true;
        }

        let reader = self.reader.as_mut().ok_or(SitlError::Disconnected)?;
        // a timeout mid-line leaves the partial text in `pending` for the next tick
        let n = reader.read_line(&mut self.pending)?;
        if n == 0 {
            self.stream = None;
            self.reader = None;
            return Err(SitlError::Disconnected);
        }
        if !self.pending.ends_with('\n') {
            return Err(SitlError::Timeout("adumsim line"));
        }
        // keep only the newest of any complete lines already buffered
        while reader.buffer().contains(&b'\n') {
            self.pending.clear();
            reader.read_line(&mut self.pending)?;
        }
        self.awaiting_reply = false;

        let applied = parse_line(&self.pending, &mut session.state);
        trace!("[Adumsim] {} fields from {:?}", applied, self.pending.trim_end());
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_line_format() {
        assert_eq!(format_outputs(&[0.5, -1.0, 0.123456]), "0.5000;-1.0000;0.1235\n");
    }

    #[test]
    fn full_line_maps_positions() {
        let line = "12.5;47.1;8.2;500;3;1;2;3;4;5;6;0;0;1;7;8;9;20;95000;12.6;4.5\n";
        let mut s = SimSensorState::default();
        assert_eq!(parse_line(line, &mut s), 21);
        assert_eq!(s.sim_time_s, 12.5);
        assert!(s.position_valid);
        assert_eq!((s.lat_deg, s.lon_deg, s.alt_msl_m), (47.1, 8.2, 500.0));
        assert_eq!(s.agl_m, Some(3.0));
        assert_eq!((s.roll_deg, s.pitch_deg, s.yaw_deg), (1.0, 2.0, 3.0));
        assert_eq!(s.rate_dps, [4.0, 5.0, 6.0]);
        assert_eq!(s.accel_g, [0.0, 0.0, 1.0]);
        assert_eq!(s.vel_ned_ms, [7.0, 8.0, 9.0]);
        assert_eq!(s.airspeed_ms, 20.0);
        assert_eq!(s.baro_pa, Some(95000.0));
        assert_eq!(s.battery_v, Some(12.6));
        assert_eq!(s.battery_a, 4.5);
    }

    #[test]
    fn bad_fields_keep_previous_values() {
        let mut s = SimSensorState::default();
        parse_line("1;47;8;100;;10;20;30", &mut s);
        let applied = parse_line("2;nan?;8.5;x;;11", &mut s);
        assert_eq!(applied, 3);
        assert_eq!(s.lat_deg, 47.0);
        assert_eq!(s.lon_deg, 8.5);
        assert_eq!(s.alt_msl_m, 100.0);
        assert_eq!(s.roll_deg, 11.0);
        assert_eq!(s.pitch_deg, 20.0);
        assert_eq!(s.agl_m, None);
    }
}
