//! Simulator backend clients and the exchange loop that drives them.
//!
//! A backend owns its transport; the loop owns the session. Every tick:
//! gather mapped outputs, exchange with the simulator, publish decoded
//! sensor values, then release the gate so one control step may run.

pub mod adumsim;
pub mod geo;
pub mod mapping;
pub mod realflight;
pub mod xplane;

use std::{
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use thread_priority::{ThreadBuilderExt, ThreadPriority};

use crate::error::{Result, SitlError};
use crate::fc::{Attitude, BatteryState, FcLinks, GpsFix};
use crate::sync::SimGate;
use crate::utils::metrics::{ExchangeFault, SharedMetrics, TraceRecorder, TraceRow};

pub use adumsim::AdumsimBackend;
pub use mapping::{ChannelMap, OutputMapping};
pub use realflight::RealFlightBackend;
pub use xplane::XPlaneBackend;

const CONNECT_RETRY_MS: u64 = 1_000;
const STANDARD_GRAVITY: f32 = 9.80665;
const RANGEFINDER_MAX_M: f64 = 10.0;
const SIM_GPS_SATS: u8 = 12;
const SIM_GPS_HDOP: u16 = 100;
const SIM_BARO_TEMP_CDEG: i32 = 2500;
/// Earth field in gauss, NED, mid-latitude with zero declination.
const EARTH_MAG_NED: [f32; 3] = [0.22, 0.0, 0.42];

/// One simulator client.
pub trait SimulatorBackend: Send {
    fn name(&self) -> &'static str;

    /// Establish (or re-establish) the transport and run startup actions.
    fn connect(&mut self) -> Result<()>;

    /// One request/response round trip: send the session's outputs, decode the reply into it.
    fn exchange(&mut self, session: &mut SimulatorSession) -> Result<()>;

    /// Whether the loop should reconnect after `err` instead of stopping.
    fn recoverable(&self, _err: &SitlError) -> bool {
        true
    }
}

/// Simulator state in simulator units, before conversion to firmware units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimSensorState {
    pub sim_time_s: f64,
    pub position_valid: bool,
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub alt_msl_m: f64,
    pub agl_m: Option<f64>,
    pub roll_deg: f32,
    pub pitch_deg: f32,
    pub yaw_deg: f32,
    /// Body rates p, q, r in deg/s.
    pub rate_dps: [f32; 3],
    /// Body specific force in g, `[0, 0, 1]` level at rest.
    pub accel_g: [f32; 3],
    /// North, east, down in m/s.
    pub vel_ned_ms: [f32; 3],
    pub airspeed_ms: f32,
    /// `None` derives pressure from `alt_msl_m`.
    pub baro_pa: Option<f64>,
    pub battery_v: Option<f32>,
    pub battery_a: f32,
    pub consumed_mah: f32,
}

/// Everything the exchange loop carries from tick to tick.
pub struct SimulatorSession {
    pub mapping: OutputMapping,
    pub state: SimSensorState,
    /// RC channels decoded from the simulator's joystick this tick, if any.
    pub joystick: Option<Vec<u16>>,
    links: FcLinks,
    use_imu: bool,
    joystick_rc: bool,
    ticks: u64,
}

impl SimulatorSession {
    pub fn new(links: FcLinks, mapping: OutputMapping, use_imu: bool) -> Self {
        Self {
            mapping,
            state: SimSensorState::default(),
            joystick: None,
            links,
            use_imu,
            joystick_rc: false,
            ticks: 0,
        }
    }

    /// Forward simulator joystick axes to the virtual receiver.
    pub fn with_joystick_rc(mut self, enabled: bool) -> Self {
        self.joystick_rc = enabled;
        self
    }

    pub fn joystick_rc(&self) -> bool {
        self.joystick_rc
    }

    /// Mapped outputs normalised by kind (motors 0..1, servos -1..1).
    pub fn actuators(&self, channels: usize) -> Vec<f32> {
        self.mapping.gather(self.links.outputs.as_ref(), channels)
    }

    /// Mapped outputs on a 0..1 scale.
    pub fn actuators_unit(&self, channels: usize) -> Vec<f32> {
        self.mapping.gather_unit(self.links.outputs.as_ref(), channels)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Push the decoded state through the fake-sensor setters.
    pub fn publish(&mut self) {
        let s = &self.state;
        let sensors = &self.links.sensors;

        if self.ticks == 0 {
            info!("[Sim] first exchange complete, simulator mode enabled");
            sensors.set_simulator_mode(true);
        }
        self.ticks += 1;

        let attitude = Attitude {
            roll_ddeg: deg_to_ddeg(s.roll_deg),
            pitch_ddeg: deg_to_ddeg(s.pitch_deg),
            yaw_ddeg: deg_to_ddeg(wrap_360(s.yaw_deg)),
        };
        sensors.set_attitude(attitude);

        if self.use_imu {
            sensors.set_accel(s.accel_g);
        } else {
            sensors.set_accel(gravity_body(s.roll_deg, s.pitch_deg));
        }
        sensors.set_gyro(s.rate_dps);
        sensors.set_mag(mag_body(s.roll_deg, s.pitch_deg, s.yaw_deg));

        let pressure = s.baro_pa.unwrap_or_else(|| isa_pressure_pa(s.alt_msl_m));
        sensors.set_baro(pressure.round() as i32, SIM_BARO_TEMP_CDEG);

        if s.position_valid {
            sensors.set_gps(gps_fix(s));
        }

        sensors.set_rangefinder(match s.agl_m {
            Some(agl) if (0.0..=RANGEFINDER_MAX_M).contains(&agl) => Some((agl * 100.0).round() as i32),
            _ => None,
        });
        sensors.set_airspeed((s.airspeed_ms.max(0.0) * 100.0).round() as u32);

        if let Some(volts) = s.battery_v {
            sensors.set_battery(BatteryState {
                voltage_cv: (volts.max(0.0) * 100.0).round() as u16,
                current_ca: (s.battery_a * 100.0).round() as i32,
                consumed_mah: s.consumed_mah.max(0.0).round() as u32,
            });
        }

        if let Some(channels) = self.joystick.take() {
            if self.joystick_rc {
                self.links.receiver.set_channels(&channels);
            }
        }
    }

    fn trace_row(&self, rec: &TraceRecorder, rtt_us: u64) -> TraceRow {
        let s = &self.state;
        let out = self.actuators(4);
        TraceRow {
            tick: self.ticks,
            ts_us: rec.now_us(),
            rtt_us,
            lat_deg: s.lat_deg,
            lon_deg: s.lon_deg,
            alt_m: s.alt_msl_m,
            roll_deg: s.roll_deg,
            pitch_deg: s.pitch_deg,
            yaw_deg: s.yaw_deg,
            gyro_x: s.rate_dps[0],
            gyro_y: s.rate_dps[1],
            gyro_z: s.rate_dps[2],
            acc_x: s.accel_g[0],
            acc_y: s.accel_g[1],
            acc_z: s.accel_g[2],
            airspeed_ms: s.airspeed_ms,
            baro_pa: s.baro_pa.unwrap_or_else(|| isa_pressure_pa(s.alt_msl_m)),
            out_1: out[0],
            out_2: out[1],
            out_3: out[2],
            out_4: out[3],
        }
    }
}

fn deg_to_ddeg(deg: f32) -> i16 {
    (deg * 10.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

fn wrap_360(deg: f32) -> f32 {
    deg.rem_euclid(360.0)
}

/// Gravity seen in the body frame for an ideal, unaccelerated airframe.
pub fn gravity_body(roll_deg: f32, pitch_deg: f32) -> [f32; 3] {
    let (sr, cr) = roll_deg.to_radians().sin_cos();
    let (sp, cp) = pitch_deg.to_radians().sin_cos();
    [-sp, sr * cp, cr * cp]
}

/// Earth magnetic field seen in the body frame at the given attitude.
pub fn mag_body(roll_deg: f32, pitch_deg: f32, yaw_deg: f32) -> [f32; 3] {
    let (sr, cr) = roll_deg.to_radians().sin_cos();
    let (sp, cp) = pitch_deg.to_radians().sin_cos();
    let (sy, cy) = yaw_deg.to_radians().sin_cos();
    let [n, e, d] = EARTH_MAG_NED;
    let dcm = [
        [cp * cy, cp * sy, -sp],
        [sr * sp * cy - cr * sy, sr * sp * sy + cr * cy, sr * cp],
        [cr * sp * cy + sr * sy, cr * sp * sy - sr * cy, cr * cp],
    ];
    dcm.map(|row| row[0] * n + row[1] * e + row[2] * d)
}

/// Convert a body acceleration in m/s^2 into g.
pub fn mps2_to_g(a: f32) -> f32 {
    a / STANDARD_GRAVITY
}

/// ISA troposphere pressure at `alt_m` above mean sea level.
pub fn isa_pressure_pa(alt_m: f64) -> f64 {
    101_325.0 * (1.0 - 2.255_77e-5 * alt_m).powf(5.255_88)
}

fn gps_fix(s: &SimSensorState) -> GpsFix {
    let [vn, ve, vd] = s.vel_ned_ms;
    let ground_speed = vn.hypot(ve);
    let course = wrap_360(ve.atan2(vn).to_degrees());
    GpsFix {
        fix_3d: true,
        num_sat: SIM_GPS_SATS,
        lat_e7: GpsFix::deg_to_e7(s.lat_deg),
        lon_e7: GpsFix::deg_to_e7(s.lon_deg),
        alt_cm: (s.alt_msl_m * 100.0).round() as i32,
        ground_speed_cms: (ground_speed * 100.0).round().min(u16::MAX as f32) as u16,
        ground_course_ddeg: ((course * 10.0).round() as u16) % 3600,
        vel_ned_cms: [ms_to_cms(vn), ms_to_cms(ve), ms_to_cms(vd)],
        hdop: SIM_GPS_HDOP,
    }
}

fn ms_to_cms(v: f32) -> i16 {
    (v * 100.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

// ============================================================================
// Exchange loop
// ============================================================================

/// Collaborators of the exchange loop.
pub struct ExchangeContext {
    pub gate: SimGate,
    pub metrics: SharedMetrics,
    pub trace: Option<TraceRecorder>,
}

/// Connect `backend`, retrying until it succeeds.
fn connect_with_retry(backend: &mut dyn SimulatorBackend, ctx: &ExchangeContext) {
    let started = Instant::now();
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        match backend.connect() {
            Ok(()) => {
                ctx.metrics.lock().record_connect(started.elapsed().as_micros() as u64);
                info!(
                    "[Sim] {} connected after {} attempt(s) in {:?}",
                    backend.name(),
                    attempts,
                    started.elapsed()
                );
                return;
            }
            Err(e) => {
                if attempts == 1 {
                    warn!("[Sim] {} connect failed: {} (retrying)", backend.name(), e);
                } else {
                    debug!("[Sim] {} connect attempt {}: {}", backend.name(), attempts, e);
                }
                thread::sleep(Duration::from_millis(CONNECT_RETRY_MS));
            }
        }
    }
}

/// Run the exchange loop of `backend` on a max-priority thread.
pub fn spawn_exchange_loop(
    mut backend: Box<dyn SimulatorBackend>,
    mut session: SimulatorSession,
    ctx: ExchangeContext,
) -> std::io::Result<JoinHandle<()>> {
    let name = format!("sim-{}", backend.name().to_ascii_lowercase());
    ctx.metrics.lock().backend = Some(backend.name());

    thread::Builder::new().name(name).spawn_with_priority(ThreadPriority::Max, move |prio| {
        if let Err(e) = prio {
            debug!("[Sim] could not raise exchange thread priority: {:?}", e);
        }
        connect_with_retry(backend.as_mut(), &ctx);

        loop {
            let t0 = Instant::now();
            match backend.exchange(&mut session) {
                Ok(()) => {
                    session.publish();
                    ctx.gate.release();
                    let rtt_us = t0.elapsed().as_micros() as u64;
                    ctx.metrics.lock().record_exchange(rtt_us);
                    if let Some(rec) = &ctx.trace {
                        rec.record(session.trace_row(rec, rtt_us));
                    }
                }
                Err(e) if e.is_timeout() => {
                    debug!("[Sim] {} no reply this cycle: {}", backend.name(), e);
                    ctx.metrics.lock().record_fault(ExchangeFault::Timeout);
                }
                Err(e) if backend.recoverable(&e) => {
                    warn!("[Sim] {} exchange failed: {} (reconnecting)", backend.name(), e);
                    ctx.metrics.lock().record_fault(ExchangeFault::Reconnect);
                    connect_with_retry(backend.as_mut(), &ctx);
                }
                Err(e) => {
                    error!("[Sim] {} exchange failed: {} (stopping)", backend.name(), e);
                    ctx.metrics.lock().record_fault(ExchangeFault::Fatal);
                    break;
                }
            }
        }
        info!("[Sim] {} exchange loop stopped after {} ticks", backend.name(), session.ticks());
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fc::{FakeSensors, OutputBank, VirtualReceiver};

    fn session(use_imu: bool) -> (Arc<FakeSensors>, Arc<VirtualReceiver>, SimulatorSession) {
        let sensors = Arc::new(FakeSensors::new());
        let receiver = Arc::new(VirtualReceiver::new());
        let links = FcLinks {
            sensors: sensors.clone(),
            receiver: receiver.clone(),
            outputs: Arc::new(OutputBank::new()),
        };
        (sensors, receiver, SimulatorSession::new(links, OutputMapping::default(), use_imu))
    }

    #[test]
    fn first_publish_enables_simulator_mode() {
        let (sensors, _rx, mut s) = session(true);
        assert!(!sensors.snapshot().simulator_mode);
        s.publish();
        assert!(sensors.snapshot().simulator_mode);
        assert_eq!(s.ticks(), 1);
    }

    #[test]
    fn gps_only_with_valid_position() {
        let (sensors, _rx, mut s) = session(true);
        s.publish();
        assert_eq!(sensors.snapshot().gps_updates, 0);

        s.state.position_valid = true;
        s.state.lat_deg = 47.5;
        s.state.lon_deg = -8.25;
        s.state.alt_msl_m = 410.0;
        s.state.vel_ned_ms = [0.0, 10.0, -1.0];
        s.publish();
        let gps = sensors.snapshot().gps;
        assert_eq!(gps.lat_e7, 475_000_000);
        assert_eq!(gps.lon_e7, -82_500_000);
        assert_eq!(gps.alt_cm, 41_000);
        assert_eq!(gps.ground_speed_cms, 1000);
        assert_eq!(gps.ground_course_ddeg, 900);
        assert_eq!(gps.vel_ned_cms, [0, 1000, -100]);
    }

    #[test]
    fn synthesised_imu_follows_attitude() {
        let (sensors, _rx, mut s) = session(false);
        s.state.accel_g = [5.0, 5.0, 5.0];
        s.state.roll_deg = 90.0;
        s.publish();
        let acc = sensors.snapshot().accel_g;
        assert!(acc[0].abs() < 1e-6);
        assert!((acc[1] - 1.0).abs() < 1e-6);
        assert!(acc[2].abs() < 1e-6);
    }

    /// Tilt-compensated heading as a flight controller computes it.
    fn heading_deg(mag: [f32; 3], roll_deg: f32, pitch_deg: f32) -> f32 {
        let (sr, cr) = roll_deg.to_radians().sin_cos();
        let (sp, cp) = pitch_deg.to_radians().sin_cos();
        let xh = mag[0] * cp + mag[1] * sr * sp + mag[2] * cr * sp;
        let yh = mag[1] * cr - mag[2] * sr;
        wrap_360((-yh).atan2(xh).to_degrees())
    }

    #[test]
    fn magnetometer_tracks_heading() {
        let (sensors, _rx, mut s) = session(true);
        for (roll, pitch, yaw) in [(0.0, 0.0, 0.0), (10.0, 0.0, 90.0), (-20.0, 15.0, 235.0)] {
            s.state.roll_deg = roll;
            s.state.pitch_deg = pitch;
            s.state.yaw_deg = yaw;
            s.publish();
            let mag = sensors.snapshot().mag;
            let norm = mag.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 0.22f32.hypot(0.42)).abs() < 1e-4);
            let err = (heading_deg(mag, roll, pitch) - yaw + 540.0).rem_euclid(360.0) - 180.0;
            assert!(err.abs() < 0.5, "yaw {} read back as {:?}", yaw, mag);
        }
    }

    #[test]
    fn rangefinder_and_baro() {
        let (sensors, _rx, mut s) = session(true);
        s.state.agl_m = Some(2.5);
        s.publish();
        let snap = sensors.snapshot();
        assert_eq!(snap.rangefinder_cm, Some(250));
        assert_eq!(snap.baro_pa, 101_325);

        s.state.agl_m = Some(50.0);
        s.state.baro_pa = Some(95_000.4);
        s.publish();
        let snap = sensors.snapshot();
        assert_eq!(snap.rangefinder_cm, None);
        assert_eq!(snap.baro_pa, 95_000);
    }

    #[test]
    fn joystick_only_when_enabled() {
        let (_sensors, rx, s) = session(true);
        let mut s = s.with_joystick_rc(false);
        s.joystick = Some(vec![1100, 1200, 1300, 1400]);
        s.publish();
        assert_eq!(rx.frame_count(), 0);

        let mut s = s.with_joystick_rc(true);
        s.joystick = Some(vec![1100, 1200, 1300, 1400]);
        s.publish();
        assert_eq!(rx.channel(3), Some(1400));
    }

    #[test]
    fn isa_reference_points() {
        assert!((isa_pressure_pa(0.0) - 101_325.0).abs() < 1e-6);
        assert!((isa_pressure_pa(1000.0) - 89_875.0).abs() < 10.0);
    }
}
