//! sensors.rs
//! Fake-sensor setters and the store that backs them in SITL.
//!
//! Units are the firmware's:
//! - accelerometer: specific force in g, body frame, reads `[0, 0, 1]` level at rest
//! - gyro: deg/s, body frame (roll, pitch, yaw rate)
//! - baro: Pa and centi-degrees C
//! - GPS: 1e-7 degree integers, cm, cm/s, deci-degrees
//! - attitude: deci-degrees

use parking_lot::Mutex;

/// GPS solution in the firmware's integer encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpsFix {
    pub fix_3d: bool,
    pub num_sat: u8,
    pub lat_e7: i32,
    pub lon_e7: i32,
    pub alt_cm: i32,
    pub ground_speed_cms: u16,
    pub ground_course_ddeg: u16,
    /// North, east, down.
    pub vel_ned_cms: [i16; 3],
    pub hdop: u16,
}

impl GpsFix {
    /// Encode degrees into the 1e-7 integer representation.
    pub fn deg_to_e7(deg: f64) -> i32 {
        (deg * 1e7).round() as i32
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatteryState {
    pub voltage_cv: u16,
    pub current_ca: i32,
    pub consumed_mah: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attitude {
    pub roll_ddeg: i16,
    pub pitch_ddeg: i16,
    pub yaw_ddeg: i16,
}

/// Setters the simulator clients push decoded values through.
pub trait SensorSink: Send + Sync {
    fn set_accel(&self, accel_g: [f32; 3]);
    fn set_gyro(&self, rate_dps: [f32; 3]);
    fn set_baro(&self, pressure_pa: i32, temperature_cdeg: i32);
    fn set_mag(&self, field: [f32; 3]);
    fn set_gps(&self, fix: GpsFix);
    /// `None` means out of range.
    fn set_rangefinder(&self, distance_cm: Option<i32>);
    fn set_airspeed(&self, airspeed_cms: u32);
    fn set_battery(&self, battery: BatteryState);
    /// Attitude estimate used when the simulator IMU is bypassed.
    fn set_attitude(&self, attitude: Attitude);
    /// Enables the simulated-mode arming flags.
    fn set_simulator_mode(&self, enabled: bool);
}

/// Everything the fake sensors currently report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorSnapshot {
    pub accel_g: [f32; 3],
    pub gyro_dps: [f32; 3],
    pub baro_pa: i32,
    pub baro_temp_cdeg: i32,
    pub mag: [f32; 3],
    pub gps: GpsFix,
    pub rangefinder_cm: Option<i32>,
    pub airspeed_cms: u32,
    pub battery: BatteryState,
    pub attitude: Attitude,
    pub simulator_mode: bool,
    /// Bumped on every GPS write so consumers can see fresh fixes.
    pub gps_updates: u64,
}

/// Last-writer-wins sensor store.
#[derive(Debug, Default)]
pub struct FakeSensors {
    state: Mutex<SensorSnapshot>,
}

impl FakeSensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        *self.state.lock()
    }
}

impl SensorSink for FakeSensors {
    fn set_accel(&self, accel_g: [f32; 3]) {
        self.state.lock().accel_g = accel_g;
    }

    fn set_gyro(&self, rate_dps: [f32; 3]) {
        self.state.lock().gyro_dps = rate_dps;
    }

    fn set_baro(&self, pressure_pa: i32, temperature_cdeg: i32) {
        let mut s = self.state.lock();
        s.baro_pa = pressure_pa;
        s.baro_temp_cdeg = temperature_cdeg;
    }

    fn set_mag(&self, field: [f32; 3]) {
        self.state.lock().mag = field;
    }

    fn set_gps(&self, fix: GpsFix) {
        let mut s = self.state.lock();
        s.gps = fix;
        s.gps_updates += 1;
    }

    fn set_rangefinder(&self, distance_cm: Option<i32>) {
        self.state.lock().rangefinder_cm = distance_cm;
    }

    fn set_airspeed(&self, airspeed_cms: u32) {
        self.state.lock().airspeed_cms = airspeed_cms;
    }

    fn set_battery(&self, battery: BatteryState) {
        self.state.lock().battery = battery;
    }

    fn set_attitude(&self, attitude: Attitude) {
        self.state.lock().attitude = attitude;
    }

    fn set_simulator_mode(&self, enabled: bool) {
        self.state.lock().simulator_mode = enabled;
    }
}
