//! The message catalog: command codes and their payload layouts.
//!
//! Multi-byte fields are little-endian throughout. Decoders take the raw
//! response payload; encoders produce the raw request payload. Values
//! the protocol scales by ten (angles, voltages, declination) are
//! exposed as `f64` in engineering units.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;

/// Command codes understood by the device.
pub mod codes {
    pub const IDENT: u8 = 100;
    pub const STATUS: u8 = 101;
    pub const RAW_IMU: u8 = 102;
    pub const SERVO: u8 = 103;
    pub const MOTOR: u8 = 104;
    pub const RC: u8 = 105;
    pub const RAW_GPS: u8 = 106;
    pub const COMP_GPS: u8 = 107;
    pub const ATTITUDE: u8 = 108;
    pub const ALTITUDE: u8 = 109;
    pub const ANALOG: u8 = 110;
    pub const RC_TUNING: u8 = 111;
    pub const PID: u8 = 112;
    pub const BOXES: u8 = 113;
    pub const MISC: u8 = 114;
    pub const MOTOR_PINS: u8 = 115;
    pub const BOX_NAMES: u8 = 116;
    pub const PID_NAMES: u8 = 117;
    pub const WAYPOINT: u8 = 118;
    pub const BOX_IDS: u8 = 119;
    pub const SERVO_CONF: u8 = 120;

    pub const SET_RAW_RC: u8 = 200;
    pub const SET_RAW_GPS: u8 = 201;
    pub const SET_PID: u8 = 202;
    pub const SET_BOXES: u8 = 203;
    pub const SET_RC_TUNING: u8 = 204;
    pub const ACC_CALIBRATION: u8 = 205;
    pub const MAG_CALIBRATION: u8 = 206;
    pub const SET_MISC: u8 = 207;
    pub const RESET_CONF: u8 = 208;
    pub const SET_WAYPOINT: u8 = 209;
    pub const SELECT_SETTING: u8 = 210;
    pub const SET_HEADING: u8 = 211;
    pub const SET_SERVO_CONF: u8 = 212;
}

/// Errors produced by catalog decoders.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The response payload is shorter than the record layout requires.
    #[error("truncated payload for code {code}: need {expected} bytes, got {actual}")]
    Truncated {
        code: u8,
        expected: usize,
        actual: usize,
    },
}

fn ensure(code: u8, data: &[u8], expected: usize) -> Result<(), CatalogError> {
    if data.len() < expected {
        return Err(CatalogError::Truncated {
            code,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Firmware identity (code 100).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ident {
    pub version: u8,
    pub multi_type: u8,
    pub msp_version: u8,
    pub capability: u32,
}

impl Ident {
    pub fn decode(data: &[u8]) -> Result<Self, CatalogError> {
        ensure(codes::IDENT, data, 7)?;
        let mut b = data;
        Ok(Self {
            version: b.get_u8(),
            multi_type: b.get_u8(),
            msp_version: b.get_u8(),
            capability: b.get_u32_le(),
        })
    }
}

/// Device status (code 101).
///
/// `box_activation` is a raw bitfield; bit `i` corresponds to entry `i`
/// of the box-names list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub cycle_time_us: u16,
    pub i2c_error_count: u16,
    pub acc_present: bool,
    pub baro_present: bool,
    pub mag_present: bool,
    pub gps_present: bool,
    pub sonar_present: bool,
    pub box_activation: u32,
    pub current_setting: u8,
}

impl Status {
    pub fn decode(data: &[u8]) -> Result<Self, CatalogError> {
        ensure(codes::STATUS, data, 11)?;
        let mut b = data;
        let cycle_time_us = b.get_u16_le();
        let i2c_error_count = b.get_u16_le();
        let sensors = b.get_u16_le();
        let box_activation = b.get_u32_le();
        let current_setting = b.get_u8();
        Ok(Self {
            cycle_time_us,
            i2c_error_count,
            acc_present: sensors & 1 != 0,
            baro_present: sensors & 2 != 0,
            mag_present: sensors & 4 != 0,
            gps_present: sensors & 8 != 0,
            sonar_present: sensors & 16 != 0,
            box_activation,
            current_setting,
        })
    }

    /// Whether box `index` is active.
    pub fn box_active(&self, index: u8) -> bool {
        index < 32 && self.box_activation & (1 << index) != 0
    }
}

/// A signed three-axis sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Vector3 {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

/// Raw inertial samples (code 102).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawImu {
    pub gyro: Vector3,
    pub acc: Vector3,
    pub mag: Vector3,
}

impl RawImu {
    pub fn decode(data: &[u8]) -> Result<Self, CatalogError> {
        ensure(codes::RAW_IMU, data, 18)?;
        let mut b = data;
        let mut axis = || Vector3 {
            x: b.get_i16_le(),
            y: b.get_i16_le(),
            z: b.get_i16_le(),
        };
        Ok(Self {
            gyro: axis(),
            acc: axis(),
            mag: axis(),
        })
    }
}

/// Decode eight consecutive `u16` values (codes 103 and 104).
fn decode_u16x8(code: u8, data: &[u8]) -> Result<[u16; 8], CatalogError> {
    ensure(code, data, 16)?;
    let mut b = data;
    Ok(std::array::from_fn(|_| b.get_u16_le()))
}

/// Servo outputs (code 103).
pub fn decode_servo(data: &[u8]) -> Result<[u16; 8], CatalogError> {
    decode_u16x8(codes::SERVO, data)
}

/// Motor outputs (code 104).
pub fn decode_motor(data: &[u8]) -> Result<[u16; 8], CatalogError> {
    decode_u16x8(codes::MOTOR, data)
}

/// RC channel values (code 105); also the payload of `set_raw_rc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RcChannels {
    pub roll: u16,
    pub pitch: u16,
    pub yaw: u16,
    pub throttle: u16,
    pub aux1: u16,
    pub aux2: u16,
    pub aux3: u16,
    pub aux4: u16,
}

impl RcChannels {
    pub fn decode(data: &[u8]) -> Result<Self, CatalogError> {
        ensure(codes::RC, data, 16)?;
        let mut b = data;
        Ok(Self {
            roll: b.get_u16_le(),
            pitch: b.get_u16_le(),
            yaw: b.get_u16_le(),
            throttle: b.get_u16_le(),
            aux1: b.get_u16_le(),
            aux2: b.get_u16_le(),
            aux3: b.get_u16_le(),
            aux4: b.get_u16_le(),
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(16);
        for value in [
            self.roll,
            self.pitch,
            self.yaw,
            self.throttle,
            self.aux1,
            self.aux2,
            self.aux3,
            self.aux4,
        ] {
            buf.put_u16_le(value);
        }
        buf
    }
}

/// GPS fix (code 106).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawGps {
    pub fix: bool,
    pub num_sat: u8,
    /// Degrees.
    pub latitude: f64,
    /// Degrees.
    pub longitude: f64,
    /// Meters.
    pub altitude: u16,
    /// cm/s.
    pub speed: u16,
    /// Degrees.
    pub ground_course: f64,
}

impl RawGps {
    pub fn decode(data: &[u8]) -> Result<Self, CatalogError> {
        ensure(codes::RAW_GPS, data, 16)?;
        let mut b = data;
        Ok(Self {
            fix: b.get_u8() == 1,
            num_sat: b.get_u8(),
            latitude: f64::from(b.get_u32_le()) / 10_000_000.0,
            longitude: f64::from(b.get_u32_le()) / 10_000_000.0,
            altitude: b.get_u16_le(),
            speed: b.get_u16_le(),
            ground_course: f64::from(b.get_u16_le()) / 10.0,
        })
    }
}

/// Home-relative GPS data (code 107).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompGps {
    pub distance_to_home: u16,
    pub direction_to_home: u16,
    pub update: u8,
}

impl CompGps {
    pub fn decode(data: &[u8]) -> Result<Self, CatalogError> {
        ensure(codes::COMP_GPS, data, 5)?;
        let mut b = data;
        Ok(Self {
            distance_to_home: b.get_u16_le(),
            direction_to_home: b.get_u16_le(),
            update: b.get_u8(),
        })
    }
}

/// Attitude estimate (code 108). Angles in degrees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attitude {
    pub x: f64,
    pub y: f64,
    pub heading: i16,
}

impl Attitude {
    pub fn decode(data: &[u8]) -> Result<Self, CatalogError> {
        ensure(codes::ATTITUDE, data, 6)?;
        let mut b = data;
        Ok(Self {
            x: f64::from(b.get_i16_le()) / 10.0,
            y: f64::from(b.get_i16_le()) / 10.0,
            heading: b.get_i16_le(),
        })
    }
}

/// Altitude estimate (code 109).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Altitude {
    /// Centimeters.
    pub estimated: i32,
    /// cm/s.
    pub vario: i16,
}

impl Altitude {
    pub fn decode(data: &[u8]) -> Result<Self, CatalogError> {
        ensure(codes::ALTITUDE, data, 6)?;
        let mut b = data;
        Ok(Self {
            estimated: b.get_i32_le(),
            vario: b.get_i16_le(),
        })
    }
}

/// Analog measurements (code 110).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analog {
    /// Volts.
    pub vbat: f64,
    pub int_power_meter_sum: u16,
    pub rssi: u16,
    pub amperage: u16,
}

impl Analog {
    pub fn decode(data: &[u8]) -> Result<Self, CatalogError> {
        ensure(codes::ANALOG, data, 7)?;
        let mut b = data;
        Ok(Self {
            vbat: f64::from(b.get_u8()) / 10.0,
            int_power_meter_sum: b.get_u16_le(),
            rssi: b.get_u16_le(),
            amperage: b.get_u16_le(),
        })
    }
}

/// RC rate/expo tuning (code 111); also the payload of `set_rc_tuning`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RcTuning {
    pub rc_rate: u8,
    pub rc_expo: u8,
    pub roll_pitch_rate: u8,
    pub yaw_rate: u8,
    pub dyn_throttle_pid: u8,
    pub throttle_mid: u8,
    pub throttle_expo: u8,
}

impl RcTuning {
    pub fn decode(data: &[u8]) -> Result<Self, CatalogError> {
        ensure(codes::RC_TUNING, data, 7)?;
        let mut b = data;
        Ok(Self {
            rc_rate: b.get_u8(),
            rc_expo: b.get_u8(),
            roll_pitch_rate: b.get_u8(),
            yaw_rate: b.get_u8(),
            dyn_throttle_pid: b.get_u8(),
            throttle_mid: b.get_u8(),
            throttle_expo: b.get_u8(),
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(7);
        buf.put_u8(self.rc_rate);
        buf.put_u8(self.rc_expo);
        buf.put_u8(self.roll_pitch_rate);
        buf.put_u8(self.yaw_rate);
        buf.put_u8(self.dyn_throttle_pid);
        buf.put_u8(self.throttle_mid);
        buf.put_u8(self.throttle_expo);
        buf
    }
}

/// One PID term triplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PidTriplet {
    pub p: u8,
    pub i: u8,
    pub d: u8,
}

/// The full PID bank (code 112); also the payload of `set_pid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pid {
    pub roll: PidTriplet,
    pub pitch: PidTriplet,
    pub yaw: PidTriplet,
    pub altitude: PidTriplet,
    pub pos: PidTriplet,
    pub posr: PidTriplet,
    pub navr: PidTriplet,
    pub level: PidTriplet,
    pub mag: PidTriplet,
    pub vel: PidTriplet,
}

impl Pid {
    pub fn decode(data: &[u8]) -> Result<Self, CatalogError> {
        ensure(codes::PID, data, 30)?;
        let mut b = data;
        let mut triplet = || PidTriplet {
            p: b.get_u8(),
            i: b.get_u8(),
            d: b.get_u8(),
        };
        Ok(Self {
            roll: triplet(),
            pitch: triplet(),
            yaw: triplet(),
            altitude: triplet(),
            pos: triplet(),
            posr: triplet(),
            navr: triplet(),
            level: triplet(),
            mag: triplet(),
            vel: triplet(),
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(30);
        for triplet in [
            self.roll,
            self.pitch,
            self.yaw,
            self.altitude,
            self.pos,
            self.posr,
            self.navr,
            self.level,
            self.mag,
            self.vel,
        ] {
            buf.put_u8(triplet.p);
            buf.put_u8(triplet.i);
            buf.put_u8(triplet.d);
        }
        buf
    }
}

/// Box activation ranges (code 113): one `u16` per box.
pub fn decode_boxes(data: &[u8]) -> Result<Vec<u16>, CatalogError> {
    let mut b = data;
    let mut boxes = Vec::with_capacity(data.len() / 2);
    while b.remaining() >= 2 {
        boxes.push(b.get_u16_le());
    }
    Ok(boxes)
}

/// Encode the payload of `set_boxes`.
pub fn encode_boxes(boxes: &[u16]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(boxes.len() * 2);
    for value in boxes {
        buf.put_u16_le(*value);
    }
    buf
}

/// Miscellaneous configuration (code 114); also the payload of
/// `set_misc`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Misc {
    pub int_power_trigger: u16,
    pub min_throttle: u16,
    pub max_throttle: u16,
    pub min_command: u16,
    pub failsafe_throttle: u16,
    pub arm_counter: u16,
    pub lifetime: u32,
    /// Degrees.
    pub mag_declination: f64,
    pub vbat_scale: u8,
    /// Volts.
    pub vbat_warn1: f64,
    /// Volts.
    pub vbat_warn2: f64,
    /// Volts.
    pub vbat_critical: f64,
}

impl Misc {
    pub fn decode(data: &[u8]) -> Result<Self, CatalogError> {
        ensure(codes::MISC, data, 22)?;
        let mut b = data;
        Ok(Self {
            int_power_trigger: b.get_u16_le(),
            min_throttle: b.get_u16_le(),
            max_throttle: b.get_u16_le(),
            min_command: b.get_u16_le(),
            failsafe_throttle: b.get_u16_le(),
            arm_counter: b.get_u16_le(),
            lifetime: b.get_u32_le(),
            mag_declination: f64::from(b.get_u16_le()) / 10.0,
            vbat_scale: b.get_u8(),
            vbat_warn1: f64::from(b.get_u8()) / 10.0,
            vbat_warn2: f64::from(b.get_u8()) / 10.0,
            vbat_critical: f64::from(b.get_u8()) / 10.0,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(22);
        buf.put_u16_le(self.int_power_trigger);
        buf.put_u16_le(self.min_throttle);
        buf.put_u16_le(self.max_throttle);
        buf.put_u16_le(self.min_command);
        buf.put_u16_le(self.failsafe_throttle);
        buf.put_u16_le(self.arm_counter);
        buf.put_u32_le(self.lifetime);
        buf.put_u16_le((self.mag_declination * 10.0).round() as u16);
        buf.put_u8(self.vbat_scale);
        buf.put_u8((self.vbat_warn1 * 10.0).round() as u8);
        buf.put_u8((self.vbat_warn2 * 10.0).round() as u8);
        buf.put_u8((self.vbat_critical * 10.0).round() as u8);
        buf
    }
}

/// Motor pin assignments (code 115).
pub fn decode_motor_pins(data: &[u8]) -> Result<[u8; 8], CatalogError> {
    ensure(codes::MOTOR_PINS, data, 8)?;
    let mut b = data;
    Ok(std::array::from_fn(|_| b.get_u8()))
}

/// Decode a `;`-separated name list (codes 116 and 117).
pub fn decode_names(data: &[u8]) -> Result<Vec<String>, CatalogError> {
    Ok(String::from_utf8_lossy(data)
        .split(';')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect())
}

/// A navigation waypoint (code 118); also the payload of `set_waypoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Waypoint {
    pub wp_no: u8,
    pub latitude: u32,
    pub longitude: u32,
    pub alt_hold: u32,
    pub heading: u16,
    pub time_to_stay: u16,
    pub nav_flag: u8,
}

impl Waypoint {
    pub fn decode(data: &[u8]) -> Result<Self, CatalogError> {
        ensure(codes::WAYPOINT, data, 18)?;
        let mut b = data;
        Ok(Self {
            wp_no: b.get_u8(),
            latitude: b.get_u32_le(),
            longitude: b.get_u32_le(),
            alt_hold: b.get_u32_le(),
            heading: b.get_u16_le(),
            time_to_stay: b.get_u16_le(),
            nav_flag: b.get_u8(),
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(18);
        buf.put_u8(self.wp_no);
        buf.put_u32_le(self.latitude);
        buf.put_u32_le(self.longitude);
        buf.put_u32_le(self.alt_hold);
        buf.put_u16_le(self.heading);
        buf.put_u16_le(self.time_to_stay);
        buf.put_u8(self.nav_flag);
        buf
    }
}

/// Box ids (code 119).
pub fn decode_box_ids(data: &[u8]) -> Result<Vec<i8>, CatalogError> {
    let mut b = data;
    let mut ids = Vec::with_capacity(data.len());
    while b.has_remaining() {
        ids.push(b.get_i8());
    }
    Ok(ids)
}

/// One servo configuration slot (code 120); eight slots form the payload
/// of `set_servo_conf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServoConfEntry {
    pub min: u16,
    pub max: u16,
    pub middle: u16,
    pub rate: u8,
}

/// Decode the eight servo configuration slots.
pub fn decode_servo_conf(data: &[u8]) -> Result<[ServoConfEntry; 8], CatalogError> {
    ensure(codes::SERVO_CONF, data, 56)?;
    let mut b = data;
    Ok(std::array::from_fn(|_| ServoConfEntry {
        min: b.get_u16_le(),
        max: b.get_u16_le(),
        middle: b.get_u16_le(),
        rate: b.get_u8(),
    }))
}

/// Encode the payload of `set_servo_conf`.
pub fn encode_servo_conf(entries: &[ServoConfEntry; 8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(56);
    for entry in entries {
        buf.put_u16_le(entry.min);
        buf.put_u16_le(entry.max);
        buf.put_u16_le(entry.middle);
        buf.put_u8(entry.rate);
    }
    buf
}

/// The payload of `set_raw_gps` — a ground-station GPS injection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpsUpdate {
    pub fix: bool,
    pub num_sat: u8,
    /// Degrees.
    pub latitude: f64,
    /// Degrees.
    pub longitude: f64,
    /// Meters.
    pub altitude: u16,
    /// cm/s.
    pub speed: u16,
}

impl GpsUpdate {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(14);
        buf.put_u8(u8::from(self.fix));
        buf.put_u8(self.num_sat);
        buf.put_u32_le((self.latitude * 10_000_000.0).round() as u32);
        buf.put_u32_le((self.longitude * 10_000_000.0).round() as u32);
        buf.put_u16_le(self.altitude);
        buf.put_u16_le(self.speed);
        buf
    }
}
