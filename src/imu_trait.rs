// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, unavailable_error};
use log::debug;
use nix::time::{ClockId, clock_gettime};

// Acceleration data from IMU.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccelData {
    // m/s².
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

// Angular velocity data from IMU.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GyroData {
    // Degrees/second.
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

// Magnetic field data from IMU.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MagData {
    // Microtesla.
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

// Orientation as reported by the device's fusion processor. Not necessarily
// normalized; the all-zero value is produced by some devices before their
// first fusion output and must not be treated as a rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Quaternion{w, x, y, z}
    }

    pub fn identity() -> Self {
        Quaternion{w: 1.0, x: 0.0, y: 0.0, z: 0.0}
    }

    pub fn norm(&self) -> f64 {
        (self.w * self.w + self.x * self.x +
         self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn negated(&self) -> Self {
        Quaternion{w: -self.w, x: -self.x, y: -self.y, z: -self.z}
    }

    // Exact bit patterns of the four components, usable as a hash key.
    pub fn to_bits(&self) -> [u64; 4] {
        [self.w.to_bits(), self.x.to_bits(), self.y.to_bits(), self.z.to_bits()]
    }
}

/// One raw acquisition from the IMU. Produced once per scheduler tick and
/// never modified afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub dev_id: String,

    // Milliseconds since an arbitrary (but fixed) epoch. Strictly increasing
    // across samples from one source.
    pub time_ms: i64,

    pub accel: AccelData,
    pub gyro: GyroData,
    pub mag: MagData,
    pub quaternion: Quaternion,
}

// Yaw, pitch and roll derived from a Sample's quaternion. See
// quaternion_converter for the ranges of each angle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Orientation {
    // Degrees.
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

/// A Sample together with its derived Orientation. This is what sinks
/// receive.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub sample: Sample,
    pub orientation: Orientation,
}

pub trait SampleSource {
    // Acquires the current accel/gyro/mag/orientation values. Blocks only as
    // long as the underlying bus transactions take. Returns unavailable_error
    // if the device cannot be read or if any of the sub-sensors has not yet
    // produced data.
    fn poll(&mut self) -> Result<Sample, CanonicalError>;

    // Returns the IMU's model.
    fn get_model(&self) -> String;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn poll(&mut self) -> Result<Sample, CanonicalError> {
        (**self).poll()
    }

    fn get_model(&self) -> String {
        (**self).get_model()
    }
}

/// Milliseconds on the system monotonic clock. Unaffected by wall clock
/// adjustments.
pub fn monotonic_millis() -> Result<i64, CanonicalError> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map_err(|e| unavailable_error(
            &format!("Failed to read monotonic clock: {:?}", e)))?;
    Ok(now.tv_sec() as i64 * 1000 + now.tv_nsec() as i64 / 1_000_000)
}

// Turns a non-decreasing millisecond clock into a strictly increasing
// sequence of sample timestamps. Two polls less than a millisecond apart
// (e.g. after a scheduler overrun) would otherwise share a timestamp.
#[derive(Debug, Default)]
pub struct TimestampSequencer {
    last: Option<i64>,
}

impl TimestampSequencer {
    pub fn new() -> Self {
        TimestampSequencer{last: None}
    }

    pub fn next(&mut self, now_ms: i64) -> i64 {
        let stamp = match self.last {
            Some(last) if now_ms <= last => {
                debug!("Time arg regressed from {} to {}", last, now_ms);
                last + 1
            },
            _ => now_ms,
        };
        self.last = Some(stamp);
        stamp
    }
}

// mod tests.
