// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::CanonicalError;
use rand::{Rng, SeedableRng};
use rand::rngs::SmallRng;

use crate::imu_trait::{AccelData, GyroData, MagData, Quaternion, Sample,
                       SampleSource, TimestampSequencer, monotonic_millis};

const G: f64 = 9.81;  // Standard gravity in m/s².

// Stand-in for a real IMU when none is attached. The simulated device sits
// level and turns about its yaw axis at a constant rate, with small
// gaussian-ish noise on every channel. Like a freshly booted BNO08x it can be
// told to report an all-zero quaternion for its first few samples.
pub struct SimulatedImu {
    dev_id: String,
    rng: SmallRng,

    // Degrees/second about the yaw axis.
    yaw_rate: f64,
    noise: f64,

    // Remaining polls that report the zero quaternion.
    boot_zero_samples: u32,

    start_ms: Option<i64>,
    timestamps: TimestampSequencer,
}

impl SimulatedImu {
    pub fn new(dev_id: &str, seed: u64, yaw_rate: f64, boot_zero_samples: u32) -> Self {
        SimulatedImu {
            dev_id: dev_id.to_string(),
            rng: SmallRng::seed_from_u64(seed),
            yaw_rate,
            noise: 0.02,
            boot_zero_samples,
            start_ms: None,
            timestamps: TimestampSequencer::new(),
        }
    }

    fn jitter(&mut self) -> f64 {
        // Sum of uniforms is close enough to normal for test data.
        let sum: f64 = (0..4).map(|_| self.rng.gen_range(-1.0..1.0)).sum();
        sum * 0.5 * self.noise
    }

    // Rotation about the axis the converter reports as yaw.
    fn quaternion_at(&self, elapsed_ms: i64) -> Quaternion {
        let angle = (self.yaw_rate * elapsed_ms as f64 / 1000.0).to_radians();
        let half = angle / 2.0;
        Quaternion::new(half.cos(), half.sin(), 0.0, 0.0)
    }
}

impl SampleSource for SimulatedImu {
    fn poll(&mut self) -> Result<Sample, CanonicalError> {
        let time_ms = self.timestamps.next(monotonic_millis()?);
        let start_ms = *self.start_ms.get_or_insert(time_ms);

        let quaternion = if self.boot_zero_samples > 0 {
            self.boot_zero_samples -= 1;
            Quaternion::new(0.0, 0.0, 0.0, 0.0)
        } else {
            self.quaternion_at(time_ms - start_ms)
        };
        let accel = AccelData{
            x: self.jitter(), y: self.jitter(), z: G + self.jitter()};
        let gyro = GyroData{
            x: self.yaw_rate + self.jitter(), y: self.jitter(), z: self.jitter()};
        let mag = MagData{
            x: 22.0 + self.jitter(), y: 5.0 + self.jitter(), z: -42.0 + self.jitter()};

        Ok(Sample{
            dev_id: self.dev_id.clone(),
            time_ms,
            accel,
            gyro,
            mag,
            quaternion,
        })
    }

    fn get_model(&self) -> String {
        "simulated".to_string()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_boot_zero_samples() {
        let mut imu = SimulatedImu::new("sim", 1, 10.0, 2);
        assert_eq!(imu.poll().unwrap().quaternion.norm(), 0.0);
        assert_eq!(imu.poll().unwrap().quaternion.norm(), 0.0);
        assert_abs_diff_eq!(imu.poll().unwrap().quaternion.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut imu = SimulatedImu::new("sim", 1, 10.0, 0);
        let mut last = imu.poll().unwrap().time_ms;
        for _ in 0..50 {
            let t = imu.poll().unwrap().time_ms;
            assert!(t > last);
            last = t;
        }
    }

    #[test]
    fn test_gravity_on_z() {
        let mut imu = SimulatedImu::new("sim", 3, 0.0, 0);
        let sample = imu.poll().unwrap();
        assert_abs_diff_eq!(sample.accel.z, G, epsilon = 0.1);
        assert_abs_diff_eq!(sample.accel.x, 0.0, epsilon = 0.1);
        assert_eq!(sample.dev_id, "sim");
    }

}  // mod tests.
