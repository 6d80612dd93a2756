// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;

use canonical_error::{CanonicalError, invalid_argument_error};

use crate::imu_trait::{Orientation, Quaternion};

// Converts device quaternions into yaw/pitch/roll degrees.
//
// Yaw is the atan2() result in (-180, 180]; an atan2() of exactly -180
// is reported as 180.
//
// Pitch and roll are folded after conversion: a positive angle `a` becomes
// `180 - a` and a non-positive angle becomes `|a|`, so both land in
// [0, 180]. The device's raw Euler output wraps across one pole for the
// mounting we use, and the fold removes that discontinuity. It is specific
// to that mounting: a device mounted any other way gets pitch/roll values
// that are not its true pitch/roll.
//
// The converter keeps a small memo keyed on the exact quaternion bits, since
// a device that has not produced a new packet returns the same quaternion
// on successive polls. The memo holds at most `memo_capacity` entries and
// evicts the least recently used one when full.
pub struct QuaternionConverter {
    memo_capacity: usize,

    // Value is the converted orientation and the `use_counter` value as of
    // its most recent lookup.
    memo: HashMap<[u64; 4], (Orientation, u64)>,
    use_counter: u64,

    memo_hits: u64,
    memo_misses: u64,
}

impl QuaternionConverter {
    // A `memo_capacity` of zero disables memoization.
    pub fn new(memo_capacity: usize) -> Self {
        QuaternionConverter {
            memo_capacity,
            memo: HashMap::new(),
            use_counter: 0,
            memo_hits: 0,
            memo_misses: 0,
        }
    }

    /// Returns the yaw, pitch and roll (degrees) for `q`. Fails with
    /// invalid_argument_error if `q` has zero (or non-finite) norm.
    pub fn convert(&mut self, q: &Quaternion) -> Result<Orientation, CanonicalError> {
        if self.memo_capacity == 0 {
            return Self::quaternion_to_ypr(q);
        }
        let key = q.to_bits();
        self.use_counter += 1;
        if let Some(entry) = self.memo.get_mut(&key) {
            entry.1 = self.use_counter;
            self.memo_hits += 1;
            return Ok(entry.0);
        }
        self.memo_misses += 1;
        let orientation = Self::quaternion_to_ypr(q)?;
        if self.memo.len() >= self.memo_capacity {
            self.evict_least_recent();
        }
        self.memo.insert(key, (orientation, self.use_counter));
        Ok(orientation)
    }

    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }

    pub fn memo_hits(&self) -> u64 {
        self.memo_hits
    }

    pub fn memo_misses(&self) -> u64 {
        self.memo_misses
    }

    fn evict_least_recent(&mut self) {
        let oldest = self.memo.iter()
            .min_by_key(|(_key, (_orientation, last_use))| *last_use)
            .map(|(key, _value)| *key);
        if let Some(key) = oldest {
            self.memo.remove(&key);
        }
    }

    fn normalize(q: &Quaternion) -> Result<Quaternion, CanonicalError> {
        let magnitude = q.norm();
        if magnitude == 0.0 {
            return Err(invalid_argument_error(
                "Cannot normalize a zero quaternion"));
        }
        if !magnitude.is_finite() {
            return Err(invalid_argument_error(
                &format!("Cannot normalize quaternion {:?}", q)));
        }
        Ok(Quaternion::new(q.w / magnitude, q.x / magnitude,
                           q.y / magnitude, q.z / magnitude))
    }

    // Positive angles map to 180 - angle, others to their magnitude.
    fn fold(angle: f64) -> f64 {
        if angle > 0.0 {
            180.0 - angle
        } else {
            angle.abs()
        }
    }

    pub fn quaternion_to_ypr(q: &Quaternion) -> Result<Orientation, CanonicalError> {
        let Quaternion{w, x, y, z} = Self::normalize(q)?;

        let yaw = (2.0 * (y * z + w * x)).atan2(1.0 - 2.0 * (x * x + y * y));
        // Rounding can push the argument slightly outside [-1, 1].
        let pitch = (2.0 * (w * y - x * z)).clamp(-1.0, 1.0).asin();
        let roll = (2.0 * (x * y + w * z)).atan2(1.0 - 2.0 * (y * y + z * z));

        let yaw = yaw.to_degrees();
        Ok(Orientation {
            yaw: if yaw <= -180.0 { 180.0 } else { yaw },
            pitch: Self::fold(pitch.to_degrees()),
            roll: Self::fold(roll.to_degrees()),
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use canonical_error::CanonicalErrorCode;
    use rand::{Rng, SeedableRng};
    use rand::rngs::SmallRng;
    use super::*;

    fn random_unit_quaternion(rng: &mut SmallRng) -> Quaternion {
        loop {
            let q = Quaternion::new(rng.gen_range(-1.0..1.0),
                                    rng.gen_range(-1.0..1.0),
                                    rng.gen_range(-1.0..1.0),
                                    rng.gen_range(-1.0..1.0));
            let n = q.norm();
            if n > 0.1 {
                return Quaternion::new(q.w / n, q.x / n, q.y / n, q.z / n);
            }
        }
    }

    #[test]
    fn test_identity() {
        let o = QuaternionConverter::quaternion_to_ypr(&Quaternion::identity()).unwrap();
        assert_eq!(o.yaw, 0.0);
        assert_eq!(o.pitch, 0.0);
        assert_eq!(o.roll, 0.0);
    }

    #[test]
    fn test_ninety_degree_yaw() {
        let half = std::f64::consts::FRAC_PI_4;
        let q = Quaternion::new(half.cos(), half.sin(), 0.0, 0.0);
        let o = QuaternionConverter::quaternion_to_ypr(&q).unwrap();
        assert_abs_diff_eq!(o.yaw, 90.0, epsilon = 1e-6);
        assert_abs_diff_eq!(o.pitch, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(o.roll, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_quaternion_rejected() {
        let err = QuaternionConverter::quaternion_to_ypr(
            &Quaternion::new(0.0, 0.0, 0.0, 0.0)).unwrap_err();
        assert!(err.code == CanonicalErrorCode::InvalidArgument);

        let mut converter = QuaternionConverter::new(4);
        let err = converter.convert(&Quaternion::new(0.0, 0.0, 0.0, 0.0)).unwrap_err();
        assert!(err.code == CanonicalErrorCode::InvalidArgument);
        // Failures are not memoized.
        assert_eq!(converter.memo_len(), 0);
    }

    #[test]
    fn test_non_finite_quaternion_rejected() {
        let err = QuaternionConverter::quaternion_to_ypr(
            &Quaternion::new(f64::NAN, 0.0, 0.0, 0.0)).unwrap_err();
        assert!(err.code == CanonicalErrorCode::InvalidArgument);
    }

    #[test]
    fn test_yaw_never_minus_180() {
        // atan2(-tiny, -1) rounds to exactly -pi.
        let o = QuaternionConverter::quaternion_to_ypr(
            &Quaternion::new(1e-200, -1.0, 0.0, 0.0)).unwrap();
        assert_eq!(o.yaw, 180.0);
        assert_eq!(o.pitch, 0.0);
        assert_eq!(o.roll, 0.0);
    }

    #[test]
    fn test_unnormalized_input() {
        let half = std::f64::consts::FRAC_PI_4;
        let q = Quaternion::new(3.0 * half.cos(), 3.0 * half.sin(), 0.0, 0.0);
        let o = QuaternionConverter::quaternion_to_ypr(&q).unwrap();
        assert_abs_diff_eq!(o.yaw, 90.0, epsilon = 1e-6);
    }

    #[test]
    fn test_double_cover_invariance() {
        let mut rng = SmallRng::seed_from_u64(42);
        for _ in 0..1000 {
            let q = random_unit_quaternion(&mut rng);
            let a = QuaternionConverter::quaternion_to_ypr(&q).unwrap();
            let b = QuaternionConverter::quaternion_to_ypr(&q.negated()).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_output_ranges() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..1000 {
            let q = random_unit_quaternion(&mut rng);
            let o = QuaternionConverter::quaternion_to_ypr(&q).unwrap();
            assert!(o.yaw > -180.0 && o.yaw <= 180.0, "yaw {}", o.yaw);
            assert!((0.0..=180.0).contains(&o.pitch), "pitch {}", o.pitch);
            assert!((0.0..=180.0).contains(&o.roll), "roll {}", o.roll);
        }
    }

    #[test]
    fn test_pitch_fold() {
        // Rotation of +30 degrees about y: raw pitch is +30, folded to 150.
        let half = 30.0_f64.to_radians() / 2.0;
        let q = Quaternion::new(half.cos(), 0.0, half.sin(), 0.0);
        let o = QuaternionConverter::quaternion_to_ypr(&q).unwrap();
        assert_abs_diff_eq!(o.pitch, 150.0, epsilon = 1e-9);

        // Raw pitch of -30 folds to 30.
        let q = Quaternion::new(half.cos(), 0.0, -half.sin(), 0.0);
        let o = QuaternionConverter::quaternion_to_ypr(&q).unwrap();
        assert_abs_diff_eq!(o.pitch, 30.0, epsilon = 1e-9);
    }

    #[test]
    fn test_roll_fold() {
        // Rotation of +40 degrees about z: raw roll is +40, folded to 140.
        let half = 40.0_f64.to_radians() / 2.0;
        let q = Quaternion::new(half.cos(), 0.0, 0.0, half.sin());
        let o = QuaternionConverter::quaternion_to_ypr(&q).unwrap();
        assert_abs_diff_eq!(o.roll, 140.0, epsilon = 1e-9);
        assert_abs_diff_eq!(o.yaw, 0.0, epsilon = 1e-9);

        let q = Quaternion::new(half.cos(), 0.0, 0.0, -half.sin());
        let o = QuaternionConverter::quaternion_to_ypr(&q).unwrap();
        assert_abs_diff_eq!(o.roll, 40.0, epsilon = 1e-9);
    }

    #[test]
    fn test_pitch_clamped_at_pole() {
        // 2(wy - xz) can round to slightly above 1 here.
        let c = std::f64::consts::FRAC_1_SQRT_2;
        let q = Quaternion::new(c, 0.0, c, 0.0);
        let o = QuaternionConverter::quaternion_to_ypr(&q).unwrap();
        assert!(o.pitch.is_finite());
        assert_abs_diff_eq!(o.pitch, 90.0, epsilon = 1e-6);
    }

    #[test]
    fn test_memo() {
        let mut converter = QuaternionConverter::new(2);
        let a = Quaternion::new(1.0, 0.0, 0.0, 0.0);
        let b = Quaternion::new(0.0, 1.0, 0.0, 0.0);
        let c = Quaternion::new(0.0, 0.0, 1.0, 0.0);

        let first = converter.convert(&a).unwrap();
        assert_eq!(converter.convert(&a).unwrap(), first);
        assert_eq!(converter.memo_hits(), 1);
        assert_eq!(converter.memo_misses(), 1);

        converter.convert(&b).unwrap();
        // Touch `a` so that `b` is the least recently used.
        converter.convert(&a).unwrap();
        converter.convert(&c).unwrap();
        assert_eq!(converter.memo_len(), 2);
        assert_eq!(converter.memo_hits(), 2);

        // `a` survived eviction, `b` did not.
        converter.convert(&a).unwrap();
        assert_eq!(converter.memo_hits(), 3);
        converter.convert(&b).unwrap();
        assert_eq!(converter.memo_misses(), 4);
        assert_eq!(converter.memo_len(), 2);
    }

    #[test]
    fn test_huge_memo_capacity() {
        let mut converter = QuaternionConverter::new(usize::MAX);
        converter.convert(&Quaternion::identity()).unwrap();
        assert_eq!(converter.memo_len(), 1);
    }

    #[test]
    fn test_memo_disabled() {
        let mut converter = QuaternionConverter::new(0);
        converter.convert(&Quaternion::identity()).unwrap();
        converter.convert(&Quaternion::identity()).unwrap();
        assert_eq!(converter.memo_len(), 0);
        assert_eq!(converter.memo_hits(), 0);
    }

}  // mod tests.
