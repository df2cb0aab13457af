//! Extended Kalman filter for UWB/IMU fusion
//!
//! This module contains the 4-state extended Kalman filter that fuses the
//! inertial motion model from the top-level [lib](crate) module with the
//! projected UWB ranges from the [ranging](crate::ranging) module. The state
//! vector is `[p_x, p_y, v_x, v_y]` in room-frame meters and meters/second.
//! Range corrections are applied sequentially, one scalar update per anchor,
//! in the fixed anchor-table order.

use crate::{InertialSample, global_acceleration, is_stationary};

use std::fmt::{self, Debug, Display};

use nalgebra::{Matrix4, Matrix4x2, RowVector4, Vector2, Vector4};

/// Floor applied to the predicted tag-anchor range inside the measurement
/// Jacobian; below this the unit direction is undefined.
pub const MIN_PREDICTED_RANGE_M: f64 = 1e-3;

/// Velocity variance written into the covariance after a stationary step's
/// corrections. An assignment, not a lower bound: zero-velocity knowledge is
/// treated as near-certain regardless of what the corrections produced.
pub const STATIONARY_VELOCITY_VARIANCE: f64 = 0.001;

/// Filter tuning and initial conditions.
///
/// `Default` carries the values tuned on the reference room deployment; the
/// CLI overrides individual fields from flags.
#[derive(Clone, Copy, Debug)]
pub struct EstimatorConfig {
    /// Process noise: standard deviation of the planar acceleration input (m/s^2)
    pub sigma_acc: f64,
    /// Measurement noise: standard deviation of a projected UWB range (m)
    pub sigma_uwb: f64,
    /// Stationarity threshold on the planar acceleration magnitude (m/s^2)
    pub accel_threshold: f64,
    /// Initial tag position in room-frame meters
    pub initial_position: Vector2<f64>,
    /// Scale of the identity initial covariance
    pub initial_covariance: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            sigma_acc: 0.1,
            sigma_uwb: 0.5,
            accel_threshold: crate::DEFAULT_ACCEL_THRESHOLD,
            initial_position: Vector2::new(2.07, 0.70),
            initial_covariance: 1.0,
        }
    }
}

/// Extended Kalman filter over the planar tag state.
///
/// Owns the state vector and covariance exclusively; callers drive it with
/// [`TagEkf::step`] (or the lower-level predict/correct pair) and read
/// position out through [`TagEkf::position`].
#[derive(Clone)]
pub struct TagEkf {
    state: Vector4<f64>,
    covariance: Matrix4<f64>,
    config: EstimatorConfig,
    /// Whether the most recent predict classified the step as stationary
    stationary: bool,
}

impl Debug for TagEkf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagEkf")
            .field("state", &self.state)
            .field("covariance", &self.covariance)
            .field("stationary", &self.stationary)
            .finish()
    }
}

impl Display for TagEkf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TagEkf {{ pos: [{:.3}, {:.3}] m, vel: [{:.3}, {:.3}] m/s, stationary: {} }}",
            self.state[0], self.state[1], self.state[2], self.state[3], self.stationary
        )
    }
}

impl TagEkf {
    /// Create a filter at rest at the configured start position with an
    /// identity-scaled covariance.
    pub fn new(config: EstimatorConfig) -> TagEkf {
        let mut state = Vector4::zeros();
        state[0] = config.initial_position[0];
        state[1] = config.initial_position[1];
        TagEkf {
            state,
            covariance: Matrix4::identity() * config.initial_covariance,
            config,
            stationary: false,
        }
    }

    /// Current planar position estimate in meters.
    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.state[0], self.state[1])
    }

    /// Current planar velocity estimate in m/s.
    pub fn velocity(&self) -> Vector2<f64> {
        Vector2::new(self.state[2], self.state[3])
    }

    /// Current state covariance.
    pub fn covariance(&self) -> &Matrix4<f64> {
        &self.covariance
    }

    /// Whether the most recent predict step was classified stationary.
    pub fn is_stationary(&self) -> bool {
        self.stationary
    }

    /// Propagate state and covariance through one time step.
    ///
    /// The control input is the planar room-frame acceleration derived from
    /// the sample. When its magnitude falls below the stationarity threshold
    /// a zero-velocity update applies: the input is zeroed and the predicted
    /// velocity is clamped to exactly zero. Process noise `Q = B B^T s_acc^2`
    /// is added in both cases so the covariance keeps growing while parked.
    ///
    /// # Arguments
    /// * `sample` - IMU observation supplying orientation and body acceleration.
    /// * `dt` - Time step in seconds; the caller must have rejected `dt <= 0`.
    pub fn predict(&mut self, sample: &InertialSample, dt: f64) {
        let accel = global_acceleration(&sample.orientation, &sample.accel_body);
        self.stationary = is_stationary(&accel, self.config.accel_threshold);

        #[rustfmt::skip]
        let a = Matrix4::new(
            1.0, 0.0,  dt, 0.0,
            0.0, 1.0, 0.0,  dt,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        let half_dt2 = 0.5 * dt * dt;
        #[rustfmt::skip]
        let b = Matrix4x2::new(
            half_dt2,      0.0,
                 0.0, half_dt2,
                  dt,      0.0,
                 0.0,       dt,
        );

        let u = if self.stationary {
            Vector2::zeros()
        } else {
            accel
        };
        self.state = a * self.state + b * u;
        if self.stationary {
            self.state[2] = 0.0;
            self.state[3] = 0.0;
        }

        let q = b * b.transpose() * (self.config.sigma_acc * self.config.sigma_acc);
        self.covariance = a * self.covariance * a.transpose() + q;
    }

    /// Apply one scalar range correction.
    ///
    /// The measurement model is the planar distance from the current position
    /// estimate to the anchor; its Jacobian is the unit direction toward the
    /// anchor in the position channels and zero in the velocity channels. The
    /// predicted range is floored at [`MIN_PREDICTED_RANGE_M`] to keep the
    /// direction well defined when the estimate sits on top of an anchor.
    ///
    /// # Arguments
    /// * `anchor_2d` - Planar anchor position in meters.
    /// * `distance_2d` - Measured range after floor-plane projection, meters.
    pub fn correct(&mut self, anchor_2d: &Vector2<f64>, distance_2d: f64) {
        let dx = self.state[0] - anchor_2d[0];
        let dy = self.state[1] - anchor_2d[1];
        let predicted = (dx * dx + dy * dy).sqrt().max(MIN_PREDICTED_RANGE_M);

        let h = RowVector4::new(dx / predicted, dy / predicted, 0.0, 0.0);
        let innovation = distance_2d - predicted;
        let s = (h * self.covariance * h.transpose())[(0, 0)]
            + self.config.sigma_uwb * self.config.sigma_uwb;
        let gain = self.covariance * h.transpose() / s;

        self.state += gain * innovation;
        self.covariance = (Matrix4::identity() - gain * h) * self.covariance;
    }

    /// Close out a step after all corrections have been applied.
    ///
    /// On a stationary step the velocity variances are overwritten with
    /// [`STATIONARY_VELOCITY_VARIANCE`]; the corrections may have reopened
    /// uncertainty the zero-velocity clamp already resolved.
    pub fn finish_step(&mut self) {
        if self.stationary {
            self.covariance[(2, 2)] = STATIONARY_VELOCITY_VARIANCE;
            self.covariance[(3, 3)] = STATIONARY_VELOCITY_VARIANCE;
        }
    }

    /// Run one full filter step: predict, sequential corrections in the given
    /// order, stationary covariance floor.
    ///
    /// # Arguments
    /// * `sample` - IMU observation for this step.
    /// * `dt` - Time step in seconds, already validated positive.
    /// * `ranges` - Projected planar ranges as `(anchor_2d, distance_2d)`
    ///   pairs, in anchor-table order; anchors without a reading this tick are
    ///   simply absent.
    pub fn step(&mut self, sample: &InertialSample, dt: f64, ranges: &[(Vector2<f64>, f64)]) {
        self.predict(sample, dt);
        for (anchor_2d, distance_2d) in ranges {
            self.correct(anchor_2d, *distance_2d);
        }
        self.finish_step();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn quiet_sample(timestamp_ns: i64) -> InertialSample {
        InertialSample {
            timestamp_ns,
            orientation: UnitQuaternion::identity(),
            accel_body: Vector3::zeros(),
        }
    }

    fn moving_sample(timestamp_ns: i64, accel_body: Vector3<f64>) -> InertialSample {
        InertialSample {
            timestamp_ns,
            orientation: UnitQuaternion::identity(),
            accel_body,
        }
    }

    #[test]
    fn test_initial_state() {
        let ekf = TagEkf::new(EstimatorConfig::default());
        assert_approx_eq!(ekf.position()[0], 2.07, 1e-12);
        assert_approx_eq!(ekf.position()[1], 0.70, 1e-12);
        assert_eq!(ekf.velocity(), Vector2::zeros());
        assert_approx_eq!(ekf.covariance()[(0, 0)], 1.0, 1e-12);
    }

    #[test]
    fn test_predict_stationary_clamps_velocity() {
        let mut ekf = TagEkf::new(EstimatorConfig::default());
        ekf.predict(&quiet_sample(0), 0.02);
        assert!(ekf.is_stationary());
        assert_eq!(ekf.velocity(), Vector2::zeros());
        assert_approx_eq!(ekf.position()[0], 2.07, 1e-12);
        // Process noise still accumulates while parked.
        assert!(ekf.covariance()[(0, 0)] > 1.0);
    }

    #[test]
    fn test_predict_moving_integrates_acceleration() {
        let config = EstimatorConfig {
            initial_position: Vector2::zeros(),
            ..Default::default()
        };
        let mut ekf = TagEkf::new(config);
        // Body (-1, 0, 0) remaps to room-frame (0, 1, 0) under identity
        // orientation: pure +y acceleration.
        let sample = moving_sample(0, Vector3::new(-1.0, 0.0, 0.0));
        ekf.predict(&sample, 1.0);
        assert!(!ekf.is_stationary());
        assert_approx_eq!(ekf.position()[1], 0.5, 1e-12);
        assert_approx_eq!(ekf.velocity()[1], 1.0, 1e-12);
        assert_approx_eq!(ekf.position()[0], 0.0, 1e-12);
    }

    #[test]
    fn test_correct_pulls_toward_measurement() {
        let config = EstimatorConfig {
            initial_position: Vector2::new(1.0, 0.0),
            ..Default::default()
        };
        let mut ekf = TagEkf::new(config);
        // Anchor at origin, predicted range 1.0, measured 2.0: the estimate
        // should move away from the anchor along +x.
        ekf.correct(&Vector2::zeros(), 2.0);
        assert!(ekf.position()[0] > 1.0);
        assert_approx_eq!(ekf.position()[1], 0.0, 1e-12);
    }

    #[test]
    fn test_correct_reduces_position_variance() {
        let mut ekf = TagEkf::new(EstimatorConfig::default());
        let before = ekf.covariance()[(0, 0)];
        ekf.correct(&Vector2::new(0.0, 0.70), 2.07);
        assert!(ekf.covariance()[(0, 0)] < before);
    }

    #[test]
    fn test_finish_step_sets_exact_velocity_variance() {
        let mut ekf = TagEkf::new(EstimatorConfig::default());
        ekf.predict(&quiet_sample(0), 0.02);
        ekf.correct(&Vector2::zeros(), 2.0);
        ekf.finish_step();
        assert_approx_eq!(ekf.covariance()[(2, 2)], 0.001, 1e-15);
        assert_approx_eq!(ekf.covariance()[(3, 3)], 0.001, 1e-15);
    }

    #[test]
    fn test_finish_step_leaves_moving_covariance_alone() {
        let mut ekf = TagEkf::new(EstimatorConfig::default());
        let sample = moving_sample(0, Vector3::new(2.0, 0.0, 0.0));
        ekf.predict(&sample, 0.02);
        let before = ekf.covariance()[(2, 2)];
        ekf.finish_step();
        assert_approx_eq!(ekf.covariance()[(2, 2)], before, 1e-15);
    }

    #[test]
    fn test_step_stationary_with_consistent_ranges() {
        let mut ekf = TagEkf::new(EstimatorConfig::default());
        let position = ekf.position();
        let anchors = [
            Vector2::new(2.8, 0.0),
            Vector2::new(0.1, 0.0),
            Vector2::new(1.86, 4.1),
        ];
        let ranges: Vec<(Vector2<f64>, f64)> = anchors
            .iter()
            .map(|a| (*a, (position - a).norm()))
            .collect();
        for k in 0..100 {
            ekf.step(&quiet_sample(k * 20_000_000), 0.02, &ranges);
        }
        // Consistent ranges and ZUPT keep the estimate pinned.
        assert!((ekf.position() - position).norm() < 1e-3);
        assert_eq!(ekf.velocity(), Vector2::zeros());
    }
}
