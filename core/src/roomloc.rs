//! Indoor tag localization toolbox for UWB ranging and inertial sensor fusion
//!
//! This crate provides the estimation core of a room-scale real-time locating
//! system: a mobile tag carries an IMU and a UWB radio, a fixed set of anchors
//! at known positions report slant-range distances to the tag, and the tag's
//! 2D position on the floor plane is recovered by fusing the two. The crate is
//! not a radio driver or an MQTT client; transport, persistence, and plotting
//! are collaborators that feed this crate a time-ordered stream of merged rows
//! and consume the position estimates it produces.
//!
//! Primarily built off of two crate dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for the filters and solvers.
//! - [`csv`](https://crates.io/crates/csv) with [`serde`](https://crates.io/crates/serde): Provides typed record I/O at the collaborator boundary.
//!
//! ## Crate overview
//!
//! This crate is organized into several modules:
//! - [ranging]: Anchor geometry, slant-range projection onto the floor plane, and the seeded least-squares multilateration solver.
//! - [kalman]: The 4-state (position, velocity) extended Kalman filter with zero-velocity updates.
//! - [labeling]: Offline stop detection and waypoint assignment used to construct ground-truth trajectories.
//! - [sim]: CSV ingestion of merged IMU/UWB rows, the offline pipeline runners, and synthetic stream generation.
//!
//! ## Coordinate and state definitions
//!
//! All positions are planar room coordinates in meters, with the origin at a
//! surveyed room corner. The estimated state vector is
//!
//! $$
//! x = [p_x, p_y, v_x, v_y]
//! $$
//!
//! Where $p_x$, $p_y$ are the tag position (m) and $v_x$, $v_y$ the tag
//! velocity (m/s) in the room frame. Anchor positions are 3D (the anchors sit
//! at different heights); range measurements are projected onto the floor
//! plane before use, see [ranging::project_to_2d].
//!
//! ## Motion model
//!
//! The forward propagation step used by dead reckoning and by the EKF predict
//! is the constant-velocity kinematic model driven by the IMU's gravity-free
//! linear acceleration, rotated into the room frame:
//!
//! $$
//! p(+) = p(-) + v(-) t + \tfrac{1}{2} a^g t^2, \qquad v(+) = v(-) + a^g t
//! $$
//!
//! where $a^g$ is the planar component of the rotated acceleration. The
//! rotation uses the orientation quaternion reported by the IMU's onboard
//! fusion; before rotating, the body axes are remapped to compensate for how
//! the sensor is mounted on the tag, see [remap_body_axes].

pub mod kalman;
pub mod labeling;
pub mod ranging;
pub mod sim;

use nalgebra::{Quaternion, UnitQuaternion, Vector2, Vector3};
use std::fmt::{self, Display};

/// Quaternion norms below this are treated as invalid sensor output and the
/// sample carrying them is skipped rather than normalized into garbage.
pub const QUATERNION_NORM_FLOOR: f64 = 1e-6;

/// Default threshold on the magnitude of the planar room-frame acceleration
/// below which a step is classified as stationary (m/s^2).
pub const DEFAULT_ACCEL_THRESHOLD: f64 = 0.5;

/// A single timestamped IMU observation: orientation plus gravity-free linear
/// acceleration in the sensor body frame.
///
/// The orientation comes from the IMU's onboard sensor fusion and is expected
/// to be (close to) unit norm on the wire; construction via [`InertialSample::from_raw`]
/// re-normalizes and rejects degenerate values.
#[derive(Clone, Copy, Debug)]
pub struct InertialSample {
    /// Capture time in nanoseconds on the tag's monotonic clock
    pub timestamp_ns: i64,
    /// Body-to-room orientation reported by the IMU
    pub orientation: UnitQuaternion<f64>,
    /// Linear acceleration in m/s^2, body frame x, y, z axis (gravity removed)
    pub accel_body: Vector3<f64>,
}

impl Display for InertialSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.orientation.quaternion();
        write!(
            f,
            "InertialSample {{ t: {} ns, q: [{:.4}, {:.4}, {:.4}, {:.4}], accel: [{:.4}, {:.4}, {:.4}] }}",
            self.timestamp_ns,
            q.w,
            q.i,
            q.j,
            q.k,
            self.accel_body[0],
            self.accel_body[1],
            self.accel_body[2]
        )
    }
}

impl InertialSample {
    /// Build a sample from raw wire components.
    ///
    /// # Arguments
    /// * `timestamp_ns` - Capture time in nanoseconds.
    /// * `quat_wxyz` - Orientation quaternion components in (w, x, y, z) order, as published by the firmware.
    /// * `accel_xyz` - Body-frame linear acceleration in m/s^2.
    ///
    /// # Returns
    /// * `Some(InertialSample)` with the quaternion normalized, or `None` if
    ///   the quaternion norm is below [`QUATERNION_NORM_FLOOR`] (invalid
    ///   sensor output; the caller skips the sample).
    pub fn from_raw(timestamp_ns: i64, quat_wxyz: [f64; 4], accel_xyz: [f64; 3]) -> Option<Self> {
        let q = Quaternion::new(quat_wxyz[0], quat_wxyz[1], quat_wxyz[2], quat_wxyz[3]);
        if q.norm() < QUATERNION_NORM_FLOOR {
            return None;
        }
        Some(InertialSample {
            timestamp_ns,
            orientation: UnitQuaternion::new_normalize(q),
            accel_body: Vector3::new(accel_xyz[0], accel_xyz[1], accel_xyz[2]),
        })
    }
}

/// Remap raw body axes to the tag's mounting convention.
///
/// The IMU is mounted rotated 90 degrees about its z axis relative to the tag
/// housing, so the sensed `(ax, ay, az)` becomes `(ay, -ax, az)` before the
/// orientation quaternion is applied. This is a fixed calibration constant of
/// the hardware rig, not something derived at runtime.
pub fn remap_body_axes(accel_body: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(accel_body[1], -accel_body[0], accel_body[2])
}

/// Rotate a body-frame acceleration into the room frame and take the planar part.
///
/// Applies [`remap_body_axes`] first, then the standard quaternion-vector
/// rotation, and returns only the (x, y) components; this is a 2D system and
/// the vertical channel is discarded.
///
/// # Arguments
/// * `orientation` - Unit quaternion from the IMU (pre-validated, see [`InertialSample::from_raw`]).
/// * `accel_body` - Raw body-frame linear acceleration in m/s^2.
///
/// # Returns
/// * The planar room-frame acceleration in m/s^2.
pub fn global_acceleration(
    orientation: &UnitQuaternion<f64>,
    accel_body: &Vector3<f64>,
) -> Vector2<f64> {
    let rotated = orientation * remap_body_axes(accel_body);
    Vector2::new(rotated[0], rotated[1])
}

/// Instantaneous stationarity test on the planar room-frame acceleration.
///
/// This is the live policy used to gate zero-velocity updates in the EKF:
/// stationary iff the acceleration magnitude is below the threshold at this
/// step, with no hysteresis. The offline labeling path uses a different,
/// dwell-based policy, see [labeling::StopDetector].
pub fn is_stationary(accel_global: &Vector2<f64>, threshold: f64) -> bool {
    accel_global.norm() < threshold
}

/// Planar kinematic state of the tag.
///
/// Owned by whichever estimator is running (dead reckoning holds one directly,
/// the EKF exposes one via [kalman::TagEkf::state]); there is no process-wide
/// estimator state anywhere in this crate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TagState {
    /// Position in meters, room frame
    pub position: Vector2<f64>,
    /// Velocity in m/s, room frame
    pub velocity: Vector2<f64>,
}

impl Default for TagState {
    fn default() -> Self {
        TagState {
            position: Vector2::zeros(),
            velocity: Vector2::zeros(),
        }
    }
}

impl Display for TagState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TagState {{ pos: [{:.3}, {:.3}] m, vel: [{:.3}, {:.3}] m/s }}",
            self.position[0], self.position[1], self.velocity[0], self.velocity[1]
        )
    }
}

impl TagState {
    /// Create a state at rest at the given start position.
    pub fn new(position: Vector2<f64>) -> TagState {
        TagState {
            position,
            velocity: Vector2::zeros(),
        }
    }
}

/// Constant-velocity forward propagation of a [`TagState`].
///
/// Equivalent to the matrix form `x' = A x + B u` used in the EKF predict
/// (position picks up `v dt + 0.5 a dt^2`, velocity picks up `a dt`), kept as
/// a plain vector update for the dead-reckoning path which carries no
/// covariance.
///
/// # Arguments
/// * `state` - State to propagate in place.
/// * `accel_global` - Planar room-frame acceleration in m/s^2, see [`global_acceleration`].
/// * `dt` - Time step in seconds; the caller must have rejected `dt <= 0`.
pub fn forward(state: &mut TagState, accel_global: Vector2<f64>, dt: f64) {
    state.position += state.velocity * dt + accel_global * (0.5 * dt * dt);
    state.velocity += accel_global * dt;
}
