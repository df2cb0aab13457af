//! UWB anchor geometry and multilateration
//!
//! This module owns the ranging side of the system: the fixed anchor table
//! loaded at configuration time, the projection of 3D slant ranges onto the
//! floor plane, and a seeded damped least-squares position solver with the
//! held-position fallback policy for anchor dropout.

use log::warn;
use nalgebra::{Matrix2, Vector2, Vector3};
use std::fmt::{self, Display};

/// Floor applied to a projected range when the reported slant distance is
/// shorter than the anchor/tag height difference (meters). Such readings are
/// geometrically impossible and come from multipath or clock noise; clamping
/// keeps the solver's residuals finite instead of producing NaN.
pub const RANGE_FLOOR_M: f64 = 0.01;

/// Identifier of a UWB anchor radio, the MAC address string as published by
/// the firmware. Resolved against the anchor table exactly once when a CSV
/// header (or CLI flag) is parsed; per-tick code only ever handles indices
/// into the table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AnchorId(pub String);

impl Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AnchorId {
    pub fn new(mac: &str) -> AnchorId {
        AnchorId(mac.to_lowercase())
    }
}

/// A surveyed UWB anchor: radio identity plus 3D room-frame position.
#[derive(Clone, Debug)]
pub struct Anchor {
    pub id: AnchorId,
    /// Surveyed position in meters; z is the mounting height above the floor
    pub position: Vector3<f64>,
}

impl Anchor {
    pub fn new(mac: &str, x: f64, y: f64, z: f64) -> Anchor {
        Anchor {
            id: AnchorId::new(mac),
            position: Vector3::new(x, y, z),
        }
    }

    /// Planar position used by the solver and the EKF range model.
    pub fn position_2d(&self) -> Vector2<f64> {
        Vector2::new(self.position[0], self.position[1])
    }

    /// Mounting height above the floor in meters.
    pub fn height(&self) -> f64 {
        self.position[2]
    }

    /// Name of the merged-CSV column carrying this anchor's slant range. The
    /// data merger abbreviates the MAC to its first five characters.
    pub fn range_column(&self) -> String {
        let prefix: String = self.id.0.chars().take(5).collect();
        format!("dist_{}", prefix)
    }
}

/// The fixed, ordered set of anchors plus the tag's antenna height.
///
/// Ordering matters: the EKF applies its per-anchor corrections in table
/// order, and the merged CSV's range cells are kept aligned to it. The table
/// is built once from configuration and never mutated during a run.
#[derive(Clone, Debug)]
pub struct AnchorTable {
    pub anchors: Vec<Anchor>,
    /// Height of the tag antenna above the floor in meters
    pub tag_height: f64,
}

impl AnchorTable {
    pub fn new(anchors: Vec<Anchor>, tag_height: f64) -> AnchorTable {
        AnchorTable {
            anchors,
            tag_height,
        }
    }

    /// The surveyed deployment of the reference room: three wall-mounted
    /// anchors and a tag carried just above floor level. The listing order is
    /// the correction order used downstream; it is part of the deployment
    /// definition, not cosmetic.
    pub fn default_room() -> AnchorTable {
        AnchorTable::new(
            vec![
                Anchor::new("83a8d3e15c4", 1.86, 4.1, 2.10),
                Anchor::new("48e72903b3fc", 0.1, 0.0, 2.0),
                Anchor::new("e05a1b1fafc4", 2.8, 0.0, 1.31),
            ],
            0.015,
        )
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Project a slant range from the given anchor onto the floor plane.
    pub fn project(&self, anchor: &Anchor, slant_distance: f64) -> f64 {
        project_to_2d(slant_distance, anchor.height(), self.tag_height)
    }
}

/// Project a 3D slant range onto the floor plane.
///
/// The anchor sits at a known height and the tag rides at a known (near-floor)
/// height, so the vertical leg of the range triangle is fixed and the planar
/// distance is `sqrt(slant^2 - h^2)`. A reported slant shorter than the height
/// difference is geometrically impossible and is clamped to [`RANGE_FLOOR_M`].
///
/// # Arguments
/// * `slant_distance` - Raw anchor-to-tag distance in meters.
/// * `anchor_height` - Anchor mounting height above the floor in meters.
/// * `tag_height` - Tag antenna height above the floor in meters.
///
/// # Returns
/// * The planar anchor-to-tag distance in meters, always finite and positive.
///
/// # Example
/// ```rust
/// use roomloc::ranging::project_to_2d;
/// let d = project_to_2d(5.0, 2.0, 0.0);
/// assert!((d - 21.0_f64.sqrt()).abs() < 1e-12);
/// ```
pub fn project_to_2d(slant_distance: f64, anchor_height: f64, tag_height: f64) -> f64 {
    let h = (anchor_height - tag_height).abs();
    if slant_distance < h {
        RANGE_FLOOR_M
    } else {
        (slant_distance * slant_distance - h * h).sqrt()
    }
}

// Levenberg-Marquardt tuning. The problem is tiny (2 unknowns, a handful of
// residuals) so the limits are generous relative to the work per iteration.
const LM_LAMBDA_INIT: f64 = 1e-3;
const LM_LAMBDA_MIN: f64 = 1e-9;
const LM_LAMBDA_MAX: f64 = 1e9;
const LM_STEP_TOLERANCE: f64 = 1e-10;
const LM_MAX_ITERATIONS: usize = 50;

fn residual_cost(position: &Vector2<f64>, anchors_2d: &[Vector2<f64>], distances: &[f64]) -> f64 {
    anchors_2d
        .iter()
        .zip(distances.iter())
        .map(|(a, d)| {
            let r = (position - a).norm() - d;
            r * r
        })
        .sum()
}

/// Solve for the tag's planar position from projected anchor ranges.
///
/// Damped Gauss-Newton (Levenberg-Marquardt) on the residuals
/// `||p - a_i|| - d_i`, started from `seed`. The damping term keeps the normal
/// equations invertible when the geometry is degenerate, so the solver accepts
/// any `n >= 1`: with fewer than three anchors the fit is under-determined and
/// the result stays biased toward the seed, which is exactly the behavior the
/// seed-chaining caller wants during partial dropout.
///
/// # Arguments
/// * `anchors_2d` - Planar anchor positions, one per reported range.
/// * `distances` - Projected planar ranges in meters, aligned with `anchors_2d`.
/// * `seed` - Starting estimate, normally the previous solved position.
///
/// # Returns
/// * `Some(position)` on convergence, `None` if the input is empty or the
///   iteration fails to converge (the caller holds its last position).
pub fn solve(
    anchors_2d: &[Vector2<f64>],
    distances: &[f64],
    seed: Vector2<f64>,
) -> Option<Vector2<f64>> {
    debug_assert_eq!(anchors_2d.len(), distances.len());
    if anchors_2d.is_empty() {
        return None;
    }
    let mut position = seed;
    let mut cost = residual_cost(&position, anchors_2d, distances);
    let mut lambda = LM_LAMBDA_INIT;

    for _ in 0..LM_MAX_ITERATIONS {
        // Accumulate the 2x2 normal equations J^T J and the gradient J^T r.
        let mut jtj = Matrix2::<f64>::zeros();
        let mut jtr = Vector2::<f64>::zeros();
        for (anchor, &measured) in anchors_2d.iter().zip(distances.iter()) {
            let delta = position - anchor;
            let range = delta.norm().max(1e-12);
            let jac = delta / range;
            let residual = range - measured;
            jtj += jac * jac.transpose();
            jtr += jac * residual;
        }

        let damped = jtj + Matrix2::identity() * lambda;
        let step = match damped.try_inverse() {
            Some(inv) => -(inv * jtr),
            None => return None,
        };
        // A vanishing step means the gradient is already (numerically) zero:
        // converged, regardless of whether the cost can still be improved.
        // Without this exit a seed sitting on the minimum would inflate
        // lambda forever and be misreported as non-convergence.
        if step.norm() < LM_STEP_TOLERANCE {
            return Some(position);
        }

        let candidate = position + step;
        let candidate_cost = residual_cost(&candidate, anchors_2d, distances);
        if candidate_cost < cost {
            position = candidate;
            cost = candidate_cost;
            lambda = (lambda * 0.5).max(LM_LAMBDA_MIN);
        } else {
            lambda *= 4.0;
            if lambda > LM_LAMBDA_MAX {
                return None;
            }
        }
    }
    // Ran out of iterations without the step shrinking below tolerance.
    None
}

/// Stateful wrapper around [`solve`] implementing the runtime ranging policy.
///
/// Chains the seed from tick to tick, holds the last known position when a
/// tick has no usable ranges or the solver fails, and warns the operator once
/// when the held position persists past `hold_warn_secs` (prolonged anchor
/// dropout is an installation fault, not a transient).
#[derive(Clone, Debug)]
pub struct MultilaterationTracker {
    last_position: Vector2<f64>,
    held_since_ns: Option<i64>,
    hold_warn_secs: f64,
    warned: bool,
}

impl MultilaterationTracker {
    /// Seconds of continuous held position before a dropout warning is logged.
    pub const DEFAULT_HOLD_WARN_SECS: f64 = 5.0;

    pub fn new(initial_position: Vector2<f64>, hold_warn_secs: f64) -> MultilaterationTracker {
        MultilaterationTracker {
            last_position: initial_position,
            held_since_ns: None,
            hold_warn_secs,
            warned: false,
        }
    }

    pub fn position(&self) -> Vector2<f64> {
        self.last_position
    }

    /// Whether the tracker is currently holding a stale position because the
    /// most recent tick produced no fix.
    pub fn is_holding(&self) -> bool {
        self.held_since_ns.is_some()
    }

    /// Process one tick of ranging data and return the position estimate.
    ///
    /// A successful solve becomes both the output and the next seed. An empty
    /// tick or a failed solve returns the held position unchanged.
    pub fn update(
        &mut self,
        timestamp_ns: i64,
        anchors_2d: &[Vector2<f64>],
        distances: &[f64],
    ) -> Vector2<f64> {
        match solve(anchors_2d, distances, self.last_position) {
            Some(position) => {
                self.last_position = position;
                self.held_since_ns = None;
                self.warned = false;
            }
            None => {
                let since = *self.held_since_ns.get_or_insert(timestamp_ns);
                let held_secs = (timestamp_ns - since) as f64 / 1e9;
                if !self.warned && held_secs >= self.hold_warn_secs {
                    warn!(
                        "no multilateration fix for {:.1} s; holding last position [{:.3}, {:.3}]",
                        held_secs, self.last_position[0], self.last_position[1]
                    );
                    self.warned = true;
                }
            }
        }
        self.last_position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_projection_floor() {
        // Slant shorter than the height difference clamps to the floor value.
        assert_eq!(project_to_2d(0.5, 2.0, 0.015), RANGE_FLOOR_M);
        assert_eq!(project_to_2d(0.0, 1.31, 0.015), RANGE_FLOOR_M);
    }

    #[test]
    fn test_projection_pythagorean() {
        assert_approx_eq!(project_to_2d(5.0, 2.0, 0.0), 21.0_f64.sqrt(), 1e-12);
        // Equal heights pass the slant through unchanged.
        assert_approx_eq!(project_to_2d(3.3, 1.0, 1.0), 3.3, 1e-12);
        // Slant exactly equal to the height difference projects to zero.
        assert_approx_eq!(project_to_2d(2.0, 2.0, 0.0), 0.0, 1e-12);
    }

    #[test]
    fn test_solve_exact_three_anchor_fixture() {
        let anchors = [
            Vector2::new(0.0, 0.0),
            Vector2::new(4.0, 0.0),
            Vector2::new(0.0, 3.0),
        ];
        let distances = [2.0_f64.sqrt(), 10.0_f64.sqrt(), 5.0_f64.sqrt()];
        let solution = solve(&anchors, &distances, Vector2::new(2.0, 2.0)).expect("converges");
        assert_approx_eq!(solution[0], 1.0, 1e-6);
        assert_approx_eq!(solution[1], 1.0, 1e-6);
    }

    #[test]
    fn test_solve_seeded_at_solution() {
        // Seeding on the minimum itself must report convergence, not failure.
        let anchors = [
            Vector2::new(0.0, 0.0),
            Vector2::new(4.0, 0.0),
            Vector2::new(0.0, 3.0),
        ];
        let distances = [2.0_f64.sqrt(), 10.0_f64.sqrt(), 5.0_f64.sqrt()];
        let solution =
            solve(&anchors, &distances, Vector2::new(1.0, 1.0)).expect("already converged");
        assert_approx_eq!(solution[0], 1.0, 1e-6);
        assert_approx_eq!(solution[1], 1.0, 1e-6);
    }

    #[test]
    fn test_tracker_stationary_tag_never_holds() {
        // A parked tag reports the same exact ranges every tick; each tick
        // must solve (seeded at the previous solution) rather than fall into
        // the held/dropout state.
        let anchors = [
            Vector2::new(0.0, 0.0),
            Vector2::new(4.0, 0.0),
            Vector2::new(0.0, 3.0),
        ];
        let distances = [2.0_f64.sqrt(), 10.0_f64.sqrt(), 5.0_f64.sqrt()];
        let mut tracker = MultilaterationTracker::new(Vector2::new(2.0, 2.0), 5.0);
        for k in 0..300i64 {
            let position = tracker.update(k * 20_000_000, &anchors, &distances);
            assert!(!tracker.is_holding());
            assert_approx_eq!(position[0], 1.0, 1e-6);
            assert_approx_eq!(position[1], 1.0, 1e-6);
        }
    }

    #[test]
    fn test_solve_noisy_ranges_least_squares() {
        let anchors = [
            Vector2::new(0.0, 0.0),
            Vector2::new(4.0, 0.0),
            Vector2::new(0.0, 3.0),
        ];
        let truth = Vector2::new(1.5, 1.2);
        let distances: Vec<f64> = anchors
            .iter()
            .enumerate()
            .map(|(i, a)| (truth - a).norm() + if i % 2 == 0 { 0.02 } else { -0.02 })
            .collect();
        let solution = solve(&anchors, &distances, Vector2::new(2.0, 2.0)).expect("converges");
        assert!((solution - truth).norm() < 0.05);
    }

    #[test]
    fn test_solve_single_anchor_stays_near_seed() {
        // Under-determined: the solver should walk toward the range circle
        // along the seed direction, not fly off.
        let anchors = [Vector2::new(0.0, 0.0)];
        let distances = [2.0];
        let seed = Vector2::new(1.0, 0.0);
        let solution = solve(&anchors, &distances, seed).expect("converges");
        assert_approx_eq!(solution.norm(), 2.0, 1e-6);
        assert_approx_eq!(solution[1], 0.0, 1e-6);
        assert!(solution[0] > 0.0);
    }

    #[test]
    fn test_solve_empty_input() {
        assert!(solve(&[], &[], Vector2::zeros()).is_none());
    }

    #[test]
    fn test_tracker_holds_position_on_dropout() {
        let anchors = [
            Vector2::new(0.0, 0.0),
            Vector2::new(4.0, 0.0),
            Vector2::new(0.0, 3.0),
        ];
        let distances = [2.0_f64.sqrt(), 10.0_f64.sqrt(), 5.0_f64.sqrt()];
        let mut tracker = MultilaterationTracker::new(Vector2::new(2.0, 2.0), 5.0);
        let fixed = tracker.update(0, &anchors, &distances);
        assert_approx_eq!(fixed[0], 1.0, 1e-6);
        // Total dropout: position holds.
        let held = tracker.update(1_000_000_000, &[], &[]);
        assert_eq!(held, fixed);
        let held = tracker.update(2_000_000_000, &[], &[]);
        assert_eq!(held, fixed);
    }

    #[test]
    fn test_anchor_range_column() {
        let anchor = Anchor::new("e05a1b1fafc4", 2.8, 0.0, 1.31);
        assert_eq!(anchor.range_column(), "dist_e05a1");
    }

    #[test]
    fn test_default_room_table() {
        let table = AnchorTable::default_room();
        assert_eq!(table.len(), 3);
        assert_approx_eq!(table.tag_height, 0.015, 1e-12);
        // Correction order: 83a8d, 48e72, e05a1.
        assert_eq!(table.anchors[0].range_column(), "dist_83a8d");
        assert_eq!(table.anchors[1].range_column(), "dist_48e72");
        assert_eq!(table.anchors[2].range_column(), "dist_e05a1");
        assert_approx_eq!(table.anchors[0].height(), 2.10, 1e-12);
    }
}
