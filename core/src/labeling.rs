//! Offline stop detection and ground-truth construction
//!
//! During a data-collection run the tag is carried along a scripted path and
//! parked at each waypoint in turn. This module recovers those dwell
//! intervals from the raw accelerometer stream after the fact, assigns the
//! Nth detected stop to the Nth scripted waypoint, and fills the moving
//! phases in between by constant-velocity interpolation. The result is a
//! per-sample ground-truth trajectory used to evaluate the estimators.
//!
//! The detection policy here is deliberately different from the instantaneous
//! test in [is_stationary](crate::is_stationary): it looks at the change in
//! raw body acceleration between consecutive samples and requires the quiet
//! period to last a minimum dwell before counting it as a stop, which rejects
//! the brief lulls that occur mid-stride.

use log::{debug, info, warn};
use nalgebra::{Vector2, Vector3};

/// Default threshold on the sample-to-sample change of the raw body
/// acceleration (m/s^2).
pub const DEFAULT_ACCEL_CHANGE_THRESHOLD: f64 = 0.5;

/// Default minimum dwell for a quiet period to count as a scripted stop (s).
pub const DEFAULT_MIN_STOP_DURATION_S: f64 = 2.0;

/// Motion phase assigned to a sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotionState {
    Moving,
    Stopped,
}

/// A detected dwell interval that met the minimum duration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StopInterval {
    /// 1-based ordinal of this stop within the run
    pub index: u32,
    pub start_ns: i64,
    pub end_ns: i64,
}

impl StopInterval {
    pub fn duration_s(&self) -> f64 {
        (self.end_ns - self.start_ns) as f64 / 1e9
    }
}

/// Two-state stop detector over the raw accelerometer stream.
///
/// Feed samples in time order through [`StopDetector::update`]; each completed
/// stop (a quiet period that lasted at least the minimum dwell) is returned as
/// it closes. Call [`StopDetector::finish`] after the last sample to close a
/// dwell still open at end of data.
#[derive(Debug)]
pub struct StopDetector {
    accel_change_threshold: f64,
    min_stop_duration_ns: i64,
    state: MotionState,
    last_accel: Option<Vector3<f64>>,
    stop_started_ns: i64,
    valid_stops: u32,
}

impl StopDetector {
    pub fn new(accel_change_threshold: f64, min_stop_duration_s: f64) -> StopDetector {
        StopDetector {
            accel_change_threshold,
            min_stop_duration_ns: (min_stop_duration_s * 1e9) as i64,
            state: MotionState::Moving,
            last_accel: None,
            stop_started_ns: 0,
            valid_stops: 0,
        }
    }

    /// Process one sample. Returns a completed [`StopInterval`] when a dwell
    /// of sufficient duration ends at this sample.
    pub fn update(&mut self, timestamp_ns: i64, accel_body: Vector3<f64>) -> Option<StopInterval> {
        let delta = match self.last_accel {
            Some(prev) => (accel_body - prev).norm(),
            None => {
                // The run starts parked at the first waypoint, so the first
                // sample opens a candidate dwell.
                debug!("stream opens stopped at {} ns", timestamp_ns);
                self.last_accel = Some(accel_body);
                self.state = MotionState::Stopped;
                self.stop_started_ns = timestamp_ns;
                return None;
            }
        };
        self.last_accel = Some(accel_body);

        let quiet = delta < self.accel_change_threshold;
        match (self.state, quiet) {
            (MotionState::Moving, true) => {
                debug!("moving -> stopped at {} ns", timestamp_ns);
                self.state = MotionState::Stopped;
                self.stop_started_ns = timestamp_ns;
                None
            }
            (MotionState::Stopped, false) => {
                self.state = MotionState::Moving;
                let duration_ns = timestamp_ns - self.stop_started_ns;
                if duration_ns >= self.min_stop_duration_ns {
                    debug!("stopped -> moving at {} ns", timestamp_ns);
                    self.valid_stops += 1;
                    let interval = StopInterval {
                        index: self.valid_stops,
                        start_ns: self.stop_started_ns,
                        end_ns: timestamp_ns,
                    };
                    info!(
                        "stop {} detected: {:.2} s dwell ending at {} ns",
                        interval.index,
                        interval.duration_s(),
                        interval.end_ns
                    );
                    Some(interval)
                } else {
                    debug!(
                        "stopped -> moving at {} ns: {:.2} s dwell below minimum, discarded",
                        timestamp_ns,
                        duration_ns as f64 / 1e9
                    );
                    None
                }
            }
            _ => None,
        }
    }

    /// Close a dwell still open at the end of the stream, if it met the
    /// minimum duration.
    pub fn finish(&mut self, last_timestamp_ns: i64) -> Option<StopInterval> {
        if self.state != MotionState::Stopped {
            return None;
        }
        self.state = MotionState::Moving;
        let duration_ns = last_timestamp_ns - self.stop_started_ns;
        if duration_ns >= self.min_stop_duration_ns {
            self.valid_stops += 1;
            let interval = StopInterval {
                index: self.valid_stops,
                start_ns: self.stop_started_ns,
                end_ns: last_timestamp_ns,
            };
            info!(
                "stop {} detected at end of data: {:.2} s dwell",
                interval.index,
                interval.duration_s()
            );
            Some(interval)
        } else {
            None
        }
    }
}

/// A detected stop paired with its scripted waypoint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LabeledStop {
    pub interval: StopInterval,
    pub waypoint: Vector2<f64>,
}

/// Generate the scripted waypoint sequence: constant x, y spaced evenly from
/// `y_start` to `y_end` inclusive over `count` stops.
pub fn waypoint_script(x: f64, y_start: f64, y_end: f64, count: usize) -> Vec<Vector2<f64>> {
    if count == 0 {
        return Vec::new();
    }
    if count == 1 {
        return vec![Vector2::new(x, y_start)];
    }
    let step = (y_end - y_start) / (count - 1) as f64;
    (0..count)
        .map(|i| Vector2::new(x, y_start + step * i as f64))
        .collect()
}

/// Assign detected stops to scripted waypoints in order.
///
/// The Nth valid stop is assumed to be the tag parked at the Nth waypoint.
/// When the counts disagree only the overlapping prefix is labeled, and the
/// mismatch is logged; the surplus stops (or waypoints) carry no label.
pub fn assign_waypoints(stops: &[StopInterval], waypoints: &[Vector2<f64>]) -> Vec<LabeledStop> {
    if stops.len() != waypoints.len() {
        warn!(
            "detected {} stops but the script has {} waypoints; labeling the first {}",
            stops.len(),
            waypoints.len(),
            stops.len().min(waypoints.len())
        );
    }
    stops
        .iter()
        .zip(waypoints.iter())
        .map(|(interval, waypoint)| LabeledStop {
            interval: *interval,
            waypoint: *waypoint,
        })
        .collect()
}

/// One ground-truth sample: motion phase plus, where determinable, the true
/// position and the stop it belongs to.
#[derive(Clone, Copy, Debug)]
pub struct GroundTruthRecord {
    pub timestamp_ns: i64,
    pub state: MotionState,
    /// True position; `None` outside the span covered by labeled stops
    pub position: Option<Vector2<f64>>,
    /// 1-based stop ordinal when the sample falls inside a dwell
    pub stop_number: Option<u32>,
}

/// Build the per-sample ground-truth trajectory for a recorded run.
///
/// Runs the stop detector over the accelerometer stream, assigns waypoints,
/// then labels every sample: inside a dwell the position is the waypoint;
/// between two consecutive labeled dwells the position is interpolated at
/// constant velocity from the earlier waypoint to the later one; before the
/// first labeled dwell and after the last the position is unknown.
///
/// # Arguments
/// * `samples` - Time-ordered `(timestamp_ns, accel_body)` pairs.
/// * `waypoints` - Scripted stop positions, in visit order.
/// * `accel_change_threshold` - See [`DEFAULT_ACCEL_CHANGE_THRESHOLD`].
/// * `min_stop_duration_s` - See [`DEFAULT_MIN_STOP_DURATION_S`].
pub fn build_ground_truth(
    samples: &[(i64, Vector3<f64>)],
    waypoints: &[Vector2<f64>],
    accel_change_threshold: f64,
    min_stop_duration_s: f64,
) -> Vec<GroundTruthRecord> {
    let mut detector = StopDetector::new(accel_change_threshold, min_stop_duration_s);
    let mut stops = Vec::new();
    for (timestamp_ns, accel_body) in samples {
        if let Some(interval) = detector.update(*timestamp_ns, *accel_body) {
            stops.push(interval);
        }
    }
    if let Some((last_ns, _)) = samples.last() {
        if let Some(interval) = detector.finish(*last_ns) {
            stops.push(interval);
        }
    }
    let labeled = assign_waypoints(&stops, waypoints);

    samples
        .iter()
        .map(|(t, _)| {
            let t = *t;
            // Inside a labeled dwell?
            if let Some(stop) = labeled
                .iter()
                .find(|s| t >= s.interval.start_ns && t <= s.interval.end_ns)
            {
                return GroundTruthRecord {
                    timestamp_ns: t,
                    state: MotionState::Stopped,
                    position: Some(stop.waypoint),
                    stop_number: Some(stop.interval.index),
                };
            }
            // Between two consecutive labeled dwells: constant-velocity leg.
            let position = labeled.windows(2).find_map(|pair| {
                let (from, to) = (&pair[0], &pair[1]);
                if t > from.interval.end_ns && t < to.interval.start_ns {
                    let span = (to.interval.start_ns - from.interval.end_ns) as f64;
                    let alpha = (t - from.interval.end_ns) as f64 / span;
                    Some(from.waypoint + (to.waypoint - from.waypoint) * alpha)
                } else {
                    None
                }
            });
            GroundTruthRecord {
                timestamp_ns: t,
                state: MotionState::Moving,
                position,
                stop_number: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const HZ_50_NS: i64 = 20_000_000;

    /// Quiet samples have constant acceleration; shaken ones alternate sign
    /// so every consecutive delta exceeds the threshold.
    fn synthetic_stream(phases: &[(bool, f64)]) -> Vec<(i64, Vector3<f64>)> {
        let mut samples = Vec::new();
        let mut t = 0i64;
        let mut k = 0u64;
        for &(quiet, duration_s) in phases {
            let n = (duration_s / 0.02) as usize;
            for _ in 0..n {
                let accel = if quiet {
                    Vector3::new(0.0, 0.0, 9.81)
                } else {
                    let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                    Vector3::new(2.0 * sign, 0.0, 9.81)
                };
                samples.push((t, accel));
                t += HZ_50_NS;
                k += 1;
            }
        }
        samples
    }

    #[test]
    fn test_detector_finds_three_plateaus() {
        let samples = synthetic_stream(&[
            (true, 3.0),
            (false, 1.5),
            (true, 3.0),
            (false, 1.5),
            (true, 3.0),
        ]);
        let mut detector =
            StopDetector::new(DEFAULT_ACCEL_CHANGE_THRESHOLD, DEFAULT_MIN_STOP_DURATION_S);
        let mut stops = Vec::new();
        for (t, a) in &samples {
            if let Some(s) = detector.update(*t, *a) {
                stops.push(s);
            }
        }
        if let Some(s) = detector.finish(samples.last().unwrap().0) {
            stops.push(s);
        }
        assert_eq!(stops.len(), 3);
        assert_eq!(stops[0].index, 1);
        assert_eq!(stops[2].index, 3);
        assert!(stops[0].duration_s() >= 2.0);
    }

    #[test]
    fn test_detector_rejects_short_lull() {
        let samples = synthetic_stream(&[(false, 2.0), (true, 0.5), (false, 2.0)]);
        let mut detector =
            StopDetector::new(DEFAULT_ACCEL_CHANGE_THRESHOLD, DEFAULT_MIN_STOP_DURATION_S);
        let mut stops = 0;
        for (t, a) in &samples {
            if detector.update(*t, *a).is_some() {
                stops += 1;
            }
        }
        // Not even the leading samples: the shaken opening closes the
        // first-sample dwell before it reaches the minimum duration.
        assert_eq!(stops, 0);
    }

    #[test]
    fn test_waypoint_script_spacing() {
        let waypoints = waypoint_script(2.07, 0.7, 2.4, 35);
        assert_eq!(waypoints.len(), 35);
        assert_approx_eq!(waypoints[0][1], 0.7, 1e-12);
        assert_approx_eq!(waypoints[34][1], 2.4, 1e-12);
        assert_approx_eq!(waypoints[0][0], 2.07, 1e-12);
        let spacing = waypoints[1][1] - waypoints[0][1];
        assert_approx_eq!(spacing, 1.7 / 34.0, 1e-12);
    }

    #[test]
    fn test_assign_waypoints_prefix_on_mismatch() {
        let stops = vec![
            StopInterval {
                index: 1,
                start_ns: 0,
                end_ns: 3_000_000_000,
            },
            StopInterval {
                index: 2,
                start_ns: 5_000_000_000,
                end_ns: 8_000_000_000,
            },
        ];
        let waypoints = waypoint_script(2.07, 0.7, 2.4, 5);
        let labeled = assign_waypoints(&stops, &waypoints);
        assert_eq!(labeled.len(), 2);
        assert_approx_eq!(labeled[1].waypoint[1], waypoints[1][1], 1e-12);
    }

    #[test]
    fn test_ground_truth_interpolates_between_stops() {
        let samples = synthetic_stream(&[(true, 3.0), (false, 2.0), (true, 3.0)]);
        let waypoints = vec![Vector2::new(2.07, 0.7), Vector2::new(2.07, 1.7)];
        let truth = build_ground_truth(
            &samples,
            &waypoints,
            DEFAULT_ACCEL_CHANGE_THRESHOLD,
            DEFAULT_MIN_STOP_DURATION_S,
        );
        assert_eq!(truth.len(), samples.len());
        // First dwell is labeled with the first waypoint.
        let first = &truth[10];
        assert_eq!(first.state, MotionState::Stopped);
        assert_eq!(first.stop_number, Some(1));
        assert_approx_eq!(first.position.unwrap()[1], 0.7, 1e-12);
        // Moving samples between the dwells interpolate in y and climb.
        let moving: Vec<&GroundTruthRecord> = truth
            .iter()
            .filter(|r| r.state == MotionState::Moving && r.position.is_some())
            .collect();
        assert!(!moving.is_empty());
        for pair in moving.windows(2) {
            assert!(pair[1].position.unwrap()[1] >= pair[0].position.unwrap()[1]);
        }
        let mid = moving[moving.len() / 2].position.unwrap();
        assert!(mid[1] > 0.7 && mid[1] < 1.7);
        assert_approx_eq!(mid[0], 2.07, 1e-12);
    }
}
