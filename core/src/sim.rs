//! Offline pipelines and data tooling
//!
//! This module contains the data-handling layer around the estimators: typed
//! ingestion of recorded merged IMU/UWB CSV files, the offline pipeline
//! runners (EKF fusion, IMU dead reckoning, UWB-only multilateration),
//! position-estimate CSV export, ground-truth CSV export, and seeded
//! synthetic stream generation for tests and demos.
//!
//! The merged CSV format is one row per IMU tick:
//! `timestamp_ns, qw, qx, qy, qz, ax, ay, az` followed by one
//! `dist_<mac prefix>` column per anchor. Range cells are empty on ticks
//! where that anchor did not report.

use crate::kalman::{EstimatorConfig, TagEkf};
use crate::labeling::{GroundTruthRecord, MotionState};
use crate::ranging::{AnchorTable, MultilaterationTracker};
use crate::{InertialSample, TagState, forward, global_acceleration};

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use log::{debug, info, warn};
use nalgebra::{Vector2, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// One row of a merged IMU/UWB recording, with range cells aligned to the
/// anchor table the file was read against.
#[derive(Clone, Debug)]
pub struct MergedRecord {
    pub timestamp_ns: i64,
    /// Raw orientation quaternion in (w, x, y, z) order, unvalidated
    pub quaternion: [f64; 4],
    /// Raw body-frame linear acceleration in m/s^2
    pub accel_body: Vector3<f64>,
    /// Slant ranges in meters, one slot per anchor in table order; `None`
    /// where the anchor did not report this tick
    pub ranges: Vec<Option<f64>>,
}

impl MergedRecord {
    /// Validate the raw quaternion and build an [`InertialSample`].
    ///
    /// Returns `None` for degenerate quaternions (norm below
    /// [`crate::QUATERNION_NORM_FLOOR`]); the runners skip such rows without
    /// touching estimator state.
    pub fn inertial_sample(&self) -> Option<InertialSample> {
        InertialSample::from_raw(
            self.timestamp_ns,
            self.quaternion,
            [self.accel_body[0], self.accel_body[1], self.accel_body[2]],
        )
    }

    /// Reads a merged recording from a CSV file.
    ///
    /// The anchor range columns are resolved against the table's
    /// `dist_<mac prefix>` names once, from the header; an anchor whose
    /// column is missing from the file gets `None` in every row. Unparseable
    /// or empty range cells likewise become `None` rather than failing the
    /// whole file (partial dropout is normal data, not an error).
    ///
    /// # Arguments
    /// * `path` - Path to the merged CSV file.
    /// * `anchors` - Anchor table defining the range-column order.
    ///
    /// # Returns
    /// * `Result<Vec<MergedRecord>, Box<dyn Error>>` - the rows in file
    ///   order, or an error for a missing file or malformed required column.
    pub fn from_csv<P: AsRef<Path>>(
        path: P,
        anchors: &AnchorTable,
    ) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let headers = rdr.headers()?.clone();
        let find = |name: &str| headers.iter().position(|h| h == name);

        let required = ["timestamp_ns", "qw", "qx", "qy", "qz", "ax", "ay", "az"];
        let mut required_idx = [0usize; 8];
        for (slot, name) in required_idx.iter_mut().zip(required.iter()) {
            *slot = find(name).ok_or_else(|| format!("missing required column '{}'", name))?;
        }
        let range_idx: Vec<Option<usize>> = anchors
            .anchors
            .iter()
            .map(|a| {
                let column = a.range_column();
                let idx = find(&column);
                if idx.is_none() {
                    warn!("anchor {} has no '{}' column in this file", a.id, column);
                }
                idx
            })
            .collect();

        let mut records = Vec::new();
        for result in rdr.records() {
            let row = result?;
            let cell = |i: usize| -> Result<f64, Box<dyn std::error::Error>> {
                Ok(row
                    .get(i)
                    .ok_or_else(|| format!("row too short at column {}", i))?
                    .trim()
                    .parse::<f64>()?)
            };
            let timestamp_ns = row
                .get(required_idx[0])
                .ok_or("row too short at timestamp column")?
                .trim()
                .parse::<i64>()?;
            let ranges = range_idx
                .iter()
                .map(|idx| {
                    idx.and_then(|i| row.get(i))
                        .and_then(|s| s.trim().parse::<f64>().ok())
                })
                .collect();
            records.push(MergedRecord {
                timestamp_ns,
                quaternion: [
                    cell(required_idx[1])?,
                    cell(required_idx[2])?,
                    cell(required_idx[3])?,
                    cell(required_idx[4])?,
                ],
                accel_body: Vector3::new(
                    cell(required_idx[5])?,
                    cell(required_idx[6])?,
                    cell(required_idx[7])?,
                ),
                ranges,
            });
        }
        info!("read {} merged rows", records.len());
        Ok(records)
    }
}

/// One position estimate, one row per accepted input row.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub timestamp_ns: i64,
    pub pos_x: f64,
    pub pos_y: f64,
}

impl PositionRecord {
    pub fn new(timestamp_ns: i64, position: &Vector2<f64>) -> PositionRecord {
        PositionRecord {
            timestamp_ns,
            pos_x: position[0],
            pos_y: position[1],
        }
    }

    /// Writes position records to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads position records back from a CSV file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Writes a ground-truth trajectory to a CSV file.
///
/// Columns: `timestamp_ns, time_s, state, gt_pos_x, gt_pos_y, stop_number`.
/// Position and stop-number cells are left empty where unknown.
pub fn ground_truth_to_csv<P: AsRef<Path>>(
    records: &[GroundTruthRecord],
    path: P,
) -> io::Result<()> {
    let mut file = File::create(path)?;
    writeln!(
        file,
        "timestamp_ns,time_s,state,gt_pos_x,gt_pos_y,stop_number"
    )?;
    let t0 = records.first().map(|r| r.timestamp_ns).unwrap_or(0);
    for record in records {
        let state = match record.state {
            MotionState::Stopped => "STOP",
            MotionState::Moving => "MOVING",
        };
        let (x, y) = match record.position {
            Some(p) => (format!("{:.4}", p[0]), format!("{:.4}", p[1])),
            None => (String::new(), String::new()),
        };
        let stop = record
            .stop_number
            .map(|n| n.to_string())
            .unwrap_or_default();
        writeln!(
            file,
            "{},{:.4},{},{},{},{}",
            record.timestamp_ns,
            (record.timestamp_ns - t0) as f64 / 1e9,
            state,
            x,
            y,
            stop
        )?;
    }
    Ok(())
}

/// Project one row's raw slant ranges into `(anchor_2d, distance_2d)` pairs,
/// in anchor-table order, skipping anchors that did not report.
fn project_ranges(record: &MergedRecord, anchors: &AnchorTable) -> Vec<(Vector2<f64>, f64)> {
    anchors
        .anchors
        .iter()
        .zip(record.ranges.iter())
        .filter_map(|(anchor, slant)| {
            slant.map(|s| (anchor.position_2d(), anchors.project(anchor, s)))
        })
        .collect()
}

/// Run the full UWB/IMU fusion pipeline over a recording.
///
/// The first row emits the configured initial position without prediction.
/// Rows with a degenerate quaternion are skipped entirely (the step clock
/// does not advance). Rows with a non-positive time step advance the step
/// clock but produce no estimate and leave the filter untouched.
///
/// # Arguments
/// * `records` - Merged rows in time order.
/// * `anchors` - Anchor table matching the rows' range slots.
/// * `config` - Filter tuning and initial conditions.
///
/// # Returns
/// * One [`PositionRecord`] per accepted row.
pub fn run_ekf(
    records: &[MergedRecord],
    anchors: &AnchorTable,
    config: EstimatorConfig,
) -> Vec<PositionRecord> {
    let mut ekf = TagEkf::new(config);
    let mut results = Vec::with_capacity(records.len());
    let mut prev_timestamp_ns: Option<i64> = None;

    for record in records {
        let sample = match record.inertial_sample() {
            Some(sample) => sample,
            None => {
                debug!(
                    "skipping row at {} ns: degenerate quaternion",
                    record.timestamp_ns
                );
                continue;
            }
        };
        let prev = match prev_timestamp_ns.replace(record.timestamp_ns) {
            Some(prev) => prev,
            None => {
                // First valid row anchors the clock and reports the start.
                results.push(PositionRecord::new(record.timestamp_ns, &ekf.position()));
                continue;
            }
        };
        let dt = (record.timestamp_ns - prev) as f64 / 1e9;
        if dt <= 0.0 {
            debug!(
                "skipping row at {} ns: non-positive dt {:.6}",
                record.timestamp_ns, dt
            );
            continue;
        }

        let ranges = project_ranges(record, anchors);
        ekf.step(&sample, dt, &ranges);
        results.push(PositionRecord::new(record.timestamp_ns, &ekf.position()));
    }
    info!("EKF pipeline produced {} estimates", results.len());
    results
}

/// Run IMU-only dead reckoning over a recording.
///
/// Pure kinematic propagation with no range corrections and no zero-velocity
/// updates; useful as a drift baseline against the fused pipeline. Row
/// skipping rules match [`run_ekf`].
pub fn dead_reckoning(records: &[MergedRecord], initial_position: Vector2<f64>) -> Vec<PositionRecord> {
    let mut state = TagState::new(initial_position);
    let mut results = Vec::with_capacity(records.len());
    let mut prev_timestamp_ns: Option<i64> = None;

    for record in records {
        let sample = match record.inertial_sample() {
            Some(sample) => sample,
            None => continue,
        };
        let prev = match prev_timestamp_ns.replace(record.timestamp_ns) {
            Some(prev) => prev,
            None => {
                results.push(PositionRecord::new(record.timestamp_ns, &state.position));
                continue;
            }
        };
        let dt = (record.timestamp_ns - prev) as f64 / 1e9;
        if dt <= 0.0 {
            continue;
        }

        let accel = global_acceleration(&sample.orientation, &sample.accel_body);
        forward(&mut state, accel, dt);
        results.push(PositionRecord::new(record.timestamp_ns, &state.position));
    }
    info!("dead-reckoning pipeline produced {} estimates", results.len());
    results
}

/// Run the UWB-only multilateration pipeline over a recording.
///
/// Every row yields an estimate: the solved position when enough ranges came
/// in and the solve converged, the held last position otherwise (see
/// [`MultilaterationTracker`]).
pub fn run_multilateration(
    records: &[MergedRecord],
    anchors: &AnchorTable,
    initial_position: Vector2<f64>,
    hold_warn_secs: f64,
) -> Vec<PositionRecord> {
    let mut tracker = MultilaterationTracker::new(initial_position, hold_warn_secs);
    let mut results = Vec::with_capacity(records.len());

    for record in records {
        let pairs = project_ranges(record, anchors);
        let (anchors_2d, distances): (Vec<Vector2<f64>>, Vec<f64>) = pairs.into_iter().unzip();
        let position = tracker.update(record.timestamp_ns, &anchors_2d, &distances);
        results.push(PositionRecord::new(record.timestamp_ns, &position));
    }
    info!("multilateration pipeline produced {} estimates", results.len());
    results
}

/// Generate a stationary merged recording: the tag parked at `position` with
/// Gaussian noise on accelerations and ranges.
///
/// # Arguments
/// * `position` - True tag position in room-frame meters.
/// * `anchors` - Anchor table; every anchor reports every tick.
/// * `duration_s` - Length of the recording in seconds.
/// * `rate_hz` - Sample rate.
/// * `accel_noise_std` - Accelerometer noise sigma in m/s^2.
/// * `range_noise_std` - Slant-range noise sigma in meters.
/// * `seed` - RNG seed, fixed for reproducible tests.
pub fn generate_stationary_records(
    position: Vector2<f64>,
    anchors: &AnchorTable,
    duration_s: f64,
    rate_hz: f64,
    accel_noise_std: f64,
    range_noise_std: f64,
    seed: u64,
) -> Vec<MergedRecord> {
    generate_walk_records(
        &[position, position],
        anchors,
        duration_s,
        rate_hz,
        accel_noise_std,
        range_noise_std,
        seed,
    )
}

/// Generate a merged recording of the tag gliding along a waypoint path at
/// constant speed, with Gaussian noise on accelerations and ranges.
///
/// Orientation is held at identity, so the noiseless body acceleration is
/// the room-frame acceleration passed back through the inverse axis remap.
/// Ranges are true 3D slant distances from each anchor to the tag at its
/// antenna height, plus noise.
pub fn generate_walk_records(
    waypoints: &[Vector2<f64>],
    anchors: &AnchorTable,
    duration_s: f64,
    rate_hz: f64,
    accel_noise_std: f64,
    range_noise_std: f64,
    seed: u64,
) -> Vec<MergedRecord> {
    assert!(waypoints.len() >= 2, "need at least a start and an end");
    let mut rng = StdRng::seed_from_u64(seed);
    // Clamped sigma is always finite and non-negative, so construction cannot fail.
    let accel_noise = Normal::new(0.0, accel_noise_std.max(0.0)).expect("valid sigma");
    let range_noise = Normal::new(0.0, range_noise_std.max(0.0)).expect("valid sigma");

    let n = (duration_s * rate_hz) as usize;
    let dt_ns = (1e9 / rate_hz) as i64;
    let legs = waypoints.len() - 1;

    let mut records = Vec::with_capacity(n);
    for k in 0..n {
        let timestamp_ns = k as i64 * dt_ns;
        // Piecewise-linear position along the waypoint path.
        let progress = k as f64 / (n.max(2) - 1) as f64 * legs as f64;
        let leg = (progress.floor() as usize).min(legs - 1);
        let alpha = progress - leg as f64;
        let position = waypoints[leg] + (waypoints[leg + 1] - waypoints[leg]) * alpha;

        // Identity orientation: room accel (gx, gy) maps back to body
        // (-gy, gx) under the inverse of the mounting remap. The scripted
        // path is constant-speed so the noiseless term is zero anyway.
        let accel_body = Vector3::new(
            accel_noise.sample(&mut rng),
            accel_noise.sample(&mut rng),
            accel_noise.sample(&mut rng),
        );
        let tag = Vector3::new(position[0], position[1], anchors.tag_height);
        let ranges = anchors
            .anchors
            .iter()
            .map(|anchor| Some((anchor.position - tag).norm() + range_noise.sample(&mut rng)))
            .collect();
        records.push(MergedRecord {
            timestamp_ns,
            quaternion: [1.0, 0.0, 0.0, 0.0],
            accel_body,
            ranges,
        });
    }
    records
}
