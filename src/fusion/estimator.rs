// estimator.rs: GPS/IMU fusion state machine around the Kalman filter.
//
// Pure computation: no threads, no clocks, no I/O. Callers pass sensor samples
// plus their notion of "now" and get events back, so the same code runs inside
// the poll loop and in unit tests with synthetic timestamps.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ConfigError, FilterError, MeasurementError};
use crate::fusion::geo::{
    course_to_velocity, haversine_distance, latlon_to_meters, meters_to_latlon, wrap_angle,
};
use crate::fusion::kalman::{ImuInput, KalmanFilter, ProcessNoise};
use crate::types::{
    GpsFix, GpsMeasNoise, GpsMeasVec, ImuReading, RawReading, StateMat, StateVec, IDX_HEADING,
    IDX_HEADING_RATE, IDX_PE, IDX_PN, IDX_VE, IDX_VN,
};

const G: f64 = 9.80665; // m/s²

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    // ── Initialization ──
    pub settle_secs: f64,
    pub min_settle_samples: usize,
    pub stationary_accel_threshold: f64,
    pub stationary_gyro_threshold: f64,

    // ── Degradation ──
    pub coast_window_secs: f64,
    pub dead_reckoning_limit_secs: f64,

    // ── Input gating ──
    pub imu_staleness_secs: f64,
    pub gps_max_latency_secs: f64,
    pub min_fix_quality: u8,
    pub max_predict_dt: f64,

    // ── Process noise (Q) ──
    pub accel_noise_density: f64,
    pub gyro_noise_density: f64,
    pub yaw_rate_noise_std: f64,

    // ── Measurement noise (R) ──
    pub gps_position_std: f64,
    pub gps_velocity_std: f64,
    pub gps_course_std_deg: f64,
    pub min_course_speed: f64,
    pub scale_noise_by_quality: bool,
    pub full_weight_satellites: u8,

    // ── Initial covariance ──
    pub initial_heading_std: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            settle_secs: 30.0,
            min_settle_samples: 10,
            stationary_accel_threshold: 0.5,
            stationary_gyro_threshold: 0.05,
            coast_window_secs: 5.0,
            dead_reckoning_limit_secs: 300.0,
            imu_staleness_secs: 1.0,
            gps_max_latency_secs: 2.0,
            min_fix_quality: 1,
            max_predict_dt: 1.0,
            accel_noise_density: 0.5,
            gyro_noise_density: 0.01,
            yaw_rate_noise_std: 0.02,
            gps_position_std: 5.0,
            gps_velocity_std: 0.5,
            gps_course_std_deg: 5.0,
            min_course_speed: 2.0,
            scale_noise_by_quality: true,
            full_weight_satellites: 6,
            initial_heading_std: std::f64::consts::PI,
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("coast_window_secs", self.coast_window_secs),
            ("imu_staleness_secs", self.imu_staleness_secs),
            ("gps_max_latency_secs", self.gps_max_latency_secs),
            ("max_predict_dt", self.max_predict_dt),
            ("accel_noise_density", self.accel_noise_density),
            ("gyro_noise_density", self.gyro_noise_density),
            ("yaw_rate_noise_std", self.yaw_rate_noise_std),
            ("gps_position_std", self.gps_position_std),
            ("gps_velocity_std", self.gps_velocity_std),
            ("gps_course_std_deg", self.gps_course_std_deg),
            ("initial_heading_std", self.initial_heading_std),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidParameter {
                    name,
                    reason: format!("must be positive and finite, got {}", value),
                });
            }
        }
        if !(self.settle_secs.is_finite() && self.settle_secs >= 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "settle_secs",
                reason: format!("must be non-negative, got {}", self.settle_secs),
            });
        }
        if self.min_settle_samples == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "min_settle_samples",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.dead_reckoning_limit_secs < self.coast_window_secs {
            return Err(ConfigError::InvalidParameter {
                name: "dead_reckoning_limit_secs",
                reason: format!(
                    "{} is shorter than the coast window ({})",
                    self.dead_reckoning_limit_secs, self.coast_window_secs
                ),
            });
        }
        Ok(())
    }

    pub fn process_noise(&self) -> ProcessNoise {
        ProcessNoise {
            accel_density: self.accel_noise_density,
            gyro_density: self.gyro_noise_density,
            yaw_rate_std: self.yaw_rate_noise_std,
        }
    }

    /// Multiplier applied to the GPS measurement variances for this fix.
    pub fn quality_scale(&self, fix: &GpsFix) -> f64 {
        if !self.scale_noise_by_quality {
            return 1.0;
        }
        let quality = match fix.fix_quality {
            4 => 0.05, // RTK fixed
            5 => 0.25, // RTK float
            2 | 3 => 0.5,
            6 => 4.0, // receiver dead reckoning
            _ => 1.0,
        };
        let sats = f64::from(fix.satellites);
        let full = f64::from(self.full_weight_satellites);
        let geometry = if fix.satellites > 0 && sats < full {
            (full / sats).powi(2)
        } else {
            1.0
        };
        quality * geometry
    }
}

// ─── Status & events ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FusionStatus {
    Uninitialized,
    Initializing,
    Tracking,
    Degraded,
}

impl FusionStatus {
    /// Numeric form published on the `KF_Status` channel.
    pub fn code(self) -> f64 {
        match self {
            FusionStatus::Uninitialized => 0.0,
            FusionStatus::Initializing => 1.0,
            FusionStatus::Tracking => 2.0,
            FusionStatus::Degraded => 3.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FusionStatus::Uninitialized => "UNINITIALIZED",
            FusionStatus::Initializing => "INITIALIZING",
            FusionStatus::Tracking => "TRACKING",
            FusionStatus::Degraded => "DEGRADED",
        }
    }

    pub fn can_transition_to(self, next: FusionStatus) -> bool {
        use FusionStatus::*;
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, Tracking)
                | (Tracking, Degraded)
                | (Degraded, Tracking)
                | (Degraded, Initializing)
        )
    }

    pub fn has_estimate(self) -> bool {
        matches!(self, FusionStatus::Tracking | FusionStatus::Degraded)
    }
}

impl fmt::Display for FusionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuBias {
    /// Accelerometer bias [m/s²]; z excludes gravity
    pub accel: [f64; 3],
    /// Gyro bias [rad/s]
    pub gyro: [f64; 3],
}

#[derive(Clone, Debug, PartialEq)]
pub enum FusionEvent {
    StatusChanged { from: FusionStatus, to: FusionStatus },
    GpsRejected(MeasurementError),
    ImuRejected(MeasurementError),
    OriginSeeded { lat: f64, lon: f64 },
    BiasSettled { bias: ImuBias, samples: usize },
    SettlingRestarted { reason: &'static str },
    ImuGap { dt: f64 },
    FilterFault(FilterError),
}

// ─── Fused output ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct FusedState {
    pub status: FusionStatus,
    /// Time the estimate refers to (last predict/update)
    pub timestamp: f64,
    pub origin: Option<(f64, f64)>,
    pub position: Option<(f64, f64)>,
    pub position_local: (f64, f64),
    pub velocity: (f64, f64),
    pub speed: f64,
    /// Course over ground [rad, clockwise from north]
    pub heading: f64,
    pub heading_rate: f64,
    pub covariance: Option<StateMat>,
    pub covariance_trace: Option<f64>,
    pub position_uncertainty_m: Option<f64>,
    pub distance: f64,
    pub bias: Option<ImuBias>,
    pub gps_updates: u64,
    pub imu_predicts: u64,
}

impl FusedState {
    /// Flatten into `KF_*` raw channels. Only `KF_Status` is published until an
    /// estimate exists.
    pub fn to_raw_reading(&self, source_id: &str) -> RawReading {
        let mut raw = RawReading::new(source_id, self.timestamp).with("KF_Status", self.status.code());
        if !self.status.has_estimate() {
            return raw;
        }
        if let Some((lat, lon)) = self.position {
            raw.insert("KF_Lat", lat);
            raw.insert("KF_Lon", lon);
        }
        raw.insert("KF_Speed", self.speed);
        raw.insert("KF_VelE", self.velocity.0);
        raw.insert("KF_VelN", self.velocity.1);
        raw.insert("KF_Heading", self.heading.to_degrees().rem_euclid(360.0));
        raw.insert("KF_HeadingRate", self.heading_rate.to_degrees());
        raw.insert("KF_Distance", self.distance);
        if let Some(uncertainty) = self.position_uncertainty_m {
            raw.insert("KF_PosUncertainty", uncertainty);
        }
        raw
    }
}

// ─── Bias settling ───────────────────────────────────────────────────────────

enum SettleOutcome {
    Accumulating,
    Restarted(&'static str),
    Settled(ImuBias, usize),
}

#[derive(Clone, Debug, Default)]
struct BiasAccumulator {
    window_start: Option<f64>,
    last_ts: f64,
    count: usize,
    accel_sum: [f64; 3],
    gyro_sum: [f64; 3],
}

impl BiasAccumulator {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn mean(sum: &[f64; 3], count: usize) -> [f64; 3] {
        let n = count.max(1) as f64;
        [sum[0] / n, sum[1] / n, sum[2] / n]
    }

    fn start_with(&mut self, imu: &ImuReading) {
        self.reset();
        self.window_start = Some(imu.timestamp);
        self.last_ts = imu.timestamp;
        self.count = 1;
        self.accel_sum = imu.accel;
        self.gyro_sum = imu.gyro;
    }

    fn is_stationary(&self, imu: &ImuReading, config: &FusionConfig) -> bool {
        let accel_mean = Self::mean(&self.accel_sum, self.count);
        let gyro_mean = Self::mean(&self.gyro_sum, self.count);
        let accel_dev = (imu.accel[0] - accel_mean[0]).hypot(imu.accel[1] - accel_mean[1]);
        let gyro_dev = ((imu.gyro[0] - gyro_mean[0]).powi(2)
            + (imu.gyro[1] - gyro_mean[1]).powi(2)
            + (imu.gyro[2] - gyro_mean[2]).powi(2))
        .sqrt();
        accel_dev <= config.stationary_accel_threshold && gyro_dev <= config.stationary_gyro_threshold
    }

    fn push(&mut self, imu: &ImuReading, config: &FusionConfig) -> SettleOutcome {
        let outcome = match self.window_start {
            None => {
                self.start_with(imu);
                SettleOutcome::Accumulating
            }
            Some(_) => {
                let gap = imu.timestamp - self.last_ts;
                if gap <= 0.0 {
                    return SettleOutcome::Accumulating;
                }
                if gap > config.max_predict_dt {
                    self.start_with(imu);
                    SettleOutcome::Restarted("imu gap")
                } else if !self.is_stationary(imu, config) {
                    self.start_with(imu);
                    SettleOutcome::Restarted("motion detected")
                } else {
                    self.last_ts = imu.timestamp;
                    self.count += 1;
                    for i in 0..3 {
                        self.accel_sum[i] += imu.accel[i];
                        self.gyro_sum[i] += imu.gyro[i];
                    }
                    SettleOutcome::Accumulating
                }
            }
        };

        if matches!(outcome, SettleOutcome::Restarted(_)) {
            return outcome;
        }

        let start = self.window_start.unwrap_or(imu.timestamp);
        if self.last_ts - start >= config.settle_secs && self.count >= config.min_settle_samples {
            let mut accel = Self::mean(&self.accel_sum, self.count);
            // Remove gravity whichever sign the sensor reports it with
            accel[2] -= G.copysign(accel[2]);
            let gyro = Self::mean(&self.gyro_sum, self.count);
            return SettleOutcome::Settled(ImuBias { accel, gyro }, self.count);
        }
        outcome
    }
}

// ─── Estimator ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct FusionEstimator {
    config: FusionConfig,
    status: FusionStatus,
    bias_acc: BiasAccumulator,
    bias: Option<ImuBias>,
    origin: Option<(f64, f64)>,
    seed: Option<GpsFix>,
    filter: Option<KalmanFilter>,
    filter_time: f64,
    last_input: ImuInput,
    last_gps_ts: Option<f64>,
    last_gps_update_ts: Option<f64>,
    last_fix_position: Option<(f64, f64)>,
    distance: f64,
    gps_updates: u64,
    imu_predicts: u64,
    rejected_gps: u64,
    rejected_imu: u64,
}

impl FusionEstimator {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            status: FusionStatus::Uninitialized,
            bias_acc: BiasAccumulator::default(),
            bias: None,
            origin: None,
            seed: None,
            filter: None,
            filter_time: 0.0,
            last_input: ImuInput::default(),
            last_gps_ts: None,
            last_gps_update_ts: None,
            last_fix_position: None,
            distance: 0.0,
            gps_updates: 0,
            imu_predicts: 0,
            rejected_gps: 0,
            rejected_imu: 0,
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn status(&self) -> FusionStatus {
        self.status
    }

    pub fn bias(&self) -> Option<ImuBias> {
        self.bias
    }

    pub fn rejected_counts(&self) -> (u64, u64) {
        (self.rejected_gps, self.rejected_imu)
    }

    pub fn covariance_trace(&self) -> Option<f64> {
        self.filter.as_ref().map(KalmanFilter::covariance_trace)
    }

    /// Drop all estimation state, back to `UNINITIALIZED`.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    fn transition(&mut self, to: FusionStatus, events: &mut Vec<FusionEvent>) {
        let from = self.status;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            debug!("[fusion] ignoring illegal transition {} -> {}", from, to);
            return;
        }
        self.status = to;
        events.push(FusionEvent::StatusChanged { from, to });
    }

    // ── Validation ───────────────────────────────────────────────────────

    pub fn validate_gps(&self, fix: &GpsFix, now: f64) -> Result<(), MeasurementError> {
        if !fix.is_finite() {
            return Err(MeasurementError::InvalidMeasurement(
                "non-finite GPS field".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&fix.latitude) {
            return Err(MeasurementError::InvalidMeasurement(format!(
                "latitude {} out of range",
                fix.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&fix.longitude) {
            return Err(MeasurementError::InvalidMeasurement(format!(
                "longitude {} out of range",
                fix.longitude
            )));
        }
        if fix.speed < 0.0 {
            return Err(MeasurementError::InvalidMeasurement(format!(
                "negative ground speed {}",
                fix.speed
            )));
        }
        if fix.fix_quality < self.config.min_fix_quality {
            return Err(MeasurementError::InvalidMeasurement(format!(
                "fix quality {} below minimum {}",
                fix.fix_quality, self.config.min_fix_quality
            )));
        }
        let age = now - fix.timestamp;
        if age > self.config.gps_max_latency_secs {
            return Err(MeasurementError::StaleData {
                age_secs: age,
                bound_secs: self.config.gps_max_latency_secs,
            });
        }
        if let Some(last) = self.last_gps_ts {
            if fix.timestamp <= last {
                return Err(MeasurementError::StaleData {
                    age_secs: last - fix.timestamp,
                    bound_secs: 0.0,
                });
            }
        }
        Ok(())
    }

    pub fn validate_imu(&self, imu: &ImuReading, now: f64) -> Result<(), MeasurementError> {
        if !imu.is_finite() {
            return Err(MeasurementError::InvalidMeasurement(
                "non-finite IMU field".to_string(),
            ));
        }
        let age = now - imu.timestamp;
        if age > self.config.imu_staleness_secs {
            return Err(MeasurementError::StaleData {
                age_secs: age,
                bound_secs: self.config.imu_staleness_secs,
            });
        }
        Ok(())
    }

    // ── Sensor feeds ─────────────────────────────────────────────────────

    /// Feed a GPS fix. `now`: current wall-clock seconds; in replay, pass the fix timestamp.
    pub fn feed_gps(&mut self, fix: &GpsFix, now: f64) -> Vec<FusionEvent> {
        let mut events = Vec::new();

        if let Err(reason) = self.validate_gps(fix, now) {
            self.rejected_gps += 1;
            events.push(FusionEvent::GpsRejected(reason));
            return events;
        }
        self.last_gps_ts = Some(fix.timestamp);

        if self.status == FusionStatus::Uninitialized {
            self.transition(FusionStatus::Initializing, &mut events);
        }
        events.extend(self.check_timeouts(now));

        match self.status {
            FusionStatus::Initializing => {
                self.seed_from(fix, &mut events);
                self.try_enter_tracking(fix.timestamp, &mut events);
            }
            FusionStatus::Tracking | FusionStatus::Degraded => {
                if self.apply_gps_update(fix, &mut events) {
                    self.transition(FusionStatus::Tracking, &mut events);
                }
            }
            FusionStatus::Uninitialized => {}
        }

        events
    }

    /// Feed an IMU reading. Settles bias while initializing, predicts while tracking.
    pub fn feed_imu(&mut self, imu: &ImuReading, now: f64) -> Vec<FusionEvent> {
        let mut events = Vec::new();

        if let Err(reason) = self.validate_imu(imu, now) {
            self.rejected_imu += 1;
            events.push(FusionEvent::ImuRejected(reason));
            return events;
        }

        if self.status == FusionStatus::Uninitialized {
            self.transition(FusionStatus::Initializing, &mut events);
        }
        events.extend(self.check_timeouts(now));

        match self.status {
            FusionStatus::Initializing => {
                if self.bias.is_none() {
                    match self.bias_acc.push(imu, &self.config) {
                        SettleOutcome::Settled(bias, samples) => {
                            self.bias = Some(bias);
                            events.push(FusionEvent::BiasSettled { bias, samples });
                        }
                        SettleOutcome::Restarted(reason) => {
                            events.push(FusionEvent::SettlingRestarted { reason });
                        }
                        SettleOutcome::Accumulating => {}
                    }
                }
                self.try_enter_tracking(imu.timestamp, &mut events);
            }
            FusionStatus::Tracking | FusionStatus::Degraded => {
                self.predict_imu(imu, &mut events);
            }
            FusionStatus::Uninitialized => {}
        }

        events
    }

    /// Evaluate the coast window and dead-reckoning limit against `now`.
    pub fn check_timeouts(&mut self, now: f64) -> Vec<FusionEvent> {
        let mut events = Vec::new();
        let Some(last_update) = self.last_gps_update_ts else {
            return events;
        };
        let silence = now - last_update;

        if self.status == FusionStatus::Tracking && silence > self.config.coast_window_secs {
            self.transition(FusionStatus::Degraded, &mut events);
        }
        if self.status == FusionStatus::Degraded && silence > self.config.dead_reckoning_limit_secs
        {
            // Bias survives; position must be re-seeded from a fresh fix.
            self.filter = None;
            self.seed = None;
            self.origin = None;
            self.last_gps_update_ts = None;
            self.last_fix_position = None;
            self.transition(FusionStatus::Initializing, &mut events);
        }
        events
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn seed_from(&mut self, fix: &GpsFix, events: &mut Vec<FusionEvent>) {
        if self.origin.is_none() {
            self.origin = Some((fix.latitude, fix.longitude));
            events.push(FusionEvent::OriginSeeded {
                lat: fix.latitude,
                lon: fix.longitude,
            });
        }
        self.seed = Some(fix.clone());
    }

    fn try_enter_tracking(&mut self, reference_ts: f64, events: &mut Vec<FusionEvent>) {
        if self.bias.is_none() {
            return;
        }
        let (Some(seed), Some(origin)) = (self.seed.clone(), self.origin) else {
            return;
        };
        if reference_ts - seed.timestamp > self.config.coast_window_secs {
            debug!(
                "[fusion] seed fix is {:.1}s old, waiting for a fresh one",
                reference_ts - seed.timestamp
            );
            return;
        }

        let scale = self.config.quality_scale(&seed);
        let (pe, pn) = latlon_to_meters(seed.latitude, seed.longitude, origin.0, origin.1);
        let (ve, vn) = course_to_velocity(seed.speed, seed.course);
        let course_known = seed.speed >= self.config.min_course_speed;

        let mut x = StateVec::zeros();
        x[IDX_PE] = pe;
        x[IDX_PN] = pn;
        x[IDX_VE] = ve;
        x[IDX_VN] = vn;
        if course_known {
            x[IDX_HEADING] = wrap_angle(seed.course.to_radians());
        }

        let pos_var = self.config.gps_position_std.powi(2) * scale;
        let vel_var = self.config.gps_velocity_std.powi(2) * scale;
        let heading_var = if course_known {
            self.config.gps_course_std_deg.to_radians().powi(2)
        } else {
            self.config.initial_heading_std.powi(2)
        };
        let mut p = StateMat::zeros();
        p[(IDX_PE, IDX_PE)] = pos_var;
        p[(IDX_PN, IDX_PN)] = pos_var;
        p[(IDX_VE, IDX_VE)] = vel_var;
        p[(IDX_VN, IDX_VN)] = vel_var;
        p[(IDX_HEADING, IDX_HEADING)] = heading_var;
        p[(IDX_HEADING_RATE, IDX_HEADING_RATE)] = self.config.yaw_rate_noise_std.powi(2);

        self.filter = Some(KalmanFilter::new(x, p));
        self.filter_time = seed.timestamp;
        self.last_input = ImuInput::default();
        self.last_gps_update_ts = Some(seed.timestamp);
        self.last_fix_position = Some((seed.latitude, seed.longitude));
        self.transition(FusionStatus::Tracking, events);
    }

    fn bias_corrected(&self, imu: &ImuReading) -> ImuInput {
        let bias = self.bias.unwrap_or_default();
        ImuInput {
            accel_forward: imu.accel[0] - bias.accel[0],
            accel_right: imu.accel[1] - bias.accel[1],
            yaw_rate: imu.gyro[2] - bias.gyro[2],
        }
    }

    fn predict_imu(&mut self, imu: &ImuReading, events: &mut Vec<FusionEvent>) {
        let input = self.bias_corrected(imu);
        let dt = imu.timestamp - self.filter_time;

        if dt <= 0.0 {
            debug!("[fusion] IMU sample {:.3}s behind filter time, holding input", -dt);
            self.last_input = input;
            return;
        }
        if dt > self.config.max_predict_dt {
            events.push(FusionEvent::ImuGap { dt });
            self.filter_time = imu.timestamp;
            self.last_input = input;
            return;
        }

        let noise = self.config.process_noise();
        let Some(filter) = self.filter.as_mut() else {
            return;
        };
        filter.predict(dt, &input, &noise);
        if self.status == FusionStatus::Degraded {
            self.distance += filter.speed() * dt;
        }
        self.filter_time = imu.timestamp;
        self.last_input = input;
        self.imu_predicts += 1;
    }

    /// Returns true when the fix was applied to the filter.
    fn apply_gps_update(&mut self, fix: &GpsFix, events: &mut Vec<FusionEvent>) -> bool {
        let Some(origin) = self.origin else {
            return false;
        };
        let noise = self.config.process_noise();
        let max_dt = self.config.max_predict_dt;
        let Some(filter) = self.filter.as_mut() else {
            return false;
        };

        // Bring the estimate up to the fix time with the held IMU input
        let dt = fix.timestamp - self.filter_time;
        if dt > 0.0 {
            if dt <= max_dt {
                filter.predict(dt, &self.last_input, &noise);
            } else {
                events.push(FusionEvent::ImuGap { dt });
            }
            self.filter_time = fix.timestamp;
        }

        let (pe, pn) = latlon_to_meters(fix.latitude, fix.longitude, origin.0, origin.1);
        let (ve, vn) = course_to_velocity(fix.speed, fix.course);
        let z = GpsMeasVec::new(pe, pn, ve, vn);

        let scale = self.config.quality_scale(fix);
        let pos_var = self.config.gps_position_std.powi(2) * scale;
        let vel_var = self.config.gps_velocity_std.powi(2) * scale;
        let r = GpsMeasNoise::from_diagonal(&GpsMeasVec::new(pos_var, pos_var, vel_var, vel_var));

        if let Err(err) = filter.update_gps(&z, &r) {
            events.push(FusionEvent::FilterFault(err));
            return false;
        }
        if fix.speed >= self.config.min_course_speed {
            let course_var = self.config.gps_course_std_deg.to_radians().powi(2) * scale;
            if let Err(err) = filter.update_heading(fix.course.to_radians(), course_var) {
                events.push(FusionEvent::FilterFault(err));
            }
        }

        // Dead-reckoned distance was already accumulated while degraded
        if self.status == FusionStatus::Tracking {
            if let Some((lat, lon)) = self.last_fix_position {
                self.distance += haversine_distance(lat, lon, fix.latitude, fix.longitude);
            }
        }
        self.last_fix_position = Some((fix.latitude, fix.longitude));
        self.last_gps_update_ts = Some(fix.timestamp);
        self.gps_updates += 1;
        true
    }

    pub fn state(&self) -> FusedState {
        let mut state = FusedState {
            status: self.status,
            timestamp: self.filter_time,
            origin: self.origin,
            position: None,
            position_local: (0.0, 0.0),
            velocity: (0.0, 0.0),
            speed: 0.0,
            heading: 0.0,
            heading_rate: 0.0,
            covariance: None,
            covariance_trace: None,
            position_uncertainty_m: None,
            distance: self.distance,
            bias: self.bias,
            gps_updates: self.gps_updates,
            imu_predicts: self.imu_predicts,
        };

        if let Some(filter) = self.filter.as_ref() {
            let x = filter.state();
            let p = filter.covariance();
            state.position_local = (x[IDX_PE], x[IDX_PN]);
            state.position = self
                .origin
                .map(|(lat0, lon0)| meters_to_latlon(x[IDX_PE], x[IDX_PN], lat0, lon0));
            state.velocity = (x[IDX_VE], x[IDX_VN]);
            state.speed = filter.speed();
            state.heading = x[IDX_HEADING];
            state.heading_rate = x[IDX_HEADING_RATE];
            state.covariance = Some(*p);
            state.covariance_trace = Some(filter.covariance_trace());
            state.position_uncertainty_m =
                Some(((p[(IDX_PE, IDX_PE)] + p[(IDX_PN, IDX_PN)]) / 2.0).sqrt());
        }
        state
    }
}
