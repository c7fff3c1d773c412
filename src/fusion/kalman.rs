//! 6-state planar INS Kalman filter.
//!
//! State vector (6D):
//! [0-1]: Position (east, north) relative to the origin fix [m]
//! [2-3]: Velocity (east, north) [m/s]
//! [4]:   Heading, course over ground clockwise from north [rad]
//! [5]:   Heading rate [rad/s]
//!
//! The IMU drives the prediction as a control input (bias-corrected body
//! acceleration rotated by heading, yaw rate integrated into heading). GPS
//! position/velocity and course are measurement updates.

use crate::error::FilterError;
use crate::fusion::geo::wrap_angle;
use crate::types::{
    GpsMeasNoise, GpsMeasVec, JacobianGps, JacobianScalar, KalmanGainGps, KalmanGainScalar,
    StateMat, StateVec, IDX_HEADING, IDX_HEADING_RATE, IDX_PE, IDX_PN, IDX_VE, IDX_VN,
};

/// Bias-corrected IMU input for one prediction step.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ImuInput {
    /// Forward acceleration [m/s²]
    pub accel_forward: f64,
    /// Rightward acceleration [m/s²]
    pub accel_right: f64,
    /// Yaw rate, positive clockwise from above [rad/s]
    pub yaw_rate: f64,
}

/// Continuous-time process noise densities used to build Q(dt).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProcessNoise {
    /// Acceleration white-noise density [m/s²/√Hz]
    pub accel_density: f64,
    /// Gyro white-noise density, integrated into heading [rad/s/√Hz]
    pub gyro_density: f64,
    /// Std-dev of a single yaw-rate sample [rad/s]
    pub yaw_rate_std: f64,
}

#[derive(Clone, Debug)]
pub struct KalmanFilter {
    state: StateVec,
    covariance: StateMat,
}

impl KalmanFilter {
    pub fn new(state: StateVec, covariance: StateMat) -> Self {
        Self { state, covariance }
    }

    pub fn state(&self) -> &StateVec {
        &self.state
    }

    pub fn covariance(&self) -> &StateMat {
        &self.covariance
    }

    pub fn covariance_trace(&self) -> f64 {
        self.covariance.trace()
    }

    pub fn speed(&self) -> f64 {
        self.state[IDX_VE].hypot(self.state[IDX_VN])
    }

    /// Acceleration in the east/north frame for the current heading.
    fn rotate_input(heading: f64, input: &ImuInput) -> (f64, f64) {
        let (s, c) = heading.sin_cos();
        let a_e = input.accel_forward * s + input.accel_right * c;
        let a_n = input.accel_forward * c - input.accel_right * s;
        (a_e, a_n)
    }

    fn transition_jacobian(dt: f64, a_e: f64, a_n: f64) -> StateMat {
        let dt2 = dt * dt;
        let mut f = StateMat::identity();

        f[(IDX_PE, IDX_VE)] = dt;
        f[(IDX_PN, IDX_VN)] = dt;

        // d(rotated accel)/d(heading): d a_e/dψ = a_n, d a_n/dψ = -a_e
        f[(IDX_PE, IDX_HEADING)] = 0.5 * dt2 * a_n;
        f[(IDX_PN, IDX_HEADING)] = -0.5 * dt2 * a_e;
        f[(IDX_VE, IDX_HEADING)] = dt * a_n;
        f[(IDX_VN, IDX_HEADING)] = -dt * a_e;

        // Heading rate is replaced by the gyro input each step
        f[(IDX_HEADING_RATE, IDX_HEADING_RATE)] = 0.0;

        f
    }

    pub fn process_noise(dt: f64, noise: &ProcessNoise) -> StateMat {
        let q_a = noise.accel_density * noise.accel_density;
        let q_g = noise.gyro_density * noise.gyro_density;
        let mut q = StateMat::zeros();

        // Continuous white-noise acceleration, per axis
        let q_pp = q_a * dt.powi(3) / 3.0;
        let q_pv = q_a * dt.powi(2) / 2.0;
        let q_vv = q_a * dt;
        for (p, v) in [(IDX_PE, IDX_VE), (IDX_PN, IDX_VN)] {
            q[(p, p)] = q_pp;
            q[(p, v)] = q_pv;
            q[(v, p)] = q_pv;
            q[(v, v)] = q_vv;
        }

        q[(IDX_HEADING, IDX_HEADING)] = q_g * dt;
        q[(IDX_HEADING_RATE, IDX_HEADING_RATE)] = noise.yaw_rate_std * noise.yaw_rate_std;

        q
    }

    /// Propagate state and covariance by `dt` seconds.
    pub fn predict(&mut self, dt: f64, input: &ImuInput, noise: &ProcessNoise) {
        let heading = self.state[IDX_HEADING];
        let (a_e, a_n) = Self::rotate_input(heading, input);
        let dt2 = dt * dt;

        let ve = self.state[IDX_VE];
        let vn = self.state[IDX_VN];

        self.state[IDX_PE] += ve * dt + 0.5 * a_e * dt2;
        self.state[IDX_PN] += vn * dt + 0.5 * a_n * dt2;
        self.state[IDX_VE] += a_e * dt;
        self.state[IDX_VN] += a_n * dt;
        self.state[IDX_HEADING] = wrap_angle(heading + input.yaw_rate * dt);
        self.state[IDX_HEADING_RATE] = input.yaw_rate;

        let f = Self::transition_jacobian(dt, a_e, a_n);
        let q = Self::process_noise(dt, noise);
        self.covariance = f * self.covariance * f.transpose() + q;
        self.symmetrize();
    }

    pub fn gps_measurement_jacobian() -> JacobianGps {
        let mut h = JacobianGps::zeros();
        h[(0, IDX_PE)] = 1.0;
        h[(1, IDX_PN)] = 1.0;
        h[(2, IDX_VE)] = 1.0;
        h[(3, IDX_VN)] = 1.0;
        h
    }

    /// Position + velocity update. Returns the innovation `y = z - Hx`.
    pub fn update_gps(
        &mut self,
        measurement: &GpsMeasVec,
        noise: &GpsMeasNoise,
    ) -> Result<GpsMeasVec, FilterError> {
        let h = Self::gps_measurement_jacobian();
        let innovation = measurement - h * self.state;

        let ph_t = self.covariance * h.transpose();
        let s = h * ph_t + noise;
        let s_inv = s.try_inverse().ok_or(FilterError::SingularInnovation)?;
        let k: KalmanGainGps = ph_t * s_inv;

        self.state += k * innovation;
        self.state[IDX_HEADING] = wrap_angle(self.state[IDX_HEADING]);

        // Joseph form: P = (I - KH) P (I - KH)^T + K R K^T
        let i_kh = StateMat::identity() - k * h;
        self.covariance = i_kh * self.covariance * i_kh.transpose() + k * noise * k.transpose();
        self.symmetrize();

        Ok(innovation)
    }

    /// Scalar heading update with angle-wrapped innovation.
    pub fn update_heading(&mut self, heading: f64, variance: f64) -> Result<f64, FilterError> {
        let mut h = JacobianScalar::zeros();
        h[(0, IDX_HEADING)] = 1.0;

        let innovation = wrap_angle(heading - self.state[IDX_HEADING]);
        let s = self.covariance[(IDX_HEADING, IDX_HEADING)] + variance;
        if s.abs() < 1e-12 {
            return Err(FilterError::SingularInnovation);
        }
        let k: KalmanGainScalar = self.covariance.column(IDX_HEADING) / s;

        self.state += k * innovation;
        self.state[IDX_HEADING] = wrap_angle(self.state[IDX_HEADING]);

        let i_kh = StateMat::identity() - k * h;
        self.covariance =
            i_kh * self.covariance * i_kh.transpose() + (k * k.transpose()) * variance;
        self.symmetrize();

        Ok(innovation)
    }

    fn symmetrize(&mut self) {
        self.covariance = (self.covariance + self.covariance.transpose()) * 0.5;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn noise() -> ProcessNoise {
        ProcessNoise {
            accel_density: 0.5,
            gyro_density: 0.01,
            yaw_rate_std: 0.02,
        }
    }

    fn filter_at_rest() -> KalmanFilter {
        let mut p = StateMat::zeros();
        for (i, v) in [25.0, 25.0, 1.0, 1.0, 0.1, 0.0004].iter().enumerate() {
            p[(i, i)] = *v;
        }
        KalmanFilter::new(StateVec::zeros(), p)
    }

    #[test]
    fn test_predict_integrates_forward_acceleration_along_heading() {
        let mut kf = filter_at_rest();
        // Heading 90° = due east
        kf.state[IDX_HEADING] = std::f64::consts::FRAC_PI_2;
        let input = ImuInput {
            accel_forward: 2.0,
            accel_right: 0.0,
            yaw_rate: 0.0,
        };
        kf.predict(1.0, &input, &noise());

        assert_abs_diff_eq!(kf.state()[IDX_VE], 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(kf.state()[IDX_VN], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(kf.state()[IDX_PE], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_predict_integrates_yaw_rate() {
        let mut kf = filter_at_rest();
        let input = ImuInput {
            yaw_rate: 0.1,
            ..Default::default()
        };
        kf.predict(0.5, &input, &noise());
        assert_abs_diff_eq!(kf.state()[IDX_HEADING], 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(kf.state()[IDX_HEADING_RATE], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_predict_grows_covariance() {
        let mut kf = filter_at_rest();
        let mut last = kf.covariance_trace();
        for _ in 0..20 {
            kf.predict(0.1, &ImuInput::default(), &noise());
            let trace = kf.covariance_trace();
            assert!(trace >= last);
            last = trace;
        }
    }

    #[test]
    fn test_gps_update_pulls_state_and_shrinks_trace() {
        let mut kf = filter_at_rest();
        let before = kf.covariance_trace();

        let z = GpsMeasVec::new(10.0, -4.0, 1.0, 0.0);
        let mut r = GpsMeasNoise::zeros();
        r[(0, 0)] = 25.0;
        r[(1, 1)] = 25.0;
        r[(2, 2)] = 1.0;
        r[(3, 3)] = 1.0;

        let innovation = kf.update_gps(&z, &r).unwrap();
        assert_abs_diff_eq!(innovation[0], 10.0, epsilon = 1e-12);

        // Equal prior and measurement variance -> halfway
        assert_abs_diff_eq!(kf.state()[IDX_PE], 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(kf.state()[IDX_PN], -2.0, epsilon = 1e-9);
        assert!(kf.covariance_trace() < before);
    }

    #[test]
    fn test_confident_filter_trusts_gps_less() {
        let mut confident = filter_at_rest();
        confident.covariance[(IDX_PE, IDX_PE)] = 1.0;
        let mut unsure = filter_at_rest();
        unsure.covariance[(IDX_PE, IDX_PE)] = 100.0;

        let z = GpsMeasVec::new(10.0, 0.0, 0.0, 0.0);
        let r = GpsMeasNoise::identity() * 25.0;
        confident.update_gps(&z, &r).unwrap();
        unsure.update_gps(&z, &r).unwrap();

        assert!(confident.state()[IDX_PE] < unsure.state()[IDX_PE]);
    }

    #[test]
    fn test_heading_update_wraps_across_pi() {
        let mut kf = filter_at_rest();
        kf.state[IDX_HEADING] = 3.1;
        kf.update_heading(-3.1, 0.1).unwrap();
        // Innovation is +0.083 rad across the seam, not -6.2
        assert!(kf.state()[IDX_HEADING].abs() > 3.1);
    }
}
