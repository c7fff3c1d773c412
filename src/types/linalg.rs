//! Linear algebra type system for the fusion filter
//!
//! Provides compile-time dimension checking and clean type aliases
//! for the GPS/IMU Kalman filter.

use nalgebra::{SMatrix, SVector};

// ===== State Dimensions =====
pub const STATE_DIM: usize = 6;

// State indices: [p_e, p_n, v_e, v_n, heading, heading_rate]
pub const IDX_PE: usize = 0;
pub const IDX_PN: usize = 1;
pub const IDX_VE: usize = 2;
pub const IDX_VN: usize = 3;
pub const IDX_HEADING: usize = 4;
pub const IDX_HEADING_RATE: usize = 5;

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_GPS: usize = 4; // (p_e, p_n, v_e, v_n)

// ===== Filter Types =====
pub type StateVec = SVector<f64, STATE_DIM>;
pub type StateMat = SMatrix<f64, STATE_DIM, STATE_DIM>;

// Measurement types
pub type GpsMeasVec = SVector<f64, MEASURE_DIM_GPS>;
pub type GpsMeasNoise = SMatrix<f64, MEASURE_DIM_GPS, MEASURE_DIM_GPS>;

// Kalman gain types
pub type KalmanGainGps = SMatrix<f64, STATE_DIM, MEASURE_DIM_GPS>; // 6×4
pub type KalmanGainScalar = SVector<f64, STATE_DIM>; // 6×1

// Jacobian types
pub type JacobianGps = SMatrix<f64, MEASURE_DIM_GPS, STATE_DIM>; // 4×6
pub type JacobianScalar = SMatrix<f64, 1, STATE_DIM>; // 1×6
