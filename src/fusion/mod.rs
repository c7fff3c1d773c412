pub mod estimator;
pub mod geo;
pub mod kalman;

pub use estimator::{FusedState, FusionConfig, FusionEstimator, FusionEvent, FusionStatus, ImuBias};
pub use kalman::{ImuInput, KalmanFilter, ProcessNoise};
