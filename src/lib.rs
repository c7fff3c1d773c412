//! Vehicle telemetry acquisition and sensor fusion.
//!
//! Hardware adapters (CAN/OBD-II, GPS, IMU) are polled on a fixed tick; GPS
//! and IMU readings drive a Kalman filter, and every tick's readings plus the
//! fused estimate are merged into one canonical sample published through a
//! lock-guarded snapshot store and bounded subscriber queues.

pub mod adapters;
pub mod config;
pub mod controller;
pub mod error;
pub mod fusion;
pub mod health;
pub mod normalizer;
pub mod snapshot;
pub mod subscribe;
pub mod types;

pub use adapters::{detect_sources, ReadOutcome, SourceAdapter, SourceConfig};
pub use config::{PipelineConfig, TelemetryConfig};
pub use controller::DataStreamController;
pub use error::{AdapterError, ConfigError, FilterError, MeasurementError};
pub use fusion::{FusedState, FusionConfig, FusionEstimator, FusionEvent, FusionStatus};
pub use health::{HealthState, SourceHealthReport};
pub use normalizer::{AliasTable, CanonicalSample, ChannelNormalizer};
pub use snapshot::{Snapshot, SnapshotStore};
pub use subscribe::{SubscriberId, SubscriberStats};
pub use types::{GpsFix, ImuReading, RawReading, Reading, SourceKind};
