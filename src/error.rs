use std::time::Duration;
use thiserror::Error;

/// Failures reported by a hardware source adapter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(String),
}

impl AdapterError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AdapterError::Timeout(_))
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        AdapterError::Io(err.to_string())
    }
}

/// Reasons a GPS fix or IMU reading is refused before it reaches the filter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeasurementError {
    #[error("Invalid measurement: {0}")]
    InvalidMeasurement(String),

    #[error("Stale data: reading is {age_secs:.3}s old (bound {bound_secs:.3}s)")]
    StaleData { age_secs: f64, bound_secs: f64 },
}

/// Numerical failures inside the Kalman filter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("Innovation covariance is singular")]
    SingularInnovation,
}

/// Invalid configuration, detected at construction time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Alias table is empty")]
    EmptyAliasTable,

    #[error("Canonical channel name must not be empty")]
    EmptyChannelName,

    #[error("Duplicate canonical channel: {0}")]
    DuplicateChannel(String),

    #[error("Canonical channel {0} has no sources")]
    NoSources(String),

    #[error("Source key {source_id}.{raw_key} is mapped to both {first} and {second}")]
    ConflictingAlias {
        source_id: String,
        raw_key: String,
        first: String,
        second: String,
    },

    #[error("Duplicate adapter source id: {0}")]
    DuplicateSource(String),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(AdapterError::Timeout(Duration::from_millis(50)).is_timeout());
        assert!(!AdapterError::Connection("gone".to_string()).is_timeout());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: AdapterError = io.into();
        assert!(matches!(err, AdapterError::Io(msg) if msg.contains("pipe closed")));
    }
}
