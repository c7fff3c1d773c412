pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Hardware family an adapter belongs to. Decides the read timeout and how its
/// readings are routed (estimator vs. normalizer only).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Can,
    Gps,
    Imu,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Can => write!(f, "can"),
            SourceKind::Gps => write!(f, "gps"),
            SourceKind::Imu => write!(f, "imu"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above mean sea level
    pub altitude: f64,
    /// Ground speed [m/s]
    pub speed: f64,
    /// Course over ground [degrees true, clockwise from north]
    pub course: f64,
    /// NMEA GGA quality indicator (0 = invalid, 1 = GPS, 2 = DGPS, 4/5 = RTK)
    pub fix_quality: u8,
    pub satellites: u8,
}

impl GpsFix {
    pub fn is_finite(&self) -> bool {
        [
            self.timestamp,
            self.latitude,
            self.longitude,
            self.altitude,
            self.speed,
            self.course,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuReading {
    pub timestamp: f64,
    /// Body-frame specific force [m/s²]: x forward, y right, z down (about -g at rest)
    pub accel: [f64; 3],
    /// Body-frame angular rate [rad/s]; z positive turning right (clockwise from above)
    pub gyro: [f64; 3],
    pub temperature: Option<f64>,
}

impl ImuReading {
    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite()
            && self.accel.iter().all(|v| v.is_finite())
            && self.gyro.iter().all(|v| v.is_finite())
            && self.temperature.map_or(true, f64::is_finite)
    }
}

/// Source-specific key/value channels produced by one adapter in one tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub source_id: String,
    pub timestamp: f64,
    pub values: BTreeMap<String, f64>,
}

impl RawReading {
    pub fn new(source_id: &str, timestamp: f64) -> Self {
        Self {
            source_id: source_id.to_string(),
            timestamp,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn insert(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One sample returned by an adapter read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reading {
    Gps(GpsFix),
    Imu(ImuReading),
    Channels(RawReading),
}

impl Reading {
    pub fn timestamp(&self) -> f64 {
        match self {
            Reading::Gps(fix) => fix.timestamp,
            Reading::Imu(imu) => imu.timestamp,
            Reading::Channels(raw) => raw.timestamp,
        }
    }

    /// Flatten into raw channels for the normalizer.
    pub fn to_raw(&self, source_id: &str) -> RawReading {
        match self {
            Reading::Gps(fix) => RawReading::new(source_id, fix.timestamp)
                .with("lat", fix.latitude)
                .with("lon", fix.longitude)
                .with("alt", fix.altitude)
                .with("speed", fix.speed)
                .with("course", fix.course)
                .with("fix_quality", f64::from(fix.fix_quality))
                .with("satellites", f64::from(fix.satellites)),
            Reading::Imu(imu) => {
                let mut raw = RawReading::new(source_id, imu.timestamp)
                    .with("ax", imu.accel[0])
                    .with("ay", imu.accel[1])
                    .with("az", imu.accel[2])
                    .with("gx", imu.gyro[0])
                    .with("gy", imu.gyro[1])
                    .with("gz", imu.gyro[2]);
                if let Some(temp) = imu.temperature {
                    raw.insert("temp", temp);
                }
                raw
            }
            Reading::Channels(raw) => {
                let mut raw = raw.clone();
                raw.source_id = source_id.to_string();
                raw
            }
        }
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_to_raw_keys() {
        let fix = GpsFix {
            timestamp: 10.0,
            latitude: 34.0,
            longitude: -118.0,
            altitude: 90.0,
            speed: 27.0,
            course: 45.0,
            fix_quality: 1,
            satellites: 9,
        };
        let raw = Reading::Gps(fix).to_raw("gps");
        assert_eq!(raw.source_id, "gps");
        assert_eq!(raw.values["speed"], 27.0);
        assert_eq!(raw.values["satellites"], 9.0);
        assert_eq!(raw.len(), 7);
    }

    #[test]
    fn test_imu_finite_check() {
        let mut imu = ImuReading {
            timestamp: 1.0,
            accel: [0.0, 0.0, 9.81],
            gyro: [0.0; 3],
            temperature: Some(25.0),
        };
        assert!(imu.is_finite());
        imu.gyro[2] = f64::NAN;
        assert!(!imu.is_finite());
    }

    #[test]
    fn test_channels_take_adapter_source_id() {
        let raw = RawReading::new("whatever", 2.0).with("rpm", 3000.0);
        let flattened = Reading::Channels(raw).to_raw("can0");
        assert_eq!(flattened.source_id, "can0");
        assert_eq!(flattened.values["rpm"], 3000.0);
    }
}
