//! Hardware source adapters and startup detection.
//!
//! Every adapter exposes the same small contract: connect, read one sample
//! within a deadline, close. Which concrete adapter backs a source is decided
//! once by [`detect_sources`]; the poll loop only sees `dyn SourceAdapter`.

pub mod can;
pub mod channel;
pub mod nmea;
pub mod simulated;
pub mod stream;
pub mod wt901;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AdapterError;
use crate::types::{Reading, SourceKind};

pub use can::{CanAdapter, CanBus, CanFrame, CanProtocol, CandumpReplay, MemoryCanBus, SignalDef};
pub use channel::ChannelAdapter;
pub use nmea::NmeaParser;
pub use simulated::{SimulatedCan, SimulatedGps, SimulatedImu, SimulatedVehicle, VehicleProfile};
pub use stream::{ByteSourceFactory, StreamAdapter, StreamParser};
pub use wt901::Wt901Parser;

pub type NmeaGpsAdapter = StreamAdapter<NmeaParser>;
pub type Wt901ImuAdapter = StreamAdapter<Wt901Parser>;

pub trait SourceAdapter: Send {
    fn source_id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Open the underlying device. Succeeds immediately when already connected.
    fn connect(&mut self) -> Result<(), AdapterError>;

    fn is_connected(&self) -> bool;

    /// Return one reading, or `AdapterError::Timeout` once `timeout` elapses.
    fn read(&mut self, timeout: Duration) -> Result<Reading, AdapterError>;

    /// Release the device. Safe to call more than once.
    fn close(&mut self) -> Result<(), AdapterError>;
}

/// Result of one bounded read, as seen by the poll loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Reading(Reading),
    Timeout,
    Failed(AdapterError),
}

impl From<Result<Reading, AdapterError>> for ReadOutcome {
    fn from(result: Result<Reading, AdapterError>) -> Self {
        match result {
            Ok(reading) => ReadOutcome::Reading(reading),
            Err(AdapterError::Timeout(_)) => ReadOutcome::Timeout,
            Err(err) => ReadOutcome::Failed(err),
        }
    }
}

// ─── Source configuration ────────────────────────────────────────────────────

fn default_queue_depth() -> usize {
    64
}

fn default_baud_rate() -> u32 {
    9600
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// NMEA 0183 receiver on a serial device
    NmeaGps {
        source_id: String,
        device: PathBuf,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_queue_depth")]
        queue_depth: usize,
    },
    /// WitMotion WT901 on a serial device
    Wt901Imu {
        source_id: String,
        device: PathBuf,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_queue_depth")]
        queue_depth: usize,
    },
    /// candump-format log replayed as a live bus
    CanReplay {
        source_id: String,
        log: PathBuf,
        #[serde(default)]
        looped: bool,
        protocol: CanProtocol,
    },
    /// Synthetic vehicle driving GPS, IMU and optionally CAN sources
    Simulated {
        #[serde(default)]
        profile: VehicleProfile,
        #[serde(default = "simulated::default_gps_id")]
        gps_id: String,
        #[serde(default = "simulated::default_imu_id")]
        imu_id: String,
        #[serde(default)]
        can_id: Option<String>,
    },
}

impl SourceConfig {
    pub fn source_ids(&self) -> Vec<&str> {
        match self {
            SourceConfig::NmeaGps { source_id, .. }
            | SourceConfig::Wt901Imu { source_id, .. }
            | SourceConfig::CanReplay { source_id, .. } => vec![source_id.as_str()],
            SourceConfig::Simulated {
                gps_id,
                imu_id,
                can_id,
                ..
            } => {
                let mut ids = vec![gps_id.as_str(), imu_id.as_str()];
                ids.extend(can_id.as_deref());
                ids
            }
        }
    }

    /// Build the adapters for this entry, or none when the hardware is absent.
    pub fn detect(&self) -> Vec<Box<dyn SourceAdapter>> {
        match self {
            SourceConfig::NmeaGps {
                source_id,
                device,
                baud_rate,
                queue_depth,
            } => {
                if !device.exists() {
                    warn!("[adapter:{}] {} not present, skipping", source_id, device.display());
                    return Vec::new();
                }
                vec![Box::new(NmeaGpsAdapter::new(
                    source_id,
                    stream::serial_factory(device.clone(), *baud_rate),
                    *queue_depth,
                ))]
            }
            SourceConfig::Wt901Imu {
                source_id,
                device,
                baud_rate,
                queue_depth,
            } => {
                if !device.exists() {
                    warn!("[adapter:{}] {} not present, skipping", source_id, device.display());
                    return Vec::new();
                }
                vec![Box::new(Wt901ImuAdapter::new(
                    source_id,
                    stream::serial_factory(device.clone(), *baud_rate),
                    *queue_depth,
                ))]
            }
            SourceConfig::CanReplay {
                source_id,
                log,
                looped,
                protocol,
            } => {
                if !log.exists() {
                    warn!("[adapter:{}] {} not present, skipping", source_id, log.display());
                    return Vec::new();
                }
                let bus = CandumpReplay::new(log.clone(), *looped);
                vec![Box::new(CanAdapter::new(source_id, Box::new(bus), protocol.clone()))]
            }
            SourceConfig::Simulated {
                profile,
                gps_id,
                imu_id,
                can_id,
            } => {
                let vehicle = SimulatedVehicle::new(profile.clone());
                let mut adapters: Vec<Box<dyn SourceAdapter>> = vec![
                    Box::new(SimulatedGps::new(gps_id, vehicle.clone())),
                    Box::new(SimulatedImu::new(imu_id, vehicle.clone())),
                ];
                if let Some(can_id) = can_id {
                    adapters.push(Box::new(SimulatedCan::new(can_id, vehicle)));
                }
                adapters
            }
        }
    }
}

/// Resolve every configured source to a concrete adapter. Sources whose
/// hardware is missing are left out; the controller reports them unavailable.
pub fn detect_sources(configs: &[SourceConfig]) -> Vec<Box<dyn SourceAdapter>> {
    let adapters: Vec<Box<dyn SourceAdapter>> = configs.iter().flat_map(SourceConfig::detect).collect();
    info!(
        "[adapter] detected {} source(s): {}",
        adapters.len(),
        adapters
            .iter()
            .map(|a| format!("{}({})", a.source_id(), a.kind()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    adapters
}
