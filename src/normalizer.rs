//! Channel normalizer: maps per-source raw keys onto one canonical schema.
//!
//! The alias table is an ordered list of canonical channels. Each channel lists
//! the `(source_id, raw_key)` pairs that may fill it, best first. A reverse
//! lookup is built once so a merge costs one hash probe per raw key.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Index;

use crate::error::{ConfigError, ConfigResult};
use crate::types::RawReading;

// ─── Alias table ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    pub source_id: String,
    pub raw_key: String,
}

impl SourceKey {
    pub fn new(source_id: &str, raw_key: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            raw_key: raw_key.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    /// Candidate writers in priority order (index 0 wins)
    pub sources: Vec<SourceKey>,
    /// Value published before any source has written the channel
    #[serde(default)]
    pub default: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AliasTable {
    channels: Vec<ChannelSpec>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
        }
    }

    /// Append a channel; `sources` are `(source_id, raw_key)` in priority order.
    pub fn channel(mut self, name: &str, sources: &[(&str, &str)]) -> Self {
        self.channels.push(ChannelSpec {
            name: name.to_string(),
            sources: sources
                .iter()
                .map(|(source_id, raw_key)| SourceKey::new(source_id, raw_key))
                .collect(),
            default: None,
        });
        self
    }

    /// Append a channel with a declared default.
    pub fn channel_with_default(mut self, name: &str, sources: &[(&str, &str)], default: f64) -> Self {
        self = self.channel(name, sources);
        if let Some(last) = self.channels.last_mut() {
            last.default = Some(default);
        }
        self
    }

    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.name.as_str())
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.channels.is_empty() {
            return Err(ConfigError::EmptyAliasTable);
        }

        let mut names = HashSet::new();
        let mut owners: HashMap<&SourceKey, &str> = HashMap::new();
        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return Err(ConfigError::EmptyChannelName);
            }
            if !names.insert(channel.name.as_str()) {
                return Err(ConfigError::DuplicateChannel(channel.name.clone()));
            }
            if channel.sources.is_empty() {
                return Err(ConfigError::NoSources(channel.name.clone()));
            }
            for key in &channel.sources {
                if let Some(first) = owners.insert(key, channel.name.as_str()) {
                    return Err(ConfigError::ConflictingAlias {
                        source_id: key.source_id.clone(),
                        raw_key: key.raw_key.clone(),
                        first: first.to_string(),
                        second: channel.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Vehicle table matching the built-in adapters' raw keys. Fused keys
    /// outrank raw GPS, which outranks CAN wheel speed.
    pub fn vehicle_default() -> Self {
        Self::new()
            .channel("Latitude", &[("fusion", "KF_Lat"), ("gps", "lat")])
            .channel("Longitude", &[("fusion", "KF_Lon"), ("gps", "lon")])
            .channel("Altitude", &[("gps", "alt")])
            .channel(
                "Speed",
                &[("fusion", "KF_Speed"), ("gps", "speed"), ("can", "vehicle_speed")],
            )
            .channel("Heading", &[("fusion", "KF_Heading"), ("gps", "course")])
            .channel_with_default("YawRate", &[("fusion", "KF_HeadingRate")], 0.0)
            .channel("VelocityEast", &[("fusion", "KF_VelE")])
            .channel("VelocityNorth", &[("fusion", "KF_VelN")])
            .channel("PositionUncertainty", &[("fusion", "KF_PosUncertainty")])
            .channel_with_default("Distance", &[("fusion", "KF_Distance")], 0.0)
            .channel_with_default("FusionStatus", &[("fusion", "KF_Status")], 0.0)
            .channel_with_default("GpsFixQuality", &[("gps", "fix_quality")], 0.0)
            .channel_with_default("GpsSatellites", &[("gps", "satellites")], 0.0)
            .channel("AccelX", &[("imu", "ax")])
            .channel("AccelY", &[("imu", "ay")])
            .channel("AccelZ", &[("imu", "az")])
            .channel("GyroX", &[("imu", "gx")])
            .channel("GyroY", &[("imu", "gy")])
            .channel("GyroZ", &[("imu", "gz")])
            .channel("ImuTemperature", &[("imu", "temp")])
            .channel("RPM", &[("can", "rpm")])
            .channel("CoolantTemp", &[("can", "coolant_temp")])
            .channel("IntakeAirTemp", &[("can", "intake_air_temp")])
            .channel("ThrottlePosition", &[("can", "throttle")])
            .channel("MassAirFlow", &[("can", "maf")])
            .channel("EngineLoad", &[("can", "engine_load")])
            .channel("FuelLevel", &[("can", "fuel_level")])
    }
}

impl Default for AliasTable {
    fn default() -> Self {
        Self::vehicle_default()
    }
}

// ─── Canonical sample ────────────────────────────────────────────────────────

/// One tick of normalized telemetry. `channels` holds exactly the declared
/// canonical keys; `raw` holds every raw value seen this tick as `source.key`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSample {
    pub timestamp: f64,
    pub channels: BTreeMap<String, f64>,
    pub raw: BTreeMap<String, f64>,
}

impl CanonicalSample {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.channels.get(name).copied()
    }

    pub fn raw_value(&self, source_id: &str, raw_key: &str) -> Option<f64> {
        self.raw.get(&format!("{}.{}", source_id, raw_key)).copied()
    }
}

impl Index<&str> for CanonicalSample {
    type Output = f64;

    fn index(&self, name: &str) -> &f64 {
        &self.channels[name]
    }
}

// ─── Normalizer ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
struct Slot {
    index: usize,
    rank: usize,
}

#[derive(Clone, Debug)]
pub struct ChannelNormalizer {
    names: Vec<String>,
    defaults: Vec<f64>,
    /// source_id -> raw_key -> slot
    lookup: HashMap<String, HashMap<String, Slot>>,
    last_known: Vec<Option<f64>>,
}

impl ChannelNormalizer {
    pub fn new(table: AliasTable) -> ConfigResult<Self> {
        table.validate()?;

        let mut lookup: HashMap<String, HashMap<String, Slot>> = HashMap::new();
        for (index, channel) in table.channels.iter().enumerate() {
            for (rank, key) in channel.sources.iter().enumerate() {
                lookup
                    .entry(key.source_id.clone())
                    .or_default()
                    .insert(key.raw_key.clone(), Slot { index, rank });
            }
        }

        let count = table.channels.len();
        Ok(Self {
            names: table.channels.iter().map(|c| c.name.clone()).collect(),
            defaults: table
                .channels
                .iter()
                .map(|c| c.default.unwrap_or(f64::NAN))
                .collect(),
            lookup,
            last_known: vec![None; count],
        })
    }

    pub fn channel_names(&self) -> &[String] {
        &self.names
    }

    /// Every canonical key at its default value.
    pub fn empty_sample(&self, timestamp: f64) -> CanonicalSample {
        CanonicalSample {
            timestamp,
            channels: self
                .names
                .iter()
                .cloned()
                .zip(self.defaults.iter().copied())
                .collect(),
            raw: BTreeMap::new(),
        }
    }

    /// Forget last-known values.
    pub fn reset(&mut self) {
        self.last_known.iter_mut().for_each(|v| *v = None);
    }

    /// Merge this tick's readings. Readings are applied in order; a slot held
    /// by a better-ranked writer is never overwritten in the same tick.
    pub fn merge(&mut self, timestamp: f64, readings: &[RawReading]) -> CanonicalSample {
        let mut written: Vec<Option<(usize, f64)>> = vec![None; self.names.len()];
        let mut raw = BTreeMap::new();

        for reading in readings {
            let by_key = self.lookup.get(reading.source_id.as_str());
            for (key, &value) in &reading.values {
                raw.insert(format!("{}.{}", reading.source_id, key), value);

                let Some(slot) = by_key.and_then(|m| m.get(key.as_str())) else {
                    continue;
                };
                if !value.is_finite() {
                    debug!(
                        "[normalizer] {}.{} is non-finite, keeping previous {}",
                        reading.source_id, key, self.names[slot.index]
                    );
                    continue;
                }
                match written[slot.index] {
                    Some((held_rank, _)) if held_rank <= slot.rank => {
                        debug!(
                            "[normalizer] dropping {}.{} for {}: slot held by rank {}",
                            reading.source_id, key, self.names[slot.index], held_rank
                        );
                    }
                    _ => written[slot.index] = Some((slot.rank, value)),
                }
            }
        }

        let mut channels = BTreeMap::new();
        for (i, name) in self.names.iter().enumerate() {
            if let Some((_, value)) = written[i] {
                self.last_known[i] = Some(value);
            }
            let value = self.last_known[i].unwrap_or(self.defaults[i]);
            channels.insert(name.clone(), value);
        }

        CanonicalSample {
            timestamp,
            channels,
            raw,
        }
    }
}
