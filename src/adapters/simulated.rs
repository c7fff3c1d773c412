//! Synthetic sources driven by one shared vehicle trajectory: parked, then a
//! straight acceleration north, then a constant-speed right-hand circle.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::SourceAdapter;
use crate::error::AdapterError;
use crate::fusion::geo::meters_to_latlon;
use crate::types::{current_timestamp, GpsFix, ImuReading, RawReading, Reading, SourceKind};

const G: f64 = 9.80665;

pub(crate) fn default_gps_id() -> String {
    "gps".to_string()
}

pub(crate) fn default_imu_id() -> String {
    "imu".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleProfile {
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub still_secs: f64,
    pub accel_secs: f64,
    /// m/s
    pub cruise_speed: f64,
    /// m
    pub turn_radius: f64,
    pub gps_period_ms: u64,
    pub imu_period_ms: u64,
    pub can_period_ms: u64,
}

impl Default for VehicleProfile {
    fn default() -> Self {
        Self {
            origin_lat: 34.0,
            origin_lon: -118.0,
            still_secs: 35.0,
            accel_secs: 5.0,
            cruise_speed: 15.0,
            turn_radius: 100.0,
            gps_period_ms: 1000,
            imu_period_ms: 20,
            can_period_ms: 100,
        }
    }
}

/// Ground truth at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Kinematics {
    pub east: f64,
    pub north: f64,
    pub speed: f64,
    /// rad, clockwise from north
    pub heading: f64,
    pub accel_forward: f64,
    pub accel_right: f64,
    pub yaw_rate: f64,
}

impl VehicleProfile {
    pub fn kinematics(&self, t: f64) -> Kinematics {
        let drive = t - self.still_secs;
        if drive <= 0.0 {
            return Kinematics::default();
        }

        let a = self.cruise_speed / self.accel_secs.max(1e-3);
        if drive < self.accel_secs {
            return Kinematics {
                north: 0.5 * a * drive * drive,
                speed: a * drive,
                accel_forward: a,
                ..Kinematics::default()
            };
        }

        let straight = 0.5 * self.cruise_speed * self.accel_secs;
        let omega = self.cruise_speed / self.turn_radius;
        let psi = omega * (drive - self.accel_secs);
        Kinematics {
            east: self.turn_radius * (1.0 - psi.cos()),
            north: straight + self.turn_radius * psi.sin(),
            speed: self.cruise_speed,
            heading: psi.rem_euclid(2.0 * std::f64::consts::PI),
            accel_forward: 0.0,
            accel_right: self.cruise_speed * omega,
            yaw_rate: omega,
        }
    }
}

/// Shared trajectory clock; clones see the same vehicle.
#[derive(Clone, Debug)]
pub struct SimulatedVehicle {
    profile: Arc<VehicleProfile>,
    start: Instant,
}

impl SimulatedVehicle {
    pub fn new(profile: VehicleProfile) -> Self {
        Self {
            profile: Arc::new(profile),
            start: Instant::now(),
        }
    }

    pub fn profile(&self) -> &VehicleProfile {
        &self.profile
    }

    pub fn now(&self) -> Kinematics {
        self.profile.kinematics(self.start.elapsed().as_secs_f64())
    }
}

/// Fixed-rate pacing shared by the simulated adapters.
#[derive(Debug)]
struct Pacer {
    period: Duration,
    next_due: Option<Instant>,
}

impl Pacer {
    fn new(period_ms: u64) -> Self {
        Self {
            period: Duration::from_millis(period_ms.max(1)),
            next_due: None,
        }
    }

    fn wait(&mut self, timeout: Duration) -> Result<(), AdapterError> {
        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);
        let wait = due.saturating_duration_since(now);
        if wait > timeout {
            thread::sleep(timeout);
            return Err(AdapterError::Timeout(timeout));
        }
        thread::sleep(wait);
        let next = due + self.period;
        // Never try to catch up on a backlog
        self.next_due = Some(if next < Instant::now() {
            Instant::now() + self.period
        } else {
            next
        });
        Ok(())
    }
}

macro_rules! simulated_adapter {
    ($name:ident, $kind:expr, $period:ident) => {
        pub struct $name {
            source_id: String,
            vehicle: SimulatedVehicle,
            pacer: Pacer,
            connected: bool,
        }

        impl $name {
            pub fn new(source_id: &str, vehicle: SimulatedVehicle) -> Self {
                let pacer = Pacer::new(vehicle.profile().$period);
                Self {
                    source_id: source_id.to_string(),
                    vehicle,
                    pacer,
                    connected: false,
                }
            }
        }

        impl SourceAdapter for $name {
            fn source_id(&self) -> &str {
                &self.source_id
            }

            fn kind(&self) -> SourceKind {
                $kind
            }

            fn connect(&mut self) -> Result<(), AdapterError> {
                self.connected = true;
                Ok(())
            }

            fn is_connected(&self) -> bool {
                self.connected
            }

            fn read(&mut self, timeout: Duration) -> Result<Reading, AdapterError> {
                if !self.connected {
                    return Err(AdapterError::Connection("not connected".to_string()));
                }
                self.pacer.wait(timeout)?;
                Ok(self.sample())
            }

            fn close(&mut self) -> Result<(), AdapterError> {
                self.connected = false;
                Ok(())
            }
        }
    };
}

simulated_adapter!(SimulatedGps, SourceKind::Gps, gps_period_ms);
simulated_adapter!(SimulatedImu, SourceKind::Imu, imu_period_ms);
simulated_adapter!(SimulatedCan, SourceKind::Can, can_period_ms);

impl SimulatedGps {
    fn sample(&self) -> Reading {
        let k = self.vehicle.now();
        let profile = self.vehicle.profile();
        let (lat, lon) = meters_to_latlon(k.east, k.north, profile.origin_lat, profile.origin_lon);
        Reading::Gps(GpsFix {
            timestamp: current_timestamp(),
            latitude: lat,
            longitude: lon,
            altitude: 100.0,
            speed: k.speed,
            course: k.heading.to_degrees(),
            fix_quality: 1,
            satellites: 10,
        })
    }
}

impl SimulatedImu {
    fn sample(&self) -> Reading {
        let k = self.vehicle.now();
        Reading::Imu(ImuReading {
            timestamp: current_timestamp(),
            accel: [k.accel_forward, k.accel_right, -G],
            gyro: [0.0, 0.0, k.yaw_rate],
            temperature: Some(30.0),
        })
    }
}

impl SimulatedCan {
    fn sample(&self) -> Reading {
        let k = self.vehicle.now();
        let moving = k.speed > 0.1;
        Reading::Channels(
            RawReading::new(&self.source_id, current_timestamp())
                .with("vehicle_speed", k.speed)
                .with("rpm", 800.0 + k.speed * 120.0)
                .with("coolant_temp", 90.0)
                .with("intake_air_temp", 35.0)
                .with("throttle", if k.accel_forward > 0.0 { 40.0 } else if moving { 15.0 } else { 0.0 })
                .with("engine_load", if moving { 30.0 } else { 12.0 })
                .with("maf", 3.0 + k.speed * 0.8)
                .with("fuel_level", 62.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_profile_phases() {
        let profile = VehicleProfile::default();
        assert_eq!(profile.kinematics(10.0), Kinematics::default());

        let accelerating = profile.kinematics(profile.still_secs + 2.5);
        assert_abs_diff_eq!(accelerating.speed, 7.5, epsilon = 1e-9);
        assert_eq!(accelerating.heading, 0.0);

        // Quarter circle after the straight: heading east
        let quarter = std::f64::consts::FRAC_PI_2 * profile.turn_radius / profile.cruise_speed;
        let turning = profile.kinematics(profile.still_secs + profile.accel_secs + quarter);
        assert_abs_diff_eq!(turning.heading, std::f64::consts::FRAC_PI_2, epsilon = 1e-9);
        assert_abs_diff_eq!(turning.east, profile.turn_radius, epsilon = 1e-6);
        assert_abs_diff_eq!(turning.accel_right, 2.25, epsilon = 1e-9);
    }

    #[test]
    fn test_pacing_times_out_between_samples() {
        let profile = VehicleProfile {
            gps_period_ms: 500,
            ..VehicleProfile::default()
        };
        let mut gps = SimulatedGps::new("gps", SimulatedVehicle::new(profile));
        gps.connect().unwrap();
        assert!(matches!(gps.read(Duration::from_millis(10)), Ok(Reading::Gps(_))));
        assert!(gps.read(Duration::from_millis(10)).unwrap_err().is_timeout());
    }
}
