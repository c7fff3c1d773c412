//! WitMotion WT901 UART packet parser.
//! Packet format: 11 bytes [0x55, TYPE, DATA(8), CHECKSUM]

use super::stream::StreamParser;
use crate::types::{ImuReading, Reading, SourceKind};

const PACKET_SIZE: usize = 11;
const HEADER: u8 = 0x55;

const TYPE_ACCEL: u8 = 0x51;
const TYPE_GYRO: u8 = 0x52;
const TYPE_ANGLE: u8 = 0x53;

const G: f64 = 9.80665; // m/s²
const ACCEL_RANGE_G: f64 = 16.0;
const GYRO_RANGE_DPS: f64 = 2000.0;

#[derive(Debug, Default)]
pub struct Wt901Parser {
    buffer: [u8; PACKET_SIZE],
    index: usize,
    synced: bool,
    accel: Option<[f64; 3]>,
    temperature: Option<f64>,
    /// Roll, pitch, yaw [deg] from the on-board filter
    pub angles: [f64; 3],
    pub checksum_failures: u64,
}

fn axis(buffer: &[u8; PACKET_SIZE], offset: usize) -> f64 {
    f64::from(i16::from_le_bytes([buffer[offset], buffer[offset + 1]])) / 32768.0
}

/// Sensor frame is x forward, y left, z up; readings use x forward, y right, z down.
fn to_vehicle_frame(v: [f64; 3]) -> [f64; 3] {
    [v[0], -v[1], -v[2]]
}

impl Wt901Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns the packet type once a valid packet completes.
    pub fn feed_packet_byte(&mut self, byte: u8) -> Option<u8> {
        if !self.synced {
            if byte == HEADER {
                self.synced = true;
                self.buffer[0] = byte;
                self.index = 1;
            }
            return None;
        }

        self.buffer[self.index] = byte;
        self.index += 1;
        if self.index < PACKET_SIZE {
            return None;
        }

        self.synced = false;
        self.index = 0;

        let checksum = self.buffer[..PACKET_SIZE - 1]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        if checksum != self.buffer[PACKET_SIZE - 1] {
            self.checksum_failures += 1;
            return None;
        }

        let packet_type = self.buffer[1];
        match packet_type {
            TYPE_ACCEL => {
                let scale = ACCEL_RANGE_G * G;
                self.accel = Some(to_vehicle_frame([
                    axis(&self.buffer, 2) * scale,
                    axis(&self.buffer, 4) * scale,
                    axis(&self.buffer, 6) * scale,
                ]));
                self.temperature = Some(
                    f64::from(i16::from_le_bytes([self.buffer[8], self.buffer[9]])) / 100.0,
                );
            }
            TYPE_GYRO | TYPE_ANGLE => {}
            _ => return None,
        }
        if packet_type == TYPE_ANGLE {
            self.angles = [
                axis(&self.buffer, 2) * 180.0,
                axis(&self.buffer, 4) * 180.0,
                axis(&self.buffer, 6) * 180.0,
            ];
        }
        Some(packet_type)
    }

    fn gyro(&self) -> [f64; 3] {
        let scale = GYRO_RANGE_DPS.to_radians();
        to_vehicle_frame([
            axis(&self.buffer, 2) * scale,
            axis(&self.buffer, 4) * scale,
            axis(&self.buffer, 6) * scale,
        ])
    }
}

impl StreamParser for Wt901Parser {
    const KIND: SourceKind = SourceKind::Imu;

    fn feed(&mut self, byte: u8, timestamp: f64) -> Option<Reading> {
        if self.feed_packet_byte(byte)? != TYPE_GYRO {
            return None;
        }
        // Gyro packets pair with the most recent accel packet
        let accel = self.accel?;
        Some(Reading::Imu(ImuReading {
            timestamp,
            accel,
            gyro: self.gyro(),
            temperature: self.temperature,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(kind: u8, x: i16, y: i16, z: i16, extra: i16) -> [u8; PACKET_SIZE] {
        let mut p = [0u8; PACKET_SIZE];
        p[0] = HEADER;
        p[1] = kind;
        p[2..4].copy_from_slice(&x.to_le_bytes());
        p[4..6].copy_from_slice(&y.to_le_bytes());
        p[6..8].copy_from_slice(&z.to_le_bytes());
        p[8..10].copy_from_slice(&extra.to_le_bytes());
        p[10] = p[..10].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        p
    }

    fn feed(parser: &mut Wt901Parser, bytes: &[u8]) -> Vec<ImuReading> {
        bytes
            .iter()
            .filter_map(|b| match parser.feed(*b, 5.0) {
                Some(Reading::Imu(imu)) => Some(imu),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_gyro_without_accel_emits_nothing() {
        let mut parser = Wt901Parser::new();
        assert!(feed(&mut parser, &packet(TYPE_GYRO, 0, 0, 100, 0)).is_empty());
    }

    #[test]
    fn test_accel_then_gyro_emits_reading() {
        let mut parser = Wt901Parser::new();
        // 1 g on sensor z (2048 counts at ±16 g), 25.00 °C
        let mut bytes = packet(TYPE_ACCEL, 0, 0, 2048, 2500).to_vec();
        // +90 °/s about sensor z
        bytes.extend(packet(TYPE_GYRO, 0, 0, 1475, 0));
        let readings = feed(&mut parser, &bytes);
        assert_eq!(readings.len(), 1);
        let imu = &readings[0];
        assert!((imu.accel[2] + G).abs() < 1e-9);
        assert_eq!(imu.temperature, Some(25.0));
        // Counter-clockwise about z-up is negative (clockwise-positive) yaw
        assert!((imu.gyro[2] + 90.0_f64.to_radians()).abs() < 0.01);
        assert_eq!(imu.timestamp, 5.0);
    }

    #[test]
    fn test_resyncs_after_garbage_and_rejects_bad_checksum() {
        let mut parser = Wt901Parser::new();
        let mut corrupt = packet(TYPE_ACCEL, 1, 2, 3, 0);
        corrupt[10] = corrupt[10].wrapping_add(1);

        let mut bytes = vec![0x00, 0x13];
        bytes.extend(corrupt);
        bytes.extend(packet(TYPE_ACCEL, 0, 0, 2048, 0));
        bytes.extend(packet(TYPE_GYRO, 0, 0, 0, 0));
        assert_eq!(feed(&mut parser, &bytes).len(), 1);
        assert_eq!(parser.checksum_failures, 1);
    }

    #[test]
    fn test_angle_packet_updates_angles() {
        let mut parser = Wt901Parser::new();
        feed(&mut parser, &packet(TYPE_ANGLE, 0, 0, 16384, 0));
        assert!((parser.angles[2] - 90.0).abs() < 1e-9);
    }
}
