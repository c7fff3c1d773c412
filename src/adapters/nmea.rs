//! NMEA 0183 parser.
//!
//! GGA carries fix quality, satellite count and altitude; RMC carries speed
//! and course. A `GpsFix` is emitted once both sentences of the same epoch
//! (identical UTC time field) have arrived.

use super::stream::StreamParser;
use crate::types::{GpsFix, Reading, SourceKind};

const MAX_SENTENCE: usize = 120;
const KNOTS_TO_MS: f64 = 0.514444;

#[derive(Clone, Debug, PartialEq)]
struct Gga {
    time: String,
    latitude: f64,
    longitude: f64,
    fix_quality: u8,
    satellites: u8,
    altitude: f64,
}

#[derive(Clone, Debug, PartialEq)]
struct Rmc {
    time: String,
    latitude: f64,
    longitude: f64,
    speed: f64,
    course: f64,
}

#[derive(Debug, Default)]
pub struct NmeaParser {
    line: Vec<u8>,
    gga: Option<Gga>,
    rmc: Option<Rmc>,
    checksum_failures: u64,
}

impl NmeaParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checksum_failures(&self) -> u64 {
        self.checksum_failures
    }

    /// Parse one complete sentence (without line terminator).
    pub fn parse_sentence(&mut self, sentence: &str, timestamp: f64) -> Option<GpsFix> {
        let Some(body) = verify_checksum(sentence) else {
            self.checksum_failures += 1;
            return None;
        };
        // Fields are sliced by byte offset below
        if !body.is_ascii() {
            return None;
        }
        let fields: Vec<&str> = body.split(',').collect();
        let talker = fields.first()?;
        if talker.len() < 5 {
            return None;
        }

        match &talker[talker.len() - 3..] {
            "GGA" => self.gga = parse_gga(&fields),
            "RMC" => self.rmc = parse_rmc(&fields),
            _ => return None,
        }
        self.try_emit(timestamp)
    }

    fn try_emit(&mut self, timestamp: f64) -> Option<GpsFix> {
        let (gga, rmc) = match (&self.gga, &self.rmc) {
            (Some(gga), Some(rmc)) if gga.time == rmc.time => (gga.clone(), rmc.clone()),
            _ => return None,
        };
        self.gga = None;
        self.rmc = None;
        Some(GpsFix {
            timestamp,
            latitude: gga.latitude,
            longitude: gga.longitude,
            altitude: gga.altitude,
            speed: rmc.speed,
            course: rmc.course,
            fix_quality: gga.fix_quality,
            satellites: gga.satellites,
        })
    }
}

impl StreamParser for NmeaParser {
    const KIND: SourceKind = SourceKind::Gps;

    fn feed(&mut self, byte: u8, timestamp: f64) -> Option<Reading> {
        match byte {
            b'$' => {
                self.line.clear();
                self.line.push(byte);
                None
            }
            b'\r' => None,
            b'\n' => {
                if self.line.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut self.line);
                let sentence = std::str::from_utf8(&line).ok()?;
                self.parse_sentence(sentence, timestamp).map(Reading::Gps)
            }
            _ => {
                if self.line.len() < MAX_SENTENCE {
                    self.line.push(byte);
                }
                None
            }
        }
    }
}

/// Check `$body*HH`; returns the body on success.
pub fn verify_checksum(sentence: &str) -> Option<&str> {
    let sentence = sentence.trim();
    let rest = sentence.strip_prefix('$')?;
    let (body, given) = rest.split_once('*')?;
    let expected = u8::from_str_radix(given.get(..2)?, 16).ok()?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    (actual == expected).then_some(body)
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere to signed decimal degrees.
pub fn parse_coordinate(value: &str, hemisphere: &str) -> Option<f64> {
    if !value.is_ascii() {
        return None;
    }
    let dot = value.find('.')?;
    if dot < 3 {
        return None;
    }
    let degrees: f64 = value[..dot - 2].parse().ok()?;
    let minutes: f64 = value[dot - 2..].parse().ok()?;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(decimal),
        "S" | "W" => Some(-decimal),
        _ => None,
    }
}

// $GPGGA,hhmmss.ss,lat,N,lon,E,quality,sats,hdop,alt,M,geoid,M,age,station
fn parse_gga(fields: &[&str]) -> Option<Gga> {
    if fields.len() < 10 {
        return None;
    }
    Some(Gga {
        time: fields[1].to_string(),
        latitude: parse_coordinate(fields[2], fields[3])?,
        longitude: parse_coordinate(fields[4], fields[5])?,
        fix_quality: fields[6].parse().unwrap_or(0),
        satellites: fields[7].parse().unwrap_or(0),
        altitude: fields[9].parse().unwrap_or(0.0),
    })
}

// $GPRMC,hhmmss.ss,A,lat,N,lon,E,speed_knots,course,ddmmyy,...
fn parse_rmc(fields: &[&str]) -> Option<Rmc> {
    if fields.len() < 9 || fields[2] != "A" {
        return None;
    }
    Some(Rmc {
        time: fields[1].to_string(),
        latitude: parse_coordinate(fields[3], fields[4])?,
        longitude: parse_coordinate(fields[5], fields[6])?,
        speed: fields[7].parse::<f64>().ok()? * KNOTS_TO_MS,
        // Empty while stationary on most receivers
        course: fields[8].parse().unwrap_or(0.0),
    })
}
