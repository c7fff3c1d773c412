//! CAN bus adapter: frames from a [`CanBus`] decoded by an OBD-II or
//! broadcast-signal protocol.

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::SourceAdapter;
use crate::error::AdapterError;
use crate::types::{current_timestamp, RawReading, Reading, SourceKind};

#[derive(Debug, Clone, PartialEq)]
pub struct CanFrame {
    /// Seconds; log time for replayed frames
    pub timestamp: f64,
    pub id: u32,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u32, data: &[u8]) -> Self {
        Self {
            timestamp: current_timestamp(),
            id,
            data: data.to_vec(),
        }
    }
}

/// Frame transport underneath a [`CanAdapter`].
pub trait CanBus: Send {
    fn open(&mut self) -> Result<(), AdapterError>;

    /// Next frame, or `AdapterError::Timeout`.
    fn recv(&mut self, timeout: Duration) -> Result<CanFrame, AdapterError>;

    fn send(&mut self, frame: &CanFrame) -> Result<(), AdapterError>;

    fn close(&mut self);
}

// ─── candump replay ──────────────────────────────────────────────────────────

/// Parse one `candump -l` line: `(1436509052.249713) can0 7E8#04410C1AF8`.
pub fn parse_candump_line(line: &str) -> Option<CanFrame> {
    let mut parts = line.split_whitespace();
    let stamp = parts.next()?;
    let _iface = parts.next()?;
    let frame = parts.next()?;

    let timestamp: f64 = stamp.strip_prefix('(')?.strip_suffix(')')?.parse().ok()?;
    let (id, payload) = frame.split_once('#')?;
    if payload.starts_with('R') {
        return None;
    }
    let id = u32::from_str_radix(id, 16).ok()?;
    if payload.len() % 2 != 0 || payload.len() > 16 {
        return None;
    }
    let data = payload
        .as_bytes()
        .chunks(2)
        .map(|pair| Some((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
        .collect::<Option<Vec<u8>>>()?;
    Some(CanFrame {
        timestamp,
        id,
        data,
    })
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

pub struct CandumpReplay {
    path: PathBuf,
    looped: bool,
    frames: Vec<CanFrame>,
    cursor: usize,
    open: bool,
}

impl CandumpReplay {
    pub fn new(path: PathBuf, looped: bool) -> Self {
        Self {
            path,
            looped,
            frames: Vec::new(),
            cursor: 0,
            open: false,
        }
    }
}

impl CanBus for CandumpReplay {
    fn open(&mut self) -> Result<(), AdapterError> {
        let bytes = std::fs::read(&self.path)
            .map_err(|e| AdapterError::Connection(format!("{}: {}", self.path.display(), e)))?;
        self.frames = String::from_utf8_lossy(&bytes)
            .lines()
            .filter_map(parse_candump_line)
            .collect();
        if self.frames.is_empty() {
            return Err(AdapterError::Connection(format!(
                "{}: no frames",
                self.path.display()
            )));
        }
        self.cursor = 0;
        self.open = true;
        Ok(())
    }

    fn recv(&mut self, _timeout: Duration) -> Result<CanFrame, AdapterError> {
        if !self.open {
            return Err(AdapterError::Connection("replay not open".to_string()));
        }
        if self.cursor >= self.frames.len() {
            if !self.looped {
                self.open = false;
                return Err(AdapterError::Connection("end of log".to_string()));
            }
            self.cursor = 0;
        }
        let frame = self.frames[self.cursor].clone();
        self.cursor += 1;
        Ok(frame)
    }

    fn send(&mut self, _frame: &CanFrame) -> Result<(), AdapterError> {
        // Replayed traffic already contains the responses
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

// ─── In-memory bus ───────────────────────────────────────────────────────────

/// Channel-backed bus. Frames pushed on the returned sender are received by
/// the adapter; frames the adapter sends appear on `outbound()`.
pub struct MemoryCanBus {
    inbound: Receiver<CanFrame>,
    outbound_tx: Sender<CanFrame>,
    outbound_rx: Receiver<CanFrame>,
    open: bool,
}

impl MemoryCanBus {
    pub fn new() -> (Sender<CanFrame>, Self) {
        let (tx, inbound) = unbounded();
        let (outbound_tx, outbound_rx) = unbounded();
        (
            tx,
            Self {
                inbound,
                outbound_tx,
                outbound_rx,
                open: false,
            },
        )
    }

    pub fn outbound(&self) -> Receiver<CanFrame> {
        self.outbound_rx.clone()
    }
}

impl CanBus for MemoryCanBus {
    fn open(&mut self) -> Result<(), AdapterError> {
        self.open = true;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<CanFrame, AdapterError> {
        if !self.open {
            return Err(AdapterError::Connection("bus not open".to_string()));
        }
        match self.inbound.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(AdapterError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                self.open = false;
                Err(AdapterError::Connection("bus disconnected".to_string()))
            }
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), AdapterError> {
        self.outbound_tx
            .send(frame.clone())
            .map_err(|e| AdapterError::Io(e.to_string()))
    }

    fn close(&mut self) {
        self.open = false;
    }
}

// ─── Protocols ───────────────────────────────────────────────────────────────

pub const OBD_REQUEST_ID: u32 = 0x7DF;
pub const OBD_RESPONSE_IDS: std::ops::RangeInclusive<u32> = 0x7E8..=0x7EF;

/// Mode 01 PIDs decoded by [`decode_obd2`].
pub const OBD_PIDS: [u8; 8] = [0x04, 0x05, 0x0C, 0x0D, 0x0F, 0x10, 0x11, 0x2F];

fn default_pids() -> Vec<u8> {
    OBD_PIDS.to_vec()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalDef {
    pub id: u32,
    pub start_byte: usize,
    /// Bytes, 1..=4
    pub length: usize,
    #[serde(default)]
    pub big_endian: bool,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "one")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    pub key: String,
}

fn one() -> f64 {
    1.0
}

impl SignalDef {
    pub fn decode(&self, data: &[u8]) -> Option<f64> {
        if self.length == 0 || self.length > 4 {
            return None;
        }
        let bytes = data.get(self.start_byte..self.start_byte + self.length)?;
        let raw = if self.big_endian {
            bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
        } else {
            bytes.iter().rev().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
        };
        let bits = (self.length * 8) as u32;
        let value = if self.signed && bits < 32 && raw & (1 << (bits - 1)) != 0 {
            i64::from(raw) - (1i64 << bits)
        } else if self.signed {
            i64::from(raw as i32)
        } else {
            i64::from(raw)
        };
        Some(self.offset + self.scale * value as f64)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanProtocol {
    /// Poll mode 01 PIDs round-robin and decode ECU replies
    Obd2 {
        #[serde(default = "default_pids")]
        pids: Vec<u8>,
    },
    /// Passive decoding of broadcast frames
    Broadcast { signals: Vec<SignalDef> },
}

impl CanProtocol {
    pub fn obd2() -> Self {
        CanProtocol::Obd2 { pids: default_pids() }
    }
}

pub fn obd2_request(pid: u8) -> CanFrame {
    CanFrame::new(OBD_REQUEST_ID, &[0x02, 0x01, pid, 0x55, 0x55, 0x55, 0x55, 0x55])
}

/// Decode a mode 01 response frame into `(key, value)`.
pub fn decode_obd2(frame: &CanFrame) -> Option<(&'static str, f64)> {
    if !OBD_RESPONSE_IDS.contains(&frame.id) || frame.data.len() < 4 || frame.data[1] != 0x41 {
        return None;
    }
    let a = f64::from(frame.data[3]);
    let b = f64::from(*frame.data.get(4).unwrap_or(&0));
    let decoded = match frame.data[2] {
        0x04 => ("engine_load", a * 100.0 / 255.0),
        0x05 => ("coolant_temp", a - 40.0),
        0x0C => ("rpm", (256.0 * a + b) / 4.0),
        // km/h on the wire, m/s downstream
        0x0D => ("vehicle_speed", a / 3.6),
        0x0F => ("intake_air_temp", a - 40.0),
        0x10 => ("maf", (256.0 * a + b) / 100.0),
        0x11 => ("throttle", a * 100.0 / 255.0),
        0x2F => ("fuel_level", a * 100.0 / 255.0),
        _ => return None,
    };
    Some(decoded)
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

pub struct CanAdapter {
    source_id: String,
    bus: Box<dyn CanBus>,
    protocol: CanProtocol,
    connected: bool,
    next_pid: usize,
}

impl CanAdapter {
    pub fn new(source_id: &str, bus: Box<dyn CanBus>, protocol: CanProtocol) -> Self {
        Self {
            source_id: source_id.to_string(),
            bus,
            protocol,
            connected: false,
            next_pid: 0,
        }
    }

    fn decode(&self, frame: &CanFrame) -> Option<RawReading> {
        let mut raw = RawReading::new(&self.source_id, current_timestamp());
        match &self.protocol {
            CanProtocol::Obd2 { .. } => {
                let (key, value) = decode_obd2(frame)?;
                raw.insert(key, value);
            }
            CanProtocol::Broadcast { signals } => {
                for signal in signals.iter().filter(|s| s.id == frame.id) {
                    if let Some(value) = signal.decode(&frame.data) {
                        raw.insert(&signal.key, value);
                    }
                }
            }
        }
        (!raw.is_empty()).then_some(raw)
    }

    fn request_next_pid(&mut self) -> Result<(), AdapterError> {
        let CanProtocol::Obd2 { pids } = &self.protocol else {
            return Ok(());
        };
        if pids.is_empty() {
            return Ok(());
        }
        let pid = pids[self.next_pid % pids.len()];
        self.next_pid = self.next_pid.wrapping_add(1);
        self.bus.send(&obd2_request(pid))
    }
}

impl SourceAdapter for CanAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Can
    }

    fn connect(&mut self) -> Result<(), AdapterError> {
        if self.connected {
            return Ok(());
        }
        self.bus.open()?;
        self.connected = true;
        info!("[adapter:{}] CAN bus open", self.source_id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read(&mut self, timeout: Duration) -> Result<Reading, AdapterError> {
        if !self.connected {
            return Err(AdapterError::Connection("not connected".to_string()));
        }
        if let Err(e) = self.request_next_pid() {
            debug!("[adapter:{}] OBD request failed: {}", self.source_id, e);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AdapterError::Timeout(timeout));
            }
            match self.bus.recv(remaining) {
                Ok(frame) => {
                    if let Some(raw) = self.decode(&frame) {
                        return Ok(Reading::Channels(raw));
                    }
                }
                Err(AdapterError::Timeout(_)) => return Err(AdapterError::Timeout(timeout)),
                Err(e) => {
                    warn!("[adapter:{}] bus error: {}", self.source_id, e);
                    if matches!(e, AdapterError::Connection(_)) {
                        self.connected = false;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        if self.connected {
            self.bus.close();
            self.connected = false;
            info!("[adapter:{}] CAN bus closed", self.source_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn obd_response(pid: u8, a: u8, b: u8) -> CanFrame {
        CanFrame::new(0x7E8, &[0x04, 0x41, pid, a, b, 0, 0, 0])
    }

    #[test]
    fn test_obd2_decoding() {
        assert_eq!(decode_obd2(&obd_response(0x0C, 0x1A, 0xF8)), Some(("rpm", 1726.0)));
        assert_eq!(decode_obd2(&obd_response(0x05, 130, 0)), Some(("coolant_temp", 90.0)));
        let (key, speed) = decode_obd2(&obd_response(0x0D, 36, 0)).unwrap();
        assert_eq!(key, "vehicle_speed");
        assert!((speed - 10.0).abs() < 1e-9);
        // Not a mode 01 reply
        assert_eq!(decode_obd2(&CanFrame::new(0x7E8, &[0x03, 0x7F, 0x01, 0x12])), None);
        assert_eq!(decode_obd2(&CanFrame::new(0x123, &[0x04, 0x41, 0x0C, 1, 2])), None);
    }

    #[test]
    fn test_signal_decoding() {
        let le = SignalDef {
            id: 0x100,
            start_byte: 1,
            length: 2,
            big_endian: false,
            signed: false,
            scale: 0.1,
            offset: 0.0,
            key: "wheel".into(),
        };
        assert!((le.decode(&[0, 0xE8, 0x03]).unwrap() - 100.0).abs() < 1e-9);

        let be_signed = SignalDef {
            big_endian: true,
            signed: true,
            scale: 1.0,
            ..le.clone()
        };
        assert_eq!(be_signed.decode(&[0, 0xFF, 0xFE]), Some(-2.0));
        assert_eq!(le.decode(&[0, 1]), None);
    }

    #[test]
    fn test_candump_line_parsing() {
        let frame = parse_candump_line("(1436509052.249713) can0 7E8#04410C1AF8000000").unwrap();
        assert_eq!(frame.id, 0x7E8);
        assert_eq!(frame.data.len(), 8);
        assert!((frame.timestamp - 1436509052.249713).abs() < 1e-6);
        assert!(parse_candump_line("(1.0) can0 123#R").is_none());
        assert!(parse_candump_line("garbage").is_none());
        assert!(parse_candump_line("(1.0) can0 123#+1").is_none());
    }

    #[test]
    fn test_non_ascii_payload_skipped() {
        assert!(parse_candump_line("(1.0) can0 123#aéb").is_none());
        assert!(parse_candump_line("(1.0) can0 1é3#0102").is_none());

        // One corrupt line does not keep the log from opening
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "(1.000000) can0 100#0é").unwrap();
        file.write_all(b"(1.050000) can0 300#\xFF\xFE\n").unwrap();
        writeln!(file, "(1.100000) can0 200#FF").unwrap();
        let mut bus = CandumpReplay::new(file.path().to_path_buf(), false);
        bus.open().unwrap();
        let frame = bus.recv(Duration::from_millis(10)).unwrap();
        assert_eq!(frame.id, 0x200);
        assert_eq!(frame.data, vec![0xFF]);
    }

    #[test]
    fn test_obd_adapter_polls_and_decodes() {
        let (tx, bus) = MemoryCanBus::new();
        let requests = bus.outbound();
        let mut adapter = CanAdapter::new("can", Box::new(bus), CanProtocol::obd2());
        adapter.connect().unwrap();

        tx.send(CanFrame::new(0x321, &[1, 2, 3])).unwrap();
        tx.send(obd_response(0x0C, 0x0B, 0xB8)).unwrap();
        match adapter.read(Duration::from_millis(100)).unwrap() {
            Reading::Channels(raw) => {
                assert_eq!(raw.source_id, "can");
                assert_eq!(raw.values["rpm"], 750.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        let request = requests.try_recv().unwrap();
        assert_eq!(request.id, OBD_REQUEST_ID);
        assert_eq!(request.data[2], OBD_PIDS[0]);

        assert!(adapter.read(Duration::from_millis(20)).unwrap_err().is_timeout());
    }

    #[test]
    fn test_replay_ends_with_connection_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "(1.000000) can0 100#00E803").unwrap();
        writeln!(file, "(1.100000) can0 200#FF").unwrap();
        let signals = vec![SignalDef {
            id: 0x100,
            start_byte: 1,
            length: 2,
            big_endian: false,
            signed: false,
            scale: 0.01,
            offset: 0.0,
            key: "wheel".into(),
        }];
        let bus = CandumpReplay::new(file.path().to_path_buf(), false);
        let mut adapter = CanAdapter::new("can", Box::new(bus), CanProtocol::Broadcast { signals });
        adapter.connect().unwrap();

        let Reading::Channels(raw) = adapter.read(Duration::from_millis(50)).unwrap() else {
            panic!("expected channels");
        };
        assert!((raw.values["wheel"] - 10.0).abs() < 1e-9);
        assert!(matches!(
            adapter.read(Duration::from_millis(50)),
            Err(AdapterError::Connection(_))
        ));
        assert!(!adapter.is_connected());
    }
}
