//! Scripted adapters shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use telemetry_stream_rs::adapters::SourceAdapter;
use telemetry_stream_rs::types::current_timestamp;
use telemetry_stream_rs::{AdapterError, GpsFix, ImuReading, Reading, SourceKind, TelemetryConfig};

pub const G: f64 = 9.80665;

type Script = Box<dyn FnMut(u64) -> Option<Reading> + Send>;

/// Adapter that answers each bounded read from a script. Zero-timeout drain
/// reads always come back empty, so every tick sees at most one reading.
pub struct ScriptedAdapter {
    source_id: String,
    kind: SourceKind,
    script: Script,
    reads: u64,
    connected: bool,
    fail_connect: bool,
    close_delay: Duration,
    closed: Arc<AtomicBool>,
}

impl ScriptedAdapter {
    pub fn new(
        source_id: &str,
        kind: SourceKind,
        script: impl FnMut(u64) -> Option<Reading> + Send + 'static,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            kind,
            script: Box::new(script),
            reads: 0,
            connected: false,
            fail_connect: false,
            close_delay: Duration::ZERO,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Adapter whose hardware never answers.
    pub fn unreachable(source_id: &str, kind: SourceKind) -> Self {
        Self {
            fail_connect: true,
            ..Self::new(source_id, kind, |_| None)
        }
    }

    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Flag set once `close()` has returned.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

impl SourceAdapter for ScriptedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn connect(&mut self) -> Result<(), AdapterError> {
        if self.fail_connect {
            return Err(AdapterError::Connection("no such device".to_string()));
        }
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
        if timeout.is_zero() {
            return Err(AdapterError::Timeout(timeout));
        }
        self.reads += 1;
        (self.script)(self.reads).ok_or(AdapterError::Timeout(timeout))
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        thread::sleep(self.close_delay);
        self.connected = false;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub fn fresh_fix(latitude: f64, longitude: f64, speed: f64) -> Reading {
    Reading::Gps(GpsFix {
        timestamp: current_timestamp(),
        latitude,
        longitude,
        altitude: 100.0,
        speed,
        course: 0.0,
        fix_quality: 1,
        satellites: 9,
    })
}

pub fn fresh_still_imu() -> Reading {
    Reading::Imu(ImuReading {
        timestamp: current_timestamp(),
        accel: [0.0, 0.0, -G],
        gyro: [0.0; 3],
        temperature: Some(30.0),
    })
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fast timers so scenarios finish in well under a second of polling.
pub fn fast_config() -> TelemetryConfig {
    let mut config = TelemetryConfig::default();
    config.pipeline.poll_period_ms = 10;
    config.pipeline.health_period_ms = 20;
    config.pipeline.can_read_timeout_ms = 5;
    config.pipeline.gps_read_timeout_ms = 5;
    config.pipeline.imu_read_timeout_ms = 5;
    config.pipeline.reconnect_base_cooldown_ms = 10;
    config
}

/// Poll `done` until it holds or three seconds pass.
pub fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
