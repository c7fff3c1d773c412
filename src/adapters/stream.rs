//! Byte-stream adapters: a driver thread reads the device, feeds a framing
//! parser and pushes complete readings into a bounded queue that `read` drains.
//!
//! Sources must return from `read` periodically (a serial read timeout, or
//! `TimedOut`/`WouldBlock` when idle) so the driver notices `close()`.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, TrySendError};
use log::{debug, info, warn};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::SourceAdapter;
use crate::error::AdapterError;
use crate::types::{current_timestamp, Reading, SourceKind};

/// Serial read timeout; bounds how long the driver takes to see a stop request.
pub const DEVICE_READ_TIMEOUT: Duration = Duration::from_millis(100);
/// How long `close()` waits for the driver thread to exit.
pub const DRIVER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Opens a fresh byte stream on every connect.
pub type ByteSourceFactory = Box<dyn Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync>;

/// Serial device at `baud_rate`, 8N1, no flow control.
pub fn serial_factory(path: PathBuf, baud_rate: u32) -> ByteSourceFactory {
    Box::new(move || {
        let port = serialport::new(path.to_string_lossy().into_owned(), baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(DEVICE_READ_TIMEOUT)
            .open()?;
        Ok(Box::new(port) as Box<dyn Read + Send>)
    })
}

/// Incremental framing parser for one device protocol.
pub trait StreamParser: Default + Send + 'static {
    const KIND: SourceKind;

    /// Feed one byte received at `timestamp`; returns a reading when a frame completes.
    fn feed(&mut self, byte: u8, timestamp: f64) -> Option<Reading>;
}

struct Driver {
    rx: Receiver<Reading>,
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

impl Driver {
    /// Ask the driver to stop and wait for it to release the device.
    fn shutdown(self, source_id: &str) {
        self.stop.store(true, Ordering::Relaxed);
        match self.done_rx.recv_timeout(DRIVER_JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    warn!("[adapter:{}] driver thread panicked", source_id);
                }
            }
            Err(RecvTimeoutError::Timeout) => warn!(
                "[adapter:{}] driver still blocked in read after {:?}, detaching",
                source_id, DRIVER_JOIN_TIMEOUT
            ),
        }
    }
}

pub struct StreamAdapter<P: StreamParser> {
    source_id: String,
    factory: ByteSourceFactory,
    queue_depth: usize,
    driver: Option<Driver>,
    _parser: std::marker::PhantomData<fn() -> P>,
}

impl<P: StreamParser> StreamAdapter<P> {
    pub fn new(source_id: &str, factory: ByteSourceFactory, queue_depth: usize) -> Self {
        Self {
            source_id: source_id.to_string(),
            factory,
            queue_depth: queue_depth.max(1),
            driver: None,
            _parser: std::marker::PhantomData,
        }
    }

    fn spawn_driver(&self, mut source: Box<dyn Read + Send>) -> Result<Driver, AdapterError> {
        let (tx, rx) = bounded::<Reading>(self.queue_depth);
        let (done_tx, done_rx) = bounded::<()>(1);
        let stop = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        let id = self.source_id.clone();

        let thread_stop = Arc::clone(&stop);
        let thread_alive = Arc::clone(&alive);
        let handle = thread::Builder::new()
            .name(format!("adapter-{}", id))
            .spawn(move || {
                let mut parser = P::default();
                let mut buf = [0u8; 256];
                let mut dropped: u64 = 0;
                'outer: while !thread_stop.load(Ordering::Relaxed) {
                    let n = match source.read(&mut buf) {
                        Ok(0) => {
                            info!("[adapter:{}] stream ended", id);
                            break;
                        }
                        Ok(n) => n,
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::Interrupted
                                    | io::ErrorKind::TimedOut
                                    | io::ErrorKind::WouldBlock
                            ) =>
                        {
                            continue
                        }
                        Err(e) => {
                            warn!("[adapter:{}] read error: {}", id, e);
                            break;
                        }
                    };
                    let now = current_timestamp();
                    for &byte in &buf[..n] {
                        let Some(reading) = parser.feed(byte, now) else {
                            continue;
                        };
                        match tx.try_send(reading) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                dropped += 1;
                                if dropped.is_power_of_two() {
                                    debug!("[adapter:{}] queue full, {} reading(s) dropped", id, dropped);
                                }
                            }
                            Err(TrySendError::Disconnected(_)) => break 'outer,
                        }
                    }
                }
                drop(source);
                thread_alive.store(false, Ordering::Relaxed);
                let _ = done_tx.send(());
            })
            .map_err(|e| AdapterError::Connection(format!("spawn driver: {}", e)))?;

        Ok(Driver {
            rx,
            stop,
            alive,
            done_rx,
            handle,
        })
    }

    /// Reap a driver whose stream already ended.
    fn release_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.shutdown(&self.source_id);
        }
    }
}

impl<P: StreamParser> SourceAdapter for StreamAdapter<P> {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        P::KIND
    }

    fn connect(&mut self) -> Result<(), AdapterError> {
        if self.is_connected() {
            return Ok(());
        }
        let source = (self.factory)().map_err(|e| AdapterError::Connection(e.to_string()))?;
        self.driver = Some(self.spawn_driver(source)?);
        info!("[adapter:{}] connected", self.source_id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.driver
            .as_ref()
            .map(|d| d.alive.load(Ordering::Relaxed) || !d.rx.is_empty())
            .unwrap_or(false)
    }

    fn read(&mut self, timeout: Duration) -> Result<Reading, AdapterError> {
        let Some(driver) = self.driver.as_ref() else {
            return Err(AdapterError::Connection("not connected".to_string()));
        };
        match driver.rx.recv_timeout(timeout) {
            Ok(reading) => Ok(reading),
            Err(RecvTimeoutError::Timeout) => {
                if driver.alive.load(Ordering::Relaxed) {
                    Err(AdapterError::Timeout(timeout))
                } else {
                    self.release_driver();
                    Err(AdapterError::Connection("stream closed".to_string()))
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.release_driver();
                Err(AdapterError::Connection("stream closed".to_string()))
            }
        }
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        if let Some(driver) = self.driver.take() {
            driver.shutdown(&self.source_id);
            info!("[adapter:{}] closed", self.source_id);
        }
        Ok(())
    }
}

impl<P: StreamParser> Drop for StreamAdapter<P> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawReading;
    use std::io::Cursor;

    /// Emits one reading per newline.
    #[derive(Default)]
    struct LineParser {
        count: f64,
    }

    impl StreamParser for LineParser {
        const KIND: SourceKind = SourceKind::Can;

        fn feed(&mut self, byte: u8, timestamp: f64) -> Option<Reading> {
            if byte != b'\n' {
                return None;
            }
            self.count += 1.0;
            Some(Reading::Channels(
                RawReading::new("lines", timestamp).with("n", self.count),
            ))
        }
    }

    fn cursor_factory(data: &'static [u8]) -> ByteSourceFactory {
        Box::new(move || Ok(Box::new(Cursor::new(data)) as Box<dyn Read + Send>))
    }

    #[test]
    fn test_reads_then_reports_closed_stream() {
        let mut adapter = StreamAdapter::<LineParser>::new("lines", cursor_factory(b"a\nb\n"), 8);
        assert!(matches!(
            adapter.read(Duration::from_millis(10)),
            Err(AdapterError::Connection(_))
        ));
        adapter.connect().unwrap();

        let mut values = Vec::new();
        for _ in 0..2 {
            match adapter.read(Duration::from_secs(1)).unwrap() {
                Reading::Channels(raw) => values.push(raw.values["n"]),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(values, vec![1.0, 2.0]);

        // EOF: the driver exits and the adapter reports the loss
        let err = adapter.read(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, AdapterError::Connection(_)));
        assert!(!adapter.is_connected());
    }

    /// A tty with nothing attached: every read times out. The token counts
    /// open handles.
    struct SilentDevice {
        _handle: Arc<()>,
    }

    impl Read for SilentDevice {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(5));
            Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
        }
    }

    #[test]
    fn test_close_releases_silent_device() {
        let token = Arc::new(());
        let factory_token = Arc::clone(&token);
        let factory: ByteSourceFactory = Box::new(move || {
            Ok(Box::new(SilentDevice {
                _handle: Arc::clone(&factory_token),
            }) as Box<dyn Read + Send>)
        });
        let mut adapter = StreamAdapter::<LineParser>::new("silent", factory, 8);

        for _ in 0..3 {
            adapter.connect().unwrap();
            assert!(adapter.is_connected());
            assert!(matches!(
                adapter.read(Duration::from_millis(20)),
                Err(AdapterError::Timeout(_))
            ));
            adapter.close().unwrap();
            // Only the factory's copy remains: the device handle was dropped
            assert_eq!(Arc::strong_count(&token), 2);
            assert!(!adapter.is_connected());
        }
    }

    #[test]
    fn test_connect_failure_is_connection_error() {
        let factory: ByteSourceFactory =
            Box::new(|| Err(io::Error::new(io::ErrorKind::NotFound, "no device")));
        let mut adapter = StreamAdapter::<LineParser>::new("lines", factory, 8);
        assert!(matches!(adapter.connect(), Err(AdapterError::Connection(_))));
        assert!(adapter.close().is_ok());
        assert!(adapter.close().is_ok());
    }
}
