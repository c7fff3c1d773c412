//! Adapter over a crossbeam receiver, for readings produced by an external
//! driver thread (or a test).

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use super::SourceAdapter;
use crate::error::AdapterError;
use crate::types::{Reading, SourceKind};

pub struct ChannelAdapter {
    source_id: String,
    kind: SourceKind,
    rx: Receiver<Reading>,
    connected: bool,
    closed_by_peer: bool,
}

impl ChannelAdapter {
    pub fn new(source_id: &str, kind: SourceKind, rx: Receiver<Reading>) -> Self {
        Self {
            source_id: source_id.to_string(),
            kind,
            rx,
            connected: false,
            closed_by_peer: false,
        }
    }

    /// Adapter plus the bounded sender that feeds it.
    pub fn pair(source_id: &str, kind: SourceKind, capacity: usize) -> (Sender<Reading>, Self) {
        let (tx, rx) = bounded(capacity.max(1));
        (tx, Self::new(source_id, kind, rx))
    }
}

impl SourceAdapter for ChannelAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn connect(&mut self) -> Result<(), AdapterError> {
        if self.closed_by_peer {
            return Err(AdapterError::Connection("sender dropped".to_string()));
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
        match self.rx.recv_timeout(timeout) {
            Ok(reading) => Ok(reading),
            Err(RecvTimeoutError::Timeout) => Err(AdapterError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                self.connected = false;
                self.closed_by_peer = true;
                Err(AdapterError::Connection("sender dropped".to_string()))
            }
        }
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        self.connected = false;
        Ok(())
    }
}
