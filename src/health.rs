//! Per-source health tracking: silence detection, read statistics and the
//! reconnect back-off schedule.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::AdapterError;
use crate::types::{current_timestamp, SourceKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unavailable,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "HEALTHY"),
            HealthState::Degraded => write!(f, "DEGRADED"),
            HealthState::Unavailable => write!(f, "UNAVAILABLE"),
        }
    }
}

// ─── Reconnect back-off ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
    pub backoff_factor: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_cooldown: Duration::from_secs(2),
            max_cooldown: Duration::from_secs(30),
            backoff_factor: 1.5,
            max_attempts: 60,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RestartState {
    pub restart_needed: bool,
    pub next_retry_time: Instant,
    pub attempts: u32,
    pub current_cooldown: Duration,
}

impl RestartState {
    pub fn new(policy: &ReconnectPolicy, now: Instant) -> Self {
        Self {
            restart_needed: false,
            next_retry_time: now,
            attempts: 0,
            current_cooldown: policy.base_cooldown,
        }
    }

    pub fn signal_restart(&mut self) {
        self.restart_needed = true;
    }

    pub fn can_retry(&self, now: Instant) -> bool {
        self.restart_needed && now >= self.next_retry_time
    }

    pub fn exhausted(&self, policy: &ReconnectPolicy) -> bool {
        self.attempts >= policy.max_attempts
    }

    /// Grow the cool-down geometrically, capped at `max_cooldown`.
    pub fn record_failed_attempt(&mut self, policy: &ReconnectPolicy, now: Instant) {
        self.attempts += 1;
        self.restart_needed = true;
        self.current_cooldown = Duration::from_secs_f64(
            (self.current_cooldown.as_secs_f64() * policy.backoff_factor)
                .min(policy.max_cooldown.as_secs_f64()),
        );
        self.next_retry_time = now + self.current_cooldown;
    }

    pub fn record_success(&mut self, policy: &ReconnectPolicy, now: Instant) {
        self.restart_needed = false;
        self.attempts = 0;
        self.current_cooldown = policy.base_cooldown;
        self.next_retry_time = now;
    }
}

// ─── Per-source tracking ─────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceHealthReport {
    pub source_id: String,
    pub kind: Option<SourceKind>,
    pub state: HealthState,
    pub connected: bool,
    pub reads: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub rejected: u64,
    pub reconnects: u64,
    pub reconnect_attempts: u32,
    /// Wall-clock seconds of the last successful read
    pub last_success: Option<f64>,
    pub silence_secs: Option<f64>,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SourceHealth {
    pub source_id: String,
    pub kind: Option<SourceKind>,
    pub silence_threshold: Duration,
    pub state: HealthState,
    pub connected: bool,
    pub restart: RestartState,
    detected: bool,
    last_update: Option<Instant>,
    last_success: Option<f64>,
    last_error: Option<String>,
    reads: u64,
    timeouts: u64,
    errors: u64,
    rejected: u64,
    reconnects: u64,
}

impl SourceHealth {
    pub fn new(
        source_id: &str,
        kind: SourceKind,
        silence_threshold: Duration,
        policy: &ReconnectPolicy,
        now: Instant,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            kind: Some(kind),
            silence_threshold,
            state: HealthState::Degraded,
            connected: false,
            restart: RestartState::new(policy, now),
            detected: true,
            last_update: None,
            last_success: None,
            last_error: None,
            reads: 0,
            timeouts: 0,
            errors: 0,
            rejected: 0,
            reconnects: 0,
        }
    }

    /// A configured source no adapter could be built for.
    pub fn missing(source_id: &str, policy: &ReconnectPolicy, now: Instant) -> Self {
        let mut health = Self::new(source_id, SourceKind::Can, Duration::ZERO, policy, now);
        health.kind = None;
        health.detected = false;
        health.state = HealthState::Unavailable;
        health.last_error = Some("not detected".to_string());
        health
    }

    pub fn is_detected(&self) -> bool {
        self.detected
    }

    pub fn record_connected(&mut self, now: Instant) {
        self.connected = true;
        // Silence is measured from the moment the source came up
        self.last_update = Some(now);
    }

    pub fn record_disconnected(&mut self) {
        self.connected = false;
    }

    pub fn record_read(&mut self, now: Instant) {
        self.reads += 1;
        self.last_update = Some(now);
        self.last_success = Some(current_timestamp());
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }

    pub fn record_error(&mut self, err: &AdapterError) {
        self.errors += 1;
        self.last_error = Some(err.to_string());
        if matches!(err, AdapterError::Connection(_)) {
            self.connected = false;
        }
    }

    pub fn record_rejection(&mut self, reason: &str) {
        self.rejected += 1;
        self.last_error = Some(reason.to_string());
    }

    pub fn record_reconnect(&mut self) {
        self.reconnects += 1;
    }

    pub fn time_since_last_update(&self, now: Instant) -> Option<Duration> {
        self.last_update.map(|t| now.saturating_duration_since(t))
    }

    pub fn is_silent(&self, now: Instant) -> bool {
        self.time_since_last_update(now)
            .map(|d| d > self.silence_threshold)
            .unwrap_or(false)
    }

    /// Recompute the health state.
    pub fn evaluate(&mut self, policy: &ReconnectPolicy, now: Instant) -> HealthState {
        let next = if !self.detected || (!self.connected && self.restart.exhausted(policy)) {
            HealthState::Unavailable
        } else if !self.connected || self.is_silent(now) {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        if next != self.state {
            match next {
                HealthState::Healthy => {
                    info!("[health] {} {} -> {}", self.source_id, self.state, next)
                }
                _ => warn!(
                    "[health] {} {} -> {} (silent {:.1}s, attempt {}/{})",
                    self.source_id,
                    self.state,
                    next,
                    self.time_since_last_update(now)
                        .unwrap_or_default()
                        .as_secs_f64(),
                    self.restart.attempts,
                    policy.max_attempts
                ),
            }
            self.state = next;
        }
        next
    }

    pub fn report(&self, now: Instant) -> SourceHealthReport {
        SourceHealthReport {
            source_id: self.source_id.clone(),
            kind: self.kind,
            state: self.state,
            connected: self.connected,
            reads: self.reads,
            timeouts: self.timeouts,
            errors: self.errors,
            rejected: self.rejected,
            reconnects: self.reconnects,
            reconnect_attempts: self.restart.attempts,
            last_success: self.last_success,
            silence_secs: self.time_since_last_update(now).map(|d| d.as_secs_f64()),
            last_error: self.last_error.clone(),
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Health of every configured source, shared between the poll thread (writer)
/// and API callers (readers).
#[derive(Debug, Default)]
pub struct HealthMonitor {
    sources: Mutex<BTreeMap<String, SourceHealth>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, health: SourceHealth) {
        if let Ok(mut sources) = self.sources.lock() {
            sources.insert(health.source_id.clone(), health);
        }
    }

    /// Run `f` against one source's tracker under the lock.
    pub fn with_source<R>(&self, source_id: &str, f: impl FnOnce(&mut SourceHealth) -> R) -> Option<R> {
        self.sources
            .lock()
            .ok()
            .and_then(|mut sources| sources.get_mut(source_id).map(f))
    }

    /// Run `f` against every tracker under one lock.
    pub fn for_each(&self, mut f: impl FnMut(&mut SourceHealth)) {
        if let Ok(mut sources) = self.sources.lock() {
            sources.values_mut().for_each(&mut f);
        }
    }

    pub fn states(&self) -> BTreeMap<String, HealthState> {
        self.sources
            .lock()
            .ok()
            .map(|sources| {
                sources
                    .iter()
                    .map(|(id, h)| (id.clone(), h.state))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn reports(&self) -> Vec<SourceHealthReport> {
        let now = Instant::now();
        self.sources
            .lock()
            .ok()
            .map(|sources| sources.values().map(|h| h.report(now)).collect())
            .unwrap_or_default()
    }

    pub fn format_status(&self) -> String {
        let parts: Vec<String> = self
            .states()
            .iter()
            .map(|(id, state)| format!("{} {}", id, state))
            .collect();
        format!("Health: {}", parts.join(" | "))
    }
}
