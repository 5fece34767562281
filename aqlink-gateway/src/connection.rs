// aqlink Gateway - LoRaWAN ingestion layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Broker connection state machine
//!
//! ```text
//! Disconnected --connect--> Connecting --ack--> Connected
//!                               |                  |  transport error
//!                               | fail / timeout   |  or stalled session
//!                               v                  v
//!                            Backoff <-------------+
//!                               |
//!                               +--delay elapsed--> Connecting
//!
//! max_restarts failed connects in a row, or inside the window --> Retired
//! ```
//!
//! The machine is pure: every transition takes the current time, so it can
//! be driven by a worker task or stepped through in tests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::ConnectionConfig;

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before the next connect attempt
    Backoff,
    /// Given up; only an operator brings it back
    Retired,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
            Self::Retired => "retired",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff with a ceiling
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(10),
            multiplier: 2.0,
            max: Duration::from_secs(600),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        if !delay_ms.is_finite() || delay_ms >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(delay_ms as u64).min(self.max)
    }
}

/// Timing limits of one connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionPolicy {
    pub data_timeout: Duration,
    pub min_uptime: Duration,
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub backoff: BackoffPolicy,
    pub connect_timeout: Duration,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for ConnectionPolicy {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            data_timeout: Duration::from_secs(config.data_timeout_secs),
            min_uptime: Duration::from_secs(config.min_uptime_secs),
            max_restarts: config.max_restarts,
            restart_window: Duration::from_secs(config.restart_window_secs),
            backoff: BackoffPolicy {
                initial: Duration::from_secs(config.backoff_initial_secs),
                multiplier: config.backoff_multiplier,
                max: Duration::from_secs(config.backoff_max_secs),
            },
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

/// Snapshot published to observers
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub endpoint: String,
    pub state: ConnectionState,
    /// Sessions started or restarted
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub started_at: Option<Instant>,
    pub last_record_at: Option<Instant>,
    pub last_error: Option<String>,
}

/// State of one broker connection
#[derive(Debug, Clone)]
pub struct Connection {
    endpoint: String,
    policy: ConnectionPolicy,
    state: ConnectionState,
    restart_count: u32,
    /// Failed connects since the last ack; picks the backoff step
    consecutive_failures: u32,
    /// Times of failed connects inside the restart window, across sessions
    failures: VecDeque<Instant>,
    started_at: Option<Instant>,
    last_record_at: Option<Instant>,
    retry_at: Option<Instant>,
    last_error: Option<String>,
}

impl Connection {
    pub fn new(endpoint: impl Into<String>, policy: ConnectionPolicy) -> Self {
        Self {
            endpoint: endpoint.into(),
            policy,
            state: ConnectionState::Disconnected,
            restart_count: 0,
            consecutive_failures: 0,
            failures: VecDeque::new(),
            started_at: None,
            last_record_at: None,
            retry_at: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Time left before a connect may be attempted; `None` when one may go now
    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        match (self.state, self.retry_at) {
            (ConnectionState::Backoff, Some(at)) if at > now => Some(at - now),
            _ => None,
        }
    }

    /// Start a connect attempt; `false` when not allowed yet
    pub fn begin_connect(&mut self, now: Instant) -> bool {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Backoff if self.backoff_remaining(now).is_none() => {}
            _ => return false,
        }
        self.state = ConnectionState::Connecting;
        self.restart_count += 1;
        true
    }

    /// The broker acknowledged the session
    pub fn connected(&mut self, now: Instant) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.state = ConnectionState::Connected;
        self.consecutive_failures = 0;
        self.started_at = Some(now);
        self.last_record_at = Some(now);
        self.retry_at = None;
        self.last_error = None;
    }

    /// The connect attempt was refused or timed out
    pub fn connect_failed(&mut self, now: Instant, reason: impl Into<String>) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.last_error = Some(reason.into());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.failures.push_back(now);
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > self.policy.restart_window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        if self.consecutive_failures >= self.policy.max_restarts
            || self.failures.len() >= self.policy.max_restarts as usize
        {
            self.state = ConnectionState::Retired;
            self.retry_at = None;
            return;
        }
        self.enter_backoff(now);
    }

    /// The session dropped while connected
    pub fn transport_error(&mut self, now: Instant, reason: impl Into<String>) {
        if self.state != ConnectionState::Connected {
            return;
        }
        self.last_error = Some(reason.into());
        self.enter_backoff(now);
    }

    /// A message arrived
    pub fn record_received(&mut self, now: Instant) {
        if self.state == ConnectionState::Connected {
            self.last_record_at = Some(now);
        }
    }

    /// Connected for longer than the minimum uptime, but silent for longer
    /// than the data timeout
    pub fn is_stalled(&self, now: Instant) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        let (Some(started), Some(last)) = (self.started_at, self.last_record_at) else {
            return false;
        };
        now.duration_since(last) > self.policy.data_timeout
            && now.duration_since(started) > self.policy.min_uptime
    }

    /// Drop a stalled session and back off
    pub fn stall(&mut self, now: Instant) {
        if self.is_stalled(now) {
            self.last_error = Some("no data received".to_string());
            self.enter_backoff(now);
        }
    }

    /// Session closed on request
    pub fn disconnected(&mut self) {
        if self.state != ConnectionState::Retired {
            self.state = ConnectionState::Disconnected;
            self.retry_at = None;
        }
    }

    /// Operator reinstates a retired connection
    pub fn reinstate(&mut self) {
        if self.state == ConnectionState::Retired {
            self.state = ConnectionState::Disconnected;
            self.consecutive_failures = 0;
            self.failures.clear();
            self.last_error = None;
        }
    }

    /// Delay the next backoff will use
    pub fn next_delay(&self) -> Duration {
        let attempt = self.consecutive_failures.saturating_sub(1);
        self.policy.backoff.delay_for_attempt(attempt)
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            endpoint: self.endpoint.clone(),
            state: self.state,
            restart_count: self.restart_count,
            consecutive_failures: self.consecutive_failures,
            started_at: self.started_at,
            last_record_at: self.last_record_at,
            last_error: self.last_error.clone(),
        }
    }

    fn enter_backoff(&mut self, now: Instant) {
        self.state = ConnectionState::Backoff;
        self.retry_at = Some(now + self.next_delay());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_backoff_policy() {
        let backoff = BackoffPolicy::default();
        assert_eq!(backoff.delay_for_attempt(0), secs(10));
        assert_eq!(backoff.delay_for_attempt(1), secs(20));
        assert_eq!(backoff.delay_for_attempt(5), secs(320));
        assert_eq!(backoff.delay_for_attempt(6), secs(600));
        assert_eq!(backoff.delay_for_attempt(200), secs(600));
    }

    #[test]
    fn test_connect_cycle() {
        let t0 = Instant::now();
        let mut conn = Connection::new("eu1", ConnectionPolicy::default());
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        assert!(conn.begin_connect(t0));
        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.connected(t0 + secs(1));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.restart_count(), 1);

        conn.transport_error(t0 + secs(60), "connection reset");
        assert_eq!(conn.state(), ConnectionState::Backoff);
        assert_eq!(conn.backoff_remaining(t0 + secs(60)), Some(secs(10)));
        assert!(!conn.begin_connect(t0 + secs(65)));
        assert!(conn.begin_connect(t0 + secs(70)));
        assert_eq!(conn.restart_count(), 2);
    }

    #[test]
    fn test_failures_grow_backoff_then_retire() {
        let mut now = Instant::now();
        let mut conn = Connection::new("eu1", ConnectionPolicy::default());
        let mut delays = Vec::new();

        for _ in 0..4 {
            assert!(conn.begin_connect(now));
            conn.connect_failed(now, "refused");
            assert_eq!(conn.state(), ConnectionState::Backoff);
            let delay = conn.backoff_remaining(now).unwrap();
            delays.push(delay);
            now += delay;
        }
        assert_eq!(delays, vec![secs(10), secs(20), secs(40), secs(80)]);

        assert!(conn.begin_connect(now));
        conn.connect_failed(now, "refused");
        assert_eq!(conn.state(), ConnectionState::Retired);
        assert!(!conn.begin_connect(now + secs(3600)));
        assert_eq!(conn.status().last_error.as_deref(), Some("refused"));
    }

    #[test]
    fn test_backoff_never_shrinks_past_window() {
        let mut now = Instant::now();
        let policy = ConnectionPolicy {
            max_restarts: 5,
            restart_window: secs(60),
            ..Default::default()
        };
        let mut conn = Connection::new("eu1", policy);
        let mut delays = Vec::new();

        while conn.state() != ConnectionState::Retired {
            assert!(delays.len() < 5, "never retired: {:?}", delays);
            assert!(conn.begin_connect(now));
            conn.connect_failed(now, "refused");
            if let Some(delay) = conn.backoff_remaining(now) {
                delays.push(delay);
                now += delay;
            }
        }
        assert_eq!(delays, vec![secs(10), secs(20), secs(40), secs(80)]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(conn.status().consecutive_failures, 5);
    }

    #[test]
    fn test_flapping_session_retires_inside_window() {
        let mut now = Instant::now();
        let policy = ConnectionPolicy {
            max_restarts: 3,
            ..Default::default()
        };
        let mut conn = Connection::new("eu1", policy);

        for _ in 0..2 {
            assert!(conn.begin_connect(now));
            conn.connect_failed(now, "refused");
            now += conn.backoff_remaining(now).unwrap();
            assert!(conn.begin_connect(now));
            conn.connected(now);
            assert_eq!(conn.status().consecutive_failures, 0);
            conn.transport_error(now + secs(5), "connection reset");
            now += secs(5) + conn.backoff_remaining(now + secs(5)).unwrap();
        }

        // acks reset the backoff step, not the windowed count
        assert!(conn.begin_connect(now));
        conn.connect_failed(now, "refused");
        assert_eq!(conn.state(), ConnectionState::Retired);
    }

    #[test]
    fn test_ack_resets_failures() {
        let now = Instant::now();
        let mut conn = Connection::new("eu1", ConnectionPolicy::default());
        conn.begin_connect(now);
        conn.connect_failed(now, "refused");
        conn.begin_connect(now + secs(10));
        conn.connect_failed(now + secs(10), "refused");
        assert_eq!(conn.status().consecutive_failures, 2);

        conn.begin_connect(now + secs(30));
        conn.connected(now + secs(30));
        assert_eq!(conn.status().consecutive_failures, 0);
        assert!(conn.status().last_error.is_none());
    }

    #[test]
    fn test_stall_detection() {
        let t0 = Instant::now();
        let mut conn = Connection::new("eu1", ConnectionPolicy::default());
        conn.begin_connect(t0);
        conn.connected(t0);

        // silent, but not up long enough to judge
        assert!(!conn.is_stalled(t0 + secs(800)));
        conn.record_received(t0 + secs(100));
        assert!(!conn.is_stalled(t0 + secs(3600)));
        assert!(conn.is_stalled(t0 + secs(3701)));

        conn.stall(t0 + secs(3701));
        assert_eq!(conn.state(), ConnectionState::Backoff);
        assert_eq!(conn.status().consecutive_failures, 0);
    }

    #[test]
    fn test_reinstate() {
        let now = Instant::now();
        let policy = ConnectionPolicy {
            max_restarts: 1,
            ..Default::default()
        };
        let mut conn = Connection::new("eu1", policy);
        conn.begin_connect(now);
        conn.connect_failed(now, "bad credentials");
        assert_eq!(conn.state(), ConnectionState::Retired);

        conn.reinstate();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.begin_connect(now));
    }
}
