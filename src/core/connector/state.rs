use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Connector lifecycle. `Idle` is the only start state, `Closed` the only
/// terminal one; every other state can fall back to `Reconnecting` and every
/// state can be cut short by `close` into `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Dialing,
    Subscribing,
    Syncing,
    Streaming,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectorState::Idle => "idle",
            ConnectorState::Dialing => "dialing",
            ConnectorState::Subscribing => "subscribing",
            ConnectorState::Syncing => "syncing",
            ConnectorState::Streaming => "streaming",
            ConnectorState::Reconnecting => "reconnecting",
            ConnectorState::Closed => "closed",
        };
        f.write_str(label)
    }
}

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
pub const BACKOFF_MAX_ATTEMPTS: u32 = 10;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const STALE_TIMEOUT: Duration = Duration::from_secs(60);

/// `delay(attempt) = min(attempt * base, cap)`, attempts counted from 1.
pub fn backoff_delay(attempt: u32) -> Duration {
    let scaled = BACKOFF_BASE.saturating_mul(attempt.max(1));
    scaled.min(BACKOFF_CAP)
}

/// Gates entry into the reconnect routine so a read error and a heartbeat
/// timeout firing at the same moment don't spawn two concurrent reconnect
/// chains. One `ReconnectGuard` per connector, shared by every task that can
/// observe a fault.
#[derive(Debug, Default)]
pub struct ReconnectGuard {
    in_flight: AtomicBool,
    attempt: AtomicU32,
}

impl ReconnectGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this caller won the race and should drive the
    /// reconnect; false if another task already owns it.
    pub fn try_enter(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn leave(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn next_attempt(&self) -> u32 {
        self.attempt.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Reset on every successful entry into Streaming.
    pub fn reset(&self) {
        self.attempt.store(0, Ordering::Release);
    }
}
