use crate::core::connector::state::ConnectorState;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque uppercase trading symbol, e.g. `BTCUSDT`.
///
/// Each connector may translate it to its venue's native form on ingress
/// (lowercase path segments, dash-separated instrument ids, etc).
pub type Symbol = String;

pub fn normalize_symbol(raw: &str) -> Symbol {
    raw.trim().to_ascii_uppercase()
}

/// Exact-decimal price or quantity. Never route a price key through `f64` -
/// binary floating point reorders levels and merges distinct prices.
pub type Price = Decimal;
pub type Qty = Decimal;

/// Compiled-in set of supported venues. Adding a venue is: a new variant
/// here, a connector module implementing `Connector`, and a registration in
/// `Engine::spawn_venue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueId {
    Binance,
    Okx,
    Coinbase,
}

impl VenueId {
    pub fn all() -> &'static [VenueId] {
        &[VenueId::Binance, VenueId::Okx, VenueId::Coinbase]
    }

    pub fn tag(&self) -> &'static str {
        match self {
            VenueId::Binance => "binance",
            VenueId::Okx => "okx",
            VenueId::Coinbase => "coinbase",
        }
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A single `(price, quantity)` resting offer. Zero quantity means *delete*
/// when applied as part of an incremental update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Price,
    pub qty: Qty,
}

impl PriceLevel {
    pub fn new(price: Price, qty: Qty) -> Self {
        Self { price, qty }
    }
}

/// Full state of (the top of) a venue's book at a given sequence point.
///
/// `bids` is ordered by price descending, `asks` ascending, matching the
/// order the venue itself publishes them in. `monotonic_id` may be zero for
/// venues whose stream is timestamp-sequenced rather than id-sequenced.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub venue: VenueId,
    pub symbol: Symbol,
    pub monotonic_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub observed_at: DateTime<Utc>,
}

/// A venue-originated incremental change to the book, or (if `is_snapshot`)
/// a full replace.
///
/// `first_id`/`final_id`/`prev_id` carry the venue's sequencing where
/// available; they are zero for venues whose protocol doesn't expose them,
/// in which case continuity is not checked for that venue.
#[derive(Debug, Clone)]
pub struct IncrementalUpdate {
    pub venue: VenueId,
    pub symbol: Symbol,
    pub event_time: DateTime<Utc>,
    pub first_id: u64,
    pub final_id: u64,
    pub prev_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub is_snapshot: bool,
}

/// Per-connector health record. Mutated only by the connector's own tasks,
/// read without blocking by the broadcast server and diagnostics.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub venue: VenueId,
    pub state: ConnectorState,
    pub connected: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub error_count: u64,
    pub last_reconnect_at: Option<DateTime<Utc>>,
}

impl HealthStatus {
    pub fn idle(venue: VenueId) -> Self {
        Self {
            venue,
            state: ConnectorState::Idle,
            connected: false,
            last_message_at: None,
            message_count: 0,
            error_count: 0,
            last_reconnect_at: None,
        }
    }
}
