use crate::core::error::EngineResult;
use crate::core::types::{HealthStatus, IncrementalUpdate, Snapshot, Symbol, VenueId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;

/// Binance spot connector, pattern 1 (out-of-band snapshot + in-band deltas).
pub mod binance;
/// Coinbase-style connector, pattern 3 (in-band snapshot-replace).
pub mod coinbase;
/// OKX connector, pattern 2 (in-band snapshot + in-band deltas).
pub mod okx;
/// Lifecycle state machine, backoff schedule, reconnect guard.
pub mod state;

pub type UpdateReceiver = Receiver<IncrementalUpdate>;

/// The abstract venue adapter (§4.2). Every connector implementation owns
/// exactly one canonical update stream for its lifetime: `take_updates`
/// hands out the receiving end exactly once, and it is not recreated across
/// internal reconnects - only `close` ever terminates it.
#[async_trait]
pub trait Connector: Send + Sync {
    fn venue_tag(&self) -> VenueId;

    fn symbol(&self) -> &Symbol;

    /// Idempotent establishment; may return before the sync algorithm has
    /// finished aligning the stream with the book. Spawns the connector's
    /// long-lived read and heartbeat loops on first call. Takes `Arc<Self>`
    /// because those loops outlive the call and must hold a handle back to
    /// the connector they belong to.
    async fn connect(self: Arc<Self>) -> EngineResult<()>;

    /// Synchronous request for the initial book state - either a
    /// request/response round trip (pattern 1) or a wait for the first
    /// in-band frame (patterns 2 and 3).
    async fn fetch_snapshot(&self) -> EngineResult<Snapshot>;

    /// Take the receiving end of the canonical update stream. Must be
    /// called exactly once per connector instance; a second call is a
    /// programmer error and returns `DataTransmitError`.
    fn take_updates(&self) -> EngineResult<UpdateReceiver>;

    /// Current health record. Never blocks on the connector's own I/O.
    async fn health(&self) -> HealthStatus;

    /// Idempotent shutdown: releases transport, terminates the update
    /// stream, guarantees no further emissions.
    async fn close(&self);
}
