use crate::core::engine::Engine;
use crate::core::types::VenueId;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use parking_lot::Mutex as SyncMutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound frame shapes, inbound control frame parsing (§6).
pub mod protocol;

/// Server-wide tunables: listen port, broadcast cadence, default depth/tick.
pub mod config;

pub use config::BroadcastCfg;
use protocol::{InboundFrame, OutboundFrame};

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    time: i64,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthBody {
        status: "ok",
        time: chrono::Utc::now().timestamp(),
    })
}

/// One subscriber's outbound queue plus the slow-client counter that decides
/// whether it gets disconnected (§4.6). `close_signal` is cancelled the
/// moment a client is flagged, which is what actually tears down its
/// WebSocket - `disconnect`/`reap_closed` alone only stop outbound sends.
struct ClientSlot {
    tx: mpsc::Sender<OutboundFrame>,
    consecutive_full: AtomicU32,
    disconnect: std::sync::atomic::AtomicBool,
    close_signal: CancellationToken,
}

/// Shared state behind every client connection and the broadcast timer.
pub struct BroadcastState {
    engine: Arc<Engine>,
    cfg: BroadcastCfg,
    tick: SyncMutex<Decimal>,
    clients: SyncMutex<Vec<Arc<ClientSlot>>>,
}

impl BroadcastState {
    pub fn new(engine: Arc<Engine>, cfg: BroadcastCfg) -> Arc<Self> {
        Arc::new(Self {
            engine,
            tick: SyncMutex::new(Decimal::ZERO),
            cfg,
            clients: SyncMutex::new(Vec::new()),
        })
    }

    /// Registers a new client's outbound queue and returns the token that
    /// signals its session to close - cancelled once this client is flagged
    /// for disconnect.
    fn register(&self, tx: mpsc::Sender<OutboundFrame>) -> CancellationToken {
        let close_signal = CancellationToken::new();
        self.clients.lock().push(Arc::new(ClientSlot {
            tx,
            consecutive_full: AtomicU32::new(0),
            disconnect: std::sync::atomic::AtomicBool::new(false),
            close_signal: close_signal.clone(),
        }));
        close_signal
    }

    /// Removes senders whose receiver has already been dropped, or that
    /// were flagged for disconnect after too many consecutive full ticks.
    fn reap_closed(&self) {
        self.clients
            .lock()
            .retain(|slot| !slot.tx.is_closed() && !slot.disconnect.load(Ordering::Acquire));
    }

    /// Attempts to send one frame to one client; never updates the
    /// consecutive-full counter itself, since a single tick fans out more
    /// than one frame and saturation must be judged once per tick, not once
    /// per frame. Returns whether the send succeeded.
    fn dispatch(&self, slot: &ClientSlot, frame: OutboundFrame) -> bool {
        slot.tx.try_send(frame).is_ok()
    }

    /// Rolls up every `dispatch` result for one client's tick into the
    /// consecutive-full counter (§4.6, scenario 6): a tick counts as "full"
    /// if any frame in it was dropped. On crossing the configured
    /// threshold, flags the slot for reaping and cancels its close signal so
    /// `client_session` actually tears the WebSocket down instead of just
    /// going quiet.
    fn record_tick(&self, slot: &ClientSlot, any_dropped: bool) {
        if !any_dropped {
            slot.consecutive_full.store(0, Ordering::Release);
            return;
        }
        let full_count = slot.consecutive_full.fetch_add(1, Ordering::AcqRel) + 1;
        if full_count >= self.cfg.max_consecutive_full_ticks {
            warn!(
                "broadcast: disconnecting a client stuck full for {full_count} consecutive ticks"
            );
            slot.disconnect.store(true, Ordering::Release);
            slot.close_signal.cancel();
        }
    }
}

/// Builds the single `axum::Router` serving both `/health` and `/ws`, the
/// way the pack's gateway-shaped examples share one listener between a
/// liveness probe and the real traffic route.
pub fn router(state: Arc<BroadcastState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BroadcastState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn client_session(socket: WebSocket, state: Arc<BroadcastState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(state.cfg.client_queue_depth);
    let close_signal = state.register(tx);

    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    warn!("broadcast: failed to serialize outbound frame: {e}");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                return;
            }
        }
    });

    loop {
        tokio::select! {
            // Fires once `record_tick` flags this client past the
            // consecutive-full-tick threshold - without this, a saturated
            // client's outbound queue stops draining but its still-open
            // socket leaves this loop awaiting `stream.next()` forever.
            _ = close_signal.cancelled() => {
                info!("broadcast: closing session for a client stuck full past the tick limit");
                break;
            }
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                if let WsMessage::Text(text) = msg {
                    match serde_json::from_str::<InboundFrame>(&text) {
                        Ok(InboundFrame::SetTick { tick }) => {
                            *state.tick.lock() = tick;
                            info!("broadcast: tick set to {tick}");
                        }
                        Ok(InboundFrame::ChangeSymbol { symbol }) => {
                            let engine = Arc::clone(&state.engine);
                            tokio::spawn(async move {
                                if let Err(e) = engine.change_symbol(symbol.clone()).await {
                                    warn!("broadcast: change_symbol to {symbol} failed: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("broadcast: malformed control frame: {e}"),
                    }
                }
            }
        }
    }

    write_task.abort();
    state.reap_closed();
}

/// Runs the 200ms (configurable) broadcast timer forever. Samples every
/// active venue's book under its own short-held lock, releases it, then
/// serializes and fans out - serialization and client I/O never happen
/// while a book lock is held.
pub async fn run_broadcast_loop(state: Arc<BroadcastState>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(state.cfg.cadence_ms));
    let bands: Vec<Decimal> = state
        .cfg
        .bands
        .iter()
        .filter_map(|p| Decimal::try_from(*p).ok())
        .collect();

    loop {
        ticker.tick().await;
        let venues = state.engine.active_venues().await;
        let clients: Vec<_> = state.clients.lock().clone();
        // Tracks, per client, whether *any* frame across *any* venue was
        // dropped this tick - saturation is judged once per client per
        // tick, never once per frame or per venue (§4.6, scenario 6).
        let mut any_dropped = vec![false; clients.len()];
        for venue in venues {
            broadcast_for_venue(&state, venue, &bands, &clients, &mut any_dropped).await;
        }
        for (client, dropped) in clients.iter().zip(any_dropped.into_iter()) {
            state.record_tick(client, dropped);
        }
        state.reap_closed();
    }
}

async fn broadcast_for_venue(
    state: &Arc<BroadcastState>,
    venue: VenueId,
    bands: &[Decimal],
    clients: &[Arc<ClientSlot>],
    any_dropped: &mut [bool],
) {
    let Some(book) = state.engine.book_for(venue).await else {
        return;
    };

    let tick = *state.tick.lock();
    let (bids, asks, stats) = {
        let book = book.lock().await;
        let (bids, asks) = if tick.is_zero() {
            book.top_n(state.cfg.default_top_n)
        } else {
            book.aggregate_by_tick(tick, state.cfg.default_top_n)
        };
        let stats = book.stats(bands);
        (bids, asks, stats)
    };

    let book_frame = OutboundFrame::order_book(venue, &bids, &asks);
    let stats_frame = OutboundFrame::stats(venue, &stats);

    for (client, dropped) in clients.iter().zip(any_dropped.iter_mut()) {
        let book_ok = state.dispatch(client, book_frame.clone());
        let stats_ok = state.dispatch(client, stats_frame.clone());
        if !book_ok || !stats_ok {
            *dropped = true;
        }
    }
}

/// Starts the server: binds the listener and spawns the broadcast timer.
/// Returns once the listener is bound; the server itself runs until the
/// process shuts down.
pub async fn serve(engine: Arc<Engine>, cfg: BroadcastCfg) -> anyhow::Result<()> {
    let port = cfg.port;
    let state = BroadcastState::new(engine, cfg);
    let app = router(Arc::clone(&state));

    tokio::spawn(run_broadcast_loop(Arc::clone(&state)));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("broadcast: listening on {addr}");
    axum::Server::try_bind(&addr)
        .map_err(|e| crate::core::error::EngineError::BindError(e.to_string()))?
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::Engine;
    use std::collections::HashMap;

    fn test_state(max_consecutive_full_ticks: u32, client_queue_depth: usize) -> Arc<BroadcastState> {
        let engine = Arc::new(Engine::new("BTCUSDT".to_string(), HashMap::new()));
        let cfg = BroadcastCfg {
            max_consecutive_full_ticks,
            client_queue_depth,
            ..BroadcastCfg::default()
        };
        BroadcastState::new(engine, cfg)
    }

    fn sample_frame() -> OutboundFrame {
        OutboundFrame::order_book(VenueId::Binance, &[], &[])
    }

    #[tokio::test]
    async fn a_slow_client_is_flagged_after_its_configured_full_tick_limit() {
        let state = test_state(3, 1);
        let (tx, _rx) = mpsc::channel(1);
        let close_signal = state.register(tx);
        let slot = Arc::clone(&state.clients.lock()[0]);

        // First tick: the first of its two frames fills the depth-1 queue,
        // the second is dropped - one dropped frame still counts as one
        // full tick, not two.
        let book_ok = state.dispatch(&slot, sample_frame());
        let stats_ok = state.dispatch(&slot, sample_frame());
        state.record_tick(&slot, !(book_ok && stats_ok));
        assert_eq!(slot.consecutive_full.load(Ordering::Acquire), 1);

        state.record_tick(&slot, true);
        assert!(!slot.disconnect.load(Ordering::Acquire));
        assert!(!close_signal.is_cancelled());

        state.record_tick(&slot, true);
        assert!(slot.disconnect.load(Ordering::Acquire));
        assert!(close_signal.is_cancelled());
    }

    #[tokio::test]
    async fn a_tick_with_no_drops_resets_the_consecutive_full_counter() {
        let state = test_state(3, 4);
        let (tx, _rx) = mpsc::channel(4);
        let close_signal = state.register(tx);
        let slot = Arc::clone(&state.clients.lock()[0]);

        state.record_tick(&slot, true);
        state.record_tick(&slot, true);
        assert_eq!(slot.consecutive_full.load(Ordering::Acquire), 2);

        state.record_tick(&slot, false);
        assert_eq!(slot.consecutive_full.load(Ordering::Acquire), 0);
        assert!(!slot.disconnect.load(Ordering::Acquire));
        assert!(!close_signal.is_cancelled());
    }

    #[tokio::test]
    async fn reap_closed_drops_clients_flagged_for_disconnect() {
        let state = test_state(1, 1);
        let (tx, _rx) = mpsc::channel(4);
        state.register(tx);
        assert_eq!(state.clients.lock().len(), 1);

        let slot = Arc::clone(&state.clients.lock()[0]);
        slot.disconnect.store(true, Ordering::Release);
        state.reap_closed();

        assert!(state.clients.lock().is_empty());
    }

    #[tokio::test]
    async fn reap_closed_drops_clients_whose_receiver_was_dropped() {
        let state = test_state(5, 1);
        let (tx, rx) = mpsc::channel(4);
        state.register(tx);
        drop(rx);

        state.reap_closed();
        assert!(state.clients.lock().is_empty());
    }

    #[tokio::test]
    async fn a_healthy_client_is_never_reaped() {
        let state = test_state(5, 4);
        let (tx, _rx) = mpsc::channel(4);
        state.register(tx);

        state.reap_closed();
        assert_eq!(state.clients.lock().len(), 1);
    }
}
