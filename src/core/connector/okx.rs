use super::state::{
    backoff_delay, ConnectorState, ReconnectGuard, BACKOFF_MAX_ATTEMPTS, HEARTBEAT_INTERVAL,
    STALE_TIMEOUT,
};
use super::{Connector, UpdateReceiver};
use crate::core::error::{EngineError, EngineResult};
use crate::core::types::{HealthStatus, IncrementalUpdate, PriceLevel, Snapshot, Symbol, VenueId};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use parking_lot::Mutex as SyncMutex;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

const QUOTE_SUFFIXES: &[&str] = &["USDT", "USDC", "BUSD", "DAI", "USD", "BTC", "ETH"];

/// OKX instrument ids are dash-separated (`BTC-USDT`); the canonical symbol
/// is the plain concatenation (`BTCUSDT`). Translate on ingress only - the
/// engine never sees venue-native symbol forms.
fn to_okx_inst_id(symbol: &str) -> String {
    for quote in QUOTE_SUFFIXES {
        if symbol.len() > quote.len() && symbol.ends_with(quote) {
            let (base, q) = symbol.split_at(symbol.len() - quote.len());
            return format!("{base}-{q}");
        }
    }
    let split = symbol.len().saturating_sub(4).max(1);
    let (base, quote) = symbol.split_at(split);
    format!("{base}-{quote}")
}

#[derive(Deserialize, Debug, Clone)]
struct OkxArg {
    #[allow(dead_code)]
    channel: String,
    #[allow(dead_code)]
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Deserialize, Debug, Clone)]
struct OkxBookData {
    asks: Vec<(String, String, String, String)>,
    bids: Vec<(String, String, String, String)>,
    #[serde(rename = "seqId")]
    seq_id: i64,
    #[serde(rename = "prevSeqId", default)]
    prev_seq_id: i64,
}

#[derive(Deserialize, Debug, Clone)]
struct OkxBookMessage {
    #[allow(dead_code)]
    arg: OkxArg,
    action: String,
    data: Vec<OkxBookData>,
}

#[derive(Deserialize, Debug, Clone)]
struct OkxEventMessage {
    event: String,
    #[serde(default)]
    msg: String,
}

fn levels_from_quad(pairs: &[(String, String, String, String)]) -> Vec<PriceLevel> {
    pairs
        .iter()
        .filter_map(|(p, q, _, _)| {
            let price = Decimal::from_str(p).ok()?;
            let qty = Decimal::from_str(q).ok()?;
            Some(PriceLevel::new(price, qty))
        })
        .collect()
}

/// OKX connector - in-band snapshot + in-band deltas (pattern 2, §4.3). The
/// push stream's first `books` frame is the full snapshot; every later
/// frame is a delta continuity-checked against `prevSeqId`.
pub struct OkxConnector {
    symbol: Symbol,
    ws_base_url: String,
    inst_id: String,

    state: SyncMutex<ConnectorState>,
    health: SyncMutex<HealthStatus>,
    guard: ReconnectGuard,
    last_message_ms: AtomicI64,

    writer: AsyncMutex<Option<WsWriter>>,
    attempt_cancel: SyncMutex<CancellationToken>,
    shutdown: CancellationToken,

    snapshot_slot: SyncMutex<Option<Snapshot>>,
    snapshot_ready: Notify,

    update_tx: mpsc::Sender<IncrementalUpdate>,
    update_rx: StdMutex<Option<UpdateReceiver>>,

    task_handle: SyncMutex<Option<JoinHandle<()>>>,
    heartbeat_handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl OkxConnector {
    pub fn new(symbol: Symbol, ws_base_url: String) -> Self {
        let (update_tx, update_rx) = mpsc::channel(1024);
        let inst_id = to_okx_inst_id(&symbol);
        Self {
            symbol,
            ws_base_url,
            inst_id,
            state: SyncMutex::new(ConnectorState::Idle),
            health: SyncMutex::new(HealthStatus::idle(VenueId::Okx)),
            guard: ReconnectGuard::new(),
            last_message_ms: AtomicI64::new(0),
            writer: AsyncMutex::new(None),
            attempt_cancel: SyncMutex::new(CancellationToken::new()),
            shutdown: CancellationToken::new(),
            snapshot_slot: SyncMutex::new(None),
            snapshot_ready: Notify::new(),
            update_tx,
            update_rx: StdMutex::new(Some(update_rx)),
            task_handle: SyncMutex::new(None),
            heartbeat_handle: SyncMutex::new(None),
        }
    }

    fn set_state(&self, state: ConnectorState) {
        *self.state.lock() = state;
        self.health.lock().state = state;
    }

    fn touch_message(&self) {
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        let mut h = self.health.lock();
        h.last_message_at = Some(Utc::now());
        h.message_count += 1;
    }

    fn millis_since_last_message(&self) -> i64 {
        let last = self.last_message_ms.load(Ordering::Acquire);
        if last == 0 {
            return 0;
        }
        Utc::now().timestamp_millis() - last
    }

    fn mark_connected(&self, connected: bool) {
        self.health.lock().connected = connected;
    }

    fn mark_reconnect(&self) {
        let mut h = self.health.lock();
        h.error_count += 1;
        h.last_reconnect_at = Some(Utc::now());
    }

    fn to_snapshot(&self, data: &OkxBookData) -> Snapshot {
        Snapshot {
            venue: VenueId::Okx,
            symbol: self.symbol.clone(),
            monotonic_id: data.seq_id.max(0) as u64,
            bids: levels_from_quad(&data.bids),
            asks: levels_from_quad(&data.asks),
            observed_at: Utc::now(),
        }
    }

    fn to_update(&self, data: &OkxBookData, is_snapshot: bool) -> IncrementalUpdate {
        IncrementalUpdate {
            venue: VenueId::Okx,
            symbol: self.symbol.clone(),
            event_time: Utc::now(),
            first_id: 0,
            final_id: data.seq_id.max(0) as u64,
            prev_id: data.prev_seq_id.max(0) as u64,
            bids: levels_from_quad(&data.bids),
            asks: levels_from_quad(&data.asks),
            is_snapshot,
        }
    }

    async fn send_update(&self, update: IncrementalUpdate) -> EngineResult<()> {
        self.update_tx
            .send(update)
            .await
            .map_err(|_| EngineError::DataTransmitError)
    }

    async fn run_once(&self, first_connect: bool) -> EngineResult<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        self.set_state(ConnectorState::Dialing);
        let (ws_stream, _) = connect_async(&self.ws_base_url).await?;
        let (mut write, mut read): (WsWriter, WsReader) = ws_stream.split();

        let attempt_cancel = self.shutdown.child_token();
        *self.attempt_cancel.lock() = attempt_cancel.clone();

        self.set_state(ConnectorState::Subscribing);
        let subscribe = serde_json::json!({
            "op": "subscribe",
            "args": [{"channel": "books", "instId": self.inst_id}],
        });
        write.send(Message::Text(subscribe.to_string())).await?;
        *self.writer.lock().await = Some(write);

        self.set_state(ConnectorState::Syncing);
        let mut last_final: u64 = 0;
        let sync_deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            if tokio::time::Instant::now() >= sync_deadline {
                return Err(EngineError::SyncFailed { snapshot_id: 0 });
            }
            let msg = match tokio::time::timeout(Duration::from_secs(5), read.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => {
                    return Err(EngineError::Transport(
                        "stream closed while syncing".into(),
                    ))
                }
                Err(_) => continue,
            };
            let Message::Text(text) = msg else { continue };

            if let Ok(event) = serde_json::from_str::<OkxEventMessage>(&text) {
                if event.event == "error" {
                    return Err(EngineError::SubscriptionRejected(event.msg));
                }
                if event.event == "subscribe" {
                    continue;
                }
            }

            let book: OkxBookMessage = match serde_json::from_str(&text) {
                Ok(b) => b,
                Err(_) => continue,
            };
            let Some(data) = book.data.first() else {
                continue;
            };
            if book.action == "snapshot" {
                let snapshot = self.to_snapshot(data);
                last_final = snapshot.monotonic_id;
                if first_connect {
                    *self.snapshot_slot.lock() = Some(snapshot);
                    self.snapshot_ready.notify_waiters();
                } else {
                    self.send_update(self.to_update(data, true)).await?;
                }
                break;
            }
        }

        self.set_state(ConnectorState::Streaming);
        self.guard.reset();
        self.mark_connected(true);
        self.touch_message();
        info!("okx: {} streaming", self.symbol);

        let mut stale_check = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.mark_connected(false);
                    return Ok(());
                }
                _ = attempt_cancel.cancelled() => {
                    self.mark_connected(false);
                    return Err(EngineError::Transport("heartbeat-triggered reconnect".into()));
                }
                _ = stale_check.tick() => {
                    if self.millis_since_last_message() > STALE_TIMEOUT.as_millis() as i64 {
                        self.mark_connected(false);
                        return Err(EngineError::Transport("stale connection, no liveness signal".into()));
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            let book: OkxBookMessage = match serde_json::from_str(&text) {
                                Ok(b) => b,
                                Err(_) => continue,
                            };
                            let Some(data) = book.data.first() else { continue };
                            if book.action != "update" {
                                continue;
                            }
                            let prev = data.prev_seq_id.max(0) as u64;
                            if prev != last_final {
                                self.mark_connected(false);
                                return Err(EngineError::SequenceGap { expected: last_final, got: prev });
                            }
                            self.send_update(self.to_update(data, false)).await?;
                            last_final = data.seq_id.max(0) as u64;
                            self.touch_message();
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => { self.mark_connected(false); return Err(e.into()); }
                        None => { self.mark_connected(false); return Err(EngineError::Transport("stream closed".into())); }
                    }
                }
            }
        }
    }

    async fn heartbeat_loop(&self) {
        // OKX's public channel expects a plain "ping" text frame and
        // replies with "pong"; liveness is otherwise tracked passively via
        // `touch_message` on every received frame.
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let mut writer = self.writer.lock().await;
                    if let Some(w) = writer.as_mut() {
                        if w.send(Message::Text("ping".into())).await.is_err() && self.guard.try_enter() {
                            warn!("okx: ping failed for {}, forcing reconnect", self.symbol);
                            self.attempt_cancel.lock().cancel();
                            self.guard.leave();
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Connector for OkxConnector {
    fn venue_tag(&self) -> VenueId {
        VenueId::Okx
    }

    fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    async fn connect(self: Arc<Self>) -> EngineResult<()> {
        if self.task_handle.lock().is_some() {
            return Ok(());
        }

        let heartbeat = Arc::clone(&self);
        let heartbeat_handle = tokio::spawn(async move { heartbeat.heartbeat_loop().await });
        *self.heartbeat_handle.lock() = Some(heartbeat_handle);

        let runner = Arc::clone(&self);
        let run_handle = tokio::spawn(async move {
            let mut first_connect = true;
            loop {
                if runner.shutdown.is_cancelled() {
                    return;
                }
                match runner.run_once(first_connect).await {
                    Ok(()) => return,
                    Err(err) => {
                        warn!("okx: {} attempt failed: {}", runner.symbol, err);
                        runner.mark_reconnect();
                        runner.set_state(ConnectorState::Reconnecting);
                        let attempt = runner.guard.next_attempt();
                        if attempt > BACKOFF_MAX_ATTEMPTS {
                            error!(
                                "okx: {} exceeded max reconnect attempts, giving up",
                                runner.symbol
                            );
                            runner.set_state(ConnectorState::Closed);
                            return;
                        }
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
                first_connect = false;
            }
        });
        *self.task_handle.lock() = Some(run_handle);

        Ok(())
    }

    async fn fetch_snapshot(&self) -> EngineResult<Snapshot> {
        let wait = async {
            loop {
                if let Some(snapshot) = self.snapshot_slot.lock().take() {
                    return snapshot;
                }
                self.snapshot_ready.notified().await;
            }
        };
        tokio::time::timeout(Duration::from_secs(30), wait)
            .await
            .map_err(|_| EngineError::Transport("timed out waiting for okx snapshot".into()))
    }

    fn take_updates(&self) -> EngineResult<UpdateReceiver> {
        self.update_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(EngineError::DataTransmitError)
    }

    async fn health(&self) -> HealthStatus {
        self.health.lock().clone()
    }

    async fn close(&self) {
        self.set_state(ConnectorState::Closed);
        self.shutdown.cancel();
        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }
        if let Some(handle) = self.heartbeat_handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_translates_canonical_symbol_to_okx_inst_id() {
        assert_eq!(to_okx_inst_id("BTCUSDT"), "BTC-USDT");
        assert_eq!(to_okx_inst_id("ETHUSDC"), "ETH-USDC");
        assert_eq!(to_okx_inst_id("ETHBTC"), "ETH-BTC");
    }
}
