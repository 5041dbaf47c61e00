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
use log::{debug, error, info, warn};
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

#[derive(Deserialize, Debug, Clone)]
struct RestDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

#[derive(Deserialize, Debug, Clone)]
struct WsDepthFrame {
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<(String, String)>,
    #[serde(rename = "a")]
    asks: Vec<(String, String)>,
}

fn levels_from_pairs(pairs: &[(String, String)]) -> Vec<PriceLevel> {
    pairs
        .iter()
        .filter_map(|(p, q)| {
            let price = Decimal::from_str(p).ok()?;
            let qty = Decimal::from_str(q).ok()?;
            Some(PriceLevel::new(price, qty))
        })
        .collect()
}

/// Splice point: the first buffered frame whose id range spans the
/// snapshot's `last_update_id` (§4.3). Frames entirely below the snapshot
/// are stale and skipped.
fn splice_index(buffered: &[WsDepthFrame], snapshot_id: u64) -> Option<usize> {
    buffered.iter().position(|frame| {
        frame.final_update_id > snapshot_id
            && frame.first_update_id <= snapshot_id + 1
            && snapshot_id + 1 <= frame.final_update_id
    })
}

/// Binance spot connector - out-of-band REST snapshot, in-band diff-depth
/// deltas over the combined-stream websocket (pattern 1, §4.3). The REST
/// snapshot is fetched exactly once per connect attempt, inside `run_once`,
/// and handed to `fetch_snapshot` through `snapshot_slot` - a second,
/// independent REST call here would risk returning a different
/// `lastUpdateId` than the one the buffered WS frames were spliced against.
pub struct BinanceConnector {
    symbol: Symbol,
    ws_base_url: String,
    rest_base_url: String,
    http: reqwest::Client,

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

impl BinanceConnector {
    pub fn new(symbol: Symbol, ws_base_url: String, rest_base_url: String) -> Self {
        let (update_tx, update_rx) = mpsc::channel(1024);
        Self {
            symbol,
            ws_base_url,
            rest_base_url,
            http: reqwest::Client::new(),
            state: SyncMutex::new(ConnectorState::Idle),
            health: SyncMutex::new(HealthStatus::idle(VenueId::Binance)),
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

    fn ws_endpoint(&self) -> String {
        format!(
            "{}/ws/{}@depth@100ms",
            self.ws_base_url,
            self.symbol.to_ascii_lowercase()
        )
    }

    fn rest_endpoint(&self) -> String {
        format!(
            "{}/api/v3/depth?symbol={}&limit=1000",
            self.rest_base_url, self.symbol
        )
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

    async fn fetch_rest_snapshot(&self) -> EngineResult<RestDepthSnapshot> {
        let resp = self.http.get(self.rest_endpoint()).send().await?;
        let parsed: RestDepthSnapshot = resp.json().await?;
        Ok(parsed)
    }

    fn to_snapshot(&self, raw: &RestDepthSnapshot) -> Snapshot {
        Snapshot {
            venue: VenueId::Binance,
            symbol: self.symbol.clone(),
            monotonic_id: raw.last_update_id,
            bids: levels_from_pairs(&raw.bids),
            asks: levels_from_pairs(&raw.asks),
            observed_at: Utc::now(),
        }
    }

    fn to_update(&self, frame: &WsDepthFrame, is_snapshot: bool) -> IncrementalUpdate {
        IncrementalUpdate {
            venue: VenueId::Binance,
            symbol: self.symbol.clone(),
            event_time: Utc::now(),
            first_id: frame.first_update_id,
            final_id: frame.final_update_id,
            prev_id: 0,
            bids: levels_from_pairs(&frame.bids),
            asks: levels_from_pairs(&frame.asks),
            is_snapshot,
        }
    }

    async fn send_update(&self, update: IncrementalUpdate) -> EngineResult<()> {
        self.update_tx
            .send(update)
            .await
            .map_err(|_| EngineError::DataTransmitError)
    }

    fn parse_text_frame(&self, msg: Message) -> EngineResult<Option<WsDepthFrame>> {
        match msg {
            Message::Text(text) => {
                let frame: WsDepthFrame = serde_json::from_str(&text)?;
                Ok(Some(frame))
            }
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => Ok(None),
            Message::Close(_) => Err(EngineError::Transport("venue closed connection".into())),
        }
    }

    /// One full dial -> subscribe -> sync -> stream attempt. Returns `Ok`
    /// only on graceful shutdown; any fault returns `Err` so the caller can
    /// back off and redial.
    async fn run_once(&self, first_connect: bool) -> EngineResult<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        self.set_state(ConnectorState::Dialing);
        let (ws_stream, _) = connect_async(self.ws_endpoint()).await?;
        let (write, mut read): (WsWriter, WsReader) = ws_stream.split();
        *self.writer.lock().await = Some(write);

        let attempt_cancel = self.shutdown.child_token();
        *self.attempt_cancel.lock() = attempt_cancel.clone();

        self.set_state(ConnectorState::Subscribing);
        self.set_state(ConnectorState::Syncing);

        let raw_snapshot = self.fetch_rest_snapshot().await?;
        debug!(
            "binance: fetched REST snapshot for {} at lastUpdateId={}",
            self.symbol, raw_snapshot.last_update_id
        );

        let mut buffered: Vec<WsDepthFrame> = Vec::new();
        let sync_deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let start = loop {
            if let Some(idx) = splice_index(&buffered, raw_snapshot.last_update_id) {
                break idx;
            }
            if tokio::time::Instant::now() >= sync_deadline {
                return Err(EngineError::SyncFailed {
                    snapshot_id: raw_snapshot.last_update_id,
                });
            }
            match tokio::time::timeout(Duration::from_millis(500), read.next()).await {
                Ok(Some(Ok(msg))) => {
                    if let Some(frame) = self.parse_text_frame(msg)? {
                        buffered.push(frame);
                    }
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => {
                    return Err(EngineError::Transport(
                        "stream closed while syncing".into(),
                    ))
                }
                Err(_) => continue,
            }
        };

        let snapshot = self.to_snapshot(&raw_snapshot);
        if first_connect {
            // Hand this exact REST snapshot - the one the buffered WS
            // frames were just spliced against - to `fetch_snapshot`
            // through the slot, rather than letting it issue its own,
            // independent REST call that could race to a different
            // `lastUpdateId`.
            *self.snapshot_slot.lock() = Some(snapshot.clone());
            self.snapshot_ready.notify_waiters();
        } else {
            // Post-reconnect resync: the engine's book is told to replace
            // its state via a snapshot-flagged update, since the initial
            // `fetch_snapshot` call already happened once at startup.
            self.send_update(IncrementalUpdate {
                venue: VenueId::Binance,
                symbol: self.symbol.clone(),
                event_time: Utc::now(),
                first_id: 0,
                final_id: raw_snapshot.last_update_id,
                prev_id: 0,
                bids: snapshot.bids.clone(),
                asks: snapshot.asks.clone(),
                is_snapshot: true,
            })
            .await?;
        }

        let mut last_final = raw_snapshot.last_update_id;
        for frame in &buffered[start..] {
            if frame.first_update_id != last_final + 1 && last_final != raw_snapshot.last_update_id
            {
                return Err(EngineError::SequenceGap {
                    expected: last_final + 1,
                    got: frame.first_update_id,
                });
            }
            self.send_update(self.to_update(frame, false)).await?;
            last_final = frame.final_update_id;
        }

        self.set_state(ConnectorState::Streaming);
        self.guard.reset();
        self.mark_connected(true);
        self.touch_message();
        info!("binance: {} streaming", self.symbol);

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
                        Some(Ok(msg)) => {
                            if let Some(frame) = self.parse_text_frame(msg)? {
                                if frame.first_update_id != last_final + 1 {
                                    self.mark_connected(false);
                                    return Err(EngineError::SequenceGap { expected: last_final + 1, got: frame.first_update_id });
                                }
                                self.send_update(self.to_update(&frame, false)).await?;
                                last_final = frame.final_update_id;
                                self.touch_message();
                            }
                        }
                        Some(Err(e)) => { self.mark_connected(false); return Err(e.into()); }
                        None => { self.mark_connected(false); return Err(EngineError::Transport("stream closed".into())); }
                    }
                }
            }
        }
    }

    async fn heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let mut writer = self.writer.lock().await;
                    if let Some(w) = writer.as_mut() {
                        if w.send(Message::Ping(Vec::new())).await.is_err() && self.guard.try_enter() {
                            warn!("binance: ping failed for {}, forcing reconnect", self.symbol);
                            self.attempt_cancel.lock().cancel();
                            self.guard.leave();
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(first: u64, last: u64) -> WsDepthFrame {
        WsDepthFrame {
            first_update_id: first,
            final_update_id: last,
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    #[test]
    fn splice_index_finds_the_frame_spanning_the_snapshot_id() {
        let buffered = vec![frame(100, 105), frame(106, 110), frame(111, 115)];
        assert_eq!(splice_index(&buffered, 108), Some(1));
    }

    #[test]
    fn splice_index_skips_frames_entirely_below_the_snapshot() {
        let buffered = vec![frame(90, 95), frame(96, 99)];
        assert_eq!(splice_index(&buffered, 150), None);
    }

    #[test]
    fn splice_index_is_none_when_the_buffer_has_not_caught_up_yet() {
        let buffered = vec![frame(100, 105)];
        assert_eq!(splice_index(&buffered, 200), None);
    }

    #[test]
    fn splice_index_accepts_the_exact_boundary_frame() {
        // snapshot_id + 1 lands exactly at the start of this frame's range.
        let buffered = vec![frame(50, 60), frame(61, 70)];
        assert_eq!(splice_index(&buffered, 60), Some(1));
    }

    #[tokio::test]
    async fn fetch_snapshot_returns_exactly_what_run_once_placed_in_the_slot() {
        let connector = BinanceConnector::new(
            "BTCUSDT".to_string(),
            String::new(),
            String::new(),
        );
        let raw = RestDepthSnapshot {
            last_update_id: 42,
            bids: vec![("100.0".to_string(), "1.0".to_string())],
            asks: vec![("101.0".to_string(), "2.0".to_string())],
        };
        let snapshot = connector.to_snapshot(&raw);
        *connector.snapshot_slot.lock() = Some(snapshot.clone());
        connector.snapshot_ready.notify_waiters();

        let handed_back = connector.fetch_snapshot().await.unwrap();
        assert_eq!(handed_back.monotonic_id, snapshot.monotonic_id);
        assert_eq!(handed_back.bids.len(), snapshot.bids.len());
    }
}

#[async_trait]
impl Connector for BinanceConnector {
    fn venue_tag(&self) -> VenueId {
        VenueId::Binance
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
                        warn!("binance: {} attempt failed: {}", runner.symbol, err);
                        runner.mark_reconnect();
                        runner.set_state(ConnectorState::Reconnecting);
                        let attempt = runner.guard.next_attempt();
                        if attempt > BACKOFF_MAX_ATTEMPTS {
                            error!(
                                "binance: {} exceeded max reconnect attempts, giving up",
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
            .map_err(|_| EngineError::Transport("timed out waiting for binance snapshot".into()))
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
