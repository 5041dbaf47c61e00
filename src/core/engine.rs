use crate::core::book::OrderBook;
use crate::core::connector::binance::BinanceConnector;
use crate::core::connector::coinbase::CoinbaseConnector;
use crate::core::connector::okx::OkxConnector;
use crate::core::connector::Connector;
use crate::core::error::{EngineError, EngineResult};
use crate::core::types::{HealthStatus, Symbol, VenueId};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Per-venue config needed to construct a connector (component H feeds this
/// in from `CoreCfg`).
#[derive(Debug, Clone)]
pub struct VenueEndpoints {
    pub ws_base_url: String,
    pub rest_base_url: String,
}

/// One venue's running ingest pipeline: the connector, its book, and the
/// task draining the canonical update channel into that book.
struct VenueHandle {
    connector: Arc<dyn Connector>,
    book: Arc<Mutex<OrderBook>>,
    ingest_task: JoinHandle<()>,
}

/// Multi-venue coordinator (component D, §4.5). Owns one `OrderBook` per
/// venue for the currently tracked symbol and keeps it fed from that venue's
/// connector. `Engine` is the only thing that ever calls `connect`,
/// `fetch_snapshot`, and `take_updates` on a connector - callers only ever
/// see `book_for`/`health_for`/`stats_for`.
pub struct Engine {
    symbol: Mutex<Symbol>,
    endpoints: HashMap<VenueId, VenueEndpoints>,
    venues: Mutex<HashMap<VenueId, VenueHandle>>,
}

impl Engine {
    pub fn new(symbol: Symbol, endpoints: HashMap<VenueId, VenueEndpoints>) -> Self {
        Self {
            symbol: Mutex::new(symbol),
            endpoints,
            venues: Mutex::new(HashMap::new()),
        }
    }

    fn build_connector(&self, venue: VenueId, symbol: &Symbol) -> Option<Arc<dyn Connector>> {
        let ep = self.endpoints.get(&venue)?;
        let connector: Arc<dyn Connector> = match venue {
            VenueId::Binance => Arc::new(BinanceConnector::new(
                symbol.clone(),
                ep.ws_base_url.clone(),
                ep.rest_base_url.clone(),
            )),
            VenueId::Okx => Arc::new(OkxConnector::new(symbol.clone(), ep.ws_base_url.clone())),
            VenueId::Coinbase => {
                Arc::new(CoinbaseConnector::new(symbol.clone(), ep.ws_base_url.clone()))
            }
        };
        Some(connector)
    }

    /// Brings up every configured venue for the engine's current symbol.
    /// Venues that fail to produce an initial snapshot are logged and
    /// skipped rather than aborting the whole engine - a single venue outage
    /// should not keep the others from streaming.
    pub async fn start(&self) -> EngineResult<()> {
        let symbol = self.symbol.lock().await.clone();
        for venue in VenueId::all() {
            self.spawn_venue(*venue, &symbol).await;
        }
        Ok(())
    }

    async fn spawn_venue(&self, venue: VenueId, symbol: &Symbol) {
        let connector = match self.build_connector(venue, symbol) {
            Some(c) => c,
            None => {
                info!("engine: no endpoint configured for {venue}, skipping");
                return;
            }
        };

        if let Err(e) = Arc::clone(&connector).connect().await {
            warn!("engine: {venue} failed to start: {e}");
            return;
        }

        // `fetch_snapshot` hands back the exact snapshot each connector's
        // own sync algorithm already spliced its buffered deltas against -
        // the engine never issues a second, independent snapshot fetch of
        // its own, which could disagree with the one deltas are continuous
        // from.
        let book = Arc::new(Mutex::new(OrderBook::new()));
        match connector.fetch_snapshot().await {
            Ok(snapshot) => {
                book.lock().await.load_snapshot(&snapshot);
            }
            Err(e) => {
                warn!("engine: {venue} initial snapshot failed: {e}");
            }
        }

        let mut updates = match connector.take_updates() {
            Ok(rx) => rx,
            Err(e) => {
                warn!("engine: {venue} update channel unavailable: {e}");
                return;
            }
        };

        let ingest_book = Arc::clone(&book);
        let ingest_task = tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                ingest_book.lock().await.apply(&update);
            }
        });

        self.venues.lock().await.insert(
            venue,
            VenueHandle {
                connector,
                book,
                ingest_task,
            },
        );
        info!("engine: {venue} venue pipeline online for {symbol}");
    }

    /// Coarse symbol change: tear every venue down, swap the tracked symbol,
    /// rebuild from scratch. A short settle delay after teardown gives
    /// in-flight venue sockets time to actually close before redialing,
    /// since some venues rate-limit rapid reconnects from the same peer.
    pub async fn change_symbol(&self, new_symbol: Symbol) -> EngineResult<()> {
        self.teardown_all().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        *self.symbol.lock().await = new_symbol.clone();
        for venue in VenueId::all() {
            self.spawn_venue(*venue, &new_symbol).await;
        }
        Ok(())
    }

    async fn teardown_all(&self) {
        let mut venues = self.venues.lock().await;
        for (venue, handle) in venues.drain() {
            handle.connector.close().await;
            handle.ingest_task.abort();
            info!("engine: {venue} venue pipeline torn down");
        }
    }

    pub async fn current_symbol(&self) -> Symbol {
        self.symbol.lock().await.clone()
    }

    pub async fn active_venues(&self) -> Vec<VenueId> {
        self.venues.lock().await.keys().copied().collect()
    }

    pub async fn book_for(&self, venue: VenueId) -> Option<Arc<Mutex<OrderBook>>> {
        self.venues.lock().await.get(&venue).map(|h| Arc::clone(&h.book))
    }

    pub async fn health_for(&self, venue: VenueId) -> Option<HealthStatus> {
        let connector = {
            let venues = self.venues.lock().await;
            venues.get(&venue).map(|h| Arc::clone(&h.connector))
        }?;
        Some(connector.health().await)
    }

    pub async fn all_health(&self) -> Vec<HealthStatus> {
        let connectors: Vec<_> = {
            let venues = self.venues.lock().await;
            venues.values().map(|h| Arc::clone(&h.connector)).collect()
        };
        let mut out = Vec::with_capacity(connectors.len());
        for c in connectors {
            out.push(c.health().await);
        }
        out
    }

    /// Idempotent full shutdown: tears every venue's connector down and
    /// aborts its ingest task, with a bounded wait so one venue hanging up
    /// doesn't stall process exit.
    pub async fn shutdown(&self) {
        let close_deadline = Duration::from_secs(5);
        match tokio::time::timeout(close_deadline, self.teardown_all()).await {
            Ok(()) => info!("engine: shutdown complete"),
            Err(_) => warn!("engine: shutdown exceeded {close_deadline:?}, forcing exit"),
        }
    }
}

/// Thin adapter so `?` composes cleanly for callers building an `Engine`
/// from config that could, in principle, name an unsupported venue.
pub fn require_endpoint<'a>(
    endpoints: &'a HashMap<VenueId, VenueEndpoints>,
    venue: VenueId,
) -> EngineResult<&'a VenueEndpoints> {
    endpoints
        .get(&venue)
        .ok_or_else(|| EngineError::Transport(format!("no endpoint configured for {venue}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> HashMap<VenueId, VenueEndpoints> {
        let mut m = HashMap::new();
        m.insert(
            VenueId::Binance,
            VenueEndpoints {
                ws_base_url: "wss://stream.binance.com:9443".into(),
                rest_base_url: "https://api.binance.com".into(),
            },
        );
        m
    }

    #[tokio::test]
    async fn an_engine_with_no_venues_started_has_no_active_venues() {
        let engine = Engine::new("BTCUSDT".to_string(), HashMap::new());
        assert!(engine.active_venues().await.is_empty());
        assert_eq!(engine.current_symbol().await, "BTCUSDT");
    }

    #[test]
    fn require_endpoint_reports_the_missing_venue() {
        let eps = endpoints();
        let err = require_endpoint(&eps, VenueId::Okx).unwrap_err();
        assert!(err.to_string().contains("okx"));
    }
}
