use crate::core::book::{LevelView, Stats};
use crate::core::types::VenueId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One resting level as transmitted to clients (§6). Decimal fields are
/// always serialized as strings - a client never sees a JSON number for a
/// price or quantity, which would round-trip through a float in most
/// consumers.
#[derive(Debug, Clone, Serialize)]
pub struct WireLevel {
    pub price: String,
    pub quantity: String,
    pub cumulative: String,
}

impl From<&LevelView> for WireLevel {
    fn from(level: &LevelView) -> Self {
        Self {
            price: level.price.to_string(),
            quantity: level.quantity.to_string(),
            cumulative: level.cumulative.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
#[allow(clippy::large_enum_variant)]
pub enum OutboundFrame {
    #[serde(rename = "orderbook")]
    OrderBook {
        exchange: String,
        bids: Vec<WireLevel>,
        asks: Vec<WireLevel>,
    },
    #[serde(rename = "stats")]
    Stats {
        exchange: String,
        #[serde(rename = "bestBid")]
        best_bid: Option<String>,
        #[serde(rename = "bestAsk")]
        best_ask: Option<String>,
        #[serde(rename = "midPrice")]
        mid_price: Option<String>,
        spread: Option<String>,
        #[serde(rename = "bidLiquidity05Pct")]
        bid_liquidity_05pct: String,
        #[serde(rename = "askLiquidity05Pct")]
        ask_liquidity_05pct: String,
        #[serde(rename = "deltaLiquidity05Pct")]
        delta_liquidity_05pct: String,
        #[serde(rename = "bidLiquidity2Pct")]
        bid_liquidity_2pct: String,
        #[serde(rename = "askLiquidity2Pct")]
        ask_liquidity_2pct: String,
        #[serde(rename = "deltaLiquidity2Pct")]
        delta_liquidity_2pct: String,
        #[serde(rename = "bidLiquidity10Pct")]
        bid_liquidity_10pct: String,
        #[serde(rename = "askLiquidity10Pct")]
        ask_liquidity_10pct: String,
        #[serde(rename = "deltaLiquidity10Pct")]
        delta_liquidity_10pct: String,
        #[serde(rename = "totalBidsQty")]
        total_bids_qty: String,
        #[serde(rename = "totalAsksQty")]
        total_asks_qty: String,
        #[serde(rename = "totalDelta")]
        total_delta: String,
    },
}

impl OutboundFrame {
    pub fn order_book(venue: VenueId, bids: &[LevelView], asks: &[LevelView]) -> Self {
        OutboundFrame::OrderBook {
            exchange: venue.tag().to_string(),
            bids: bids.iter().map(WireLevel::from).collect(),
            asks: asks.iter().map(WireLevel::from).collect(),
        }
    }

    /// Maps the configured band list onto the fixed 0.5/2/10 pct wire shape.
    /// A band missing from `stats.bands` (e.g. because the server wasn't
    /// configured with it) serializes as zero rather than omitting the
    /// field, since the wire shape is fixed.
    pub fn stats(venue: VenueId, stats: &Stats) -> Self {
        let band = |pct: Decimal| {
            stats
                .bands
                .iter()
                .find(|b| b.pct == pct)
                .copied()
                .unwrap_or(crate::core::book::stats::BandStats {
                    pct,
                    bid_liquidity: Decimal::ZERO,
                    ask_liquidity: Decimal::ZERO,
                    delta: Decimal::ZERO,
                })
        };
        let b05 = band(Decimal::new(5, 3));
        let b2 = band(Decimal::new(2, 2));
        let b10 = band(Decimal::new(10, 2));

        OutboundFrame::Stats {
            exchange: venue.tag().to_string(),
            best_bid: stats.best_bid.map(|d| d.to_string()),
            best_ask: stats.best_ask.map(|d| d.to_string()),
            mid_price: stats.mid_price.map(|d| d.to_string()),
            spread: stats.spread.map(|d| d.to_string()),
            bid_liquidity_05pct: b05.bid_liquidity.to_string(),
            ask_liquidity_05pct: b05.ask_liquidity.to_string(),
            delta_liquidity_05pct: b05.delta.to_string(),
            bid_liquidity_2pct: b2.bid_liquidity.to_string(),
            ask_liquidity_2pct: b2.ask_liquidity.to_string(),
            delta_liquidity_2pct: b2.delta.to_string(),
            bid_liquidity_10pct: b10.bid_liquidity.to_string(),
            ask_liquidity_10pct: b10.ask_liquidity.to_string(),
            delta_liquidity_10pct: b10.delta.to_string(),
            total_bids_qty: stats.total_bid_qty.to_string(),
            total_asks_qty: stats.total_ask_qty.to_string(),
            total_delta: stats.total_delta.to_string(),
        }
    }
}

/// Inbound client control frame (§6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    #[serde(rename = "set_tick")]
    SetTick { tick: Decimal },
    #[serde(rename = "change_symbol")]
    ChangeSymbol { symbol: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::book::stats::BandStats;
    use rust_decimal_macros::dec;

    #[test]
    fn order_book_frame_serializes_with_type_tag() {
        let frame = OutboundFrame::order_book(VenueId::Binance, &[], &[]);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"orderbook\""));
        assert!(json.contains("\"exchange\":\"binance\""));
    }

    #[test]
    fn stats_frame_carries_decimal_strings_not_numbers() {
        let stats = Stats {
            best_bid: Some(dec!(100)),
            best_ask: Some(dec!(101)),
            mid_price: Some(dec!(100.5)),
            spread: Some(dec!(1)),
            bands: vec![BandStats {
                pct: dec!(0.005),
                bid_liquidity: dec!(5),
                ask_liquidity: dec!(3),
                delta: dec!(2),
            }],
            total_bid_qty: dec!(10),
            total_ask_qty: dec!(8),
            total_delta: dec!(2),
        };
        let frame = OutboundFrame::stats(VenueId::Okx, &stats);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"bestBid\":\"100\""));
        assert!(json.contains("\"bidLiquidity05Pct\":\"5\""));
    }

    #[test]
    fn inbound_set_tick_parses_decimal_tick() {
        let parsed: InboundFrame =
            serde_json::from_str(r#"{"type":"set_tick","tick":0.5}"#).unwrap();
        matches!(parsed, InboundFrame::SetTick { .. });
    }

    #[test]
    fn inbound_change_symbol_parses() {
        let parsed: InboundFrame =
            serde_json::from_str(r#"{"type":"change_symbol","symbol":"ETHUSDT"}"#).unwrap();
        match parsed {
            InboundFrame::ChangeSymbol { symbol } => assert_eq!(symbol, "ETHUSDT"),
            _ => panic!("wrong variant"),
        }
    }
}
