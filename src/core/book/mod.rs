use crate::core::types::{IncrementalUpdate, Snapshot};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Pure statistics kernel (component G, §4.7).
pub mod stats;

pub use stats::Stats;

/// One price level as returned by `top_n`/`aggregate_by_tick`, carrying the
/// running cumulative quantity from the top of that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelView {
    pub price: Decimal,
    pub quantity: Decimal,
    pub cumulative: Decimal,
}

/// `(1-p).floor()`-style bucket, rounded toward negative infinity.
fn floor_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    (price / tick).floor() * tick
}

/// Rounded toward positive infinity: `ceil(x) = -floor(-x)`.
fn ceil_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    -floor_to_tick(-price, tick)
}

/// Mutable per-(venue, symbol) order book (component B, §4.1).
///
/// Each side is a sorted map so `top_n`/`recompute_best` are bounded by the
/// number of levels actually touched, not a linear rescan: bids and asks
/// routinely carry thousands of levels and several venues push 50-200
/// updates per second, so a hash map plus lazy rescan is off the table.
#[derive(Debug, Default)]
pub struct OrderBook {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    best_bid: Option<Decimal>,
    best_ask: Option<Decimal>,
    last_applied_id: u64,
    malformed_count: u64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.best_bid
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.best_ask
    }

    pub fn last_applied_id(&self) -> u64 {
        self.last_applied_id
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed_count
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Initializes both sides from the snapshot levels, resets the cached
    /// best bid/ask, sets `last_applied_id` to the snapshot's id. Replaces
    /// any existing state unconditionally.
    pub fn load_snapshot(&mut self, snapshot: &Snapshot) {
        self.bids.clear();
        self.asks.clear();
        for level in &snapshot.bids {
            self.set_level(true, level.price, level.qty);
        }
        for level in &snapshot.asks {
            self.set_level(false, level.price, level.qty);
        }
        self.recompute_best();
        self.last_applied_id = snapshot.monotonic_id;
    }

    /// Applies an incremental update. A `is_snapshot` update is handled as
    /// a full replace built from the update's own levels, matching
    /// `load_snapshot`'s semantics exactly (invariant 4: idempotent replay).
    pub fn apply(&mut self, update: &IncrementalUpdate) {
        if update.is_snapshot {
            self.bids.clear();
            self.asks.clear();
            for level in &update.bids {
                self.set_level(true, level.price, level.qty);
            }
            for level in &update.asks {
                self.set_level(false, level.price, level.qty);
            }
            self.recompute_best();
            self.last_applied_id = update.final_id;
            return;
        }

        for level in &update.bids {
            self.set_level(true, level.price, level.qty);
        }
        for level in &update.asks {
            self.set_level(false, level.price, level.qty);
        }
        self.recompute_best();
        if update.final_id != 0 {
            self.last_applied_id = update.final_id;
        }
    }

    /// Zero quantity deletes the price; a negative quantity is a malformed
    /// level - dropped and counted, `apply` never errors for it.
    fn set_level(&mut self, is_bid: bool, price: Decimal, qty: Decimal) {
        let side = if is_bid {
            &mut self.bids
        } else {
            &mut self.asks
        };
        if qty.is_sign_negative() {
            self.malformed_count += 1;
            return;
        }
        if qty.is_zero() {
            side.remove(&price);
        } else {
            side.insert(price, qty);
        }
    }

    fn recompute_best(&mut self) {
        self.best_bid = self.bids.keys().next_back().copied();
        self.best_ask = self.asks.keys().next().copied();
    }

    /// Top `n` levels per side, highest-price-first for bids and
    /// lowest-price-first for asks, each carrying the running cumulative
    /// quantity from the top. `n` is clamped to the available depth.
    pub fn top_n(&self, n: usize) -> (Vec<LevelView>, Vec<LevelView>) {
        let bids = Self::views_from(self.bids.iter().rev().take(n));
        let asks = Self::views_from(self.asks.iter().take(n));
        (bids, asks)
    }

    /// Like `top_n`, but prices are bucketed to multiples of `tick` first:
    /// bids floor to the lower boundary, asks ceil to the upper, and
    /// quantities within a bucket sum before the top-N cut is taken.
    pub fn aggregate_by_tick(&self, tick: Decimal, n: usize) -> (Vec<LevelView>, Vec<LevelView>) {
        if tick.is_zero() {
            return self.top_n(n);
        }

        let mut bid_buckets: BTreeMap<Decimal, Decimal> = BTreeMap::new();
        for (price, qty) in &self.bids {
            *bid_buckets.entry(floor_to_tick(*price, tick)).or_default() += *qty;
        }
        let mut ask_buckets: BTreeMap<Decimal, Decimal> = BTreeMap::new();
        for (price, qty) in &self.asks {
            *ask_buckets.entry(ceil_to_tick(*price, tick)).or_default() += *qty;
        }

        let bids = Self::views_from(bid_buckets.iter().rev().take(n));
        let asks = Self::views_from(ask_buckets.iter().take(n));
        (bids, asks)
    }

    fn views_from<'a>(iter: impl Iterator<Item = (&'a Decimal, &'a Decimal)>) -> Vec<LevelView> {
        let mut cumulative = Decimal::ZERO;
        iter.map(|(price, qty)| {
            cumulative += *qty;
            LevelView {
                price: *price,
                quantity: *qty,
                cumulative,
            }
        })
        .collect()
    }

    /// Statistics record (component G, §4.7), delegated to the pure
    /// `stats` module so the computation itself never needs the book's
    /// lock held a moment longer than copying the two sides out.
    pub fn stats(&self, bands: &[Decimal]) -> Stats {
        stats::compute_stats(&self.bids, &self.asks, self.best_bid, self.best_ask, bands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{PriceLevel, VenueId};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn snapshot(bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) -> Snapshot {
        Snapshot {
            venue: VenueId::Binance,
            symbol: "BTCUSDT".to_string(),
            monotonic_id: 1,
            bids: bids
                .iter()
                .map(|(p, q)| PriceLevel::new(*p, *q))
                .collect(),
            asks: asks
                .iter()
                .map(|(p, q)| PriceLevel::new(*p, *q))
                .collect(),
            observed_at: Utc::now(),
        }
    }

    fn delta(
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
        is_snapshot: bool,
    ) -> IncrementalUpdate {
        IncrementalUpdate {
            venue: VenueId::Binance,
            symbol: "BTCUSDT".to_string(),
            event_time: Utc::now(),
            first_id: 0,
            final_id: 0,
            prev_id: 0,
            bids: bids.iter().map(|(p, q)| PriceLevel::new(*p, *q)).collect(),
            asks: asks.iter().map(|(p, q)| PriceLevel::new(*p, *q)).collect(),
            is_snapshot,
        }
    }

    #[test]
    fn it_loads_a_snapshot_and_reports_top_of_book() {
        let mut book = OrderBook::new();
        book.load_snapshot(&snapshot(
            &[(dec!(100), dec!(2)), (dec!(99), dec!(1))],
            &[(dec!(101), dec!(3)), (dec!(102), dec!(1))],
        ));

        assert_eq!(book.best_bid(), Some(dec!(100)));
        assert_eq!(book.best_ask(), Some(dec!(101)));

        let (bids, asks) = book.top_n(1);
        assert_eq!(bids, vec![LevelView { price: dec!(100), quantity: dec!(2), cumulative: dec!(2) }]);
        assert_eq!(asks, vec![LevelView { price: dec!(101), quantity: dec!(3), cumulative: dec!(3) }]);

        let stats = book.stats(&[]);
        assert_eq!(stats.mid_price, Some(dec!(100.5)));
        assert_eq!(stats.spread, Some(dec!(1)));
    }

    #[test]
    fn it_deletes_a_level_via_zero_quantity() {
        let mut book = OrderBook::new();
        book.load_snapshot(&snapshot(
            &[(dec!(100), dec!(2)), (dec!(99), dec!(1))],
            &[(dec!(101), dec!(3))],
        ));
        book.apply(&delta(&[(dec!(99), dec!(0))], &[], false));

        assert_eq!(book.best_bid(), Some(dec!(100)));
        let (bids, _) = book.top_n(10);
        assert!(bids.iter().all(|l| l.price != dec!(99)));
    }

    #[test]
    fn it_preserves_best_bid_below_best_ask_after_a_crossing_update() {
        let mut book = OrderBook::new();
        book.load_snapshot(&snapshot(
            &[(dec!(100), dec!(2))],
            &[(dec!(101), dec!(3)), (dec!(102), dec!(1))],
        ));
        book.apply(&delta(
            &[],
            &[(dec!(101), dec!(0)), (dec!(100.5), dec!(4))],
            false,
        ));

        assert_eq!(book.best_ask(), Some(dec!(100.5)));
        assert!(book.best_bid().unwrap() < book.best_ask().unwrap());
        let stats = book.stats(&[]);
        assert_eq!(stats.spread, Some(dec!(0.5)));
    }

    #[test]
    fn it_replaces_the_book_on_a_snapshot_flagged_update() {
        let mut book = OrderBook::new();
        book.load_snapshot(&snapshot(
            &[(dec!(100), dec!(2)), (dec!(99), dec!(1))],
            &[(dec!(101), dec!(3)), (dec!(102), dec!(1))],
        ));
        book.apply(&delta(&[(dec!(50), dec!(1))], &[(dec!(60), dec!(1))], true));

        let (bids, asks) = book.top_n(10);
        assert_eq!(bids.len(), 1);
        assert_eq!(asks.len(), 1);
        assert_eq!(bids[0].price, dec!(50));
        assert_eq!(asks[0].price, dec!(60));
    }

    #[test]
    fn negative_quantity_levels_are_dropped_and_counted() {
        let mut book = OrderBook::new();
        book.load_snapshot(&snapshot(&[(dec!(100), dec!(2))], &[(dec!(101), dec!(1))]));
        book.apply(&delta(&[(dec!(95), dec!(-1))], &[], false));
        assert_eq!(book.malformed_count(), 1);
        let (bids, _) = book.top_n(10);
        assert!(bids.iter().all(|l| l.price != dec!(95)));
    }

    #[test]
    fn top_n_is_a_prefix_of_a_larger_top_n() {
        let mut book = OrderBook::new();
        book.load_snapshot(&snapshot(
            &[(dec!(100), dec!(1)), (dec!(99), dec!(1)), (dec!(98), dec!(1))],
            &[(dec!(101), dec!(1)), (dec!(102), dec!(1)), (dec!(103), dec!(1))],
        ));
        let (bids2, _) = book.top_n(2);
        let (bids3, _) = book.top_n(3);
        assert_eq!(&bids3[..2], &bids2[..]);
    }

    #[test]
    fn aggregate_by_tick_conserves_total_quantity() {
        let mut book = OrderBook::new();
        book.load_snapshot(&snapshot(
            &[(dec!(100.1), dec!(1)), (dec!(100.4), dec!(2)), (dec!(99.9), dec!(3))],
            &[(dec!(101.05), dec!(1)), (dec!(101.2), dec!(2))],
        ));
        let (bids, _) = book.aggregate_by_tick(dec!(1), 10);
        let total: Decimal = bids.iter().map(|l| l.quantity).sum();
        assert_eq!(total, dec!(6));
    }
}
