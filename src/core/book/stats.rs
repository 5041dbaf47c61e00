use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Liquidity and imbalance figures for one configured band, e.g. 2%.
#[derive(Debug, Clone, Copy)]
pub struct BandStats {
    pub pct: Decimal,
    pub bid_liquidity: Decimal,
    pub ask_liquidity: Decimal,
    pub delta: Decimal,
}

/// Pure statistics record over a book's current state (§4.7). Nothing here
/// mutates or even borrows the book past the call - every field is a value
/// copied out of it.
#[derive(Debug, Clone)]
pub struct Stats {
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub spread: Option<Decimal>,
    pub bands: Vec<BandStats>,
    pub total_bid_qty: Decimal,
    pub total_ask_qty: Decimal,
    pub total_delta: Decimal,
}

/// Sum of quantities for prices in `[lower, upper]`, using the map's sorted
/// order so the cost is proportional to the levels actually inside the
/// band, not the whole side.
fn sum_range(side: &BTreeMap<Decimal, Decimal>, lower: Decimal, upper: Decimal) -> Decimal {
    if lower > upper {
        return Decimal::ZERO;
    }
    side.range(lower..=upper).map(|(_, qty)| *qty).sum()
}

/// Compute the full statistics record for a book side pair. `bands` is the
/// configured set of percent thresholds (e.g. 0.5%, 2%, 10% expressed as
/// `0.005`, `0.02`, `0.10`). When a venue's protocol restricts depth, the
/// wider bands simply saturate at the liquidity actually present - this
/// function never synthesizes or extrapolates missing levels.
pub fn compute_stats(
    bids: &BTreeMap<Decimal, Decimal>,
    asks: &BTreeMap<Decimal, Decimal>,
    best_bid: Option<Decimal>,
    best_ask: Option<Decimal>,
    bands: &[Decimal],
) -> Stats {
    let mid_price = match (best_bid, best_ask) {
        (Some(b), Some(a)) => Some((b + a) / Decimal::from(2)),
        _ => None,
    };
    let spread = match (best_bid, best_ask) {
        (Some(b), Some(a)) => Some(a - b),
        _ => None,
    };

    let band_stats = bands
        .iter()
        .map(|pct| {
            let (bid_liquidity, ask_liquidity) = match (mid_price, best_bid, best_ask) {
                (Some(mid), Some(bb), Some(ba)) => {
                    let lower_bound = mid * (Decimal::ONE - *pct);
                    let upper_bound = mid * (Decimal::ONE + *pct);
                    (
                        sum_range(bids, lower_bound, bb),
                        sum_range(asks, ba, upper_bound),
                    )
                }
                _ => (Decimal::ZERO, Decimal::ZERO),
            };
            BandStats {
                pct: *pct,
                bid_liquidity,
                ask_liquidity,
                delta: bid_liquidity - ask_liquidity,
            }
        })
        .collect();

    let total_bid_qty: Decimal = bids.values().copied().sum();
    let total_ask_qty: Decimal = asks.values().copied().sum();

    Stats {
        best_bid,
        best_ask,
        mid_price,
        spread,
        bands: band_stats,
        total_bid_qty,
        total_ask_qty,
        total_delta: total_bid_qty - total_ask_qty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn side(levels: &[(Decimal, Decimal)]) -> BTreeMap<Decimal, Decimal> {
        levels.iter().copied().collect()
    }

    #[test]
    fn it_computes_mid_and_spread() {
        let bids = side(&[(dec!(100), dec!(2)), (dec!(99), dec!(1))]);
        let asks = side(&[(dec!(101), dec!(3)), (dec!(102), dec!(1))]);
        let stats = compute_stats(&bids, &asks, Some(dec!(100)), Some(dec!(101)), &[]);
        assert_eq!(stats.mid_price, Some(dec!(100.5)));
        assert_eq!(stats.spread, Some(dec!(1)));
    }

    #[test]
    fn bands_are_monotonically_non_decreasing_with_width() {
        let bids = side(&[
            (dec!(100), dec!(1)),
            (dec!(99), dec!(1)),
            (dec!(90), dec!(5)),
            (dec!(50), dec!(50)),
        ]);
        let asks = side(&[
            (dec!(101), dec!(1)),
            (dec!(102), dec!(1)),
            (dec!(110), dec!(5)),
            (dec!(150), dec!(50)),
        ]);
        let bands = vec![dec!(0.005), dec!(0.02), dec!(0.10)];
        let stats = compute_stats(&bids, &asks, Some(dec!(100)), Some(dec!(101)), &bands);
        assert!(stats.bands[2].bid_liquidity >= stats.bands[1].bid_liquidity);
        assert!(stats.bands[1].bid_liquidity >= stats.bands[0].bid_liquidity);
        assert!(stats.bands[2].ask_liquidity >= stats.bands[1].ask_liquidity);
        assert!(stats.bands[1].ask_liquidity >= stats.bands[0].ask_liquidity);
    }
}
