use crate::indicator::Series;
use marlin_execution::{
    market::MarketId,
    money::{Rounding, quantize},
};
use rand::Rng;
use rust_decimal::{Decimal, prelude::ToPrimitive};

/// Quote-denominated headroom left for a market before its exposure limits bind:
/// `min(concentration_limit · AUM, pov_limit · volume · price) − exposure`, floored at zero.
pub fn exposure_headroom(
    aum: f64,
    concentration_limit: f64,
    pov_limit: f64,
    volume: f64,
    price: f64,
    exposure: f64,
) -> f64 {
    let concentration_cap = concentration_limit * aum;
    let pov_cap = pov_limit * volume * price;
    (concentration_cap.min(pov_cap) - exposure).max(0.0)
}

/// Clip each weight so that `weight · spending_limit` stays within the market's exposure
/// headroom. Markets with no headroom drop out.
pub fn apply_exposure_caps(
    mut weights: Series,
    spending_limit: f64,
    headroom: &Series,
) -> Series {
    if spending_limit <= 0.0 {
        return Series::default();
    }
    for (market, weight) in weights.iter_mut() {
        let cap = headroom.get(market).copied().unwrap_or(0.0) / spending_limit;
        *weight = weight.min(cap);
    }
    weights.retain(|_, weight| *weight > 0.0);
    weights
}

fn ranked(weights: &Series) -> Vec<(MarketId, f64)> {
    let mut ranked: Vec<(MarketId, f64)> = weights
        .iter()
        .map(|(market, weight)| (market.clone(), *weight))
        .collect();
    ranked.sort_by(|(market_a, weight_a), (market_b, weight_b)| {
        weight_b
            .partial_cmp(weight_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| market_a.cmp(market_b))
    });
    ranked
}

/// Rank & prune weights for limit buys: choose the top-`k` prefix (renormalized to the total
/// weight) that maximizes the number of markets whose hypothetical size clears the exchange
/// minimum, then renormalize over the qualifying markets.
pub fn prune_limit_weights(
    spending_limit: f64,
    weights: &Series,
    prices: &Series,
    min_sizes: &Series,
) -> Series {
    prune_weights(spending_limit, weights, |market, amount| {
        match (prices.get(market), min_sizes.get(market)) {
            (Some(price), Some(min_size)) if *price > 0.0 => amount / price >= *min_size,
            _ => false,
        }
    })
}

/// Rank & prune weights for market buys: qualification is `amount ≥ min_market_funds`.
pub fn prune_market_weights(
    spending_limit: f64,
    weights: &Series,
    min_market_funds: &Series,
) -> Series {
    prune_weights(spending_limit, weights, |market, amount| {
        match min_market_funds.get(market) {
            Some(min_funds) => amount >= *min_funds,
            _ => false,
        }
    })
}

fn prune_weights<Qualifies>(
    spending_limit: f64,
    weights: &Series,
    qualifies: Qualifies,
) -> Series
where
    Qualifies: Fn(&MarketId, f64) -> bool,
{
    let total_weight: f64 = weights.values().sum();
    if total_weight <= 0.0 || spending_limit <= 0.0 {
        return Series::default();
    }

    let ranked = ranked(weights);
    let mut best = Series::default();
    let mut max_qualifying = 0usize;

    for prefix_len in 1..=ranked.len() {
        let prefix = &ranked[..prefix_len];
        let prefix_weight: f64 = prefix.iter().map(|(_, weight)| weight).sum();
        if prefix_weight <= 0.0 {
            continue;
        }

        let qualifying: Vec<(&MarketId, f64)> = prefix
            .iter()
            .map(|(market, weight)| {
                (market, weight / prefix_weight * total_weight * spending_limit)
            })
            .filter(|(market, amount)| qualifies(market, *amount))
            .collect();

        if qualifying.len() > max_qualifying {
            max_qualifying = qualifying.len();
            let qualifying_amount: f64 = qualifying.iter().map(|(_, amount)| amount).sum();
            best = qualifying
                .into_iter()
                .map(|(market, amount)| {
                    (market.clone(), amount / qualifying_amount * total_weight)
                })
                .collect();
        }
    }

    best
}

/// Compound each per-horizon spending target down to a per-tick fraction.
///
/// `over` is the number of ticks expected within the horizon (horizon ÷ last tick duration);
/// spending fraction `1 − (1 − w)^(1/over)` each tick recovers `w` over the horizon. A
/// non-positive or non-finite `over` yields the targets unchanged.
pub fn adjust_spending_target(targets: &Series, over: f64) -> Series {
    if !over.is_finite() || over <= 0.0 {
        return targets.clone();
    }
    let exponent = 1.0 / over;
    targets
        .iter()
        .map(|(market, target)| {
            let target = target.clamp(0.0, 1.0);
            let adjusted = 1.0 - (1.0 - target).powf(exponent);
            (market.clone(), if adjusted.is_finite() { adjusted } else { 0.0 })
        })
        .collect()
}

fn compute_sell_size_level1<R>(
    size: Decimal,
    fraction: Decimal,
    min_size: Decimal,
    increment: Decimal,
    rng: &mut R,
) -> Decimal
where
    R: Rng,
{
    let desired_size = fraction * size;
    let obeys_increment = quantize(desired_size, increment, Rounding::Up);
    if obeys_increment < min_size {
        // sell what you want in expectation
        let sell_probability = (obeys_increment / min_size).to_f64().unwrap_or(0.0);
        if rng.random::<f64>() < sell_probability {
            return min_size;
        }
        return Decimal::ZERO;
    }
    obeys_increment
}

/// Determine the size of the position to sell.
///
/// The returned size obeys the exchange increment, clears the exchange minimum (selling
/// `fraction` in expectation when the desired size is below it), and never leaves an
/// un-sellable remainder behind: when the leftover would fall below `min_size` the whole
/// position is sold instead.
pub fn compute_sell_size_with<R>(
    size: Decimal,
    fraction: Decimal,
    min_size: Decimal,
    increment: Decimal,
    rng: &mut R,
) -> Decimal
where
    R: Rng,
{
    let level1 = compute_sell_size_level1(size, fraction, min_size, increment, rng);
    if size - level1 < min_size {
        quantize(size, increment, Rounding::Down)
    } else {
        level1
    }
}

/// [`compute_sell_size_with`] using the thread-local RNG.
pub fn compute_sell_size(
    size: Decimal,
    fraction: Decimal,
    min_size: Decimal,
    increment: Decimal,
) -> Decimal {
    compute_sell_size_with(size, fraction, min_size, increment, &mut rand::rng())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};
    use rust_decimal_macros::dec;

    fn series(entries: &[(&str, f64)]) -> Series {
        entries
            .iter()
            .map(|(market, value)| (MarketId::new(*market), *value))
            .collect()
    }

    mod exposure {
        use super::*;

        #[test]
        fn test_headroom_binds_on_tighter_cap() {
            // concentration cap 250, pov cap 2000, exposure 240 -> 10 left
            assert_eq!(
                exposure_headroom(1000.0, 0.25, 0.5, 4.0, 1000.0, 240.0),
                10.0
            );
            // pov binds: 0.5 * 1 * 100 = 50
            assert_eq!(exposure_headroom(1000.0, 0.25, 0.5, 1.0, 100.0, 0.0), 50.0);
        }

        #[test]
        fn test_headroom_floors_at_zero() {
            assert_eq!(exposure_headroom(1000.0, 0.25, 1.0, 100.0, 100.0, 500.0), 0.0);
        }

        #[test]
        fn test_caps_clip_weights() {
            let weights = series(&[("ETH-USD", 1.0)]);
            let headroom = series(&[("ETH-USD", 10.0)]);
            let capped = apply_exposure_caps(weights, 500.0, &headroom);
            assert_eq!(capped.get(&MarketId::new("ETH-USD")), Some(&0.02));
        }

        #[test]
        fn test_exhausted_markets_drop_out() {
            let weights = series(&[("ETH-USD", 0.5), ("BTC-USD", 0.5)]);
            let headroom = series(&[("ETH-USD", 0.0), ("BTC-USD", 100.0)]);
            let capped = apply_exposure_caps(weights, 100.0, &headroom);
            assert!(!capped.contains_key(&MarketId::new("ETH-USD")));
            assert!(capped.contains_key(&MarketId::new("BTC-USD")));
        }
    }

    mod prune {
        use super::*;

        #[test]
        fn test_keeps_markets_above_minimum() {
            // 100 quote to spend; ETH gets 80, BTC 20. BTC's hypothetical size
            // 20/1000 = 0.02 is below its 0.05 minimum.
            let weights = series(&[("ETH-USD", 0.8), ("BTC-USD", 0.2)]);
            let prices = series(&[("ETH-USD", 100.0), ("BTC-USD", 1000.0)]);
            let min_sizes = series(&[("ETH-USD", 0.01), ("BTC-USD", 0.05)]);

            let pruned = prune_limit_weights(100.0, &weights, &prices, &min_sizes);
            assert_eq!(pruned.len(), 1);
            let eth = pruned.get(&MarketId::new("ETH-USD")).unwrap();
            assert!((eth - 1.0).abs() < 1e-9, "sole survivor takes the total weight");
        }

        #[test]
        fn test_prefers_wider_prefix_when_all_clear() {
            let weights = series(&[("ETH-USD", 0.6), ("BTC-USD", 0.4)]);
            let prices = series(&[("ETH-USD", 100.0), ("BTC-USD", 100.0)]);
            let min_sizes = series(&[("ETH-USD", 0.01), ("BTC-USD", 0.01)]);

            let pruned = prune_limit_weights(100.0, &weights, &prices, &min_sizes);
            assert_eq!(pruned.len(), 2);
            let total: f64 = pruned.values().sum();
            assert!((total - 1.0).abs() < 1e-9);
        }

        #[test]
        fn test_market_variant_uses_min_funds() {
            let weights = series(&[("ETH-USD", 0.9), ("DOGE-USD", 0.1)]);
            let min_funds = series(&[("ETH-USD", 10.0), ("DOGE-USD", 50.0)]);

            let pruned = prune_market_weights(100.0, &weights, &min_funds);
            assert!(pruned.contains_key(&MarketId::new("ETH-USD")));
            assert!(!pruned.contains_key(&MarketId::new("DOGE-USD")));
        }

        #[test]
        fn test_unknown_metadata_never_qualifies() {
            let weights = series(&[("GHOST-USD", 1.0)]);
            let pruned =
                prune_limit_weights(100.0, &weights, &Series::default(), &Series::default());
            assert!(pruned.is_empty());
        }
    }

    mod horizon {
        use super::*;

        #[test]
        fn test_identity_without_horizon() {
            let targets = series(&[("ETH-USD", 0.3)]);
            assert_eq!(adjust_spending_target(&targets, f64::NAN), targets);
            assert_eq!(adjust_spending_target(&targets, 0.0), targets);
        }

        #[test]
        fn test_per_tick_fraction_compounds_to_target() {
            let targets = series(&[("ETH-USD", 0.5)]);
            let over = 10.0;
            let adjusted = adjust_spending_target(&targets, over);
            let per_tick = adjusted.get(&MarketId::new("ETH-USD")).copied().unwrap();

            // spending per_tick for `over` ticks should recover the 0.5 target
            let compounded = 1.0 - (1.0 - per_tick).powf(over);
            assert!((compounded - 0.5).abs() < 1e-9);
            assert!(per_tick < 0.5);
        }

        #[test]
        fn test_full_weight_stays_full() {
            let targets = series(&[("ETH-USD", 1.0)]);
            let adjusted = adjust_spending_target(&targets, 10.0);
            assert_eq!(adjusted.get(&MarketId::new("ETH-USD")), Some(&1.0));
        }
    }

    mod sell_size {
        use super::*;

        #[test]
        fn test_round_trip_exact_or_full() {
            let min_size = dec!(0.01);
            let increment = dec!(0.001);
            let mut rng = StdRng::seed_from_u64(7);

            for size in [dec!(0.05), dec!(0.1), dec!(1), dec!(2.5)] {
                for fraction in [dec!(0), dec!(0.1), dec!(0.25), dec!(0.5), dec!(0.9), dec!(1)] {
                    let sell =
                        compute_sell_size_with(size, fraction, min_size, increment, &mut rng);
                    let remainder = size - sell;
                    assert!(
                        remainder == Decimal::ZERO || remainder >= min_size || sell == Decimal::ZERO,
                        "size={size} fraction={fraction} sell={sell}"
                    );
                    assert!(sell <= size);
                    assert!(
                        sell == Decimal::ZERO || (sell % increment).is_zero() || sell == min_size,
                        "sell {sell} must obey the increment"
                    );
                }
            }
        }

        #[test]
        fn test_full_fraction_sells_everything() {
            let mut rng = StdRng::seed_from_u64(7);
            let sell = compute_sell_size_with(dec!(1.5), dec!(1), dec!(0.01), dec!(0.001), &mut rng);
            assert_eq!(sell, dec!(1.5));
        }

        #[test]
        fn test_dust_remainder_forces_full_liquidation() {
            let mut rng = StdRng::seed_from_u64(7);
            // selling 0.095 of 0.1 would leave 0.005 < 0.01 of dust
            let sell = compute_sell_size_with(dec!(0.1), dec!(0.95), dec!(0.01), dec!(0.001), &mut rng);
            assert_eq!(sell, dec!(0.1));
        }

        #[test]
        fn test_probabilistic_branch_preserves_expectation() {
            let size = dec!(1);
            let fraction = dec!(0.002);
            let min_size = dec!(0.01);
            let increment = dec!(0.001);

            let mut rng = StdRng::seed_from_u64(42);
            let trials = 10_000;
            let mut sold = Decimal::ZERO;
            for _ in 0..trials {
                sold += compute_sell_size_with(size, fraction, min_size, increment, &mut rng);
            }
            let mean = (sold / Decimal::from(trials)).to_f64().unwrap();
            let desired = 0.002;
            assert!(
                (mean - desired).abs() < desired * 0.2,
                "mean sell size {mean} should approximate the desired fraction {desired}"
            );
        }

        #[test]
        fn test_zero_fraction_sells_nothing() {
            let mut rng = StdRng::seed_from_u64(7);
            let sell = compute_sell_size_with(dec!(1), dec!(0), dec!(0.01), dec!(0.001), &mut rng);
            assert_eq!(sell, Decimal::ZERO);
        }
    }
}
