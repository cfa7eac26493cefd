// =============================================================================
// Synthetic market data — deterministic pseudo-random walk fallback
// =============================================================================
//
// Used only when every real provider failed and synthetic data is allowed
// (development default). The generator is seeded by (pair, timeframe,
// current hour) so repeated calls within the same hour return identical
// series, and bars are tagged `source = synthetic` so downstream logic never
// treats them as confirming evidence.
// =============================================================================

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

use crate::types::{Bar, BarSource, Pair, Quote, Timeframe};

/// Reference mid prices for common symbols; unknown pairs derive a price
/// from their seed so the walk is still stable.
fn base_price(pair: &Pair) -> f64 {
    match pair.as_str() {
        "EURUSD" => 1.0850,
        "GBPUSD" => 1.2700,
        "USDJPY" => 149.50,
        "AUDUSD" => 0.6550,
        "USDCAD" => 1.3600,
        "USDCHF" => 0.8800,
        "NZDUSD" => 0.6000,
        "EURGBP" => 0.8550,
        "EURJPY" => 162.20,
        "GBPJPY" => 189.90,
        "XAUUSD" => 2350.0,
        "XAGUSD" => 28.50,
        "BTCUSD" => 64_000.0,
        _ => {
            let h = seed_for(pair, Timeframe::H1, 0);
            1.0 + (h % 1000) as f64 / 1000.0
        }
    }
}

/// Derive a 64-bit seed from (pair, timeframe, hour bucket).
fn seed_for(pair: &Pair, timeframe: Timeframe, hour_bucket: i64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(pair.as_str().as_bytes());
    hasher.update(timeframe.to_string().as_bytes());
    hasher.update(hour_bucket.to_le_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is at least 8 bytes"))
}

/// Generate `count` synthetic bars ending at the most recent closed period.
pub fn synthetic_bars(pair: &Pair, timeframe: Timeframe, count: usize, now_ms: i64) -> Vec<Bar> {
    let hour_bucket = now_ms / 3_600_000;
    let mut rng = ChaCha8Rng::seed_from_u64(seed_for(pair, timeframe, hour_bucket));

    let period_ms = timeframe.period_ms();
    let last_open_ms = (now_ms / period_ms) * period_ms - period_ms;
    let first_open_ms = last_open_ms - period_ms * (count.saturating_sub(1)) as i64;

    let base = base_price(pair);
    // Per-bar volatility of roughly 5 basis points keeps the walk plausible
    // across timeframes without blowing through sanity bounds.
    let step_sigma = base * 0.0005;

    let mut price = base;
    let mut bars = Vec::with_capacity(count);
    for i in 0..count {
        let open = price;
        let drift: f64 = rng.gen_range(-1.0..1.0) * step_sigma;
        let close = (open + drift).max(base * 0.5);
        let wick_up: f64 = rng.gen_range(0.0..1.0) * step_sigma * 0.6;
        let wick_down: f64 = rng.gen_range(0.0..1.0) * step_sigma * 0.6;

        bars.push(Bar {
            timestamp_ms: first_open_ms + period_ms * i as i64,
            open,
            high: open.max(close) + wick_up,
            low: (open.min(close) - wick_down).max(base * 0.4),
            close,
            volume: Some(rng.gen_range(500.0..5000.0)),
            source: BarSource::Synthetic,
        });
        price = close;
    }
    bars
}

/// Generate a synthetic quote around the pair's reference price.
pub fn synthetic_quote(pair: &Pair, now_ms: i64) -> Quote {
    let hour_bucket = now_ms / 3_600_000;
    let mut rng = ChaCha8Rng::seed_from_u64(seed_for(pair, Timeframe::M1, hour_bucket));

    let base = base_price(pair);
    let mid = base * (1.0 + rng.gen_range(-0.001..0.001));
    let half_spread = pair.pip_size() * 0.6;

    Quote {
        pair: pair.clone(),
        bid: mid - half_spread,
        ask: mid + half_spread,
        timestamp_ms: now_ms,
        provider: "synthetic".to_string(),
    }
}
