// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
// Quantifies trend strength regardless of direction:
//   1. +DM / -DM and True Range per bar.
//   2. Wilder's smoothing of +DM, -DM, TR.
//   3. +DI / -DI, DX = |+DI - -DI| / (+DI + -DI) * 100.
//   4. ADX = Wilder's smoothed average of DX.
//
// ADX > 25 trending, ADX < 20 ranging.
// =============================================================================

use crate::types::Bar;

/// Most recent ADX value from `bars` (oldest first).
///
/// Needs at least `2 * period + 1` bars: `period` transitions to seed the
/// smoothing plus `period` DX values to seed the ADX average.
pub fn calculate_adx(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let n = bars.len();

    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    let mut tr_vals = Vec::with_capacity(n - 1);

    for w in bars.windows(2) {
        let up_move = w[1].high - w[0].high;
        let down_move = w[0].low - w[1].low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });

        let tr = (w[1].high - w[1].low)
            .max((w[1].high - w[0].close).abs())
            .max((w[1].low - w[0].close).abs());
        tr_vals.push(tr);
    }

    // Initial smoothed sums over the first `period` transitions.
    let mut sm_plus: f64 = plus_dm[..period].iter().sum();
    let mut sm_minus: f64 = minus_dm[..period].iter().sum();
    let mut sm_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values = Vec::new();
    if let Some(dx) = dx_from(sm_plus, sm_minus, sm_tr) {
        dx_values.push(dx);
    }

    for i in period..tr_vals.len() {
        sm_plus = sm_plus - sm_plus / period_f + plus_dm[i];
        sm_minus = sm_minus - sm_minus / period_f + minus_dm[i];
        sm_tr = sm_tr - sm_tr / period_f + tr_vals[i];

        match dx_from(sm_plus, sm_minus, sm_tr) {
            Some(dx) => dx_values.push(dx),
            None => return None,
        }
    }

    if dx_values.len() < period {
        return None;
    }

    // ADX: Wilder's smoothed DX.
    let mut adx: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }

    adx.is_finite().then_some(adx)
}

fn dx_from(sm_plus: f64, sm_minus: f64, sm_tr: f64) -> Option<f64> {
    if sm_tr == 0.0 {
        return Some(0.0);
    }
    let plus_di = sm_plus / sm_tr * 100.0;
    let minus_di = sm_minus / sm_tr * 100.0;
    let di_sum = plus_di + minus_di;
    let dx = if di_sum == 0.0 {
        0.0
    } else {
        (plus_di - minus_di).abs() / di_sum * 100.0
    };
    dx.is_finite().then_some(dx)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BarSource;

    fn bar(high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp_ms: 0,
            open: (high + low) / 2.0,
            high,
            low,
            close,
            volume: None,
            source: BarSource::Provider("test".into()),
        }
    }

    #[test]
    fn adx_guards() {
        let bars = vec![bar(1.09, 1.07, 1.08); 20];
        assert!(calculate_adx(&bars, 0).is_none());
        assert!(calculate_adx(&bars[..10], 14).is_none());
    }

    #[test]
    fn strong_trend_high_adx() {
        let bars: Vec<Bar> = (0..60)
            .map(|i| {
                let base = 1.08 + i as f64 * 0.0020;
                bar(base + 0.0010, base - 0.0010, base + 0.0005)
            })
            .collect();
        let adx = calculate_adx(&bars, 14).unwrap();
        assert!(adx > 25.0, "steady trend should trend-read, got {adx}");
    }

    #[test]
    fn choppy_range_low_adx() {
        let bars: Vec<Bar> = (0..60)
            .map(|i| {
                let wobble = if i % 2 == 0 { 0.0008 } else { -0.0008 };
                let base = 1.08 + wobble;
                bar(base + 0.0010, base - 0.0010, base)
            })
            .collect();
        let adx = calculate_adx(&bars, 14).unwrap();
        assert!(adx < 25.0, "chop should read weak, got {adx}");
    }

    #[test]
    fn adx_in_range() {
        let bars: Vec<Bar> = (0..80)
            .map(|i| {
                let base = 1.08 + (i as f64 * 0.7).sin() * 0.003;
                bar(base + 0.0015, base - 0.0015, base)
            })
            .collect();
        let adx = calculate_adx(&bars, 14).unwrap();
        assert!((0.0..=100.0).contains(&adx));
    }
}
