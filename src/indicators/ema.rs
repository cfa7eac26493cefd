// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first value is seeded with the SMA of the first `period` closes.
// =============================================================================

/// Compute the EMA series for `closes` with the given look-back `period`.
///
/// Returns an empty vec when `period == 0` or the input is too short. The
/// series stops early if a non-finite value is produced.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev = ema;
    }
    result
}

/// Check the EMA-9 / EMA-21 / EMA-55 stack for full trend alignment.
///
/// `Some((bullish, strength))` when the stack is strictly ordered either
/// way; `strength = |EMA9 - EMA55| / EMA55`. `None` on mixed ordering or
/// insufficient data.
pub fn ema_trend_aligned(closes: &[f64]) -> Option<(bool, f64)> {
    if closes.len() < 55 {
        return None;
    }

    let e9 = *calculate_ema(closes, 9).last()?;
    let e21 = *calculate_ema(closes, 21).last()?;
    let e55 = *calculate_ema(closes, 55).last()?;

    let bullish = e9 > e21 && e21 > e55;
    let bearish = e9 < e21 && e21 < e55;
    if !bullish && !bearish {
        return None;
    }
    if e55 == 0.0 {
        return None;
    }

    let strength = (e9 - e55).abs() / e55;
    strength.is_finite().then_some((bullish, strength))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_guards() {
        assert!(calculate_ema(&[], 5).is_empty());
        assert!(calculate_ema(&[1.08, 1.09], 0).is_empty());
        assert!(calculate_ema(&[1.08, 1.09], 5).is_empty());
    }

    #[test]
    fn ema_seed_is_sma() {
        let closes = vec![1.08, 1.10, 1.12];
        let ema = calculate_ema(&closes, 3);
        assert_eq!(ema.len(), 1);
        assert!((ema[0] - 1.10).abs() < 1e-12);
    }

    #[test]
    fn ema_known_values() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = calculate_ema(&closes, 5);
        assert_eq!(ema.len(), 6);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        for (i, &c) in closes[5..].iter().enumerate() {
            expected = c * mult + expected * (1.0 - mult);
            assert!((ema[i + 1] - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn ema_stops_on_nan() {
        let closes = vec![1.0, 2.0, 3.0, f64::NAN, 5.0];
        assert_eq!(calculate_ema(&closes, 3).len(), 1);
    }

    #[test]
    fn trend_alignment() {
        let rising: Vec<f64> = (0..200).map(|i| 1.05 + i as f64 * 0.0005).collect();
        let (bullish, strength) = ema_trend_aligned(&rising).unwrap();
        assert!(bullish);
        assert!(strength > 0.0);

        let falling: Vec<f64> = (0..200).rev().map(|i| 1.05 + i as f64 * 0.0005).collect();
        let (bullish, _) = ema_trend_aligned(&falling).unwrap();
        assert!(!bullish);

        assert!(ema_trend_aligned(&vec![1.08; 200]).is_none());
        assert!(ema_trend_aligned(&rising[..50]).is_none());
    }
}
