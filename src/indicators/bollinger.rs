// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band (SMA), upper/lower at ±k standard deviations. The Band Width
// (BBW) is the normalised distance: (upper - lower) / middle * 100 — the
// volatility-regime input for the technical analyzer.

/// Result of a Bollinger Band calculation.
#[derive(Debug, Clone)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

/// Bands over the trailing `period` closes.
///
/// `None` with fewer than `period` points or a degenerate (zero) middle.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    width.is_finite().then_some(BollingerResult {
        upper,
        middle,
        lower,
        width,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (0..20).map(|i| 1.08 + i as f64 * 0.001).collect();
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.width > 0.0);
    }

    #[test]
    fn bollinger_insufficient_data() {
        assert!(calculate_bollinger(&[1.08, 1.09, 1.10], 20, 2.0).is_none());
    }

    #[test]
    fn bollinger_flat_series_zero_width() {
        let closes = vec![1.0850; 25];
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.width.abs() < 1e-12);
        assert!((bb.upper - bb.lower).abs() < 1e-12);
    }
}
