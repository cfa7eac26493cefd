// =============================================================================
// Rate of Change (ROC) — momentum
// =============================================================================
//
//   ROC = ((close - close_n) / close_n) * 100

/// ROC series, one value per close starting at index `period`.
pub fn calculate_roc(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period);
    for i in period..closes.len() {
        let prev = closes[i - period];
        if prev == 0.0 {
            result.push(0.0);
        } else {
            result.push((closes[i] - prev) / prev * 100.0);
        }
    }
    result
}

/// Most recent ROC value.
pub fn current_roc(closes: &[f64], period: usize) -> Option<f64> {
    calculate_roc(closes, period).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roc_basic() {
        let closes: Vec<f64> = (0..20).map(|i| 1.08 * (1.0 + i as f64 * 0.01)).collect();
        let roc = calculate_roc(&closes, 14);
        assert!(!roc.is_empty());
        assert!(roc.iter().all(|v| *v > 0.0));
    }

    #[test]
    fn roc_insufficient_data() {
        assert!(calculate_roc(&[1.08, 1.09, 1.10], 14).is_empty());
    }

    #[test]
    fn current_roc_sign() {
        let falling: Vec<f64> = (0..20).rev().map(|i| 1.08 + i as f64 * 0.001).collect();
        assert!(current_roc(&falling, 14).unwrap() < 0.0);
    }
}
