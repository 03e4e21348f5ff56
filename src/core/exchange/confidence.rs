//! Per-update confidence scoring.
//!
//! Confidence is a product of a per-exchange baseline and three monotone
//! factors: delivery latency (lower is better), reported volume (higher
//! is better) and bid-ask spread (tighter is better). The result is
//! clamped to `[0, 1]`.

/// Relative bid-ask spread in percent of the mid price.
#[must_use]
pub fn spread_pct(bid: Option<f64>, ask: Option<f64>) -> Option<f64> {
    let (bid, ask) = (bid?, ask?);
    if !(bid.is_finite() && ask.is_finite()) || bid <= 0.0 || ask <= 0.0 || ask < bid {
        return None;
    }
    let mid = (bid + ask) / 2.0;
    Some((ask - bid) / mid * 100.0)
}

/// Combine the baseline and quality factors into a `[0, 1]` score.
#[must_use]
pub fn score(baseline: f64, latency_ms: f64, volume: Option<f64>, spread_pct: Option<f64>) -> f64 {
    (baseline * latency_factor(latency_ms) * volume_factor(volume) * spread_factor(spread_pct))
        .clamp(0.0, 1.0)
}

/// Decreasing in latency; 1.0 at zero, 0.5 at one second.
fn latency_factor(latency_ms: f64) -> f64 {
    1.0 / (1.0 + latency_ms.max(0.0) / 1000.0)
}

/// Increasing in volume within `[0.85, 1.0]`; 0.9 when unreported.
fn volume_factor(volume: Option<f64>) -> f64 {
    match volume {
        Some(v) if v.is_finite() && v >= 0.0 => 0.85 + 0.15 * (v / (v + 1_000.0)),
        _ => 0.9,
    }
}

/// Decreasing in spread within `[0.5, 1.0]`; 0.95 when quotes are missing.
fn spread_factor(spread_pct: Option<f64>) -> f64 {
    match spread_pct {
        Some(s) if s.is_finite() && s >= 0.0 => (1.0 - s / 10.0).clamp(0.5, 1.0),
        _ => 0.95,
    }
}
