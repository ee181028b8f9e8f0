use icn_types::{normalize_percent, TokenAmount};
use std::time::Duration;

// Weights of the composite bid score
pub const PRICE_WEIGHT: f64 = 0.40;
pub const REPUTATION_WEIGHT: f64 = 0.30;
pub const QUALITY_WEIGHT: f64 = 0.20;
pub const SPEED_WEIGHT: f64 = 0.10;

/// Breakdown of a bid's composite score, each component in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreComponents {
    pub price: f64,
    pub reputation: f64,
    pub quality: f64,
    pub speed: f64,
}

impl ScoreComponents {
    pub fn total(&self) -> f64 {
        PRICE_WEIGHT * self.price
            + REPUTATION_WEIGHT * self.reputation
            + QUALITY_WEIGHT * self.quality
            + SPEED_WEIGHT * self.speed
    }
}

/**
 * Scores a bid against the auction it was placed in.
 *
 * - Price is inverted against `max_price`: a free bid scores 1, a bid at the cap scores 0.
 * - Reputation and quality arrive on a 0-100 scale and are normalized to 0-1.
 * - Speed compares the bidder's own estimate with the execution timeout; an
 *   estimate at or beyond the timeout scores 0.
 */
pub fn score_components(
    price: TokenAmount,
    max_price: TokenAmount,
    reputation: f64,
    quality: f64,
    estimated: Duration,
    execution_timeout: Duration,
) -> ScoreComponents {
    let price = if max_price == 0 {
        0.0
    } else {
        (1.0 - price as f64 / max_price as f64).clamp(0.0, 1.0)
    };
    let speed = if execution_timeout.is_zero() {
        0.0
    } else {
        (1.0 - estimated.as_secs_f64() / execution_timeout.as_secs_f64()).max(0.0)
    };
    ScoreComponents {
        price,
        reputation: normalize_percent(reputation),
        quality: normalize_percent(quality),
        speed,
    }
}

pub fn composite_score(
    price: TokenAmount,
    max_price: TokenAmount,
    reputation: f64,
    quality: f64,
    estimated: Duration,
    execution_timeout: Duration,
) -> f64 {
    let score = score_components(price, max_price, reputation, quality, estimated, execution_timeout).total();
    tracing::trace!(price, max_price, reputation, quality, score, "Composite bid score");
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cheaper_bid_scores_higher_all_else_equal() {
        let t = Duration::from_secs(60);
        let e = Duration::from_secs(10);
        let cheap = composite_score(200, 500, 80.0, 80.0, e, t);
        let dear = composite_score(450, 500, 80.0, 80.0, e, t);
        assert!(cheap > dear);
    }

    #[test]
    fn components_are_clamped() {
        let c = score_components(10, 100, 250.0, -5.0, Duration::from_secs(120), Duration::from_secs(60));
        assert_eq!(c.reputation, 1.0);
        assert_eq!(c.quality, 0.0);
        assert_eq!(c.speed, 0.0);
        assert!((c.price - 0.9).abs() < 1e-9);
    }

    #[test]
    fn reputation_can_outweigh_price() {
        let t = Duration::from_secs(60);
        let e = Duration::from_secs(30);
        // 0.4*0.5 + 0.3*1.0 vs 0.4*0.6 + 0.3*0.5
        let trusted = composite_score(50, 100, 100.0, 80.0, e, t);
        let cheap = composite_score(40, 100, 50.0, 80.0, e, t);
        assert!(trusted > cheap);
    }
}
