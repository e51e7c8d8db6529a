/// Approximates how many model tokens a piece of text costs.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Characters-per-token heuristic. Rounds up, so any non-empty text costs
/// at least one token.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: f32,
}

impl CharRatioEstimator {
    pub const DEFAULT_RATIO: f32 = 4.0;

    /// Non-positive or non-finite ratios fall back to the default.
    pub fn new(chars_per_token: f32) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            Self::DEFAULT_RATIO
        };
        Self { chars_per_token }
    }

    pub fn ratio(&self) -> f32 {
        self.chars_per_token
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RATIO)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        let chars = text.chars().count();
        (chars as f64 / f64::from(self.chars_per_token)).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up() {
        let e = CharRatioEstimator::default();
        assert_eq!(e.estimate(""), 0);
        assert_eq!(e.estimate("a"), 1);
        assert_eq!(e.estimate("abcd"), 1);
        assert_eq!(e.estimate("abcde"), 2);
    }

    #[test]
    fn counts_chars_not_bytes() {
        let e = CharRatioEstimator::new(2.0);
        assert_eq!(e.estimate("éé"), 1);
    }

    #[test]
    fn bad_ratio_falls_back() {
        assert_eq!(CharRatioEstimator::new(0.0).ratio(), 4.0);
        assert_eq!(CharRatioEstimator::new(f32::NAN).ratio(), 4.0);
    }
}
