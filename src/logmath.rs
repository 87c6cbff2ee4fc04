//! Integer log-domain scores.
//!
//! Search scores are `i32` logarithms in a base slightly above one (1.0001 by
//! default), so that a unit of score is a tiny relative change in
//! probability. `WORST_SCORE` marks impossible or pruned states; every sum
//! involving it stays at `WORST_SCORE` instead of overflowing.

use crate::error::DecoderError;

/// Log-probability in `LogMath` units.
pub type Score = i32;

/// Sentinel for impossible states. Far enough from `i32::MIN` that adding a
/// handful of large negative scores cannot wrap.
pub const WORST_SCORE: Score = -0x2000_0000;

/// Upper clamp for positive log-likelihoods coming from density scorers.
pub const BEST_SCORE: Score = 0x2000_0000;

/// Saturating score addition.
#[inline]
pub fn add_scores(a: Score, b: Score) -> Score {
    if a <= WORST_SCORE || b <= WORST_SCORE {
        return WORST_SCORE;
    }
    (a as i64 + b as i64).clamp(WORST_SCORE as i64, BEST_SCORE as i64) as Score
}

/// Narrows a wide sum back into the score range.
#[inline]
pub fn clamp_score(total: i64) -> Score {
    total.clamp(WORST_SCORE as i64, BEST_SCORE as i64) as Score
}

/// Numerically stable `ln(exp(a) + exp(b))`.
#[inline]
pub fn log_sum_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogMath {
    base: f64,
    ln_base: f64,
}

impl LogMath {
    pub const DEFAULT_BASE: f64 = 1.0001;

    pub fn new(base: f64) -> Result<Self, DecoderError> {
        if !base.is_finite() || base <= 1.0 {
            return Err(DecoderError::config(format!(
                "log base must be a finite number above 1, got {base}"
            )));
        }
        Ok(Self {
            base,
            ln_base: base.ln(),
        })
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    /// Probability to score. Zero (or negative) probabilities map to
    /// `WORST_SCORE`.
    pub fn log(&self, prob: f64) -> Score {
        if prob <= 0.0 || prob.is_nan() {
            return WORST_SCORE;
        }
        self.from_ln(prob.ln())
    }

    /// Natural log to score, clamped to `[WORST_SCORE, BEST_SCORE]`.
    /// NaN has no meaningful score and also maps to `WORST_SCORE`; callers
    /// that must reject NaN check for it first.
    pub fn from_ln(&self, ln: f64) -> Score {
        if ln.is_nan() {
            return WORST_SCORE;
        }
        let scaled = (ln / self.ln_base).round();
        scaled.clamp(WORST_SCORE as f64, BEST_SCORE as f64) as Score
    }

    pub fn from_log10(&self, log10: f64) -> Score {
        self.from_ln(log10 * std::f64::consts::LN_10)
    }

    /// Score to natural log. `WORST_SCORE` maps to negative infinity.
    pub fn ln(&self, score: Score) -> f64 {
        if score <= WORST_SCORE {
            return f64::NEG_INFINITY;
        }
        score as f64 * self.ln_base
    }

    pub fn exp(&self, score: Score) -> f64 {
        self.ln(score).exp()
    }

    /// Log-add in the score domain.
    pub fn add(&self, a: Score, b: Score) -> Score {
        let sum = log_sum_exp(self.ln(a), self.ln(b));
        if sum == f64::NEG_INFINITY {
            WORST_SCORE
        } else {
            self.from_ln(sum)
        }
    }
}

impl Default for LogMath {
    fn default() -> Self {
        Self {
            base: Self::DEFAULT_BASE,
            ln_base: Self::DEFAULT_BASE.ln(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_scores_saturates_at_worst() {
        assert_eq!(add_scores(WORST_SCORE, 10), WORST_SCORE);
        assert_eq!(add_scores(-10, WORST_SCORE), WORST_SCORE);
        assert_eq!(add_scores(WORST_SCORE + 5, -100), WORST_SCORE);
        assert_eq!(add_scores(-3, -4), -7);
    }

    #[test]
    fn add_scores_never_wraps() {
        let big = BEST_SCORE - 1;
        assert_eq!(add_scores(big, big), BEST_SCORE);
        assert_eq!(add_scores(-0x1fff_ffff, -0x1fff_ffff), WORST_SCORE);
    }

    #[test]
    fn log_of_one_is_zero() {
        let lmath = LogMath::default();
        assert_eq!(lmath.log(1.0), 0);
        assert_eq!(lmath.log(0.0), WORST_SCORE);
        assert!(lmath.log(0.5) < 0);
    }

    #[test]
    fn ln_round_trips_within_one_unit() {
        let lmath = LogMath::default();
        let s = lmath.log(1e-10);
        let back = lmath.ln(s);
        assert!((back - 1e-10f64.ln()).abs() < 1e-3);
    }

    #[test]
    fn log_sum_exp_is_stable_for_large_magnitudes() {
        let v = log_sum_exp(-1000.0, -1000.0);
        assert!((v - (-1000.0 + 2f64.ln())).abs() < 1e-9);
        assert_eq!(log_sum_exp(f64::NEG_INFINITY, -3.0), -3.0);
        assert!(log_sum_exp(0.0, -800.0).is_finite());
    }

    #[test]
    fn score_add_of_halves_is_one() {
        let lmath = LogMath::default();
        let half = lmath.log(0.5);
        let total = lmath.add(half, half);
        assert!(total.abs() <= 1);
        assert_eq!(lmath.add(WORST_SCORE, WORST_SCORE), WORST_SCORE);
    }

    #[test]
    fn rejects_bad_base() {
        assert!(LogMath::new(1.0).is_err());
        assert!(LogMath::new(f64::NAN).is_err());
        assert!(LogMath::new(1.0003).is_ok());
    }
}
