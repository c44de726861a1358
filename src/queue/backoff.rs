use std::time::Duration;

/// Exponential retry delay with an upper cap.
///
/// `delay(attempt) = min(base * multiplier^(attempt - 1), max)`, never below 1 ms.
/// No jitter is applied, so the delay never shrinks as attempts grow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            multiplier: 2.0,
            max: Duration::from_millis(300_000),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows failed attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = self.multiplier.max(1.0);
        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max.as_millis().max(1) as f64;

        let raw = base_ms * multiplier.powi(exponent);
        let ms = if raw.is_finite() { raw.min(max_ms) } else { max_ms };

        Duration::from_millis((ms as u64).max(1))
    }
}
