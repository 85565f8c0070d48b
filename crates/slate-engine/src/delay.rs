//! Coordination delay from observed round-trip times.

use std::time::Duration;

/// Floor on the coordination delay.
pub const MIN_DELAY: Duration = Duration::from_secs(1);
/// Ceiling on the coordination delay.
pub const MAX_DELAY: Duration = Duration::from_secs(8);
/// Extra margin applied when no samples exist at all.
pub const NO_SAMPLE_MARGIN: Duration = Duration::from_secs(2);

/// Minimum delay plus twice the worst round trip plus half the mean round
/// trip, clamped to [`MAX_DELAY`]. With no samples the result is the
/// conservative `MIN_DELAY + NO_SAMPLE_MARGIN`.
pub fn compute_delay(samples: &[Duration]) -> Duration {
    if samples.is_empty() {
        return MIN_DELAY + NO_SAMPLE_MARGIN;
    }
    let max = samples
        .iter()
        .copied()
        .max()
        .unwrap_or(Duration::ZERO)
        .as_secs_f64();
    let avg = samples.iter().map(Duration::as_secs_f64).sum::<f64>() / samples.len() as f64;
    let raw = MIN_DELAY.as_secs_f64() + 2.0 * max + 0.5 * avg;
    Duration::from_secs_f64(raw.min(MAX_DELAY.as_secs_f64()))
}
