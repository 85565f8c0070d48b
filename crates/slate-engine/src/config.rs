use std::time::Duration;

/// Tunables for the coordination engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window an acknowledged send waits for its ack.
    pub ack_timeout: Duration,
    /// Total send attempts allowed per retried message.
    pub max_retries: u32,
    /// Base backoff; the delay scheduled after attempt `k` (1-indexed) times
    /// out is `base * 2^(k-1)`.
    pub retry_backoff_base: Duration,
    /// Upper bound on waiting for a clock resync before falling back to
    /// local time.
    pub resync_deadline: Duration,
    /// Capacity of the recently-seen message id window.
    pub seen_ids_capacity: usize,
    /// Driver sleep between drive steps outside the fine wait window.
    pub tick_interval: Duration,
    /// Driver sleep between polls inside the fine wait window.
    pub fine_tick: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff_base: Duration::from_millis(500),
            resync_deadline: Duration::from_secs(10),
            seen_ids_capacity: 512,
            tick_interval: Duration::from_millis(50),
            fine_tick: Duration::from_millis(5),
        }
    }
}

impl EngineConfig {
    /// Backoff scheduled after the `attempts_done`-th send times out:
    /// 0.5 s, 1 s, 2 s, ... with the default base.
    pub fn retry_backoff(&self, attempts_done: u32) -> Duration {
        let exponent = attempts_done.saturating_sub(1).min(16);
        self.retry_backoff_base * (1_u32 << exponent)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::EngineConfig;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.ack_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_backoff_base, Duration::from_millis(500));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.retry_backoff(1), Duration::from_millis(500));
        assert_eq!(cfg.retry_backoff(2), Duration::from_secs(1));
        assert_eq!(cfg.retry_backoff(3), Duration::from_secs(2));
    }

    #[test]
    fn backoff_exponent_saturates() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.retry_backoff(0), cfg.retry_backoff(1));
        assert_eq!(cfg.retry_backoff(40), cfg.retry_backoff(17));
    }
}
