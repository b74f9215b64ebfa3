use rand::Rng;
use std::time::Duration;

/// Delay before provisioning resumes after `failures` consecutive failed
/// creates: doubles from `base_ms`, capped at `max_ms`, with up to 25% jitter.
pub fn create_backoff(failures: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let delay_ms = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    let jitter_ms = if delay_ms >= 4 {
        rand::thread_rng().gen_range(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter_ms).min(max_ms))
}
