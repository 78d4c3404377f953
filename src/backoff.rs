use rand::Rng;
use std::time::Duration;

const BASE_DELAY_MS: u64 = 150;
const MAX_DELAY_MS: u64 = 2_000;

/// Calculate the wait before retry attempt `attempt` (0-based): exponential
/// growth from 150 ms, capped at 2 s, plus uniform jitter up to 30% of the
/// current delay.
pub fn retry_delay(attempt: u32) -> Duration {
    let exponential = BASE_DELAY_MS.saturating_mul(2u64.saturating_pow(attempt));
    let capped = exponential.min(MAX_DELAY_MS);

    let jitter_range = capped * 3 / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..=jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}
