//! Reconnect backoff: capped exponential delay with jitter.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep as tokio_sleep;

#[cfg(test)]
const BASE_DELAY_MS: u64 = 5;
#[cfg(not(test))]
const BASE_DELAY_MS: u64 = 500;

#[cfg(test)]
const MAX_DELAY_MS: u64 = 1_000;
#[cfg(not(test))]
const MAX_DELAY_MS: u64 = 30_000;

/// Delay before reconnect attempt number `attempt` (0-based).
pub fn delay(attempt: u32) -> Duration {
    let pow = attempt.min(16); // prevent overflow
    let base = BASE_DELAY_MS.saturating_mul(1u64 << pow);
    let capped = base.min(MAX_DELAY_MS);
    let jitter = if capped == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..capped)
    };
    Duration::from_millis(capped.saturating_add(jitter).min(MAX_DELAY_MS))
}

pub async fn sleep(attempt: u32) {
    tokio_sleep(delay(attempt)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_cap() {
        for attempt in 0..40 {
            assert!(delay(attempt) <= Duration::from_millis(MAX_DELAY_MS));
        }
    }

    #[test]
    fn early_attempts_grow() {
        // Jitter aside, the deterministic floor doubles until the cap.
        let floor = |attempt: u32| BASE_DELAY_MS.saturating_mul(1 << attempt).min(MAX_DELAY_MS);
        assert!(floor(0) < floor(3));
        assert_eq!(floor(20u32.min(16)), MAX_DELAY_MS);
    }
}
