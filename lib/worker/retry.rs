use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff applied to every RPC call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    /// Policy without delays, for tests and callers that retry elsewhere.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// Final error of a retried operation together with how far the retries got.
#[derive(Debug)]
pub struct RetryTerminal<E> {
    pub error: E,
    pub attempts: u32,
    pub exhausted_retryable: bool,
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or runs out of attempts.
///
/// `seed` feeds the deterministic jitter so concurrent calls for different blocks spread out
/// instead of retrying in lockstep. On success the attempt count is returned with the value.
pub async fn run_with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    seed: i64,
    mut op: F,
    mut is_retryable: R,
) -> Result<(T, u32), RetryTerminal<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(error) => error,
        };

        let retryable = is_retryable(&error);
        if !retryable || attempt >= max_attempts {
            return Err(RetryTerminal {
                error,
                attempts: attempt,
                exhausted_retryable: retryable,
            });
        }

        let delay = backoff_delay(policy, attempt, seed);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Delay before attempt `attempt + 1`: `initial * 2^(attempt-1)` capped at `max_backoff`,
/// plus up to `jitter`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, seed: i64) -> Duration {
    if policy.initial_backoff.is_zero() && policy.jitter.is_zero() {
        return Duration::ZERO;
    }

    let shift = attempt.saturating_sub(1).min(20);
    let exponential_ms = policy
        .initial_backoff
        .as_millis()
        .saturating_mul(1u128 << shift)
        .min(policy.max_backoff.as_millis());
    let jitter_ms = jitter_for(seed, attempt, policy.jitter.as_millis());

    let total_ms = exponential_ms.saturating_add(jitter_ms);
    Duration::from_millis(u64::try_from(total_ms).unwrap_or(u64::MAX))
}

fn jitter_for(seed: i64, attempt: u32, cap_ms: u128) -> u128 {
    if cap_ms == 0 {
        return 0;
    }

    // splitmix64 finalizer
    let mut x = (seed as u64) ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;

    u128::from(x) % (cap_ms + 1)
}
