//! Retry scheduling for transient failures.

/// Delay in milliseconds before retry number `retry_count` (1-based):
/// `base * 2^(retry_count - 1)`, capped.
pub fn backoff_millis(retry_count: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let exponent = retry_count.saturating_sub(1).min(63);
    base_ms
        .checked_mul(1_u64 << exponent)
        .unwrap_or(u64::MAX)
        .min(cap_ms)
}
