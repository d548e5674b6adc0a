use std::time::Duration;

/// Longest delay between reconnection attempts of a permanent bridge.
pub const PERMANENT_BACKOFF_CAP: Duration = Duration::from_secs(600);
/// Scheduled bridges retry within a bounded window, so they back off less.
pub const SCHEDULED_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Exponential backoff with ±25 % jitter: `base × 2^retry`, capped, then
/// spread so a fleet of bridges does not reconnect in lockstep.
pub fn backoff_delay(
    base: Duration,
    retry_count: u32,
    cap: Duration,
    rng: &mut fastrand::Rng,
) -> Duration {
    let factor = 2u32.saturating_pow(retry_count.min(16));
    let capped = base.saturating_mul(factor).min(cap);

    let millis = capped.as_millis() as u64;
    let spread = millis / 4;
    let jittered = millis - spread + rng.u64(0..=spread * 2);
    Duration::from_millis(jittered)
}
