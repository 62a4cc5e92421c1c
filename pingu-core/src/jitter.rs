use rand::prelude::*;
use std::time::Duration;

pub fn jitter(value: Duration) -> Duration {
    let random: u64 = thread_rng().gen_range(0, 10);
    Duration::from_secs(random) + value
}

pub async fn delay_with_jitter(value: Duration) {
    tokio::time::sleep(jitter(value)).await;
}

/// Like `delay_with_jitter`, but the whole delay is randomized rather than
/// padded, for use as a startup stagger (so a fleet of bots restarted at the
/// same time does not all hit the API in the same instant).
pub async fn random_delay(max: Duration) {
    let random: u64 = thread_rng().gen_range(0, max.as_secs().max(1));
    tokio::time::sleep(Duration::from_secs(random)).await;
}
