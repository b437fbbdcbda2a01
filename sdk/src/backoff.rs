//! Staged reconnect pacing.
//!
//! A fresh link (or one that held for a while) retries immediately; a
//! flapping one backs off along a fixed schedule, saturating at the last
//! step. Time already spent connecting counts against the pending delay.

use std::time::Duration;

use tokio::time::Instant;

/// How long an unanswered handshake may sit before the channel is cycled.
pub const T_HANDSHAKE: Duration = Duration::from_secs(10);

/// How long a TCP connect may take before it counts as failed.
pub const T_TCP_CONNECT: Duration = Duration::from_secs(10);

#[rustfmt::skip]
static RECONNECT_DELAY_S: [u64; 124] = [
    0, 0, 0,                            // 3 immediate retries
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1,       // 1 Hz for 30 seconds
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2,       // 1/2 Hz for 1 minute
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4,
    4, 4, 4, 4, 4, 4, 4, 4, 4, 4,       // 1/4 Hz for 2 minutes
    8, 8, 8, 8, 8, 8, 8, 8, 8, 8,
    8, 8, 8, 8, 8, 8, 8, 8, 8, 8,
    8, 8, 8, 8, 8, 8, 8, 8, 8, 8,       // 1/8 Hz for 4 minutes
    16,                                 // 1/16 Hz thereafter
];

#[derive(Default)]
pub struct Backoff {
    idx: usize,
    last_attempt: Option<Instant>,
}

impl Backoff {
    /// Back to immediate-retry behaviour.
    pub fn reset(&mut self) {
        self.idx = 0;
        self.last_attempt = None;
    }

    /// Records the start of a connect attempt.
    pub fn mark_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self, now: Instant) -> Duration {
        let since_last = self.last_attempt.map(|at| now.duration_since(at));

        // revert to rapid reconnects when the last attempt is long past,
        // i.e. the previous connection was a good one.
        let reset_after = 2 * T_HANDSHAKE
            .max(T_TCP_CONNECT)
            .max(Duration::from_secs(RECONNECT_DELAY_S[RECONNECT_DELAY_S.len() - 1]));
        if since_last.is_none_or(|d| d > reset_after) {
            self.idx = 0;
        }

        let need = Duration::from_secs(RECONNECT_DELAY_S[self.idx]);
        let delay = need
            .saturating_sub(since_last.unwrap_or(Duration::MAX))
            // a minimum of 1ms keeps the state machine going through its
            // timer even when no delay is due.
            .max(Duration::from_millis(1));

        self.idx = (self.idx + 1).min(RECONNECT_DELAY_S.len() - 1);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::advance;

    /// One failed attempt that consumes no wall time.
    async fn fast_failure(backoff: &mut Backoff) -> Duration {
        let delay = backoff.next_delay(Instant::now());
        advance(delay).await;
        backoff.mark_attempt(Instant::now());
        delay
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_shape() {
        let mut backoff = Backoff::default();

        let mut delays = Vec::new();
        for _ in 0..10 {
            delays.push(fast_failure(&mut backoff).await.as_millis());
        }

        assert_eq!(delays, [1, 1, 1, 1000, 1000, 1000, 1000, 1000, 1000, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn saturates_at_the_last_step() {
        let mut backoff = Backoff::default();

        let mut last = Duration::ZERO;
        for _ in 0..RECONNECT_DELAY_S.len() + 5 {
            last = fast_failure(&mut backoff).await;
        }

        assert_eq!(last, Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn good_connection_resets_the_schedule() {
        let mut backoff = Backoff::default();
        for _ in 0..10 {
            fast_failure(&mut backoff).await;
        }

        // a connection that held for more than 2 * max(10, 10, 16)
        // seconds starts over at the front of the schedule.
        backoff.mark_attempt(Instant::now());
        advance(Duration::from_secs(33)).await;
        assert_eq!(
            backoff.next_delay(Instant::now()),
            Duration::from_millis(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_failures_consume_their_delay() {
        let mut backoff = Backoff::default();
        for _ in 0..4 {
            fast_failure(&mut backoff).await;
        }

        // the next step wants 1s; a connect attempt that already burned
        // 700ms only waits out the remaining 300ms.
        advance(Duration::from_millis(700)).await;
        assert_eq!(
            backoff.next_delay(Instant::now()),
            Duration::from_millis(300)
        );
    }
}
