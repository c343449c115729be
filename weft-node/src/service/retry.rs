//! Outbound dial cooldowns.
use localtime::{LocalDuration, LocalTime};

/// Minimum cooldown after a failed connection attempt.
pub const MIN_RETRY_DELTA: LocalDuration = LocalDuration::from_secs(1);
/// Ceiling on the retry cooldown.
pub const MAX_RETRY_DELTA: LocalDuration = LocalDuration::from_secs(60);

/// Cooldown state for one (transport, direction) of a peer.
#[derive(Debug, Default, Clone)]
pub struct Retry {
    /// Permanently refuse further attempts. Sticky once set.
    never_retry: bool,
    /// No attempts before this time.
    cooldown_until: LocalTime,
    /// Failed attempts since the last success.
    failures: u32,
}

impl Retry {
    /// Whether an attempt is currently admitted.
    pub fn can_connect(&self, now: LocalTime) -> bool {
        !self.never_retry && now >= self.cooldown_until
    }

    /// Record a failed attempt. Whitelisted peers are not penalized:
    /// their cooldown stays zero and failures aren't counted.
    pub fn failed(&mut self, now: LocalTime, whitelisted: bool) {
        if whitelisted {
            return;
        }
        let delay = LocalDuration::from_secs(2u64.saturating_pow(self.failures))
            .clamp(MIN_RETRY_DELTA, MAX_RETRY_DELTA);

        self.failures += 1;
        self.cooldown_until = now + delay;
    }

    /// Record a successful connection.
    pub fn succeeded(&mut self) {
        self.failures = 0;
        self.cooldown_until = LocalTime::default();
    }

    /// Refuse attempts permanently.
    pub fn never_retry(&mut self) {
        self.never_retry = true;
    }

    pub fn is_never_retry(&self) -> bool {
        self.never_retry
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
