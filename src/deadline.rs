//! Request deadlines.
//!
//! A [`Deadline`] is computed once when a request enters the system and is
//! carried unchanged through every RPC hop; it is never recomputed
//! mid-flight. Expiry surfaces as an ordinary error, together with a hint
//! naming the configuration knob that controls the timeout.

use std::time::{Duration, Instant};

/// Absolute deadline for one logical request.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    deadline: Instant,
    timeout: Duration,
    flag_hint: &'static str,
}

impl Deadline {
    /// Creates a deadline `timeout` from now. `flag_hint` names the setting
    /// that controls the timeout and is echoed in error messages.
    pub fn new(timeout: Duration, flag_hint: &'static str) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            flag_hint,
        }
    }

    pub fn from_secs(secs: u64, flag_hint: &'static str) -> Self {
        Self::new(Duration::from_secs(secs), flag_hint)
    }

    /// The absolute instant at which the request expires.
    pub fn instant(&self) -> Instant {
        self.deadline
    }

    /// The originally requested timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn exceeded(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left before expiry; zero once exceeded.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Remaining time in whole seconds, rounded up, as sent to storage nodes.
    /// Nodes receive a relative timeout rather than an absolute instant since
    /// their clocks may differ.
    pub fn remaining_secs(&self) -> u32 {
        let rem = self.remaining();
        rem.as_secs().saturating_add(1).min(u32::MAX as u64) as u32
    }
}

impl std::fmt::Display for Deadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.3}s (can be adjusted with `{}`)",
            self.timeout.as_secs_f64(),
            self.flag_hint
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_deadline_not_exceeded() {
        let d = Deadline::from_secs(30, "search.max_query_duration");
        assert!(!d.exceeded());
        assert!(d.remaining() > Duration::from_secs(29));
        assert!(d.remaining_secs() >= 30);
    }

    #[test]
    fn test_expired_deadline() {
        let d = Deadline::new(Duration::ZERO, "search.max_query_duration");
        assert!(d.exceeded());
        assert_eq!(d.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_display_includes_flag_hint() {
        let d = Deadline::from_secs(5, "search.max_query_duration");
        let s = d.to_string();
        assert!(s.contains("5.000s"));
        assert!(s.contains("search.max_query_duration"));
    }
}
