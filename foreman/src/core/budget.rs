//! Wall-clock budget helpers for task execution.

use std::time::{Duration, Instant};

/// Return the remaining time budget until `deadline`, or `None` once spent.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_deadline_has_no_budget() {
        let now = Instant::now();
        assert!(remaining_budget(now).is_none());
        assert!(remaining_budget(now + Duration::from_secs(60)).is_some());
    }
}
