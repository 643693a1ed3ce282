//! RFC 3261 §17 timer durations (§4.4, § "Timer defaults").
//!
//! These are pure functions over [`crate::config::StackConfig`] rather than
//! a standalone scheduler object: each transaction variant drives its own
//! `tokio::time::sleep` futures inside its run loop and asks this module for
//! the next duration on every retransmit.

use std::time::Duration;

use crate::config::StackConfig;

/// Timer A/E: starts at T1, doubles on each retransmit, capped at T2 on
/// unreliable transports. Reliable transports never retransmit (caller
/// should not schedule this timer at all in that case).
pub fn retransmit_interval(config: &StackConfig, attempt: u32) -> Duration {
    let doubled = config.t1.saturating_mul(1 << attempt.min(16));
    doubled.min(config.t2)
}

/// Timer G: identical doubling to A/E, same T2 cap (§ "Open questions": "the
/// 200 OK retransmit cap handling at T2 ... treat T2 as the hard cap").
pub fn response_retransmit_interval(config: &StackConfig, attempt: u32) -> Duration {
    retransmit_interval(config, attempt)
}

/// Timer B/F: transaction timeout, 64*T1.
pub fn timeout(config: &StackConfig) -> Duration {
    config.timer_b()
}

/// Timer D: wait for response retransmits after a final response on ICT.
pub fn wait_after_final(config: &StackConfig, reliable: bool) -> Duration {
    config.timer_d(reliable)
}

/// Timer K: wait after COMPLETED on NICT.
pub fn wait_after_complete(config: &StackConfig, reliable: bool) -> Duration {
    config.timer_k(reliable)
}

/// Timer H: wait for ACK on IST, 64*T1.
pub fn wait_for_ack(config: &StackConfig) -> Duration {
    config.t1 * 64
}

/// Timer I: wait after ACK on IST (CONFIRMED), T4 on unreliable, 0 on reliable.
pub fn wait_after_ack(config: &StackConfig, reliable: bool) -> Duration {
    if reliable {
        Duration::ZERO
    } else {
        config.t4
    }
}

/// Timer J: wait after COMPLETED on NIST, 64*T1 on unreliable, 0 on reliable.
pub fn wait_after_nist_complete(config: &StackConfig, reliable: bool) -> Duration {
    if reliable {
        Duration::ZERO
    } else {
        config.t1 * 64
    }
}

/// Timer L: wait in ACCEPTED on IST, generally 2*T1*64 per §4.4.
pub fn wait_in_accepted(config: &StackConfig) -> Duration {
    config.t1 * 64 * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmit_doubles_then_caps_at_t2() {
        let config = StackConfig::default();
        assert_eq!(retransmit_interval(&config, 0), config.t1);
        assert_eq!(retransmit_interval(&config, 1), config.t1 * 2);
        assert_eq!(retransmit_interval(&config, 2), config.t1 * 4);
        assert_eq!(retransmit_interval(&config, 10), config.t2);
    }

    #[test]
    fn timer_b_is_64_t1() {
        let config = StackConfig::default();
        assert_eq!(timeout(&config), config.t1 * 64);
    }

    #[test]
    fn wait_after_ack_zero_on_reliable() {
        let config = StackConfig::default();
        assert_eq!(wait_after_ack(&config, true), Duration::ZERO);
        assert_eq!(wait_after_ack(&config, false), config.t4);
    }
}
