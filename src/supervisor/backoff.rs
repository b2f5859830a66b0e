//! Geometric backoff with jitter (§4.1): base 2s, factor 2, capped at 60s,
//! ±25% jitter.

use rand::Rng;
use std::time::Duration;

const BASE: Duration = Duration::from_secs(2);
const FACTOR: u32 = 2;
const CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Duration to wait before the next attempt, advancing internal state.
    pub fn next_delay(&mut self) -> Duration {
        let exp = FACTOR.saturating_pow(self.attempt);
        self.attempt += 1;
        let nominal = BASE.saturating_mul(exp).min(CAP);
        jitter(nominal)
    }
}

fn jitter(nominal: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor: f64 = rng.gen_range(0.75..=1.25);
    Duration::from_secs_f64(nominal.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = Backoff::default();
        let first = b.next_delay();
        assert!(first.as_secs_f64() >= 1.5 && first.as_secs_f64() <= 2.5);
        for _ in 0..10 {
            b.next_delay();
        }
        let capped = b.next_delay();
        assert!(capped.as_secs_f64() <= 75.0);
    }

    #[test]
    fn reset_restarts_from_base() {
        let mut b = Backoff::default();
        b.next_delay();
        b.next_delay();
        b.reset();
        let after_reset = b.next_delay();
        assert!(after_reset.as_secs_f64() <= 2.5);
    }
}
