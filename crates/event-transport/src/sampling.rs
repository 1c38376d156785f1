//! Probabilistic event sampling.

use crate::hooks::ShouldSendHook;
use crate::Event;
use rand::Rng;
use std::sync::Arc;

/// Accepts each event independently with probability `rate`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleFilter {
    rate: f64,
}

impl SampleFilter {
    /// `rate` is expected to be validated already; it is clamped again here.
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_nan() { 1.0 } else { rate.clamp(0.0, 1.0) };
        Self { rate }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Decide for one event using the thread-local RNG.
    pub fn accepts(&self) -> bool {
        self.accepts_with(&mut rand::thread_rng())
    }

    /// Decide for one event using the given RNG.
    pub fn accepts_with<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        if self.rate >= 1.0 {
            return true;
        }
        if self.rate <= 0.0 {
            return false;
        }
        rng.gen::<f64>() < self.rate
    }

    /// Express the filter as a send-veto hook.
    pub fn into_send_hook(self) -> Arc<ShouldSendHook> {
        Arc::new(move |_event: &Event| self.accepts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Severity;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn full_rate_always_accepts() {
        let filter = SampleFilter::new(1.0);
        assert!((0..100).all(|_| filter.accepts()));
    }

    #[test]
    fn zero_rate_never_accepts() {
        let filter = SampleFilter::new(0.0);
        assert!((0..100).all(|_| !filter.accepts()));
    }

    #[test]
    fn rate_is_clamped() {
        assert_eq!(SampleFilter::new(4.0).rate(), 1.0);
        assert_eq!(SampleFilter::new(-1.0).rate(), 0.0);
        assert_eq!(SampleFilter::new(f64::NAN).rate(), 1.0);
    }

    #[test]
    fn acceptance_converges_to_rate() {
        let mut rng = StdRng::seed_from_u64(7);
        for rate in [0.1, 0.25, 0.5, 0.9] {
            let filter = SampleFilter::new(rate);
            let n = 20_000;
            let accepted = (0..n).filter(|_| filter.accepts_with(&mut rng)).count();
            let fraction = accepted as f64 / n as f64;
            // 4 standard deviations of a binomial proportion at n=20k is < 0.015.
            assert!(
                (fraction - rate).abs() < 0.015,
                "rate {rate} produced {fraction}"
            );
        }
    }

    #[test]
    fn send_hook_follows_rate() {
        let event = Event::message(Severity::Info, "sampled");
        let never = SampleFilter::new(0.0).into_send_hook();
        let always = SampleFilter::new(1.0).into_send_hook();
        assert!(!never(&event));
        assert!(always(&event));
    }
}
