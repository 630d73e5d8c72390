//! Detail-stream sampler.
//!
//! One [`Sampler`] is created per flow on its first packet, seeded from the configured
//! `detail_sample_rate` (overridable per protocol) and held by the connection observer
//! for the life of the flow. Decisions are a pure function of `(now_ns, is_error)`: a
//! token-bucket rate limiter, plus an always-sample-on-error rule that bypasses the
//! bucket entirely.

/// Token-bucket rate limiter seeded from a fractional rate, replaying deterministically
/// given the same `(now_ns, is_error)` sequence.
pub struct Sampler {
    rate: f64,
    tokens: f64,
    capacity: f64,
    last_refill_ns: Option<u64>,
}

impl Sampler {
    /// `rate` is the fraction of exchanges admitted, clamped to `[0.0, 1.0]`; this is the
    /// common case for `detail_sample_rate`.
    pub fn new(rate: f64) -> Self {
        let rate = rate.clamp(0.0, 1.0);
        Sampler {
            rate,
            tokens: 1.0,
            capacity: 1.0,
            last_refill_ns: None,
        }
    }

    /// Decides whether the exchange observed at `now_ns` should be sampled. Errors are
    /// always sampled regardless of the token bucket's state.
    pub fn should_sample(&mut self, now_ns: u64, is_error: bool) -> bool {
        if is_error {
            return true;
        }
        if self.rate <= 0.0 {
            return false;
        }
        if self.rate >= 1.0 {
            return true;
        }
        self.refill(now_ns);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now_ns: u64) {
        let elapsed_ns = match self.last_refill_ns {
            Some(last) => now_ns.saturating_sub(last),
            None => 0,
        };
        self.last_refill_ns = Some(now_ns);
        let elapsed_s = elapsed_ns as f64 / 1_000_000_000.0;
        self.tokens = (self.tokens + elapsed_s * self.rate).min(self.capacity);
    }
}
