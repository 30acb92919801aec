//! Capability traits for the dynamic callable parameters spec.md §9 asks to
//! be re-architected as injectable interfaces: decorators applied around
//! recorded input/output/tape data, plus the latency and error-injection
//! policies consulted by the replay transport.

use std::fmt;

use rand::Rng;

use crate::matcher::MatchingContext;
use crate::tape::model::Tape;

pub trait InputDecorator: fmt::Debug + Send + Sync {
    fn decorate(&self, raw: &[u8], ctx: &MatchingContext) -> Vec<u8>;
}

pub trait OutputDecorator: fmt::Debug + Send + Sync {
    fn decorate(&self, chunk: &[u8], ctx: &MatchingContext) -> Vec<u8>;
}

pub trait TapeDecorator: fmt::Debug + Send + Sync {
    fn decorate(&self, tape: &mut Tape);
}

/// `latency` construction option: fixed milliseconds, a uniform range, or a
/// policy computed from the matching context.
pub trait LatencyPolicy: fmt::Debug + Send + Sync {
    fn resolve_ms(&self, ctx: &MatchingContext) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct FixedLatency(pub u64);

impl LatencyPolicy for FixedLatency {
    fn resolve_ms(&self, _ctx: &MatchingContext) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RangedLatency {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl LatencyPolicy for RangedLatency {
    fn resolve_ms(&self, _ctx: &MatchingContext) -> u64 {
        if self.max_ms <= self.min_ms {
            return self.min_ms;
        }
        rand::thread_rng().gen_range(self.min_ms..=self.max_ms)
    }
}

/// `error_rate` construction option: a percentage in `[0, 100]` deciding
/// whether to synthesize a `TapeMiss` after a successful stream.
pub trait ErrorPolicy: fmt::Debug + Send + Sync {
    fn should_inject(&self, ctx: &MatchingContext) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct PercentErrorRate(pub f64);

impl ErrorPolicy for PercentErrorRate {
    fn should_inject(&self, _ctx: &MatchingContext) -> bool {
        if self.0 <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_range(0.0..100.0) < self.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverInjectError;

impl ErrorPolicy for NeverInjectError {
    fn should_inject(&self, _ctx: &MatchingContext) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> MatchingContext {
        MatchingContext {
            program: "demo".to_string(),
            args: vec![],
            env: vec![],
            cwd: "/tmp".to_string(),
            prompt: None,
        }
    }

    #[test]
    fn fixed_latency_always_resolves_to_same_value() {
        let policy = FixedLatency(250);
        assert_eq!(policy.resolve_ms(&ctx()), 250);
        assert_eq!(policy.resolve_ms(&ctx()), 250);
    }

    #[test]
    fn ranged_latency_stays_within_bounds() {
        let policy = RangedLatency { min_ms: 10, max_ms: 20 };
        for _ in 0..50 {
            let v = policy.resolve_ms(&ctx());
            assert!((10..=20).contains(&v));
        }
    }

    #[test]
    fn zero_percent_never_injects() {
        let policy = PercentErrorRate(0.0);
        for _ in 0..20 {
            assert!(!policy.should_inject(&ctx()));
        }
    }

    #[test]
    fn hundred_percent_always_injects() {
        let policy = PercentErrorRate(100.0);
        for _ in 0..20 {
            assert!(policy.should_inject(&ctx()));
        }
    }
}
