//! Processor selection when no routing rule applies.
//!
//! Tiers, first non-empty wins:
//! 1. Processors that have not handled anything yet, round-robin
//! 2. Lowest average processing time
//! 3. Lowest average API round trip
//! 4. Round-robin over everyone

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::connection::ProcessorConnection;

/// Stateless apart from the shared round-robin cursor.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    cursor: AtomicUsize,
}

impl LoadBalancer {
    /// Create a balancer with the cursor at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a Processor from `healthy`. `None` only when the slice is empty.
    pub fn select(&self, healthy: &[Arc<ProcessorConnection>]) -> Option<Arc<ProcessorConnection>> {
        if healthy.is_empty() {
            return None;
        }

        let cold: Vec<&Arc<ProcessorConnection>> = healthy.iter().filter(|p| p.handled() == 0).collect();
        if !cold.is_empty() {
            return Some(cold[self.next(cold.len())].clone());
        }

        if let Some(best) = fastest(healthy, ProcessorConnection::avg_processing) {
            return Some(best.clone());
        }
        if let Some(best) = fastest(healthy, ProcessorConnection::avg_rtt) {
            return Some(best.clone());
        }

        Some(healthy[self.next(healthy.len())].clone())
    }

    fn next(&self, len: usize) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % len
    }
}

/// Lowest non-zero average by `metric`; earliest connected wins ties.
fn fastest(
    healthy: &[Arc<ProcessorConnection>],
    metric: impl Fn(&ProcessorConnection) -> Option<Duration>,
) -> Option<&Arc<ProcessorConnection>> {
    healthy
        .iter()
        .filter_map(|p| metric(p.as_ref()).filter(|avg| !avg.is_zero()).map(|avg| (avg, p)))
        .min_by_key(|(avg, _)| *avg)
        .map(|(_, p)| p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::processor;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn warm(ids: &[&str]) -> Vec<Arc<ProcessorConnection>> {
        ids.iter()
            .map(|id| {
                let (p, rx) = processor(id);
                drop(rx);
                p.record_delivery();
                p
            })
            .collect()
    }

    #[test]
    fn empty_set_yields_none() {
        assert!(LoadBalancer::new().select(&[]).is_none());
    }

    #[test]
    fn cold_processors_go_first() {
        let lb = LoadBalancer::new();
        let mut pool = warm(&["w1"]);
        pool[0].record_processing(Duration::from_millis(1));
        let (cold, _rx) = processor("cold");
        pool.push(cold);
        for _ in 0..3 {
            assert_eq!(lb.select(&pool).unwrap().id().as_str(), "cold");
        }
    }

    #[test]
    fn cold_tier_round_robins() {
        let lb = LoadBalancer::new();
        let (a, _ra) = processor("a");
        let (b, _rb) = processor("b");
        let pool = vec![a, b];
        let first = lb.select(&pool).unwrap();
        let second = lb.select(&pool).unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn lowest_processing_time_wins() {
        let lb = LoadBalancer::new();
        let pool = warm(&["slow", "fast", "none"]);
        pool[0].record_processing(Duration::from_millis(50));
        pool[1].record_processing(Duration::from_millis(5));
        pool[2].record_rtt(Duration::from_millis(1));
        assert_eq!(lb.select(&pool).unwrap().id().as_str(), "fast");
    }

    #[test]
    fn rtt_used_when_no_processing_samples() {
        let lb = LoadBalancer::new();
        let pool = warm(&["a", "b"]);
        pool[0].record_rtt(Duration::from_millis(30));
        pool[1].record_rtt(Duration::from_millis(10));
        assert_eq!(lb.select(&pool).unwrap().id().as_str(), "b");
    }

    #[test]
    fn zero_averages_are_ignored() {
        let lb = LoadBalancer::new();
        let pool = warm(&["zero", "real"]);
        pool[0].record_processing(Duration::ZERO);
        pool[1].record_processing(Duration::from_millis(3));
        assert_eq!(lb.select(&pool).unwrap().id().as_str(), "real");
    }

    proptest! {
        #[test]
        fn round_robin_visits_everyone_before_repeating(n in 1usize..12, skew in 0usize..50) {
            let ids: Vec<String> = (0..n).map(|i| format!("p{i}")).collect();
            let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            let pool = warm(&refs);
            let lb = LoadBalancer::new();
            lb.cursor.store(skew, Ordering::Relaxed);

            let picked: HashSet<String> = (0..n)
                .map(|_| lb.select(&pool).unwrap().id().to_string())
                .collect();
            prop_assert_eq!(picked.len(), n);
        }
    }
}
