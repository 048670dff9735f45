//! Instance selection strategies.
//!
//! Selection is a pure function of the strategy, the eligible instances and
//! the provider's [`SelectionState`]. Races between concurrent callers are
//! benign: an instance may be skipped or picked twice, never out of bounds.

use crate::types::{InstanceId, ServiceInstance, Strategy};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Per-provider mutable selection state
#[derive(Debug, Default)]
pub struct SelectionState {
    /// Round-robin cursor
    cursor: AtomicUsize,

    /// Instance pinned by the sticky strategy
    pinned: RwLock<Option<InstanceId>>,
}

impl SelectionState {
    /// Create fresh state
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently pinned instance id
    pub fn pinned(&self) -> Option<InstanceId> {
        self.pinned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Pick one instance from `eligible`
pub fn select(
    strategy: Strategy,
    eligible: &[Arc<ServiceInstance>],
    state: &SelectionState,
) -> Option<Arc<ServiceInstance>> {
    if eligible.is_empty() {
        return None;
    }

    match strategy {
        Strategy::RoundRobin => round_robin(eligible, state),
        Strategy::Random => random(eligible),
        Strategy::Sticky => sticky(eligible, state),
    }
}

fn round_robin(eligible: &[Arc<ServiceInstance>], state: &SelectionState) -> Option<Arc<ServiceInstance>> {
    let offset = state.cursor.fetch_add(1, Ordering::Relaxed);
    eligible.get(offset % eligible.len()).cloned()
}

fn random(eligible: &[Arc<ServiceInstance>]) -> Option<Arc<ServiceInstance>> {
    let index = rand::thread_rng().gen_range(0..eligible.len());
    eligible.get(index).cloned()
}

fn sticky(eligible: &[Arc<ServiceInstance>], state: &SelectionState) -> Option<Arc<ServiceInstance>> {
    if let Some(pinned) = state.pinned() {
        if let Some(instance) = eligible.iter().find(|i| i.id == pinned) {
            return Some(instance.clone());
        }
    }

    let choice = random(eligible)?;
    *state.pinned.write().unwrap_or_else(PoisonError::into_inner) = Some(choice.id.clone());
    Some(choice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceDescriptor;
    use std::collections::HashSet;

    fn instances(n: usize) -> Vec<Arc<ServiceInstance>> {
        (0..n)
            .map(|i| {
                let descriptor = ServiceDescriptor::named("svc", serde_json::Value::Null)
                    .with_endpoint("127.0.0.1", 9000 + i as u16);
                Arc::new(ServiceInstance::from_descriptor(&descriptor))
            })
            .collect()
    }

    #[test]
    fn test_empty_selects_nothing() {
        let state = SelectionState::new();
        for strategy in [Strategy::RoundRobin, Strategy::Random, Strategy::Sticky] {
            assert!(select(strategy, &[], &state).is_none());
        }
    }

    #[test]
    fn test_round_robin_visits_each_once_then_wraps() {
        let pool = instances(4);
        let state = SelectionState::new();

        let first_pass: Vec<_> = (0..4)
            .map(|_| select(Strategy::RoundRobin, &pool, &state).unwrap().id.clone())
            .collect();
        let unique: HashSet<_> = first_pass.iter().collect();
        assert_eq!(unique.len(), 4);

        let wrapped = select(Strategy::RoundRobin, &pool, &state).unwrap();
        assert_eq!(wrapped.id, first_pass[0]);
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let pool = instances(3);
        let state = SelectionState::new();
        let ids: HashSet<_> = pool.iter().map(|i| i.id.clone()).collect();

        for _ in 0..100 {
            let picked = select(Strategy::Random, &pool, &state).unwrap();
            assert!(ids.contains(&picked.id));
        }
    }

    #[test]
    fn test_sticky_keeps_pin_while_eligible() {
        let pool = instances(5);
        let state = SelectionState::new();

        let first = select(Strategy::Sticky, &pool, &state).unwrap();
        for _ in 0..50 {
            assert_eq!(select(Strategy::Sticky, &pool, &state).unwrap().id, first.id);
        }
        assert_eq!(state.pinned(), Some(first.id.clone()));
    }

    #[test]
    fn test_sticky_rerolls_when_pin_becomes_ineligible() {
        let pool = instances(3);
        let state = SelectionState::new();

        let first = select(Strategy::Sticky, &pool, &state).unwrap();
        let remaining: Vec<_> = pool.iter().filter(|i| i.id != first.id).cloned().collect();

        let second = select(Strategy::Sticky, &remaining, &state).unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(state.pinned(), Some(second.id.clone()));

        // The new pin holds even once the old instance is back.
        assert_eq!(select(Strategy::Sticky, &pool, &state).unwrap().id, second.id);
    }
}
