//! Per-service instance cache, selection and down-instance circuit breaking.

use crate::directory::InstanceDirectory;
use crate::strategy::{self, SelectionState};
use crate::types::{DownInstancePolicy, InstanceId, ServiceInstance, Strategy};
use dashmap::DashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Failure bookkeeping for one instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureState {
    /// Errors reported since the last recovery
    pub error_count: u32,

    /// When the instance crossed the error threshold
    pub down_since: Option<Instant>,
}

impl FailureState {
    /// Count one error. Returns true if this report marked the instance down.
    fn record_error(&mut self, policy: &DownInstancePolicy, now: Instant) -> bool {
        self.error_count = self.error_count.saturating_add(1);
        if self.error_count >= policy.error_threshold && self.down_since.is_none() {
            self.down_since = Some(now);
            return true;
        }
        false
    }

    /// Whether the instance is excluded at `now`; recovers it once the
    /// down timeout has elapsed.
    fn is_down(&mut self, policy: &DownInstancePolicy, now: Instant) -> bool {
        match self.down_since {
            Some(since) if now.duration_since(since) >= policy.down_timeout => {
                self.error_count = 0;
                self.down_since = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

/// Instance provider for one service name
pub struct ServiceProvider {
    name: String,
    directory: Arc<InstanceDirectory>,
    policy: DownInstancePolicy,
    instances: RwLock<Vec<Arc<ServiceInstance>>>,
    selection: SelectionState,
    failures: DashMap<InstanceId, FailureState>,
}

impl ServiceProvider {
    /// Create a provider with an empty cache
    pub fn new(name: impl Into<String>, directory: Arc<InstanceDirectory>, policy: DownInstancePolicy) -> Self {
        Self {
            name: name.into(),
            directory,
            policy,
            instances: RwLock::new(Vec::new()),
            selection: SelectionState::new(),
            failures: DashMap::new(),
        }
    }

    /// Service name this provider resolves
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Refresh the cached instance set from the directory.
    ///
    /// Keeps the previous set when the directory read fails. Returns the
    /// number of cached instances.
    pub async fn refresh(&self) -> usize {
        match self.directory.try_query(&self.name).await {
            Ok(instances) => {
                self.failures
                    .retain(|id, _| instances.iter().any(|i| &i.id == id));
                let count = instances.len();
                *self.instances.write().unwrap_or_else(PoisonError::into_inner) = instances;
                count
            }
            Err(e) => {
                warn!(service = %self.name, error = %e, "Keeping cached instances after failed refresh");
                self.instance_count()
            }
        }
    }

    /// Refresh and pick an eligible instance with `strategy`
    pub async fn select(&self, strategy: Strategy) -> Option<Arc<ServiceInstance>> {
        self.refresh().await;
        let eligible = self.eligible();
        let picked = strategy::select(strategy, &eligible, &self.selection);
        if let Some(ref instance) = picked {
            debug!(service = %self.name, id = %instance.id, %strategy, "Selected instance");
        }
        picked
    }

    /// Enabled instances that are not currently down, in stable order
    pub fn eligible(&self) -> Vec<Arc<ServiceInstance>> {
        let now = Instant::now();
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|i| i.enabled && !self.is_down(&i.id, now))
            .cloned()
            .collect()
    }

    /// Record a failure against `instance_id`.
    ///
    /// Returns false if the instance is not in this provider's cache.
    pub fn note_error(&self, instance_id: &str) -> bool {
        if !self.contains(instance_id) {
            return false;
        }

        let mut state = self.failures.entry(instance_id.to_string()).or_default();
        if state.record_error(&self.policy, Instant::now()) {
            info!(
                service = %self.name,
                id = instance_id,
                errors = state.error_count,
                down_for_ms = self.policy.down_timeout.as_millis() as u64,
                "Instance marked down"
            );
        } else {
            debug!(service = %self.name, id = instance_id, errors = state.error_count, "Instance error noted");
        }
        true
    }

    /// Failure state of an instance, if any errors were recorded
    pub fn failure_state(&self, instance_id: &str) -> Option<FailureState> {
        self.failures.get(instance_id).map(|s| *s)
    }

    /// Number of cached instances
    pub fn instance_count(&self) -> usize {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn contains(&self, instance_id: &str) -> bool {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|i| i.id == instance_id)
    }

    fn is_down(&self, instance_id: &str, now: Instant) -> bool {
        match self.failures.get_mut(instance_id) {
            Some(mut state) => {
                let was_down = state.down_since.is_some();
                let down = state.is_down(&self.policy, now);
                if was_down && !down {
                    info!(service = %self.name, id = instance_id, "Instance recovered");
                }
                down
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy() -> DownInstancePolicy {
        DownInstancePolicy {
            error_threshold: 2,
            down_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_failure_state_marks_down_once() {
        let policy = policy();
        let mut state = FailureState::default();
        let t0 = Instant::now();

        assert!(!state.record_error(&policy, t0));
        assert!(!state.is_down(&policy, t0));

        assert!(state.record_error(&policy, t0));
        assert_eq!(state.down_since, Some(t0));

        // Further errors do not move the timestamp.
        let later = t0 + Duration::from_millis(100);
        assert!(!state.record_error(&policy, later));
        assert_eq!(state.down_since, Some(t0));
        assert_eq!(state.error_count, 3);
    }

    #[test]
    fn test_failure_state_recovers_after_timeout() {
        let policy = policy();
        let mut state = FailureState::default();
        let t0 = Instant::now();
        state.record_error(&policy, t0);
        state.record_error(&policy, t0);

        assert!(state.is_down(&policy, t0 + Duration::from_millis(499)));
        assert!(!state.is_down(&policy, t0 + Duration::from_millis(500)));
        assert_eq!(state, FailureState::default());
    }

    #[test]
    fn test_below_threshold_count_is_kept() {
        let policy = DownInstancePolicy {
            error_threshold: 3,
            down_timeout: Duration::from_millis(10),
        };
        let mut state = FailureState::default();
        let t0 = Instant::now();
        state.record_error(&policy, t0);

        assert!(!state.is_down(&policy, t0 + Duration::from_secs(60)));
        assert_eq!(state.error_count, 1);
    }
}
