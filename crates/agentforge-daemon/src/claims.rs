//! Feature claim store.
//!
//! [`ClaimStore`] owns the [`FeatureGraph`] behind a single async mutex and
//! writes every change through to `SQLite`. Claims are additionally guarded
//! by a storage compare-and-set, so a lost race surfaces as a skipped
//! candidate rather than a double claim.

use std::collections::BTreeSet;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use agentforge_core::db::unix_timestamp;
use agentforge_core::model::{
    BlockedFeature, Feature, FeatureId, FeatureStats, FeatureStatus, GraphView, NewFeature,
    NewFeatureSpec, Priority, ReleaseOutcome,
};
use agentforge_core::{ErrorKind, OrchestratorEvent};

use crate::events::EventBus;
use crate::graph::{FeatureGraph, GraphError, MAX_DEPENDENCIES};
use crate::storage::{Database, DatabaseError};

/// Default number of failing releases before a feature is parked.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Feature {0} not found")]
    NotFound(FeatureId),

    #[error("Feature {feature} is not held by agent {agent_id}")]
    NotHeld { feature: FeatureId, agent_id: String },

    #[error("Feature {feature} is {status}: {reason}")]
    InvalidState {
        feature: FeatureId,
        status: FeatureStatus,
        reason: &'static str,
    },

    #[error("Batch entry {position} depends on index {index}, which is not an earlier entry")]
    InvalidIndex { position: usize, index: usize },
}

impl ClaimError {
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Graph(e) => e.kind(),
            Self::InvalidState { .. } | Self::NotHeld { .. } => Some(ErrorKind::ClaimConflict),
            _ => None,
        }
    }
}

pub struct ClaimStore {
    db: Database,
    graph: Mutex<FeatureGraph>,
    max_failures: u32,
    events: EventBus,
}

impl ClaimStore {
    /// Rebuild the graph from storage.
    pub async fn load(db: Database, events: EventBus, max_failures: u32) -> Result<Self, ClaimError> {
        let features = db.list_features().await?;
        let graph = FeatureGraph::from_features(features)?;
        info!(features = graph.len(), "Feature graph loaded");
        Ok(Self {
            db,
            graph: Mutex::new(graph),
            max_failures: max_failures.max(1),
            events,
        })
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    // =========================================================================
    // Claiming
    // =========================================================================

    /// Claim up to `max_count` ready features for `agent_id`. Never waits
    /// for work; an empty result means nothing is ready.
    pub async fn claim(&self, agent_id: &str, max_count: usize) -> Result<Vec<Feature>, ClaimError> {
        let mut graph = self.graph.lock().await;
        let now = unix_timestamp();
        let mut claimed = Vec::new();

        for candidate in graph.ready_set() {
            if claimed.len() >= max_count {
                break;
            }
            let won = match self.db.try_claim_feature(candidate.id, agent_id, now).await {
                Ok(won) => won,
                Err(e) => {
                    self.roll_back_claims(&mut graph, agent_id, &claimed).await;
                    return Err(e.into());
                }
            };
            if !won {
                warn!(
                    feature_id = candidate.id,
                    agent_id,
                    kind = %ErrorKind::ClaimConflict,
                    "Claim lost compare-and-set, skipping"
                );
                continue;
            }
            let Some(feature) = graph.update(candidate.id, |f| {
                f.status = FeatureStatus::InProgress;
                f.claimed_by = Some(agent_id.to_string());
                f.claimed_at = Some(now);
            }) else {
                continue;
            };
            self.events.publish(OrchestratorEvent::FeatureClaimed {
                feature_id: feature.id,
                agent_id: agent_id.to_string(),
            });
            claimed.push(feature);
        }

        if !claimed.is_empty() {
            debug!(agent_id, count = claimed.len(), "Features claimed");
        }
        Ok(claimed)
    }

    /// Undo a partial batch. The graph is reverted even when the storage
    /// write fails; the leftover row is cleared as a stale claim on reload.
    async fn roll_back_claims(
        &self,
        graph: &mut FeatureGraph,
        agent_id: &str,
        claimed: &[Feature],
    ) {
        for feature in claimed {
            let mut reverted = feature.clone();
            reverted.status = FeatureStatus::Pending;
            reverted.claimed_by = None;
            reverted.claimed_at = None;
            if let Err(e) = self.db.save_feature_state(&reverted).await {
                warn!(feature_id = feature.id, agent_id, error = %e, "Failed to roll back claim");
            }
            graph.update(feature.id, |f| *f = reverted);
            self.events.publish(OrchestratorEvent::FeatureReleased {
                feature_id: feature.id,
                status: FeatureStatus::Pending,
            });
        }
        if !claimed.is_empty() {
            warn!(agent_id, count = claimed.len(), "Rolled back partial claim batch");
        }
    }

    /// Claim passing features for regression testing. Status stays `passing`.
    pub async fn claim_for_regression(
        &self,
        agent_id: &str,
        max_count: usize,
    ) -> Result<Vec<Feature>, ClaimError> {
        let mut graph = self.graph.lock().await;
        let now = unix_timestamp();
        let mut claimed = Vec::new();

        for candidate in graph.regression_candidates() {
            if claimed.len() >= max_count {
                break;
            }
            if !self.db.try_claim_regression(candidate.id, agent_id, now).await? {
                warn!(feature_id = candidate.id, agent_id, "Regression claim lost, skipping");
                continue;
            }
            if let Some(feature) = graph.update(candidate.id, |f| {
                f.claimed_by = Some(agent_id.to_string());
                f.claimed_at = Some(now);
            }) {
                self.events.publish(OrchestratorEvent::FeatureClaimed {
                    feature_id: feature.id,
                    agent_id: agent_id.to_string(),
                });
                claimed.push(feature);
            }
        }
        Ok(claimed)
    }

    // =========================================================================
    // Releasing
    // =========================================================================

    /// Clear the claim on `feature_id` and record the outcome.
    pub async fn release(
        &self,
        feature_id: FeatureId,
        outcome: ReleaseOutcome,
    ) -> Result<Feature, ClaimError> {
        let mut graph = self.graph.lock().await;
        self.release_locked(&mut graph, feature_id, outcome).await
    }

    /// Release on behalf of an agent; rejects features it does not hold.
    pub async fn release_held(
        &self,
        agent_id: &str,
        feature_id: FeatureId,
        outcome: ReleaseOutcome,
    ) -> Result<Feature, ClaimError> {
        let mut graph = self.graph.lock().await;
        let holder = graph
            .get(feature_id)
            .ok_or(ClaimError::NotFound(feature_id))?
            .claimed_by
            .as_deref();
        if holder != Some(agent_id) {
            return Err(ClaimError::NotHeld {
                feature: feature_id,
                agent_id: agent_id.to_string(),
            });
        }
        self.release_locked(&mut graph, feature_id, outcome).await
    }

    /// Return a feature to the queue regardless of partial progress.
    pub async fn force_release(&self, feature_id: FeatureId) -> Result<Feature, ClaimError> {
        self.release(feature_id, ReleaseOutcome::Pending).await
    }

    /// Force-release everything `agent_id` holds. Returns the released ids.
    pub async fn release_agent(&self, agent_id: &str) -> Result<Vec<FeatureId>, ClaimError> {
        let mut graph = self.graph.lock().await;
        let held: Vec<FeatureId> = graph
            .all()
            .filter(|f| f.claimed_by.as_deref() == Some(agent_id))
            .map(|f| f.id)
            .collect();
        for &id in &held {
            self.release_locked(&mut graph, id, ReleaseOutcome::Pending)
                .await?;
        }
        if !held.is_empty() {
            info!(agent_id, released = ?held, "Released agent claims");
        }
        Ok(held)
    }

    async fn release_locked(
        &self,
        graph: &mut FeatureGraph,
        feature_id: FeatureId,
        outcome: ReleaseOutcome,
    ) -> Result<Feature, ClaimError> {
        let current = graph.get(feature_id).ok_or(ClaimError::NotFound(feature_id))?;
        let holder = current.claimed_by.clone();
        let mut next = current.clone();
        let now = unix_timestamp();

        next.claimed_by = None;
        next.claimed_at = None;
        match outcome {
            ReleaseOutcome::Passing => {
                next.status = FeatureStatus::Passing;
                next.failure_count = 0;
                next.last_tested_at = Some(now);
            }
            ReleaseOutcome::Pending => {
                if next.status == FeatureStatus::InProgress {
                    next.status = FeatureStatus::Pending;
                }
            }
            ReleaseOutcome::Failing => {
                let regressed = current.status == FeatureStatus::Passing;
                next.failure_count = next.failure_count.saturating_add(1);
                next.last_tested_at = Some(now);
                // A regression always goes back to the queue.
                next.status = if !regressed && next.failure_count >= self.max_failures {
                    FeatureStatus::Failing
                } else {
                    FeatureStatus::Pending
                };
            }
        }

        self.db.save_feature_state(&next).await?;
        let saved = graph
            .update(feature_id, |f| *f = next)
            .ok_or(ClaimError::NotFound(feature_id))?;

        let event = match outcome {
            ReleaseOutcome::Passing => OrchestratorEvent::FeaturePassing {
                feature_id,
                agent_id: holder,
            },
            ReleaseOutcome::Failing => {
                if saved.status == FeatureStatus::Failing {
                    warn!(
                        feature_id,
                        failures = saved.failure_count,
                        "Feature parked as failing"
                    );
                }
                OrchestratorEvent::FeatureFailing {
                    feature_id,
                    agent_id: holder,
                    status: saved.status,
                    failure_count: saved.failure_count,
                }
            }
            ReleaseOutcome::Pending => OrchestratorEvent::FeatureReleased {
                feature_id,
                status: saved.status,
            },
        };
        self.events.publish(event);
        Ok(saved)
    }

    /// Drop claims left behind by a previous owner.
    pub async fn clear_stale_claims(&self) -> Result<u64, ClaimError> {
        let mut graph = self.graph.lock().await;
        let cleared = self.db.clear_claims().await?;
        let stale: Vec<FeatureId> = graph
            .all()
            .filter(|f| f.claimed_by.is_some() || f.status == FeatureStatus::InProgress)
            .map(|f| f.id)
            .collect();
        for id in stale {
            graph.update(id, |f| {
                f.claimed_by = None;
                f.claimed_at = None;
                if f.status == FeatureStatus::InProgress {
                    f.status = FeatureStatus::Pending;
                }
            });
        }
        if cleared > 0 {
            info!(cleared, "Cleared stale claims");
        }
        Ok(cleared)
    }

    // =========================================================================
    // Creation and edges
    // =========================================================================

    pub async fn create_feature(&self, new: NewFeature) -> Result<Feature, ClaimError> {
        let mut graph = self.graph.lock().await;
        let deps: BTreeSet<FeatureId> = new.dependencies.iter().copied().collect();
        graph.check_new(&deps)?;

        let feature = self.db.create_feature(&new).await?;
        graph.add_feature(feature.clone())?;
        info!(feature_id = feature.id, name = %feature.name, "Feature created");
        self.events.publish(OrchestratorEvent::FeatureCreated {
            feature_id: feature.id,
            name: feature.name.clone(),
        });
        Ok(feature)
    }

    /// All-or-nothing batch creation. Entries may depend on earlier entries
    /// through `depends_on_indices`.
    pub async fn create_bulk(&self, specs: Vec<NewFeatureSpec>) -> Result<Vec<Feature>, ClaimError> {
        let mut graph = self.graph.lock().await;

        let mut batch = Vec::with_capacity(specs.len());
        for (position, spec) in specs.into_iter().enumerate() {
            if let Some(&index) = spec.depends_on_indices.iter().find(|&&i| i >= position) {
                return Err(ClaimError::InvalidIndex { position, index });
            }
            let deps: BTreeSet<FeatureId> = spec.feature.dependencies.iter().copied().collect();
            graph.check_new(&deps)?;
            let indices: BTreeSet<usize> = spec.depends_on_indices.into_iter().collect();
            let total = deps.len() + indices.len();
            if total > MAX_DEPENDENCIES {
                return Err(GraphError::TooManyDependencies(total).into());
            }
            batch.push((spec.feature, indices.into_iter().collect::<Vec<_>>()));
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let created = self.db.create_features(&batch).await?;
        for feature in &created {
            graph.add_feature(feature.clone())?;
            self.events.publish(OrchestratorEvent::FeatureCreated {
                feature_id: feature.id,
                name: feature.name.clone(),
            });
        }
        info!(count = created.len(), "Features created in bulk");
        Ok(created)
    }

    /// Replace the dependency set of a feature.
    pub async fn set_dependencies(
        &self,
        feature_id: FeatureId,
        deps: BTreeSet<FeatureId>,
    ) -> Result<Feature, ClaimError> {
        let mut graph = self.graph.lock().await;
        self.set_dependencies_locked(&mut graph, feature_id, deps).await
    }

    pub async fn add_dependency(
        &self,
        feature_id: FeatureId,
        dependency: FeatureId,
    ) -> Result<Feature, ClaimError> {
        let mut graph = self.graph.lock().await;
        let mut deps = graph
            .get(feature_id)
            .ok_or(ClaimError::NotFound(feature_id))?
            .dependencies
            .clone();
        deps.insert(dependency);
        self.set_dependencies_locked(&mut graph, feature_id, deps).await
    }

    pub async fn remove_dependency(
        &self,
        feature_id: FeatureId,
        dependency: FeatureId,
    ) -> Result<Feature, ClaimError> {
        let mut graph = self.graph.lock().await;
        let mut deps = graph
            .get(feature_id)
            .ok_or(ClaimError::NotFound(feature_id))?
            .dependencies
            .clone();
        deps.remove(&dependency);
        self.set_dependencies_locked(&mut graph, feature_id, deps).await
    }

    async fn set_dependencies_locked(
        &self,
        graph: &mut FeatureGraph,
        feature_id: FeatureId,
        deps: BTreeSet<FeatureId>,
    ) -> Result<Feature, ClaimError> {
        if !graph.contains(feature_id) {
            return Err(ClaimError::NotFound(feature_id));
        }
        if let Err(e) = graph.check_dependencies(feature_id, &deps) {
            warn!(feature_id, error = %e, "Dependency change rejected");
            return Err(e.into());
        }
        self.db.set_feature_dependencies(feature_id, &deps).await?;
        graph.set_dependencies(feature_id, deps)?;
        graph
            .get(feature_id)
            .cloned()
            .ok_or(ClaimError::NotFound(feature_id))
    }

    /// Delete a feature. Dependents lose the edge; claimed features are kept.
    pub async fn remove_feature(&self, feature_id: FeatureId) -> Result<Feature, ClaimError> {
        let mut graph = self.graph.lock().await;
        let feature = graph.get(feature_id).ok_or(ClaimError::NotFound(feature_id))?;
        if feature.claimed_by.is_some() {
            return Err(ClaimError::InvalidState {
                feature: feature_id,
                status: feature.status,
                reason: "claimed by a running agent",
            });
        }
        if !self.db.delete_feature(feature_id).await? {
            return Err(ClaimError::NotFound(feature_id));
        }
        let removed = graph
            .remove_feature(feature_id)
            .ok_or(ClaimError::NotFound(feature_id))?;
        self.events
            .publish(OrchestratorEvent::FeatureRemoved { feature_id });
        Ok(removed)
    }

    /// Demote to the lowest priority and send to the back of the queue.
    pub async fn skip(&self, feature_id: FeatureId) -> Result<Feature, ClaimError> {
        let mut graph = self.graph.lock().await;
        let mut next = graph
            .get(feature_id)
            .cloned()
            .ok_or(ClaimError::NotFound(feature_id))?;
        next.priority = Priority::LOWEST;
        next.status = FeatureStatus::Pending;
        next.claimed_by = None;
        next.claimed_at = None;
        next.enqueued_at = unix_timestamp();

        self.db.save_feature_state(&next).await?;
        let saved = graph
            .update(feature_id, |f| *f = next)
            .ok_or(ClaimError::NotFound(feature_id))?;
        info!(feature_id, "Feature skipped");
        Ok(saved)
    }

    /// Put a parked `failing` feature back in the queue.
    pub async fn retry(&self, feature_id: FeatureId) -> Result<Feature, ClaimError> {
        let mut graph = self.graph.lock().await;
        let mut next = graph
            .get(feature_id)
            .cloned()
            .ok_or(ClaimError::NotFound(feature_id))?;
        if next.status != FeatureStatus::Failing {
            return Err(ClaimError::InvalidState {
                feature: feature_id,
                status: next.status,
                reason: "only failing features can be retried",
            });
        }
        next.status = FeatureStatus::Pending;
        next.failure_count = 0;
        next.enqueued_at = unix_timestamp();

        self.db.save_feature_state(&next).await?;
        graph
            .update(feature_id, |f| *f = next)
            .ok_or(ClaimError::NotFound(feature_id))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, feature_id: FeatureId) -> Option<Feature> {
        self.graph.lock().await.get(feature_id).cloned()
    }

    pub async fn list(&self) -> Vec<Feature> {
        self.graph.lock().await.all().cloned().collect()
    }

    pub async fn ready_set(&self) -> Vec<Feature> {
        self.graph.lock().await.ready_set()
    }

    pub async fn blocked(&self) -> Vec<BlockedFeature> {
        self.graph.lock().await.blocked()
    }

    pub async fn stats(&self) -> FeatureStats {
        self.graph.lock().await.stats()
    }

    pub async fn graph_view(&self) -> GraphView {
        self.graph.lock().await.view()
    }

    pub async fn is_empty(&self) -> bool {
        self.graph.lock().await.is_empty()
    }

    pub async fn all_passing(&self) -> bool {
        self.graph.lock().await.all_passing()
    }

    /// Features currently claimed by `agent_id`.
    pub async fn held_by(&self, agent_id: &str) -> Vec<FeatureId> {
        self.graph
            .lock()
            .await
            .all()
            .filter(|f| f.claimed_by.as_deref() == Some(agent_id))
            .map(|f| f.id)
            .collect()
    }

    /// Number of features with a live claim.
    pub async fn claimed_count(&self) -> usize {
        self.graph
            .lock()
            .await
            .all()
            .filter(|f| f.claimed_by.is_some())
            .count()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn store() -> ClaimStore {
        let db = Database::open_in_memory().await.unwrap();
        ClaimStore::load(db, EventBus::new(), DEFAULT_MAX_FAILURES)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn claim_respects_readiness() {
        let store = store().await;
        let a = store.create_feature(NewFeature::named("a")).await.unwrap();
        let b = store
            .create_feature(NewFeature::named("b").depends_on([a.id]))
            .await
            .unwrap();

        let first = store.claim("agent-1", 5).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, a.id);
        assert_eq!(first[0].status, FeatureStatus::InProgress);
        assert!(store.claim("agent-2", 5).await.unwrap().is_empty());

        store.release(a.id, ReleaseOutcome::Passing).await.unwrap();
        let second = store.claim("agent-2", 5).await.unwrap();
        assert_eq!(second[0].id, b.id);
    }

    #[tokio::test]
    async fn claim_then_force_release_restores_state() {
        let store = store().await;
        let f = store.create_feature(NewFeature::named("x")).await.unwrap();
        store.claim("agent-1", 1).await.unwrap();
        let released = store.force_release(f.id).await.unwrap();
        assert_eq!(released.status, FeatureStatus::Pending);
        assert!(released.claimed_by.is_none());
        assert_eq!(store.ready_set().await[0].id, f.id);

        let stored = store.database().get_feature(f.id).await.unwrap();
        assert_eq!(stored.status, FeatureStatus::Pending);
        assert!(stored.claimed_by.is_none());
    }

    #[tokio::test]
    async fn repeated_failures_park_feature() {
        let store = store().await;
        let f = store.create_feature(NewFeature::named("flaky")).await.unwrap();
        for attempt in 1..=DEFAULT_MAX_FAILURES {
            let claimed = store.claim("agent", 1).await.unwrap();
            assert_eq!(claimed.len(), 1, "attempt {attempt}");
            let after = store
                .release_held("agent", f.id, ReleaseOutcome::Failing)
                .await
                .unwrap();
            assert_eq!(after.failure_count, attempt);
        }
        let parked = store.get(f.id).await.unwrap();
        assert_eq!(parked.status, FeatureStatus::Failing);
        assert!(store.ready_set().await.is_empty());

        let retried = store.retry(f.id).await.unwrap();
        assert_eq!(retried.failure_count, 0);
        assert_eq!(retried.status, FeatureStatus::Pending);
    }

    #[tokio::test]
    async fn failed_regression_requeues_previously_flaky_feature() {
        let store = store().await;
        let f = store.create_feature(NewFeature::named("flaky")).await.unwrap();
        for _ in 1..DEFAULT_MAX_FAILURES {
            store.claim("agent", 1).await.unwrap();
            store
                .release_held("agent", f.id, ReleaseOutcome::Failing)
                .await
                .unwrap();
        }
        store.claim("agent", 1).await.unwrap();
        let passed = store
            .release_held("agent", f.id, ReleaseOutcome::Passing)
            .await
            .unwrap();
        assert_eq!(passed.failure_count, 0);

        let regression = store.claim_for_regression("tester", 1).await.unwrap();
        assert_eq!(regression[0].id, f.id);
        let after = store
            .release_held("tester", f.id, ReleaseOutcome::Failing)
            .await
            .unwrap();
        assert_eq!(after.status, FeatureStatus::Pending);
        assert_eq!(store.ready_set().await[0].id, f.id);
    }

    #[tokio::test]
    async fn regression_failure_never_parks() {
        let db = Database::open_in_memory().await.unwrap();
        let store = ClaimStore::load(db, EventBus::new(), 1).await.unwrap();
        let f = store.create_feature(NewFeature::named("x")).await.unwrap();
        store.claim("agent", 1).await.unwrap();
        store.release(f.id, ReleaseOutcome::Passing).await.unwrap();
        store.claim_for_regression("tester", 1).await.unwrap();
        let after = store.release(f.id, ReleaseOutcome::Failing).await.unwrap();
        assert_eq!(after.status, FeatureStatus::Pending);
        assert_eq!(after.failure_count, 1);
    }

    #[tokio::test]
    async fn storage_error_mid_batch_rolls_back_earlier_claims() {
        let store = store().await;
        let a = store.create_feature(NewFeature::named("a")).await.unwrap();
        let b = store.create_feature(NewFeature::named("b")).await.unwrap();
        sqlx::query(&format!(
            "CREATE TRIGGER reject_claim BEFORE UPDATE OF claimed_by ON features \
             WHEN NEW.id = {} AND NEW.claimed_by IS NOT NULL \
             BEGIN SELECT RAISE(ABORT, 'claim rejected'); END",
            b.id
        ))
        .execute(store.database().pool())
        .await
        .unwrap();

        assert!(store.claim("agent", 2).await.is_err());
        assert_eq!(store.claimed_count().await, 0);
        let stored = store.database().get_feature(a.id).await.unwrap();
        assert_eq!(stored.status, FeatureStatus::Pending);
        assert!(stored.claimed_by.is_none());
        assert_eq!(store.ready_set().await.len(), 2);
    }

    #[tokio::test]
    async fn release_held_rejects_other_agents() {
        let store = store().await;
        let f = store.create_feature(NewFeature::named("x")).await.unwrap();
        store.claim("owner", 1).await.unwrap();
        let err = store
            .release_held("intruder", f.id, ReleaseOutcome::Passing)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ClaimConflict));
        assert_eq!(store.release_agent("owner").await.unwrap(), vec![f.id]);
    }

    #[tokio::test]
    async fn cycle_is_rejected_without_side_effects() {
        let store = store().await;
        let a = store.create_feature(NewFeature::named("a")).await.unwrap();
        let b = store
            .create_feature(NewFeature::named("b").depends_on([a.id]))
            .await
            .unwrap();
        let err = store.add_dependency(a.id, b.id).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::CycleDetected));
        assert!(store.database().get_feature(a.id).await.unwrap().dependencies.is_empty());
        assert!(store.get(a.id).await.unwrap().dependencies.is_empty());
    }

    #[tokio::test]
    async fn bulk_indices_must_point_backwards() {
        let store = store().await;
        let specs = vec![
            NewFeatureSpec {
                feature: NewFeature::named("a"),
                depends_on_indices: vec![1],
            },
            NewFeatureSpec {
                feature: NewFeature::named("b"),
                depends_on_indices: vec![],
            },
        ];
        assert!(matches!(
            store.create_bulk(specs).await,
            Err(ClaimError::InvalidIndex { position: 0, index: 1 })
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn skip_demotes_and_requeues() {
        let store = store().await;
        let a = store
            .create_feature(NewFeature::named("a").with_priority(Priority::P1))
            .await
            .unwrap();
        let b = store.create_feature(NewFeature::named("b")).await.unwrap();
        let skipped = store.skip(a.id).await.unwrap();
        assert_eq!(skipped.priority, Priority::P5);
        let order: Vec<FeatureId> = store.ready_set().await.iter().map(|f| f.id).collect();
        assert_eq!(order, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn stale_claims_are_cleared_on_reload() {
        let db = Database::open_in_memory().await.unwrap();
        let store = ClaimStore::load(db.clone(), EventBus::new(), 3).await.unwrap();
        let f = store.create_feature(NewFeature::named("x")).await.unwrap();
        store.claim("dead-agent", 1).await.unwrap();
        drop(store);

        let reloaded = ClaimStore::load(db, EventBus::new(), 3).await.unwrap();
        assert_eq!(reloaded.claimed_count().await, 1);
        assert_eq!(reloaded.clear_stale_claims().await.unwrap(), 1);
        assert_eq!(reloaded.ready_set().await[0].id, f.id);
    }

    #[tokio::test]
    async fn claimed_feature_cannot_be_removed() {
        let store = store().await;
        let f = store.create_feature(NewFeature::named("x")).await.unwrap();
        store.claim("agent", 1).await.unwrap();
        assert!(store.remove_feature(f.id).await.is_err());
        store.force_release(f.id).await.unwrap();
        assert_eq!(store.remove_feature(f.id).await.unwrap().id, f.id);
        assert!(store.is_empty().await);
    }
}
