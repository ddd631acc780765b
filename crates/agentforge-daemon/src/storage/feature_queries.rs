//! Feature and dependency-edge queries.

use std::collections::{BTreeSet, HashMap};

use agentforge_core::db::unix_timestamp;
use agentforge_core::model::{Feature, FeatureId, NewFeature};

use super::db::{Database, DatabaseError};
use super::models::{DependencyRow, FeatureRow};

type Tx<'a> = sqlx::Transaction<'a, sqlx::Sqlite>;

async fn insert_feature_tx(
    tx: &mut Tx<'_>,
    new: &NewFeature,
    dependencies: &BTreeSet<FeatureId>,
    now: i64,
) -> Result<FeatureId, DatabaseError> {
    let steps = serde_json::to_string(&new.steps)
        .map_err(|e| DatabaseError::Query(format!("encode steps: {e}")))?;

    let id = sqlx::query(
        r"
        INSERT INTO features (name, description, category, steps, priority, status,
                              created_at, enqueued_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, ?)
        ",
    )
    .bind(&new.name)
    .bind(&new.description)
    .bind(&new.category)
    .bind(steps)
    .bind(i64::from(u8::from(new.priority)))
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();

    insert_edges_tx(tx, id, dependencies).await?;
    Ok(id)
}

async fn insert_edges_tx(
    tx: &mut Tx<'_>,
    id: FeatureId,
    dependencies: &BTreeSet<FeatureId>,
) -> Result<(), DatabaseError> {
    for dep in dependencies {
        sqlx::query("INSERT INTO feature_dependencies (feature_id, depends_on) VALUES (?, ?)")
            .bind(id)
            .bind(dep)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

impl Database {
    // =========================================================================
    // Feature creation
    // =========================================================================

    /// Insert one feature with its dependency edges.
    pub async fn create_feature(&self, new: &NewFeature) -> Result<Feature, DatabaseError> {
        let deps: BTreeSet<FeatureId> = new.dependencies.iter().copied().collect();
        let mut tx = self.pool().begin().await?;
        let id = insert_feature_tx(&mut tx, new, &deps, unix_timestamp()).await?;
        tx.commit().await?;
        self.get_feature(id).await
    }

    /// Insert a batch atomically. Each entry carries indices of earlier
    /// entries it depends on, resolved to ids as rows are inserted.
    pub async fn create_features(
        &self,
        batch: &[(NewFeature, Vec<usize>)],
    ) -> Result<Vec<Feature>, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;
        let mut ids: Vec<FeatureId> = Vec::with_capacity(batch.len());

        for (new, indices) in batch {
            let mut deps: BTreeSet<FeatureId> = new.dependencies.iter().copied().collect();
            for &index in indices {
                let id = ids.get(index).copied().ok_or_else(|| {
                    DatabaseError::Query(format!("dependency index {index} is not an earlier entry"))
                })?;
                deps.insert(id);
            }
            ids.push(insert_feature_tx(&mut tx, new, &deps, now).await?);
        }

        tx.commit().await?;

        let mut created = Vec::with_capacity(ids.len());
        for id in ids {
            created.push(self.get_feature(id).await?);
        }
        Ok(created)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a feature by ID, including dependencies.
    pub async fn get_feature(&self, id: FeatureId) -> Result<Feature, DatabaseError> {
        let row = sqlx::query_as::<_, FeatureRow>("SELECT * FROM features WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Feature {id}")))?;

        let deps: Vec<i64> = sqlx::query_scalar(
            "SELECT depends_on FROM feature_dependencies WHERE feature_id = ?",
        )
        .bind(id)
        .fetch_all(self.pool())
        .await?;

        row.into_feature(deps.into_iter().collect())
    }

    /// All features with their dependencies, ordered by id.
    pub async fn list_features(&self) -> Result<Vec<Feature>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeatureRow>("SELECT * FROM features ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        let edges = sqlx::query_as::<_, DependencyRow>(
            "SELECT feature_id, depends_on FROM feature_dependencies",
        )
        .fetch_all(self.pool())
        .await?;

        let mut deps: HashMap<FeatureId, BTreeSet<FeatureId>> = HashMap::new();
        for edge in edges {
            deps.entry(edge.feature_id).or_default().insert(edge.depends_on);
        }

        rows.into_iter()
            .map(|row| {
                let d = deps.remove(&row.id).unwrap_or_default();
                row.into_feature(d)
            })
            .collect()
    }

    pub async fn count_features(&self) -> Result<i64, DatabaseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM features")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Replace a feature's dependency set.
    pub async fn set_feature_dependencies(
        &self,
        id: FeatureId,
        dependencies: &BTreeSet<FeatureId>,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM feature_dependencies WHERE feature_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        insert_edges_tx(&mut tx, id, dependencies).await?;
        sqlx::query("UPDATE features SET updated_at = ? WHERE id = ?")
            .bind(unix_timestamp())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete a feature. Edges in both directions cascade.
    pub async fn delete_feature(&self, id: FeatureId) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM features WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Compare-and-set claim of a ready feature.
    ///
    /// Succeeds only if the row is still `pending` and unclaimed.
    pub async fn try_claim_feature(
        &self,
        id: FeatureId,
        agent_id: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE features
            SET claimed_by = ?, claimed_at = ?, status = 'in_progress', updated_at = ?
            WHERE id = ? AND claimed_by IS NULL AND status = 'pending'
            ",
        )
        .bind(agent_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Compare-and-set claim of a passing feature for regression testing.
    pub async fn try_claim_regression(
        &self,
        id: FeatureId,
        agent_id: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE features
            SET claimed_by = ?, claimed_at = ?, updated_at = ?
            WHERE id = ? AND claimed_by IS NULL AND status = 'passing'
            ",
        )
        .bind(agent_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Persist the mutable queue/claim fields of a feature.
    pub async fn save_feature_state(&self, feature: &Feature) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE features
            SET status = ?, priority = ?, claimed_by = ?, claimed_at = ?,
                failure_count = ?, last_tested_at = ?, enqueued_at = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(feature.status.as_str())
        .bind(i64::from(u8::from(feature.priority)))
        .bind(feature.claimed_by.as_deref())
        .bind(feature.claimed_at)
        .bind(i64::from(feature.failure_count))
        .bind(feature.last_tested_at)
        .bind(feature.enqueued_at)
        .bind(unix_timestamp())
        .bind(feature.id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Feature {}", feature.id)));
        }
        Ok(())
    }

    /// Drop every stored claim; in-progress features go back to pending.
    pub async fn clear_claims(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE features
            SET status = CASE WHEN status = 'in_progress' THEN 'pending' ELSE status END,
                claimed_by = NULL, claimed_at = NULL, updated_at = ?
            WHERE claimed_by IS NOT NULL OR status = 'in_progress'
            ",
        )
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
