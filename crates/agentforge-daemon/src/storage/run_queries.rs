//! Run history queries.

use agentforge_core::db::unix_timestamp;
use agentforge_core::model::{RunSettings, RunTrigger};

use super::db::{Database, DatabaseError};
use super::models::{RunOutcome, RunRecord};

impl Database {
    pub async fn insert_run(
        &self,
        id: &str,
        trigger: &RunTrigger,
        settings: &RunSettings,
        started_at: i64,
    ) -> Result<(), DatabaseError> {
        let trigger_json = serde_json::to_string(trigger)
            .map_err(|e| DatabaseError::Query(format!("encode trigger: {e}")))?;
        let settings_json = serde_json::to_string(settings)
            .map_err(|e| DatabaseError::Query(format!("encode settings: {e}")))?;

        sqlx::query(
            r"
            INSERT INTO runs (id, run_trigger, schedule_id, settings, status, started_at)
            VALUES (?, ?, ?, ?, 'running', ?)
            ",
        )
        .bind(id)
        .bind(trigger_json)
        .bind(trigger.schedule_id())
        .bind(settings_json)
        .bind(started_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn finish_run(
        &self,
        id: &str,
        outcome: RunOutcome,
        reason: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE runs SET status = ?, reason = ?, ended_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(outcome.as_str())
        .bind(reason)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Running run {id}")));
        }
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>, DatabaseError> {
        let runs = sqlx::query_as::<_, RunRecord>(
            "SELECT * FROM runs ORDER BY started_at DESC, rowid DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;
        Ok(runs)
    }

    /// Mark runs left `running` by a previous daemon as failed.
    pub async fn fail_interrupted_runs(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE runs SET status = 'failed', reason = 'daemon restarted', ended_at = ?
            WHERE status = 'running'
            ",
        )
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_run(&self, id: &str) -> Result<RunRecord, DatabaseError> {
        sqlx::query_as::<_, RunRecord>("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Run {id}")))
    }

    /// Latest run started by a schedule.
    pub async fn latest_run_for_schedule(
        &self,
        schedule_id: i64,
    ) -> Result<Option<RunRecord>, DatabaseError> {
        let run = sqlx::query_as::<_, RunRecord>(
            "SELECT * FROM runs WHERE schedule_id = ? ORDER BY started_at DESC, rowid DESC LIMIT 1",
        )
        .bind(schedule_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(run)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_lifecycle() {
        let db = Database::open_in_memory().await.unwrap();
        let trigger = RunTrigger::Scheduled {
            schedule_id: 3,
            window_start: 100,
            window_end: 200,
        };
        db.insert_run("run-1", &trigger, &RunSettings::default(), 100)
            .await
            .unwrap();
        db.insert_run("run-2", &RunTrigger::Manual, &RunSettings::default(), 150)
            .await
            .unwrap();

        db.finish_run("run-1", RunOutcome::Completed, None).await.unwrap();
        assert!(db.finish_run("run-1", RunOutcome::Failed, None).await.is_err());

        let runs = db.list_runs(10).await.unwrap();
        assert_eq!(runs[0].id, "run-2");
        assert_eq!(runs[1].status, "completed");
        assert_eq!(runs[1].schedule_id, Some(3));

        assert_eq!(db.get_run("run-2").await.unwrap().status, "running");
        assert!(matches!(
            db.get_run("nope").await,
            Err(DatabaseError::NotFound(_))
        ));
        let latest = db.latest_run_for_schedule(3).await.unwrap().unwrap();
        assert_eq!(latest.id, "run-1");
        assert!(db.latest_run_for_schedule(9).await.unwrap().is_none());

        assert_eq!(db.fail_interrupted_runs().await.unwrap(), 1);
    }
}
