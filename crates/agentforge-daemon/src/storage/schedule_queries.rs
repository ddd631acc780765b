//! Schedule queries.

use agentforge_core::db::unix_timestamp;
use agentforge_core::model::{NewSchedule, RunSettings, Schedule};

use super::db::{Database, DatabaseError};
use super::models::ScheduleRow;

fn encode_overrides(overrides: &RunSettings) -> Result<String, DatabaseError> {
    serde_json::to_string(overrides).map_err(|e| DatabaseError::Query(format!("encode overrides: {e}")))
}

impl Database {
    pub async fn create_schedule(&self, new: &NewSchedule) -> Result<Schedule, DatabaseError> {
        let now = unix_timestamp();
        let id = sqlx::query(
            r"
            INSERT INTO schedules (weekdays, start_time, duration_minutes, enabled, overrides,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(i64::from(new.weekdays.bits()))
        .bind(&new.start_time)
        .bind(i64::from(new.duration_minutes))
        .bind(new.enabled)
        .bind(encode_overrides(&new.overrides)?)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        self.get_schedule(id).await
    }

    pub async fn get_schedule(&self, id: i64) -> Result<Schedule, DatabaseError> {
        sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Schedule {id}")))?
            .try_into()
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>, DatabaseError> {
        sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules ORDER BY id")
            .fetch_all(self.pool())
            .await?
            .into_iter()
            .map(Schedule::try_from)
            .collect()
    }

    pub async fn count_schedules(&self) -> Result<i64, DatabaseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schedules")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Persist every mutable column of a schedule.
    pub async fn update_schedule(&self, schedule: &Schedule) -> Result<Schedule, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE schedules
            SET weekdays = ?, start_time = ?, duration_minutes = ?, enabled = ?, paused = ?,
                skip_next = ?, skip_until = ?, overrides = ?, failed_window_start = ?,
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(i64::from(schedule.weekdays.bits()))
        .bind(&schedule.start_time)
        .bind(i64::from(schedule.duration_minutes))
        .bind(schedule.enabled)
        .bind(schedule.paused)
        .bind(schedule.skip_next)
        .bind(schedule.skip_until)
        .bind(encode_overrides(&schedule.overrides)?)
        .bind(schedule.failed_window_start)
        .bind(unix_timestamp())
        .bind(schedule.id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Schedule {}", schedule.id)));
        }
        self.get_schedule(schedule.id).await
    }

    pub async fn delete_schedule(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use agentforge_core::model::Weekdays;

    fn nightly() -> NewSchedule {
        NewSchedule {
            weekdays: Weekdays::WORKDAYS,
            start_time: "22:00".into(),
            duration_minutes: 240,
            enabled: true,
            overrides: RunSettings {
                max_concurrency: Some(2),
                model: None,
                yolo: true,
            },
        }
    }

    #[tokio::test]
    async fn create_update_delete() {
        let db = Database::open_in_memory().await.unwrap();
        let mut s = db.create_schedule(&nightly()).await.unwrap();
        assert_eq!(s.weekdays, Weekdays::WORKDAYS);
        assert_eq!(s.overrides.max_concurrency, Some(2));
        assert!(s.is_active());

        s.paused = true;
        s.skip_next = true;
        s.skip_until = Some(1_000);
        let updated = db.update_schedule(&s).await.unwrap();
        assert!(updated.paused);
        assert_eq!(updated.skip_until, Some(1_000));

        assert_eq!(db.list_schedules().await.unwrap().len(), 1);
        assert!(db.delete_schedule(s.id).await.unwrap());
        assert_eq!(db.count_schedules().await.unwrap(), 0);
        assert!(matches!(
            db.get_schedule(s.id).await,
            Err(DatabaseError::NotFound(_))
        ));
    }
}
