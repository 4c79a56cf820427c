//! SQLite implementation of the crash-recovery `StateJournal` port.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::domain::error::AgentResult;
use crate::domain::models::{JournalEntry, JournalStatus, WorkAssignment};
use crate::domain::ports::StateJournal;

pub struct SqliteStateJournal {
    pool: SqlitePool,
}

impl SqliteStateJournal {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    status: String,
    work_json: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<RunRow> for JournalEntry {
    type Error = crate::domain::error::AgentError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = match row.status.as_str() {
            "pending" => JournalStatus::Pending,
            "running" => JournalStatus::Running,
            other => {
                return Err(crate::domain::error::AgentError::run_error(format!(
                    "unknown journal status {other}"
                )))
            }
        };
        let assignment: WorkAssignment = serde_json::from_str(&row.work_json)?;
        Ok(Self {
            run_id: row.run_id,
            status,
            assignment,
            created_at: row.created_at.parse().map_err(|e| {
                crate::domain::error::AgentError::run_error(format!("bad created_at: {e}"))
            })?,
            updated_at: row.updated_at.parse().map_err(|e| {
                crate::domain::error::AgentError::run_error(format!("bad updated_at: {e}"))
            })?,
        })
    }
}

#[async_trait]
impl StateJournal for SqliteStateJournal {
    async fn save(
        &self,
        run_id: &str,
        status: JournalStatus,
        assignment: &WorkAssignment,
    ) -> AgentResult<()> {
        let work_json = serde_json::to_string(assignment)?;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO runs (run_id, status, work_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(run_id) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(work_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, run_id: &str) -> AgentResult<()> {
        sqlx::query("DELETE FROM runs WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_pending(&self) -> AgentResult<Vec<JournalEntry>> {
        let rows: Vec<RunRow> = sqlx::query_as("SELECT * FROM runs")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JournalEntry::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::open_test_pool;
    use crate::adapters::sqlite::migrations::{all_embedded_migrations, Migrator};
    use crate::domain::models::{ExecutionType, GitRef};
    use std::collections::HashMap;

    fn sample_assignment(run_id: &str) -> WorkAssignment {
        WorkAssignment {
            run_id: run_id.to_string(),
            execution_type: ExecutionType::Subprocess,
            git_ref: GitRef {
                url: "https://example.test/repo.git".into(),
                ..Default::default()
            },
            tests: vec![],
            setup_commands: vec![],
            teardown_commands: vec![],
            environment: HashMap::new(),
            secrets: vec![],
            container_image: None,
            working_directory: None,
            deadline: None,
        }
    }

    async fn journal() -> SqliteStateJournal {
        let pool = open_test_pool().await.unwrap();
        Migrator::new(pool.clone())
            .run_embedded_migrations(all_embedded_migrations())
            .await
            .unwrap();
        SqliteStateJournal::new(pool)
    }

    #[tokio::test]
    async fn round_trip_persists_assignment() {
        let j = journal().await;
        let a = sample_assignment("run-1");
        j.save("run-1", JournalStatus::Running, &a).await.unwrap();

        let pending = j.get_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].run_id, "run-1");
        assert_eq!(pending[0].assignment.git_ref.url, a.git_ref.url);
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let j = journal().await;
        let a = sample_assignment("run-2");
        j.save("run-2", JournalStatus::Running, &a).await.unwrap();
        j.delete("run-2").await.unwrap();
        assert!(j.get_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_upserts_existing_row() {
        let j = journal().await;
        let a = sample_assignment("run-3");
        j.save("run-3", JournalStatus::Pending, &a).await.unwrap();
        j.save("run-3", JournalStatus::Running, &a).await.unwrap();
        let pending = j.get_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, JournalStatus::Running);
    }
}
