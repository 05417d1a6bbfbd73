//! Task history operations.

use crate::{Error, Result};

use super::{Database, NewTaskHistory, TaskHistoryEntry, TaskHistoryRow};

const HISTORY_COLUMNS: &str = r#"
    id, task_id, kind, queue, priority, status, attempt, max_attempts,
    input, result, error_kind, error_message, workflow_id, batch_id,
    created_at, started_at, finished_at
"#;

impl Database {
    /// Archive a terminal task
    pub async fn insert_task_history(&self, entry: &NewTaskHistory) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_history (
                task_id, kind, queue, priority, status, attempt, max_attempts,
                input, result, error_kind, error_message, workflow_id, batch_id,
                created_at, started_at, finished_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.task_id)
        .bind(&entry.kind)
        .bind(&entry.queue)
        .bind(entry.priority)
        .bind(entry.status)
        .bind(entry.attempt)
        .bind(entry.max_attempts)
        .bind(&entry.input)
        .bind(&entry.result)
        .bind(&entry.error_kind)
        .bind(&entry.error_message)
        .bind(entry.workflow_id)
        .bind(entry.batch_id)
        .bind(entry.created_at)
        .bind(entry.started_at)
        .bind(entry.finished_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Sqlx)?;

        Ok(result.last_insert_rowid())
    }

    /// Latest archived record of a task
    pub async fn get_task_history(&self, task_id: i64) -> Result<Option<TaskHistoryEntry>> {
        let sql = format!(
            "SELECT {} FROM task_history WHERE task_id = ? ORDER BY id DESC LIMIT 1",
            HISTORY_COLUMNS
        );
        let row = sqlx::query_as::<_, TaskHistoryRow>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Sqlx)?;

        Ok(row.map(TaskHistoryEntry::from))
    }

    /// Query history with pagination and optional status filter
    ///
    /// Most recently finished first.
    pub async fn query_history(
        &self,
        status_filter: Option<i32>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TaskHistoryEntry>> {
        let filter = if status_filter.is_some() {
            "WHERE status = ?"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {} FROM task_history {} ORDER BY finished_at DESC, id DESC LIMIT ? OFFSET ?",
            HISTORY_COLUMNS, filter
        );

        let mut query = sqlx::query_as::<_, TaskHistoryRow>(&sql);
        if let Some(status) = status_filter {
            query = query.bind(status);
        }
        let rows = query
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Sqlx)?;

        Ok(rows.into_iter().map(TaskHistoryEntry::from).collect())
    }

    /// Count history entries (optionally filtered by status)
    pub async fn count_history(&self, status_filter: Option<i32>) -> Result<i64> {
        let count = if let Some(status) = status_filter {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM task_history WHERE status = ?")
                .bind(status)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Sqlx)?
        } else {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM task_history")
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Sqlx)?
        };

        Ok(count)
    }
}
