//! Append-only output log per agent.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::output::{OutputKind, OutputLine};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for captured output lines.
#[derive(Clone)]
pub struct OutputRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct OutputRow {
    seq: i64,
    agent_id: String,
    timestamp: String,
    output_type: String,
    content: String,
}

impl OutputRow {
    fn into_line(self) -> Result<OutputLine> {
        let kind = match self.output_type.as_str() {
            "system" => OutputKind::System,
            "terminal" => OutputKind::Terminal,
            other => return Err(AppError::Db(format!("invalid output type: {other}"))),
        };
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| AppError::Db(format!("invalid output timestamp: {e}")))?
            .with_timezone(&Utc);
        Ok(OutputLine {
            seq: self.seq,
            agent_id: self.agent_id,
            timestamp,
            kind,
            content: self.content,
        })
    }
}

impl OutputRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append one line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn append(&self, agent_id: &str, kind: OutputKind, content: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_output (agent_id, timestamp, output_type, content)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(agent_id)
        .bind(Utc::now().to_rfc3339())
        .bind(kind.as_str())
        .bind(content)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Append a batch of lines in one transaction, preserving order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if any insert fails; nothing is written then.
    pub async fn append_many(
        &self,
        agent_id: &str,
        kind: OutputKind,
        lines: &[String],
    ) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let mut tx = self.db.begin().await?;
        for line in lines {
            sqlx::query(
                "INSERT INTO agent_output (agent_id, timestamp, output_type, content)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(agent_id)
            .bind(&now)
            .bind(kind.as_str())
            .bind(line)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Return the most recent `limit` lines (all when `None`) in append order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, agent_id: &str, limit: Option<u32>) -> Result<Vec<OutputLine>> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map_or(-1, i64::from);
        let rows: Vec<OutputRow> = sqlx::query_as(
            "SELECT seq, agent_id, timestamp, output_type, content FROM (
                 SELECT seq, agent_id, timestamp, output_type, content
                 FROM agent_output WHERE agent_id = ?1
                 ORDER BY seq DESC LIMIT ?2
             ) ORDER BY seq ASC",
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(OutputRow::into_line).collect()
    }

    /// Number of lines stored for an agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count(&self, agent_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM agent_output WHERE agent_id = ?1")
                .bind(agent_id)
                .fetch_one(self.db.as_ref())
                .await?;
        Ok(count)
    }
}
