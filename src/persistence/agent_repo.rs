//! Agent record repository for `SQLite` persistence.
//!
//! Every status mutation is a compare-and-set: the `UPDATE` names the
//! status (and where relevant the handle) it expects to replace and
//! reports whether it won. Concurrent invocations touching the same agent
//! therefore serialize on the row instead of racing.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::agent::{AgentConfig, AgentFilter, AgentRecord, AgentStatus, BackendKind};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for agent records.
#[derive(Clone)]
pub struct AgentRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    repo_url: String,
    workdir: String,
    backend_kind: String,
    backend_handle: Option<String>,
    status: String,
    stop_requested: i64,
    config: String,
    created_at: String,
    last_seen_at: Option<String>,
    updated_at: String,
    last_error: Option<String>,
}

impl AgentRow {
    fn into_record(self) -> Result<AgentRecord> {
        let config: AgentConfig = serde_json::from_str(&self.config)
            .map_err(|e| AppError::Db(format!("invalid agent config: {e}")))?;

        Ok(AgentRecord {
            id: self.id,
            repo_url: self.repo_url,
            workdir: PathBuf::from(self.workdir),
            backend_kind: self.backend_kind.parse::<BackendKind>()?,
            backend_handle: self.backend_handle.filter(|h| !h.is_empty()),
            status: self.status.parse::<AgentStatus>()?,
            stop_requested: self.stop_requested != 0,
            config,
            created_at: parse_ts("created_at", &self.created_at)?,
            last_seen_at: self
                .last_seen_at
                .as_deref()
                .map(|s| parse_ts("last_seen_at", s))
                .transpose()?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            last_error: self.last_error,
        })
    }
}

fn parse_ts(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

const SELECT_COLUMNS: &str = "SELECT id, repo_url, workdir, backend_kind, backend_handle, status,
            stop_requested, config, created_at, last_seen_at, updated_at, last_error
     FROM agent";

/// `?, ?, ...` with `n` placeholders.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl AgentRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new agent record.
    ///
    /// The primary key and the retired-id ledger together guarantee an id is
    /// claimed by exactly one record, ever.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the id is in use or was used before,
    /// or `AppError::Db` if the insert fails otherwise.
    pub async fn insert(&self, record: &AgentRecord) -> Result<AgentRecord> {
        let config = serde_json::to_string(&record.config)
            .map_err(|e| AppError::Db(format!("failed to encode agent config: {e}")))?;
        let workdir = record.workdir.to_string_lossy().into_owned();

        let mut tx = self.db.begin().await?;

        let retired: Option<(String,)> =
            sqlx::query_as("SELECT id FROM retired_agent_id WHERE id = ?1")
                .bind(&record.id)
                .fetch_optional(&mut *tx)
                .await?;
        if retired.is_some() {
            return Err(AppError::Conflict(format!(
                "agent id {} was used before and cannot be reused",
                record.id
            )));
        }

        let inserted = sqlx::query(
            "INSERT INTO agent (id, repo_url, workdir, backend_kind, backend_handle, status,
                                stop_requested, config, created_at, last_seen_at, updated_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&record.id)
        .bind(&record.repo_url)
        .bind(&workdir)
        .bind(record.backend_kind.as_str())
        .bind(record.handle())
        .bind(record.status.as_str())
        .bind(i64::from(record.stop_requested))
        .bind(&config)
        .bind(record.created_at.to_rfc3339())
        .bind(record.last_seen_at.map(|t| t.to_rfc3339()))
        .bind(record.updated_at.to_rfc3339())
        .bind(&record.last_error)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(AppError::Conflict(format!(
                    "agent id {} already exists",
                    record.id
                )));
            }
            Err(err) => return Err(err.into()),
        }

        tx.commit().await?;
        Ok(record.clone())
    }

    /// Retrieve an agent by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<AgentRecord>> {
        let row: Option<AgentRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(AgentRow::into_record).transpose()
    }

    /// Retrieve an agent by identifier, failing when absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no record exists.
    pub async fn get_required(&self, id: &str) -> Result<AgentRecord> {
        self.get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("agent {id} not found")))
    }

    /// List agents matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_where(&self, filter: &AgentFilter) -> Result<Vec<AgentRecord>> {
        let rows: Vec<AgentRow> = match filter {
            AgentFilter::All => {
                sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY created_at DESC"))
                    .fetch_all(self.db.as_ref())
                    .await?
            }
            AgentFilter::Id(id) => {
                sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
                    .bind(id)
                    .fetch_all(self.db.as_ref())
                    .await?
            }
            AgentFilter::Status(status) => {
                sqlx::query_as(&format!(
                    "{SELECT_COLUMNS} WHERE status = ?1 ORDER BY created_at DESC"
                ))
                .bind(status.as_str())
                .fetch_all(self.db.as_ref())
                .await?
            }
        };
        rows.into_iter().map(AgentRow::into_record).collect()
    }

    /// List agents whose status may be backed by a live instance.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_live(&self) -> Result<Vec<AgentRecord>> {
        let rows: Vec<AgentRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE status IN ('spawning','running') ORDER BY created_at ASC"
        ))
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(AgentRow::into_record).collect()
    }

    /// All agent ids currently in the store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM agent")
            .fetch_all(self.db.as_ref())
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Record the handle of a freshly created instance and move the agent
    /// to `running`.
    ///
    /// Only succeeds while the agent is still `spawning` and no stop has
    /// been requested in the meantime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if another writer changed the record
    /// first, or `AppError::Db` if the update fails.
    pub async fn mark_running(&self, id: &str, handle: &str) -> Result<AgentRecord> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE agent
             SET status = 'running', backend_handle = ?1, last_seen_at = ?2,
                 updated_at = ?2, last_error = NULL
             WHERE id = ?3 AND status = 'spawning' AND stop_requested = 0",
        )
        .bind(handle)
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 1 {
            self.get_required(id).await
        } else {
            Err(AppError::Conflict(format!(
                "agent {id} left spawning before its instance was recorded"
            )))
        }
    }

    /// Move the agent to `error`, clearing its handle, if it is currently in
    /// one of `expected`.
    ///
    /// Returns whether the transition was applied.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_error(
        &self,
        id: &str,
        expected: &[AgentStatus],
        message: &str,
    ) -> Result<bool> {
        self.settle(id, expected, AgentStatus::Error, Some(message))
            .await
    }

    /// Move the agent to `stopped`, clearing its handle, if it is currently
    /// in one of `expected`.
    ///
    /// Returns whether the transition was applied.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_stopped(&self, id: &str, expected: &[AgentStatus]) -> Result<bool> {
        self.settle(id, expected, AgentStatus::Stopped, None).await
    }

    async fn settle(
        &self,
        id: &str,
        expected: &[AgentStatus],
        to: AgentStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let expected: Vec<AgentStatus> = expected
            .iter()
            .copied()
            .filter(|from| from.can_transition_to(to))
            .collect();
        if expected.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE agent
             SET status = ?, backend_handle = NULL, updated_at = ?,
                 last_error = COALESCE(?, last_error)
             WHERE id = ? AND status IN ({})",
            placeholders(expected.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(message)
            .bind(id);
        for status in &expected {
            query = query.bind(status.as_str());
        }
        let result = query.execute(self.db.as_ref()).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Refresh `updated_at` of a handle-less `spawning` record, showing the
    /// spawn that owns it is still making progress.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn heartbeat_spawn(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agent SET updated_at = ?1
             WHERE id = ?2 AND status = 'spawning' AND backend_handle IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Settle a spawn that stopped making progress.
    ///
    /// Applies only while the record is still handle-less `spawning` and
    /// untouched since `seen_updated_at`, so a spawn that heartbeats after
    /// the caller read the record is left alone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn expire_spawn(
        &self,
        id: &str,
        seen_updated_at: DateTime<Utc>,
        to: AgentStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        if !AgentStatus::Spawning.can_transition_to(to) {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE agent
             SET status = ?1, updated_at = ?2, last_error = COALESCE(?3, last_error)
             WHERE id = ?4 AND status = 'spawning' AND backend_handle IS NULL
               AND updated_at = ?5",
        )
        .bind(to.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(message)
        .bind(id)
        .bind(seen_updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Resolve a vanished instance: if the agent is still live with exactly
    /// `handle`, move it to `to` and clear the handle.
    ///
    /// Keyed on the observed handle so a pass working from stale data can
    /// never clobber a newer instance.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn resolve_gone(
        &self,
        id: &str,
        handle: &str,
        to: AgentStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agent
             SET status = ?1, backend_handle = NULL, updated_at = ?2,
                 last_error = COALESCE(?3, last_error)
             WHERE id = ?4 AND backend_handle = ?5 AND status IN ('spawning','running')",
        )
        .bind(to.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(message)
        .bind(id)
        .bind(handle)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Flag that a graceful stop was requested for a live agent.
    ///
    /// Returns whether the agent was live.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn request_stop(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agent SET stop_requested = 1, updated_at = ?1
             WHERE id = ?2 AND status IN ('spawning','running')",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Claim a `stopped` or `error` agent for respawn, moving it back to
    /// `spawning` with no handle.
    ///
    /// Exactly one concurrent caller wins.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the agent is not in a respawnable
    /// state, or `AppError::Db` if the update fails.
    pub async fn begin_respawn(&self, id: &str) -> Result<AgentRecord> {
        let from: Vec<AgentStatus> = AgentStatus::ALL
            .into_iter()
            .filter(|s| !s.is_live() && s.can_transition_to(AgentStatus::Spawning))
            .collect();
        let sql = format!(
            "UPDATE agent
             SET status = 'spawning', backend_handle = NULL, stop_requested = 0, updated_at = ?
             WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql).bind(Utc::now().to_rfc3339()).bind(id);
        for status in &from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(self.db.as_ref()).await?;

        if result.rows_affected() == 1 {
            self.get_required(id).await
        } else {
            let current = self.get_required(id).await?;
            Err(AppError::Conflict(format!(
                "agent {id} is {} and cannot be respawned",
                current.status
            )))
        }
    }

    /// Record a successful probe of `handle`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn touch_seen(&self, id: &str, handle: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agent SET last_seen_at = ?1 WHERE id = ?2 AND backend_handle = ?3",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(handle)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete an agent record together with its output log, and retire its
    /// id permanently.
    ///
    /// Returns whether a record was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM agent_output WHERE agent_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM agent WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO retired_agent_id (id, retired_at) VALUES (?1, ?2)")
            .bind(id)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }
}
