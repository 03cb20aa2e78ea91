//! `SQLite` schema bootstrap logic.
//!
//! All definitions use `IF NOT EXISTS` and are safe to re-run on every
//! invocation.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS agent (
    id              TEXT PRIMARY KEY NOT NULL,
    repo_url        TEXT NOT NULL,
    workdir         TEXT NOT NULL,
    backend_kind    TEXT NOT NULL CHECK(backend_kind IN ('session','container')),
    backend_handle  TEXT,
    status          TEXT NOT NULL CHECK(status IN ('spawning','running','stopped','error')),
    stop_requested  INTEGER NOT NULL DEFAULT 0,
    config          TEXT NOT NULL DEFAULT '{}',
    created_at      TEXT NOT NULL,
    last_seen_at    TEXT,
    updated_at      TEXT NOT NULL,
    last_error      TEXT
);

CREATE TABLE IF NOT EXISTS retired_agent_id (
    id              TEXT PRIMARY KEY NOT NULL,
    retired_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_output (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id        TEXT NOT NULL,
    timestamp       TEXT NOT NULL,
    output_type     TEXT NOT NULL CHECK(output_type IN ('system','terminal')),
    content         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agent_status ON agent(status);
CREATE INDEX IF NOT EXISTS idx_output_agent ON agent_output(agent_id, seq);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
