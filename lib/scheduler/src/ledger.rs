//! The durable state ledger.
//!
//! An append-only `state(routine, instance, state, state_time_stamp)`
//! table backed by a single embedded SQLite file, not a server-backed
//! RDBMS (see DESIGN.md). Two read queries are exposed: `current_status`
//! (latest open-state row per `(routine, instance)`) and `task_result`
//! (all non-archived rows for one `(routine, instance)`, newest first).

use crate::task::{ParseTaskStateError, TaskState};
use cadence_core::Moment;
use cadence_core::time::ParseMomentError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Errors reading or writing the state ledger.
#[derive(Debug)]
pub enum LedgerError {
    /// Failed to open or migrate the database file.
    Connect { reason: String },
    /// A query failed to execute.
    Query { reason: String },
    /// A stored row could not be decoded back into domain types.
    Corrupt { reason: String },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { reason } => write!(f, "failed to open state ledger: {reason}"),
            Self::Query { reason } => write!(f, "state ledger query failed: {reason}"),
            Self::Corrupt { reason } => write!(f, "state ledger row is corrupt: {reason}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<ParseMomentError> for LedgerError {
    fn from(e: ParseMomentError) -> Self {
        Self::Corrupt { reason: e.to_string() }
    }
}

impl From<ParseTaskStateError> for LedgerError {
    fn from(e: ParseTaskStateError) -> Self {
        Self::Corrupt { reason: e.to_string() }
    }
}

/// One row of the current-status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub routine: String,
    pub instance: Moment,
    pub state: TaskState,
    pub stamp: Moment,
}

const OPEN_STATES: &str = "'Waiting','Ready','Running','Failure','Cancelled'";

/// A single-file, append-only record of task state transitions.
pub struct StateLedger {
    pool: SqlitePool,
}

impl StateLedger {
    /// Opens (creating if missing) the ledger at `path`, installing
    /// the schema on first open. `clean_start` truncates the table —
    /// only used on explicit operator opt-in (`--wipe`).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Connect`] if the database cannot be
    /// opened or migrated.
    pub async fn open(path: &Path, clean_start: bool) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| LedgerError::Connect { reason: e.to_string() })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS state (
                routine TEXT NOT NULL,
                instance TEXT NOT NULL,
                state TEXT NOT NULL,
                state_time_stamp TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| LedgerError::Connect { reason: e.to_string() })?;

        if clean_start {
            sqlx::query("DELETE FROM state")
                .execute(&pool)
                .await
                .map_err(|e| LedgerError::Connect { reason: e.to_string() })?;
        }

        Ok(Self { pool })
    }

    /// Opens a ledger backed by an in-memory database, for tests.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| LedgerError::Connect { reason: e.to_string() })?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS state (
                routine TEXT NOT NULL,
                instance TEXT NOT NULL,
                state TEXT NOT NULL,
                state_time_stamp TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| LedgerError::Connect { reason: e.to_string() })?;
        Ok(Self { pool })
    }

    /// Appends a state transition record. Inserts are never updated
    /// or deleted; the ledger is append-only.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Query`] if the insert fails.
    pub async fn record(
        &self,
        routine: &str,
        instance: Moment,
        state: TaskState,
        stamp: Moment,
    ) -> Result<(), LedgerError> {
        sqlx::query("INSERT INTO state (routine, instance, state, state_time_stamp) VALUES (?, ?, ?, ?)")
            .bind(routine)
            .bind(instance.to_string())
            .bind(state.as_str())
            .bind(stamp.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| LedgerError::Query { reason: e.to_string() })?;
        Ok(())
    }

    /// The latest state per `(routine, instance)` pair, filtered to
    /// open states and ordered by `instance, stamp`, optionally
    /// filtered to a single routine.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Query`] or [`LedgerError::Corrupt`].
    pub async fn current_status(&self, routine: Option<&str>) -> Result<Vec<StatusRow>, LedgerError> {
        let sql = format!(
            "SELECT routine, instance, state, state_time_stamp FROM (
                SELECT routine, instance, state, state_time_stamp, rowid,
                       ROW_NUMBER() OVER (
                           PARTITION BY routine, instance
                           ORDER BY state_time_stamp DESC, rowid DESC
                       ) AS rn
                FROM state
            ) WHERE rn = 1 AND state IN ({OPEN_STATES}){}
            ORDER BY instance, state_time_stamp",
            if routine.is_some() { " AND routine = ?" } else { "" }
        );

        let mut query = sqlx::query(&sql);
        if let Some(routine) = routine {
            query = query.bind(routine);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LedgerError::Query { reason: e.to_string() })?;

        rows.into_iter().map(Self::decode_status_row).collect()
    }

    /// All non-archived states for one `(routine, instance)` pair,
    /// newest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Query`] or [`LedgerError::Corrupt`].
    pub async fn task_result(
        &self,
        routine: &str,
        instance: Moment,
    ) -> Result<Vec<(TaskState, Moment)>, LedgerError> {
        let rows = sqlx::query(
            "SELECT state, state_time_stamp FROM state
             WHERE routine = ? AND instance = ? AND state != 'Archived'
             ORDER BY state_time_stamp DESC, rowid DESC",
        )
        .bind(routine)
        .bind(instance.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError::Query { reason: e.to_string() })?;

        rows.into_iter()
            .map(|row| {
                let state: String = row.try_get("state").map_err(|e| LedgerError::Query { reason: e.to_string() })?;
                let stamp: String = row
                    .try_get("state_time_stamp")
                    .map_err(|e| LedgerError::Query { reason: e.to_string() })?;
                Ok((TaskState::from_str(&state)?, Moment::from_str(&stamp)?))
            })
            .collect()
    }

    fn decode_status_row(row: sqlx::sqlite::SqliteRow) -> Result<StatusRow, LedgerError> {
        let routine: String = row.try_get("routine").map_err(|e| LedgerError::Query { reason: e.to_string() })?;
        let instance: String = row.try_get("instance").map_err(|e| LedgerError::Query { reason: e.to_string() })?;
        let state: String = row.try_get("state").map_err(|e| LedgerError::Query { reason: e.to_string() })?;
        let stamp: String = row
            .try_get("state_time_stamp")
            .map_err(|e| LedgerError::Query { reason: e.to_string() })?;
        Ok(StatusRow {
            routine,
            instance: Moment::from_str(&instance)?,
            state: TaskState::from_str(&state)?,
            stamp: Moment::from_str(&stamp)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moment(s: &str) -> Moment {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn insert_then_query_round_trip() {
        let ledger = StateLedger::open_in_memory().await.unwrap();
        let instance = moment("2021-09-22T08:00:00");
        ledger.record("r", instance, TaskState::Waiting, moment("2021-09-22T08:00:01")).await.unwrap();
        ledger.record("r", instance, TaskState::Ready, moment("2021-09-22T08:00:02")).await.unwrap();

        let result = ledger.task_result("r", instance).await.unwrap();
        assert_eq!(result.first().unwrap().0, TaskState::Ready);
    }

    #[tokio::test]
    async fn current_status_excludes_archived_and_terminal() {
        let ledger = StateLedger::open_in_memory().await.unwrap();
        let open_instance = moment("2021-09-22T08:00:00");
        let done_instance = moment("2021-09-22T09:00:00");

        ledger.record("r", open_instance, TaskState::Waiting, moment("2021-09-22T08:00:01")).await.unwrap();
        ledger.record("r", done_instance, TaskState::Success, moment("2021-09-22T09:00:01")).await.unwrap();
        ledger.record("r", done_instance, TaskState::Archived, moment("2021-09-22T09:00:02")).await.unwrap();

        let status = ledger.current_status(None).await.unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].instance, open_instance);
        assert_eq!(status[0].state, TaskState::Waiting);
    }

    #[tokio::test]
    async fn current_status_filters_by_routine() {
        let ledger = StateLedger::open_in_memory().await.unwrap();
        let instance = moment("2021-09-22T08:00:00");
        ledger.record("a", instance, TaskState::Waiting, moment("2021-09-22T08:00:01")).await.unwrap();
        ledger.record("b", instance, TaskState::Ready, moment("2021-09-22T08:00:01")).await.unwrap();

        let status = ledger.current_status(Some("a")).await.unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].routine, "a");
    }

    #[tokio::test]
    async fn clean_start_truncates_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        {
            let ledger = StateLedger::open(&path, false).await.unwrap();
            ledger
                .record("r", moment("2021-09-22T08:00:00"), TaskState::Waiting, moment("2021-09-22T08:00:01"))
                .await
                .unwrap();
        }

        let ledger = StateLedger::open(&path, true).await.unwrap();
        let status = ledger.current_status(None).await.unwrap();
        assert!(status.is_empty());
    }
}
