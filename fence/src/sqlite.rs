//! `SQLite` adapter for [`ConditionalStore`].
//!
//! Conditions are rendered into the `WHERE` clause of a single statement, so
//! the database evaluates them atomically with the write. A condition that
//! admits an absent record runs as an upsert; anything else runs as a plain
//! `UPDATE`. In both cases `RETURNING` yields no row when the condition is
//! false, which is how a failed condition is told apart from an error.

use crate::{
    record::{Fence, LeaseRecord},
    store::{Condition, ConditionalStore, Mutation, StoreError, UpdateOutcome},
    time::Timestamp,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{
    ffi, params_from_iter, types::Value, Connection, OpenFlags, OptionalExtension, Row,
};
use std::{path::Path, sync::Arc, time::Duration};
use tracing::debug;

pub const DEFAULT_TABLE: &str = "leases";

const COLUMNS: &str = "name, holder_nonce, fence, acquire_time, heartbeat_time, expire_time, body";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    table: Arc<str>,
}

impl SqliteStore {
    /// Opens (creating if needed) a database file. Call
    /// [`ConditionalStore::ensure_schema`] before first use.
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Ok(Self::from_connection(conn, table))
    }

    pub fn in_memory(table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn, table))
    }

    fn from_connection(conn: Connection, table: &str) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            table: Arc::from(table),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &str) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let table = Arc::clone(&self.table);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn, &table)
        })
        .await?
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && table.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::Config(format!("invalid table name {table:?}")))
    }
}

fn ts(t: Timestamp) -> Value {
    Value::Integer(t.as_nanos())
}

fn fence_value(fence: Fence) -> Option<Value> {
    i64::try_from(fence).ok().map(Value::Integer)
}

/// Appends `value` and returns its `?N` placeholder.
fn bind(params: &mut Vec<Value>, value: Value) -> String {
    params.push(value);
    format!("?{}", params.len())
}

fn render_condition(cond: &Condition, table: &str, params: &mut Vec<Value>) -> String {
    match cond {
        // Only ever evaluated against a row that exists
        Condition::Absent => "0".to_string(),
        Condition::Exists => "1".to_string(),
        Condition::LiveAt(t) => format!("\"{table}\".expire_time > {}", bind(params, ts(*t))),
        Condition::ExpiredAt(t) => format!("\"{table}\".expire_time <= {}", bind(params, ts(*t))),
        Condition::NonceIs(nonce) => {
            format!("\"{table}\".holder_nonce = {}", bind(params, Value::Text(nonce.clone())))
        }
        Condition::FenceIs(fence) => match fence_value(*fence) {
            Some(v) => format!("\"{table}\".fence = {}", bind(params, v)),
            // No stored fence can exceed i64::MAX
            None => "0".to_string(),
        },
        Condition::All(conds) if conds.is_empty() => "1".to_string(),
        Condition::Any(conds) if conds.is_empty() => "0".to_string(),
        Condition::All(conds) => join(conds, " AND ", table, params),
        Condition::Any(conds) => join(conds, " OR ", table, params),
    }
}

fn join(conds: &[Condition], op: &str, table: &str, params: &mut Vec<Value>) -> String {
    let parts: Vec<String> = conds
        .iter()
        .map(|c| render_condition(c, table, params))
        .collect();
    format!("({})", parts.join(op))
}

fn render_assignments(mutations: &[Mutation], table: &str, params: &mut Vec<Value>) -> String {
    let mut sets: Vec<String> = mutations
        .iter()
        .map(|m| match m {
            Mutation::SetNonce(nonce) => {
                format!("holder_nonce = {}", bind(params, Value::Text(nonce.clone())))
            }
            // NULL at the ceiling trips the NOT NULL constraint
            Mutation::IncrementFence => {
                let ceiling = bind(params, Value::Integer(i64::MAX));
                format!(
                    "fence = CASE WHEN \"{table}\".fence < {ceiling} THEN \"{table}\".fence + 1 END"
                )
            }
            Mutation::SetAcquireTime(t) => format!("acquire_time = {}", bind(params, ts(*t))),
            Mutation::SetHeartbeatTime(t) => format!("heartbeat_time = {}", bind(params, ts(*t))),
            Mutation::SetExpireTime(t) => format!("expire_time = {}", bind(params, ts(*t))),
            Mutation::SetBody(body) => format!("body = {}", bind(params, Value::Text(body.clone()))),
        })
        .collect();
    if sets.is_empty() {
        sets.push("name = name".to_string());
    }
    sets.join(", ")
}

struct RawRecord {
    name: String,
    holder_nonce: String,
    fence: i64,
    acquire_time: i64,
    heartbeat_time: i64,
    expire_time: i64,
    body: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        name: row.get(0)?,
        holder_nonce: row.get(1)?,
        fence: row.get(2)?,
        acquire_time: row.get(3)?,
        heartbeat_time: row.get(4)?,
        expire_time: row.get(5)?,
        body: row.get(6)?,
    })
}

impl TryFrom<RawRecord> for LeaseRecord {
    type Error = StoreError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        let fence = Fence::try_from(raw.fence).map_err(|_| StoreError::Corrupt {
            name: raw.name.clone(),
            reason: format!("negative fence {}", raw.fence),
        })?;
        Ok(LeaseRecord {
            name: raw.name,
            holder_nonce: raw.holder_nonce,
            fence,
            acquire_time: Timestamp::from_nanos(raw.acquire_time),
            heartbeat_time: Timestamp::from_nanos(raw.heartbeat_time),
            expire_time: Timestamp::from_nanos(raw.expire_time),
            body: raw.body,
        })
    }
}

fn update_if_blocking(
    conn: &Connection,
    table: &str,
    name: &str,
    condition: &Condition,
    mutations: &[Mutation],
) -> Result<UpdateOutcome, StoreError> {
    let mut params = Vec::new();

    let sql = if condition.evaluate(None) {
        let mut fresh = LeaseRecord::vacant(name);
        for m in mutations {
            m.apply(&mut fresh)?;
        }
        let fresh_fence = fence_value(fresh.fence).ok_or_else(|| StoreError::Corrupt {
            name: name.to_string(),
            reason: "fence out of range".to_string(),
        })?;
        let values = [
            bind(&mut params, Value::Text(fresh.name)),
            bind(&mut params, Value::Text(fresh.holder_nonce)),
            bind(&mut params, fresh_fence),
            bind(&mut params, ts(fresh.acquire_time)),
            bind(&mut params, ts(fresh.heartbeat_time)),
            bind(&mut params, ts(fresh.expire_time)),
            bind(&mut params, Value::Text(fresh.body)),
        ]
        .join(", ");
        let sets = render_assignments(mutations, table, &mut params);
        let cond = render_condition(condition, table, &mut params);
        format!(
            "INSERT INTO \"{table}\" ({COLUMNS}) VALUES ({values}) \
             ON CONFLICT(name) DO UPDATE SET {sets} WHERE {cond} \
             RETURNING {COLUMNS}"
        )
    } else {
        let sets = render_assignments(mutations, table, &mut params);
        let key = bind(&mut params, Value::Text(name.to_string()));
        let cond = render_condition(condition, table, &mut params);
        format!(
            "UPDATE \"{table}\" SET {sets} WHERE \"{table}\".name = {key} AND {cond} \
             RETURNING {COLUMNS}"
        )
    };

    let row = conn
        .query_row(&sql, params_from_iter(params.iter()), read_row)
        .optional()
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.extended_code == ffi::SQLITE_CONSTRAINT_NOTNULL
                    && mutations.contains(&Mutation::IncrementFence) =>
            {
                StoreError::FenceExhausted {
                    name: name.to_string(),
                }
            }
            other => StoreError::from(other),
        })?;
    match row {
        Some(raw) => Ok(UpdateOutcome::Applied(LeaseRecord::try_from(raw)?)),
        None => Ok(UpdateOutcome::ConditionFailed),
    }
}

#[async_trait]
impl ConditionalStore for SqliteStore {
    async fn update_if(
        &self,
        name: &str,
        condition: &Condition,
        mutations: &[Mutation],
    ) -> Result<UpdateOutcome, StoreError> {
        let name = name.to_owned();
        let condition = condition.clone();
        let mutations = mutations.to_vec();
        self.with_conn(move |conn, table| {
            update_if_blocking(conn, table, &name, &condition, &mutations)
        })
        .await
    }

    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>, StoreError> {
        let name = name.to_owned();
        self.with_conn(move |conn, table| {
            let sql = format!("SELECT {COLUMNS} FROM \"{table}\" WHERE name = ?1");
            conn.query_row(&sql, [&name], read_row)
                .optional()?
                .map(LeaseRecord::try_from)
                .transpose()
        })
        .await
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn, table| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (
                    name           TEXT PRIMARY KEY NOT NULL,
                    holder_nonce   TEXT NOT NULL,
                    fence          INTEGER NOT NULL,
                    acquire_time   INTEGER NOT NULL,
                    heartbeat_time INTEGER NOT NULL,
                    expire_time    INTEGER NOT NULL,
                    body           TEXT NOT NULL DEFAULT ''
                );"
            ))?;
            debug!("Ensured lease table {table}");
            Ok(())
        })
        .await
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MAX_FENCE;

    async fn store() -> SqliteStore {
        let store = SqliteStore::in_memory(DEFAULT_TABLE).unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("leases").is_ok());
        assert!(validate_table_name("_Leases_2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2leases").is_err());
        assert!(validate_table_name("leases; DROP TABLE x").is_err());
        assert!(validate_table_name("le\"ases").is_err());
        assert!(SqliteStore::in_memory("bad name").is_err());
    }

    #[test]
    fn test_render_condition() {
        let mut params = Vec::new();
        let cond = Condition::All(vec![
            Condition::Exists,
            Condition::LiveAt(Timestamp::from_nanos(5)),
            Condition::FenceIs(2),
        ]);
        let sql = render_condition(&cond, "leases", &mut params);
        assert_eq!(
            sql,
            "(1 AND \"leases\".expire_time > ?1 AND \"leases\".fence = ?2)"
        );
        assert_eq!(params, vec![Value::Integer(5), Value::Integer(2)]);

        let mut params = Vec::new();
        let sql = render_condition(&Condition::FenceIs(u64::MAX), "leases", &mut params);
        assert_eq!(sql, "0");
        assert!(params.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let store = store().await;
        store.ensure_schema().await.unwrap();
        assert!(store.get("job1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_and_conditional_update() {
        let store = store().await;
        let acquirable = Condition::Any(vec![
            Condition::Absent,
            Condition::ExpiredAt(Timestamp::from_nanos(100)),
            Condition::NonceIs("n1".to_string()),
        ]);
        let grant = [
            Mutation::SetNonce("n1".to_string()),
            Mutation::IncrementFence,
            Mutation::SetExpireTime(Timestamp::from_nanos(500)),
        ];

        let first = store.update_if("job1", &acquirable, &grant).await.unwrap();
        let UpdateOutcome::Applied(rec) = first else {
            panic!("first insert should apply");
        };
        assert_eq!(rec.fence, 1);
        assert_eq!(rec.holder_nonce, "n1");
        assert_eq!(rec.body, "");

        // Same nonce takes the conflict branch and bumps the fence
        let second = store.update_if("job1", &acquirable, &grant).await.unwrap();
        let UpdateOutcome::Applied(rec) = second else {
            panic!("re-acquire by nonce should apply");
        };
        assert_eq!(rec.fence, 2);

        let other = Condition::Any(vec![
            Condition::Absent,
            Condition::ExpiredAt(Timestamp::from_nanos(100)),
            Condition::NonceIs("n2".to_string()),
        ]);
        let third = store.update_if("job1", &other, &grant).await.unwrap();
        assert_eq!(third, UpdateOutcome::ConditionFailed);

        let stored = store.get("job1").await.unwrap().unwrap();
        assert_eq!(stored.fence, 2);
        assert_eq!(stored.expire_time, Timestamp::from_nanos(500));
    }

    #[tokio::test]
    async fn test_update_on_absent_record_fails_condition() {
        let store = store().await;
        let outcome = store
            .update_if(
                "missing",
                &Condition::All(vec![Condition::Exists, Condition::FenceIs(1)]),
                &[Mutation::SetExpireTime(Timestamp::EPOCH)],
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::ConditionFailed);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_table_is_an_error() {
        let store = SqliteStore::in_memory("never_created").unwrap();
        let err = store.get("job1").await.unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("leases.db");
        {
            let store = SqliteStore::open(&path, "locks").unwrap();
            store.ensure_schema().await.unwrap();
            store
                .update_if(
                    "job1",
                    &Condition::Absent,
                    &[Mutation::IncrementFence, Mutation::SetBody("ckpt".to_string())],
                )
                .await
                .unwrap();
        }

        let reopened = SqliteStore::open(&path, "locks").unwrap();
        let rec = reopened.get("job1").await.unwrap().unwrap();
        assert_eq!(rec.fence, 1);
        assert_eq!(rec.body, "ckpt");
        assert_eq!(reopened.table(), "locks");
    }

    #[tokio::test]
    async fn test_exhausted_fence_is_an_error() {
        let store = store().await;
        store
            .update_if("job1", &Condition::Absent, &[Mutation::IncrementFence])
            .await
            .unwrap();
        store
            .conn
            .lock()
            .execute("UPDATE leases SET fence = ?1, body = 'ckpt'", [i64::MAX])
            .unwrap();

        let err = store
            .update_if(
                "job1",
                &Condition::Exists,
                &[Mutation::SetBody("lost".to_string()), Mutation::IncrementFence],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FenceExhausted { .. }));

        let rec = store.get("job1").await.unwrap().unwrap();
        assert_eq!(rec.fence, MAX_FENCE);
        assert_eq!(rec.body, "ckpt");
    }
}
