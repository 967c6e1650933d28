//! SQLite implementation of `RemoteStore`.
//!
//! # Responsibility
//! - Persist region children in the `remote_children` table so a data set
//!   can be re-attached after a restart.
//!
//! # Invariants
//! - Children of a region are returned in first-insertion order (`seq`).
//! - Each write runs in its own transaction; listeners are notified only
//!   after it commits.

use crate::db::{open_db, open_db_in_memory};
use crate::scheduler::Scheduler;
use crate::sync::error::{RemoteError, RemoteResult};
use crate::sync::remote_store::{
    change_event, merge_fields, ListenerId, ListenerRegistry, RemoteEvent, RemoteListener,
    RemoteRecord, RemoteStore,
};
use log::{debug, error};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value as JsonValue};
use std::path::Path;
use std::rc::Weak;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub struct SqliteRemoteStore {
    conn: Connection,
    listeners: ListenerRegistry,
}

impl SqliteRemoteStore {
    /// Opens (or creates) a store file and applies pending migrations.
    pub fn open(path: impl AsRef<Path>, scheduler: Scheduler) -> RemoteResult<Self> {
        Ok(Self::from_connection(open_db(path)?, scheduler))
    }

    pub fn in_memory(scheduler: Scheduler) -> RemoteResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?, scheduler))
    }

    /// Wraps an already migrated connection.
    pub fn from_connection(conn: Connection, scheduler: Scheduler) -> Self {
        Self {
            conn,
            listeners: ListenerRegistry::new(scheduler),
        }
    }

    pub fn record(&self, region: &str, key: &str) -> RemoteResult<Option<JsonValue>> {
        read_child(&self.conn, region, key)
    }

    fn write(&self, op: &str, region: &str, key: &str, value: JsonValue) -> RemoteResult<bool> {
        let event = match self.write_in_transaction(region, key, &value) {
            Ok(event) => event,
            Err(err) => {
                error!(
                    "event=remote_write module=sqlite_store status=error op={} region={} key={} error={}",
                    op, region, key, err
                );
                return Err(err);
            }
        };
        debug!(
            "event=remote_write module=sqlite_store status=ok op={} region={} key={}",
            op, region, key
        );
        let Some(event) = event else {
            return Ok(false);
        };
        self.listeners.notify(region, event);
        Ok(true)
    }

    fn write_in_transaction(
        &self,
        region: &str,
        key: &str,
        value: &JsonValue,
    ) -> RemoteResult<Option<RemoteEvent>> {
        let tx = self.conn.unchecked_transaction()?;
        let previous = read_child(&tx, region, key)?;
        let event = change_event(key, previous.as_ref(), value);

        match (previous.is_some(), value) {
            (true, JsonValue::Null) => {
                tx.execute(
                    "DELETE FROM remote_children WHERE region = ?1 AND child_key = ?2;",
                    params![region, key],
                )?;
            }
            (false, JsonValue::Null) => {}
            (true, value) => {
                tx.execute(
                    "UPDATE remote_children SET payload = ?3, updated_at = ?4
                     WHERE region = ?1 AND child_key = ?2;",
                    params![region, key, serde_json::to_string(value)?, now_millis()],
                )?;
            }
            (false, value) => {
                tx.execute(
                    "INSERT INTO remote_children (region, child_key, payload, updated_at)
                     VALUES (?1, ?2, ?3, ?4);",
                    params![region, key, serde_json::to_string(value)?, now_millis()],
                )?;
            }
        }
        tx.commit()?;
        Ok(event)
    }
}

impl RemoteStore for SqliteRemoteStore {
    fn get(&self, region: &str) -> RemoteResult<Vec<RemoteRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT child_key, payload FROM remote_children WHERE region = ?1 ORDER BY seq ASC;",
        )?;
        let rows = stmt.query_map(params![region], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (key, payload) = row?;
            let value = serde_json::from_str(&payload).map_err(|err| RemoteError::InvalidRecord {
                region: region.to_string(),
                key: key.clone(),
                message: err.to_string(),
            })?;
            records.push(RemoteRecord::new(key, value));
        }
        Ok(records)
    }

    fn set(&self, region: &str, key: &str, value: JsonValue) -> RemoteResult<bool> {
        self.write("set", region, key, value)
    }

    fn push(&self, region: &str, value: JsonValue) -> RemoteResult<String> {
        let key = format!("-{}", Uuid::new_v4().simple());
        self.write("push", region, &key, value)?;
        Ok(key)
    }

    fn update(
        &self,
        region: &str,
        key: &str,
        fields: Map<String, JsonValue>,
    ) -> RemoteResult<bool> {
        let previous = read_child(&self.conn, region, key)?;
        let merged = merge_fields(previous.as_ref(), fields);
        self.write("update", region, key, merged)
    }

    fn listen(&self, region: &str, listener: Weak<dyn RemoteListener>) -> ListenerId {
        self.listeners.add(region, listener)
    }

    fn unlisten(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

fn read_child(conn: &Connection, region: &str, key: &str) -> RemoteResult<Option<JsonValue>> {
    let payload = conn
        .query_row(
            "SELECT payload FROM remote_children WHERE region = ?1 AND child_key = ?2;",
            params![region, key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    match payload {
        Some(payload) => serde_json::from_str(&payload)
            .map(Some)
            .map_err(|err| RemoteError::InvalidRecord {
                region: region.to_string(),
                key: key.to_string(),
                message: err.to_string(),
            }),
        None => Ok(None),
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}
