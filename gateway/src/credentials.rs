//! Credential storage keyed by (actor, platform).
//!
//! Last-write-wins, no merge semantics, no implicit expiry. The store is an
//! injected trait object rather than ambient state: the dispatcher that
//! receives a `credentials` message and the session runtime that reads them
//! may live in different processes, so the SQLite variant keeps writes
//! visible across the whole worker fleet. The in-memory variant covers
//! tests and single-process deployments.

use std::sync::Mutex;

use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;

use shared_types::ActorId;

#[derive(Debug, Error)]
#[error("credential store: {0}")]
pub struct StoreError(pub String);

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError(e.to_string())
    }
}

pub trait CredentialStore: Send + Sync {
    /// Store credentials for an actor on a platform, overwriting any
    /// previous record.
    fn set(&self, actor: &ActorId, platform: &str, object: Value) -> Result<(), StoreError>;

    fn get(&self, actor: &ActorId, platform: &str) -> Result<Option<Value>, StoreError>;

    fn has(&self, actor: &ActorId, platform: &str) -> Result<bool, StoreError> {
        Ok(self.get(actor, platform)?.is_some())
    }
}

/// Process-local store backed by a concurrent map.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: DashMap<(String, String), Value>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn set(&self, actor: &ActorId, platform: &str, object: Value) -> Result<(), StoreError> {
        self.entries
            .insert((actor.0.clone(), platform.to_string()), object);
        Ok(())
    }

    fn get(&self, actor: &ActorId, platform: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .entries
            .get(&(actor.0.clone(), platform.to_string()))
            .map(|entry| entry.clone()))
    }
}

/// Shared store with cross-process visibility.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                actor_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                object TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (actor_id, platform)
            )
            "#,
            (),
        )?;
        Ok(())
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn set(&self, actor: &ActorId, platform: &str, object: Value) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("credential store mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO credentials (actor_id, platform, object)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (actor_id, platform)
            DO UPDATE SET object = excluded.object, updated_at = datetime('now')
            "#,
            params![actor.as_str(), platform, object.to_string()],
        )?;
        Ok(())
    }

    fn get(&self, actor: &ActorId, platform: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn.lock().expect("credential store mutex poisoned");
        let raw: Option<String> = conn
            .query_row(
                "SELECT object FROM credentials WHERE actor_id = ?1 AND platform = ?2",
                params![actor.as_str(), platform],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| StoreError(format!("corrupt credential record: {e}"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check_store(store: &dyn CredentialStore) {
        let alice = ActorId::from("alice@example.com");

        assert!(!store.has(&alice, "email").unwrap());
        assert_eq!(store.get(&alice, "email").unwrap(), None);

        store
            .set(
                &alice,
                "email",
                json!({"type": "credentials", "username": "alice", "password": "one"}),
            )
            .unwrap();
        assert!(store.has(&alice, "email").unwrap());

        // Same actor on a different platform is a separate record.
        assert!(!store.has(&alice, "irc").unwrap());

        // Last write wins.
        store
            .set(
                &alice,
                "email",
                json!({"type": "credentials", "username": "alice", "password": "two"}),
            )
            .unwrap();
        let current = store.get(&alice, "email").unwrap().unwrap();
        assert_eq!(current["password"], json!("two"));
    }

    #[test]
    fn test_memory_store() {
        check_store(&MemoryCredentialStore::new());
    }

    #[test]
    fn test_sqlite_store() {
        check_store(&SqliteCredentialStore::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.db");
        let path = path.to_str().unwrap();

        let alice = ActorId::from("alice@example.com");
        {
            let store = SqliteCredentialStore::open(path).unwrap();
            store
                .set(&alice, "email", json!({"type": "credentials", "token": "t"}))
                .unwrap();
        }

        // A second handle (standing in for another process) sees the write.
        let store = SqliteCredentialStore::open(path).unwrap();
        assert!(store.has(&alice, "email").unwrap());
    }
}
