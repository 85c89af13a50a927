//! Embedded relational backend: a single SQLite file with WAL and
//! IMMEDIATE transactions. Generations give the optimistic commit its
//! compare-and-swap.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{KbError, KvBackend};

pub(crate) struct EmbeddedKv {
    path: PathBuf,
}

impl EmbeddedKv {
    pub(crate) fn open(path: &Path) -> Result<Self, KbError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| KbError::BackendUnavailable {
                endpoint: path.display().to_string(),
                reason: err.to_string(),
            })?;
        }
        let kv = Self {
            path: path.to_path_buf(),
        };
        let conn = kv.connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                generation INTEGER NOT NULL
            );",
        )
        .map_err(backend_err)?;
        Ok(kv)
    }

    fn connection(&self) -> Result<Connection, KbError> {
        let conn = Connection::open(&self.path).map_err(|err| KbError::BackendUnavailable {
            endpoint: self.path.display().to_string(),
            reason: err.to_string(),
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(backend_err)?;
        conn.busy_timeout(Duration::from_secs(10))
            .map_err(backend_err)?;
        Ok(conn)
    }
}

impl KvBackend for EmbeddedKv {
    fn label(&self) -> &'static str {
        "embedded"
    }

    fn get(&self, key: &str) -> Result<Option<(String, u64)>, KbError> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT value, generation FROM kv WHERE key = ?1",
            params![key],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)),
        )
        .optional()
        .map_err(backend_err)
    }

    fn scan(&self, prefix: &str) -> Result<Vec<String>, KbError> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT key FROM kv WHERE key LIKE ?1 || '%' ORDER BY key")
            .map_err(backend_err)?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .map_err(backend_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend_err)?;
        Ok(keys)
    }

    fn commit(
        &self,
        reads: &[(String, u64)],
        writes: &[(String, Option<String>)],
    ) -> Result<(), KbError> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend_err)?;
        for (key, expected) in reads {
            let current: u64 = tx
                .query_row(
                    "SELECT generation FROM kv WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .map_err(backend_err)?
                .map_or(0, |gen| gen as u64);
            if current != *expected {
                let group: Vec<&str> = reads.iter().map(|(k, _)| k.as_str()).collect();
                return Err(KbError::Conflict(group.join(", ")));
            }
        }
        for (key, value) in writes {
            match value {
                Some(value) => {
                    tx.execute(
                        "INSERT INTO kv (key, value, generation) VALUES (?1, ?2, 1)
                         ON CONFLICT(key) DO UPDATE
                         SET value = excluded.value, generation = kv.generation + 1",
                        params![key, value],
                    )
                    .map_err(backend_err)?;
                }
                None => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])
                        .map_err(backend_err)?;
                }
            }
        }
        tx.commit().map_err(backend_err)
    }

    fn clear(&self) -> Result<(), KbError> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM kv", []).map_err(backend_err)?;
        Ok(())
    }
}

fn backend_err(err: rusqlite::Error) -> KbError {
    KbError::Backend(err.to_string())
}
