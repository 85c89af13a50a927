//! Knowledge base: indexed, durable metadata for packages, bubbles,
//! snapshots and interpreters. Two backends share one contract; selection
//! is automatic at startup and never mixed afterwards.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::config::settings::{InterpreterSettings, KbBackendChoice};

pub(crate) mod embedded;
pub mod keys;
pub(crate) mod resident;

use embedded::EmbeddedKv;
use resident::ResidentKv;

const KB_RETRY_LIMIT: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum KbError {
    #[error("[VX800] concurrent write to key group [{0}]")]
    Conflict(String),
    #[error("[VX210] knowledge base backend unavailable at {endpoint}: {reason}")]
    BackendUnavailable { endpoint: String, reason: String },
    #[error("[VX211] knowledge base schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: u32, found: String },
    #[error("[VX810] knowledge base backend error: {0}")]
    Backend(String),
    #[error("[VX810] value at {key} failed to decode: {reason}")]
    Decode { key: String, reason: String },
}

/// One key/value backend. Values are opaque strings (the KB layer stores
/// canonical JSON); generations implement optimistic concurrency.
pub(crate) trait KvBackend: Send + Sync {
    fn label(&self) -> &'static str;
    fn get(&self, key: &str) -> Result<Option<(String, u64)>, KbError>;
    fn scan(&self, prefix: &str) -> Result<Vec<String>, KbError>;
    /// Compare-and-swap commit: every `(key, generation)` in `reads` must
    /// still hold (missing keys have generation 0), then all `writes` apply
    /// atomically. `None` deletes the key.
    fn commit(
        &self,
        reads: &[(String, u64)],
        writes: &[(String, Option<String>)],
    ) -> Result<(), KbError>;
    fn clear(&self) -> Result<(), KbError>;
}

pub struct KnowledgeBase {
    backend: Box<dyn KvBackend>,
}

/// Read-modify-write view over a key group. Reads record the generation
/// they observed; the commit fails with `Conflict` if any of them moved.
pub struct Tx<'a> {
    backend: &'a dyn KvBackend,
    reads: Vec<(String, u64)>,
    writes: Vec<(String, Option<String>)>,
}

impl<'a> Tx<'a> {
    fn new(backend: &'a dyn KvBackend) -> Self {
        Self {
            backend,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Result<Option<String>, KbError> {
        // A staged write shadows the committed value within this tx.
        if let Some((_, staged)) = self
            .writes
            .iter()
            .rev()
            .find(|(written, _)| written == key)
        {
            return Ok(staged.clone());
        }
        match self.backend.get(key)? {
            Some((value, generation)) => {
                self.record_read(key, generation);
                Ok(Some(value))
            }
            None => {
                self.record_read(key, 0);
                Ok(None)
            }
        }
    }

    pub fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, KbError> {
        match self.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|err| KbError::Decode {
                    key: key.to_string(),
                    reason: err.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn put(&mut self, key: &str, value: String) {
        self.writes.push((key.to_string(), Some(value)));
    }

    pub fn put_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), KbError> {
        let raw = serde_json::to_string(value).map_err(|err| KbError::Backend(err.to_string()))?;
        self.put(key, raw);
        Ok(())
    }

    pub fn delete(&mut self, key: &str) {
        self.writes.push((key.to_string(), None));
    }

    fn record_read(&mut self, key: &str, generation: u64) {
        if !self.reads.iter().any(|(read, _)| read == key) {
            self.reads.push((key.to_string(), generation));
        }
    }
}

impl KnowledgeBase {
    /// Open the KB for an interpreter, honoring the configured backend
    /// choice. `auto` prefers the fast backend and falls back to the
    /// embedded file; `fast` fails hard when unreachable.
    pub fn open(settings: &InterpreterSettings) -> Result<Self, KbError> {
        let backend: Box<dyn KvBackend> = match settings.kb_backend {
            KbBackendChoice::Embedded => Box::new(EmbeddedKv::open(&settings.kb_embedded_path())?),
            KbBackendChoice::Fast => {
                Box::new(ResidentKv::open(&settings.kb_resident_endpoint())?)
            }
            KbBackendChoice::Auto => match ResidentKv::open(&settings.kb_resident_endpoint()) {
                Ok(kv) => Box::new(kv),
                Err(err) => {
                    warn!(%err, "fast KB backend unreachable, falling back to embedded");
                    Box::new(EmbeddedKv::open(&settings.kb_embedded_path())?)
                }
            },
        };
        let kb = Self { backend };
        kb.check_schema()?;
        debug!(backend = kb.backend.label(), "knowledge base ready");
        Ok(kb)
    }

    #[cfg(test)]
    pub(crate) fn with_backend(backend: Box<dyn KvBackend>) -> Self {
        let kb = Self { backend };
        kb.check_schema().expect("schema init");
        kb
    }

    pub fn backend_label(&self) -> &'static str {
        self.backend.label()
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, KbError> {
        Ok(self.backend.get(key)?.map(|(value, _)| value))
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KbError> {
        match self.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|err| KbError::Decode {
                    key: key.to_string(),
                    reason: err.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Atomic single-key write.
    pub fn put(&self, key: &str, value: &str) -> Result<(), KbError> {
        self.backend
            .commit(&[], &[(key.to_string(), Some(value.to_string()))])
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), KbError> {
        let raw = serde_json::to_string(value).map_err(|err| KbError::Backend(err.to_string()))?;
        self.put(key, &raw)
    }

    pub fn delete(&self, key: &str) -> Result<(), KbError> {
        self.backend.commit(&[], &[(key.to_string(), None)])
    }

    /// All keys under `prefix`, sorted. Finite and restartable via
    /// [`Self::scan_page`].
    pub fn scan(&self, prefix: &str) -> Result<Vec<String>, KbError> {
        self.backend.scan(prefix)
    }

    /// Page of keys under `prefix` strictly after `after`, capped at
    /// `limit`. A scan interrupted at any point restarts from its last key.
    pub fn scan_page(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, KbError> {
        let mut keys = self.backend.scan(prefix)?;
        if let Some(after) = after {
            keys.retain(|key| key.as_str() > after);
        }
        keys.truncate(limit);
        Ok(keys)
    }

    /// Read-modify-write over a key group with at-most-one-writer
    /// semantics. Conflicting commits retry up to a small bound, then
    /// surface `Conflict`.
    pub fn transaction<T>(
        &self,
        mut f: impl FnMut(&mut Tx<'_>) -> Result<T, KbError>,
    ) -> Result<T, KbError> {
        let mut last = None;
        for attempt in 0..KB_RETRY_LIMIT {
            let mut tx = Tx::new(self.backend.as_ref());
            let value = f(&mut tx)?;
            match self.backend.commit(&tx.reads, &tx.writes) {
                Ok(()) => return Ok(value),
                Err(KbError::Conflict(group)) => {
                    debug!(attempt, group = %group, "KB transaction conflict, retrying");
                    last = Some(KbError::Conflict(group));
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| KbError::Conflict(String::from("unknown"))))
    }

    /// Discard all KB state (used by rebuild) and re-seed the schema key.
    pub fn reset(&self) -> Result<(), KbError> {
        self.backend.clear()?;
        self.backend.commit(
            &[],
            &[(
                keys::SCHEMA_KEY.to_string(),
                Some(keys::SCHEMA_VERSION.to_string()),
            )],
        )
    }

    fn check_schema(&self) -> Result<(), KbError> {
        match self.backend.get(keys::SCHEMA_KEY)? {
            None => self.backend.commit(
                &[],
                &[(
                    keys::SCHEMA_KEY.to_string(),
                    Some(keys::SCHEMA_VERSION.to_string()),
                )],
            ),
            Some((found, _)) if found == keys::SCHEMA_VERSION.to_string() => Ok(()),
            Some((found, _)) => Err(KbError::SchemaMismatch {
                expected: keys::SCHEMA_VERSION,
                found,
            }),
        }
    }
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("backend", &self.backend.label())
            .finish()
    }
}
