//! Fast backend: a memory-resident map persisted through an append-only
//! JSON journal with snapshot compaction. Cross-process writers serialize
//! on an exclusive file lock; readers reload when the journal grows.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{KbError, KvBackend};
use crate::core::fsutil;

const JOURNAL_FILE: &str = "journal.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";
const LOCK_FILE: &str = "kb.lock";
const SEQ_FILE: &str = "seq";
const COMPACT_THRESHOLD_BYTES: u64 = 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct JournalEntry {
    key: String,
    value: Option<String>,
    generation: u64,
}

#[derive(Default)]
struct MemState {
    map: BTreeMap<String, (String, u64)>,
    journal_bytes: u64,
    /// Commit counter mirrored in the `seq` file; compaction truncates the
    /// journal, so length alone cannot detect foreign commits.
    commit_seq: u64,
}

pub(crate) struct ResidentKv {
    dir: PathBuf,
    state: Mutex<MemState>,
}

impl ResidentKv {
    /// Open (and create) the endpoint directory. "Reachable" means the
    /// directory exists and its lock can be taken at least once.
    pub(crate) fn open(dir: &Path) -> Result<Self, KbError> {
        fs::create_dir_all(dir).map_err(|err| unavailable(dir, &err))?;
        let kv = Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(MemState::default()),
        };
        {
            // Probe the lock so an unreachable endpoint fails at startup,
            // not on first write.
            let _probe = kv.lock_file()?;
        }
        {
            let mut state = kv.state.lock().expect("kb state poisoned");
            kv.reload(&mut state)?;
        }
        Ok(kv)
    }

    fn lock_file(&self) -> Result<File, KbError> {
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| unavailable(&self.dir, &err))?;
        file.lock_exclusive()
            .map_err(|err| unavailable(&self.dir, &err))?;
        Ok(file)
    }

    fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn seq_path(&self) -> PathBuf {
        self.dir.join(SEQ_FILE)
    }

    fn read_seq(&self) -> u64 {
        fs::read_to_string(self.seq_path())
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    }

    fn bump_seq(&self, state: &mut MemState) -> Result<(), KbError> {
        state.commit_seq += 1;
        fs::write(self.seq_path(), state.commit_seq.to_string())
            .map_err(|err| KbError::Backend(err.to_string()))
    }

    fn reload(&self, state: &mut MemState) -> Result<(), KbError> {
        let mut map: BTreeMap<String, (String, u64)> = BTreeMap::new();
        if self.snapshot_path().exists() {
            let raw = fs::read_to_string(self.snapshot_path())
                .map_err(|err| KbError::Backend(err.to_string()))?;
            map = serde_json::from_str(&raw).map_err(|err| KbError::Backend(err.to_string()))?;
        }
        let mut journal_bytes = 0;
        if self.journal_path().exists() {
            let raw = fs::read_to_string(self.journal_path())
                .map_err(|err| KbError::Backend(err.to_string()))?;
            journal_bytes = raw.len() as u64;
            for line in raw.lines() {
                let Ok(entry) = serde_json::from_str::<JournalEntry>(line) else {
                    // A torn trailing line from a crashed writer is ignored;
                    // everything before it committed with fsync.
                    continue;
                };
                match entry.value {
                    Some(value) => {
                        map.insert(entry.key, (value, entry.generation));
                    }
                    None => {
                        map.remove(&entry.key);
                    }
                }
            }
        }
        state.map = map;
        state.journal_bytes = journal_bytes;
        state.commit_seq = self.read_seq();
        Ok(())
    }

    fn refresh_if_stale(&self, state: &mut MemState) -> Result<(), KbError> {
        if self.read_seq() != state.commit_seq {
            self.reload(state)?;
        }
        Ok(())
    }

    fn compact(&self, state: &mut MemState) -> Result<(), KbError> {
        let rendered = serde_json::to_string(&state.map)
            .map_err(|err| KbError::Backend(err.to_string()))?;
        fsutil::atomic_write(&self.snapshot_path(), &rendered)
            .map_err(|err| KbError::Backend(err.to_string()))?;
        fs::write(self.journal_path(), b"").map_err(|err| KbError::Backend(err.to_string()))?;
        state.journal_bytes = 0;
        debug!(dir = %self.dir.display(), "compacted resident KB journal");
        Ok(())
    }
}

impl KvBackend for ResidentKv {
    fn label(&self) -> &'static str {
        "fast"
    }

    fn get(&self, key: &str) -> Result<Option<(String, u64)>, KbError> {
        let mut state = self.state.lock().expect("kb state poisoned");
        self.refresh_if_stale(&mut state)?;
        Ok(state.map.get(key).cloned())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<String>, KbError> {
        let mut state = self.state.lock().expect("kb state poisoned");
        self.refresh_if_stale(&mut state)?;
        Ok(state
            .map
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn commit(
        &self,
        reads: &[(String, u64)],
        writes: &[(String, Option<String>)],
    ) -> Result<(), KbError> {
        let mut state = self.state.lock().expect("kb state poisoned");
        let _guard = self.lock_file()?;
        // Another process may have appended since we last looked.
        self.refresh_if_stale(&mut state)?;

        for (key, expected) in reads {
            let current = state.map.get(key).map_or(0, |(_, gen)| *gen);
            if current != *expected {
                let group: Vec<&str> = reads.iter().map(|(k, _)| k.as_str()).collect();
                return Err(KbError::Conflict(group.join(", ")));
            }
        }

        let mut journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())
            .map_err(|err| KbError::Backend(err.to_string()))?;
        let mut appended = 0u64;
        for (key, value) in writes {
            let generation = state.map.get(key).map_or(0, |(_, gen)| *gen) + 1;
            let entry = JournalEntry {
                key: key.clone(),
                value: value.clone(),
                generation,
            };
            let mut line =
                serde_json::to_string(&entry).map_err(|err| KbError::Backend(err.to_string()))?;
            line.push('\n');
            journal
                .write_all(line.as_bytes())
                .map_err(|err| KbError::Backend(err.to_string()))?;
            appended += line.len() as u64;
            match value {
                Some(value) => {
                    state.map.insert(key.clone(), (value.clone(), generation));
                }
                None => {
                    state.map.remove(key);
                }
            }
        }
        journal
            .sync_all()
            .map_err(|err| KbError::Backend(err.to_string()))?;
        state.journal_bytes += appended;
        self.bump_seq(&mut state)?;

        if state.journal_bytes > COMPACT_THRESHOLD_BYTES {
            self.compact(&mut state)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), KbError> {
        let mut state = self.state.lock().expect("kb state poisoned");
        let _guard = self.lock_file()?;
        fs::write(self.journal_path(), b"").map_err(|err| KbError::Backend(err.to_string()))?;
        if self.snapshot_path().exists() {
            fs::remove_file(self.snapshot_path())
                .map_err(|err| KbError::Backend(err.to_string()))?;
        }
        state.map.clear();
        state.journal_bytes = 0;
        self.bump_seq(&mut state)?;
        Ok(())
    }
}

fn unavailable(dir: &Path, err: &std::io::Error) -> KbError {
    KbError::BackendUnavailable {
        endpoint: dir.display().to_string(),
        reason: err.to_string(),
    }
}
