//! The orchestration object. One `CommandContext` is created at process
//! start and passed explicitly; there are no hidden singletons.

use std::sync::OnceLock;

use crate::core::config::settings::InterpreterSettings;
use crate::core::daemon::{WorkerLauncher, WorkerPool};
use crate::core::interpreters::InterpreterRecord;
use crate::core::kb::{KbError, KnowledgeBase};
use crate::core::loader::LoaderRuntime;
use crate::core::snapshot::SnapshotStore;
use crate::core::tooling::messages::Catalog;

pub struct CommandContext {
    settings: InterpreterSettings,
    interpreter: InterpreterRecord,
    kb: KnowledgeBase,
    loader: LoaderRuntime,
    catalog: Catalog,
    pool: OnceLock<WorkerPool>,
}

impl CommandContext {
    /// Open the KB (with automatic backend selection) and assemble the
    /// context. `BackendUnavailable` and `SchemaMismatch` surface here,
    /// at startup.
    pub fn new(
        settings: InterpreterSettings,
        interpreter: InterpreterRecord,
    ) -> Result<Self, KbError> {
        let kb = KnowledgeBase::open(&settings)?;
        let catalog = Catalog::for_language(&settings.language_code);
        Ok(Self {
            settings,
            interpreter,
            kb,
            loader: LoaderRuntime::new(),
            catalog,
            pool: OnceLock::new(),
        })
    }

    pub fn settings(&self) -> &InterpreterSettings {
        &self.settings
    }

    pub fn interpreter(&self) -> &InterpreterRecord {
        &self.interpreter
    }

    pub fn kb(&self) -> &KnowledgeBase {
        &self.kb
    }

    pub fn loader(&self) -> &LoaderRuntime {
        &self.loader
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(self.settings.snapshots_dir())
    }

    /// The worker pool, started lazily on first use.
    pub fn pool(&self) -> &WorkerPool {
        self.pool.get_or_init(|| {
            WorkerPool::new(
                self.settings.daemon.clone(),
                WorkerLauncher::for_interpreter(&self.interpreter),
            )
        })
    }

    /// Whether a daemon pool has been started in this process.
    pub fn pool_started(&self) -> bool {
        self.pool.get().is_some()
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("interpreter", &self.interpreter.version)
            .field("kb", &self.kb.backend_label())
            .finish()
    }
}
