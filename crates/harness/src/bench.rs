use std::sync::Arc;

use sheetwright_core::{EntityId, EntitySnapshot, FieldValue};
use sheetwright_engine::{Engine, EngineConfig, PolicyRegistry, Recalculator, Session};
use sheetwright_storage::{SqliteStore, StorageError};
use tempfile::TempDir;

use crate::faults::{FaultSwitch, FlakyStore};

pub type BenchStore = FlakyStore<SqliteStore>;

/// An engine over SQLite with a fault switch in front of the store.
pub struct TestBench {
    pub engine: Engine<BenchStore>,
    pub faults: Arc<FaultSwitch>,
    /// Holds the database file of on-disk benches.
    dir: Option<TempDir>,
}

impl TestBench {
    pub fn new() -> Result<Self, StorageError> {
        Self::in_memory(EngineConfig::default(), PolicyRegistry::standard(), Recalculator::standard())
    }

    pub fn with_policies(policies: PolicyRegistry) -> Result<Self, StorageError> {
        Self::in_memory(EngineConfig::default(), policies, Recalculator::standard())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, StorageError> {
        Self::in_memory(config, PolicyRegistry::standard(), Recalculator::standard())
    }

    pub fn with_recalculator(recalculator: Recalculator) -> Result<Self, StorageError> {
        Self::in_memory(EngineConfig::default(), PolicyRegistry::standard(), recalculator)
    }

    fn in_memory(
        config: EngineConfig,
        policies: PolicyRegistry,
        recalculator: Recalculator,
    ) -> Result<Self, StorageError> {
        Self::build(SqliteStore::open_in_memory()?, None, config, policies, recalculator)
    }

    /// Same as `new`, but backed by a database file in a temporary directory.
    pub fn on_disk() -> Result<Self, Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let path = dir.path().join("sheets.db");
        let store = SqliteStore::open(path.to_str().ok_or("non-utf8 temp path")?)?;
        Ok(Self::build(
            store,
            Some(dir),
            EngineConfig::default(),
            PolicyRegistry::standard(),
            Recalculator::standard(),
        )?)
    }

    fn build(
        store: SqliteStore,
        dir: Option<TempDir>,
        config: EngineConfig,
        policies: PolicyRegistry,
        recalculator: Recalculator,
    ) -> Result<Self, StorageError> {
        let store = FlakyStore::new(store);
        let faults = store.switch();
        Ok(Self {
            engine: Engine::with_parts(store, config, policies, Arc::new(recalculator)),
            faults,
            dir,
        })
    }

    /// Path of the backing database, for on-disk benches.
    pub fn db_path(&self) -> Option<std::path::PathBuf> {
        self.dir.as_ref().map(|d| d.path().join("sheets.db"))
    }

    pub fn create_character(
        &self,
        fields: Vec<(&str, FieldValue)>,
    ) -> Result<EntityId, Box<dyn std::error::Error>> {
        Ok(self.engine.create_entity(fields)?)
    }

    pub fn sheet(&self, entity_id: EntityId) -> Result<EntitySnapshot, Box<dyn std::error::Error>> {
        Ok(self.engine.entity(entity_id)?)
    }

    pub fn open(&self, entity_id: EntityId) -> Result<Session<BenchStore>, Box<dyn std::error::Error>> {
        Ok(self.engine.open_session(entity_id)?)
    }

    /// Recalculation passes completed since the bench was built.
    pub fn passes(&self) -> u64 {
        self.engine.gateway().recalculator().passes()
    }
}
