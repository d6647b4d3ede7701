use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use sheetwright_core::{
    Contribution, DerivedFields, EntityId, EntitySnapshot, FieldValue, ProvenanceTag, SubEntity,
    SubEntityId,
};
use sheetwright_storage::{DocumentStore, StorageError};

const DISARMED: usize = usize::MAX;

/// Shared trigger for injected write failures. Writes are numbered from 1 in
/// the order they reach the store; reads are never counted.
#[derive(Debug)]
pub struct FaultSwitch {
    writes: AtomicUsize,
    fail_at: AtomicUsize,
    sticky: AtomicBool,
}

impl Default for FaultSwitch {
    fn default() -> Self {
        Self {
            writes: AtomicUsize::new(0),
            fail_at: AtomicUsize::new(DISARMED),
            sticky: AtomicBool::new(false),
        }
    }
}

impl FaultSwitch {
    /// Fail only the `n`th write from now (1-based).
    pub fn fail_write(&self, n: usize) {
        self.arm(n, false);
    }

    /// Fail the `n`th write from now and every write after it.
    pub fn fail_from(&self, n: usize) {
        self.arm(n, true);
    }

    pub fn disarm(&self) {
        self.fail_at.store(DISARMED, Ordering::SeqCst);
        self.sticky.store(false, Ordering::SeqCst);
    }

    /// Write attempts seen so far, failed ones included.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn arm(&self, n: usize, sticky: bool) {
        let target = self.writes().saturating_add(n.max(1));
        self.sticky.store(sticky, Ordering::SeqCst);
        self.fail_at.store(target, Ordering::SeqCst);
    }

    fn check(&self, what: &str) -> Result<(), StorageError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        let at = self.fail_at.load(Ordering::SeqCst);
        let hit = n == at || (at != DISARMED && n > at && self.sticky.load(Ordering::SeqCst));
        if hit {
            return Err(StorageError::WriteRejected(format!(
                "injected failure on write {n} ({what})"
            )));
        }
        Ok(())
    }
}

/// Wraps a store and fails writes on command.
pub struct FlakyStore<S> {
    inner: S,
    faults: Arc<FaultSwitch>,
}

impl<S: DocumentStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_switch(inner, Arc::new(FaultSwitch::default()))
    }

    pub fn with_switch(inner: S, faults: Arc<FaultSwitch>) -> Self {
        Self { inner, faults }
    }

    pub fn switch(&self) -> Arc<FaultSwitch> {
        Arc::clone(&self.faults)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: DocumentStore> DocumentStore for FlakyStore<S> {
    fn insert_entity(&mut self, snapshot: &EntitySnapshot) -> Result<(), StorageError> {
        self.faults.check("insert_entity")?;
        self.inner.insert_entity(snapshot)
    }

    fn load_entity(&self, entity_id: EntityId) -> Result<Option<EntitySnapshot>, StorageError> {
        self.inner.load_entity(entity_id)
    }

    fn entity_exists(&self, entity_id: EntityId) -> Result<bool, StorageError> {
        self.inner.entity_exists(entity_id)
    }

    fn set_field(
        &mut self,
        entity_id: EntityId,
        field_key: &str,
        value: Option<&FieldValue>,
    ) -> Result<(), StorageError> {
        self.faults.check("set_field")?;
        self.inner.set_field(entity_id, field_key, value)
    }

    fn put_sub_entity(&mut self, entity_id: EntityId, sub: &SubEntity) -> Result<(), StorageError> {
        self.faults.check("put_sub_entity")?;
        self.inner.put_sub_entity(entity_id, sub)
    }

    fn remove_sub_entity(
        &mut self,
        entity_id: EntityId,
        collection: &str,
        sub_id: SubEntityId,
    ) -> Result<(), StorageError> {
        self.faults.check("remove_sub_entity")?;
        self.inner.remove_sub_entity(entity_id, collection, sub_id)
    }

    fn put_ledger_entry(
        &mut self,
        entity_id: EntityId,
        provenance: ProvenanceTag,
        contribution: &Contribution,
    ) -> Result<(), StorageError> {
        self.faults.check("put_ledger_entry")?;
        self.inner.put_ledger_entry(entity_id, provenance, contribution)
    }

    fn remove_ledger_entry(
        &mut self,
        entity_id: EntityId,
        provenance: ProvenanceTag,
    ) -> Result<(), StorageError> {
        self.faults.check("remove_ledger_entry")?;
        self.inner.remove_ledger_entry(entity_id, provenance)
    }

    fn write_derived(
        &mut self,
        entity_id: EntityId,
        derived: &DerivedFields,
        revision: u64,
    ) -> Result<(), StorageError> {
        self.faults.check("write_derived")?;
        self.inner.write_derived(entity_id, derived, revision)
    }
}
