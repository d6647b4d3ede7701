use sheetwright_core::{
    field_value::FieldValue,
    ids::*,
    ledger::Contribution,
    state::{DerivedFields, EntitySnapshot, SubEntity},
};

use crate::error::StorageError;

/// Host document store. Every method is one write (or read) against the
/// persisted entity; none of them are transactional across calls.
pub trait DocumentStore {
    /// Persist a brand-new entity. Fails with `EntityCollision` if the id is taken.
    fn insert_entity(&mut self, snapshot: &EntitySnapshot) -> Result<(), StorageError>;

    fn load_entity(&self, entity_id: EntityId) -> Result<Option<EntitySnapshot>, StorageError>;

    fn entity_exists(&self, entity_id: EntityId) -> Result<bool, StorageError>;

    /// `None` clears the field.
    fn set_field(
        &mut self,
        entity_id: EntityId,
        field_key: &str,
        value: Option<&FieldValue>,
    ) -> Result<(), StorageError>;

    /// Create or replace a sub-entity, effects included.
    fn put_sub_entity(&mut self, entity_id: EntityId, sub: &SubEntity) -> Result<(), StorageError>;

    fn remove_sub_entity(
        &mut self,
        entity_id: EntityId,
        collection: &str,
        sub_id: SubEntityId,
    ) -> Result<(), StorageError>;

    fn put_ledger_entry(
        &mut self,
        entity_id: EntityId,
        provenance: ProvenanceTag,
        contribution: &Contribution,
    ) -> Result<(), StorageError>;

    fn remove_ledger_entry(
        &mut self,
        entity_id: EntityId,
        provenance: ProvenanceTag,
    ) -> Result<(), StorageError>;

    /// Replace the derived section and stamp the new revision.
    fn write_derived(
        &mut self,
        entity_id: EntityId,
        derived: &DerivedFields,
        revision: u64,
    ) -> Result<(), StorageError>;
}
