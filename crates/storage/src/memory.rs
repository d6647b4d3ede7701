use std::collections::BTreeMap;

use sheetwright_core::{
    field_value::FieldValue,
    ids::*,
    ledger::Contribution,
    state::{DerivedFields, EntitySnapshot, SubEntity},
};

use crate::error::StorageError;
use crate::traits::DocumentStore;

/// Document store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: BTreeMap<EntityId, EntitySnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn entity_mut(&mut self, entity_id: EntityId) -> Result<&mut EntitySnapshot, StorageError> {
        self.entities
            .get_mut(&entity_id)
            .ok_or_else(|| StorageError::NotFound(format!("entity {entity_id}")))
    }
}

impl DocumentStore for MemoryStore {
    fn insert_entity(&mut self, snapshot: &EntitySnapshot) -> Result<(), StorageError> {
        if self.entities.contains_key(&snapshot.entity_id) {
            return Err(StorageError::EntityCollision {
                entity_id: snapshot.entity_id.to_string(),
            });
        }
        self.entities.insert(snapshot.entity_id, snapshot.clone());
        Ok(())
    }

    fn load_entity(&self, entity_id: EntityId) -> Result<Option<EntitySnapshot>, StorageError> {
        Ok(self.entities.get(&entity_id).cloned())
    }

    fn entity_exists(&self, entity_id: EntityId) -> Result<bool, StorageError> {
        Ok(self.entities.contains_key(&entity_id))
    }

    fn set_field(
        &mut self,
        entity_id: EntityId,
        field_key: &str,
        value: Option<&FieldValue>,
    ) -> Result<(), StorageError> {
        let fields = &mut self.entity_mut(entity_id)?.canonical.fields;
        match value {
            Some(value) => {
                fields.insert(field_key.to_string(), value.clone());
            }
            None => {
                fields.remove(field_key);
            }
        }
        Ok(())
    }

    fn put_sub_entity(&mut self, entity_id: EntityId, sub: &SubEntity) -> Result<(), StorageError> {
        let canonical = &mut self.entity_mut(entity_id)?.canonical;
        // A sub-entity id is unique across collections.
        for members in canonical.collections.values_mut() {
            members.remove(&sub.id);
        }
        canonical.collections.retain(|_, members| !members.is_empty());
        canonical.insert_sub_entity(sub.clone());
        Ok(())
    }

    fn remove_sub_entity(
        &mut self,
        entity_id: EntityId,
        collection: &str,
        sub_id: SubEntityId,
    ) -> Result<(), StorageError> {
        self.entity_mut(entity_id)?
            .canonical
            .remove_sub_entity(collection, sub_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("sub-entity {sub_id} in {collection}")))
    }

    fn put_ledger_entry(
        &mut self,
        entity_id: EntityId,
        provenance: ProvenanceTag,
        contribution: &Contribution,
    ) -> Result<(), StorageError> {
        self.entity_mut(entity_id)?
            .canonical
            .ledger
            .record(provenance, contribution.clone());
        Ok(())
    }

    fn remove_ledger_entry(
        &mut self,
        entity_id: EntityId,
        provenance: ProvenanceTag,
    ) -> Result<(), StorageError> {
        self.entity_mut(entity_id)?
            .canonical
            .ledger
            .take(provenance)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("ledger entry {provenance}")))
    }

    fn write_derived(
        &mut self,
        entity_id: EntityId,
        derived: &DerivedFields,
        revision: u64,
    ) -> Result<(), StorageError> {
        let entity = self.entity_mut(entity_id)?;
        entity.derived = derived.clone();
        entity.revision = revision;
        Ok(())
    }
}
