use std::collections::BTreeMap;

use sheetwright_core::{FieldValue, SubEntity, SubEntityId};

/// Bucket key for writes to the entity's own canonical fields.
pub const ROOT_COLLECTION: &str = "$root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdate {
    /// `None` addresses the entity's root fields.
    pub sub_id: Option<SubEntityId>,
    pub field_key: String,
    /// `None` clears the field.
    pub value: Option<FieldValue>,
}

/// One write the gateway performs, borrowed from its plan.
#[derive(Debug, Clone, Copy)]
pub enum SubMutation<'a> {
    Create {
        collection: &'a str,
        sub: &'a SubEntity,
    },
    Update {
        collection: &'a str,
        update: &'a FieldUpdate,
    },
    Delete {
        collection: &'a str,
        sub_id: SubEntityId,
    },
}

/// Creates, updates and deletes keyed by target collection. Built once,
/// consumed by value by `MutationGateway::apply_plan`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationPlan {
    base_revision: Option<u64>,
    creates: BTreeMap<String, Vec<SubEntity>>,
    updates: BTreeMap<String, Vec<FieldUpdate>>,
    deletes: BTreeMap<String, Vec<SubEntityId>>,
}

impl MutationPlan {
    pub fn builder() -> MutationPlanBuilder {
        MutationPlanBuilder::default()
    }

    /// Revision the plan was computed against, if it came from a draft.
    pub fn base_revision(&self) -> Option<u64> {
        self.base_revision
    }

    pub fn creates(&self) -> &BTreeMap<String, Vec<SubEntity>> {
        &self.creates
    }

    pub fn updates(&self) -> &BTreeMap<String, Vec<FieldUpdate>> {
        &self.updates
    }

    pub fn deletes(&self) -> &BTreeMap<String, Vec<SubEntityId>> {
        &self.deletes
    }

    pub fn sub_mutation_count(&self) -> usize {
        self.creates.values().map(Vec::len).sum::<usize>()
            + self.updates.values().map(Vec::len).sum::<usize>()
            + self.deletes.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_mutation_count() == 0
    }

    /// Creates, then updates, then deletes; collections in key order, entries
    /// in insertion order.
    pub fn sub_mutations(&self) -> Vec<SubMutation<'_>> {
        let mut out = Vec::with_capacity(self.sub_mutation_count());
        for (collection, subs) in &self.creates {
            let collection = collection.as_str();
            out.extend(subs.iter().map(|sub| SubMutation::Create { collection, sub }));
        }
        for (collection, updates) in &self.updates {
            let collection = collection.as_str();
            out.extend(updates.iter().map(|update| SubMutation::Update { collection, update }));
        }
        for (collection, ids) in &self.deletes {
            let collection = collection.as_str();
            out.extend(ids.iter().map(|sub_id| SubMutation::Delete {
                collection,
                sub_id: *sub_id,
            }));
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct MutationPlanBuilder {
    plan: MutationPlan,
}

impl MutationPlanBuilder {
    pub fn base_revision(mut self, revision: u64) -> Self {
        self.plan.base_revision = Some(revision);
        self
    }

    pub fn create(mut self, sub: SubEntity) -> Self {
        self.plan
            .creates
            .entry(sub.collection.clone())
            .or_default()
            .push(sub);
        self
    }

    pub fn set_field(self, field_key: &str, value: FieldValue) -> Self {
        self.update(ROOT_COLLECTION, None, field_key, Some(value))
    }

    pub fn clear_field(self, field_key: &str) -> Self {
        self.update(ROOT_COLLECTION, None, field_key, None)
    }

    pub fn update_sub_entity(
        self,
        collection: &str,
        sub_id: SubEntityId,
        field_key: &str,
        value: Option<FieldValue>,
    ) -> Self {
        self.update(collection, Some(sub_id), field_key, value)
    }

    fn update(
        mut self,
        collection: &str,
        sub_id: Option<SubEntityId>,
        field_key: &str,
        value: Option<FieldValue>,
    ) -> Self {
        self.plan
            .updates
            .entry(collection.to_string())
            .or_default()
            .push(FieldUpdate {
                sub_id,
                field_key: field_key.to_string(),
                value,
            });
        self
    }

    pub fn delete(mut self, collection: &str, sub_id: SubEntityId) -> Self {
        self.plan
            .deletes
            .entry(collection.to_string())
            .or_default()
            .push(sub_id);
        self
    }

    pub fn build(self) -> MutationPlan {
        self.plan
    }
}
