use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::ids::{EntityId, ProvenanceTag, SubEntityId};
use crate::ledger::BonusLedger;
use crate::rules::{Condition, RuleContent};

/// A rule element attached to the entity through a carrying sub-entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectInstance {
    pub provenance: ProvenanceTag,
    pub content: RuleContent,
}

impl EffectInstance {
    pub fn new(content: impl Into<RuleContent>) -> Self {
        Self {
            provenance: ProvenanceTag::new(),
            content: content.into(),
        }
    }
}

/// An item-like member of one of the entity's sub-collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEntity {
    pub id: SubEntityId,
    pub collection: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub effects: Vec<EffectInstance>,
}

impl SubEntity {
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }
}

/// Canonical entity fields plus sub-collections and the bonus ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalState {
    pub fields: BTreeMap<String, FieldValue>,
    pub collections: BTreeMap<String, BTreeMap<SubEntityId, SubEntity>>,
    pub ledger: BonusLedger,
}

impl CanonicalState {
    pub fn with_fields(fields: BTreeMap<String, FieldValue>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(FieldValue::as_integer)
    }

    pub fn sub_entity(&self, collection: &str, id: SubEntityId) -> Option<&SubEntity> {
        self.collections.get(collection).and_then(|c| c.get(&id))
    }

    pub fn sub_entity_mut(&mut self, collection: &str, id: SubEntityId) -> Option<&mut SubEntity> {
        self.collections.get_mut(collection).and_then(|c| c.get_mut(&id))
    }

    pub fn sub_entities(&self) -> impl Iterator<Item = &SubEntity> {
        self.collections.values().flat_map(|c| c.values())
    }

    pub fn insert_sub_entity(&mut self, sub: SubEntity) -> Option<SubEntity> {
        self.collections
            .entry(sub.collection.clone())
            .or_default()
            .insert(sub.id, sub)
    }

    pub fn remove_sub_entity(&mut self, collection: &str, id: SubEntityId) -> Option<SubEntity> {
        let members = self.collections.get_mut(collection)?;
        let removed = members.remove(&id);
        if members.is_empty() {
            self.collections.remove(collection);
        }
        removed
    }

    pub fn holds(&self, condition: &Condition) -> bool {
        match condition {
            Condition::FieldEquals { field, value } => self.fields.get(field) == Some(value),
            Condition::FieldAtLeast { field, min } => {
                self.integer(field).is_some_and(|v| v >= *min)
            }
            Condition::HasAbility(name) => self.ledger.abilities().contains(name),
            Condition::HasTraining(name) => self.ledger.trainings().contains(name),
            Condition::HasSubEntity { collection } => self
                .collections
                .get(collection)
                .is_some_and(|c| !c.is_empty()),
            Condition::AllOf(all) => all.iter().all(|c| self.holds(c)),
            Condition::AnyOf(any) => any.iter().any(|c| self.holds(c)),
            Condition::Not(inner) => !self.holds(inner),
        }
    }

    /// Ledger total for `target`, evaluating conditional bonuses against this state.
    pub fn bonus_total(&self, target: &str) -> i64 {
        self.ledger.bonus_total(target, |c| self.holds(c))
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Content hash of the canonical state. Equal states hash equal.
    pub fn digest(&self) -> Result<[u8; 32], CoreError> {
        Ok(*blake3::hash(&self.to_msgpack()?).as_bytes())
    }
}

/// Values computed from canonical state. Only the recalculator produces these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFields {
    pub values: BTreeMap<String, i64>,
    pub abilities: BTreeSet<String>,
    pub trained: BTreeSet<String>,
    /// Digest of the canonical state these values were computed from.
    pub source_digest: [u8; 32],
}

impl DerivedFields {
    pub fn value(&self, key: &str) -> Option<i64> {
        self.values.get(key).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: EntityId,
    /// Bumped once per committed plan.
    pub revision: u64,
    pub canonical: CanonicalState,
    pub derived: DerivedFields,
}

impl EntitySnapshot {
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.canonical.field(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Contribution, Grant};

    #[test]
    fn digest_tracks_content() {
        let mut a = CanonicalState::default();
        a.fields.insert("name".into(), FieldValue::Text("Vex".into()));
        let b = a.clone();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());

        a.fields.insert("level".into(), FieldValue::Integer(2));
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn removing_last_member_drops_collection() {
        let mut state = CanonicalState::default();
        let id = SubEntityId::new();
        state.insert_sub_entity(SubEntity {
            id,
            collection: "gear".into(),
            fields: BTreeMap::new(),
            effects: Vec::new(),
        });
        assert!(state.holds(&Condition::HasSubEntity {
            collection: "gear".into()
        }));
        assert!(state.remove_sub_entity("gear", id).is_some());
        assert!(state.collections.is_empty());
    }

    #[test]
    fn conditions_see_granted_abilities() {
        let mut state = CanonicalState::default();
        state.fields.insert("strength".into(), FieldValue::Integer(13));
        state.ledger.record(
            ProvenanceTag::new(),
            Contribution {
                carrier: SubEntityId::new(),
                grants: vec![Grant::Ability("power_attack".into())],
            },
        );
        let cond = Condition::AllOf(vec![
            Condition::HasAbility("power_attack".into()),
            Condition::FieldAtLeast {
                field: "strength".into(),
                min: 13,
            },
        ]);
        assert!(state.holds(&cond));
        assert!(!state.holds(&Condition::Not(Box::new(cond))));
    }
}
