//! The single writer of entity state.
//!
//! A plan is checked against its operation's budget, then applied one write at
//! a time while an inverse journal is kept. If a write fails the journal is
//! replayed backwards. On success the recalculator runs exactly once and its
//! output is written with the new revision.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use sheetwright_core::{
    CanonicalState, Contribution, DerivedFields, EntityId, EntitySnapshot, FieldValue,
    ProvenanceTag, SubEntity, SubEntityId,
};
use sheetwright_storage::{DocumentStore, StorageError};
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::plan::{FieldUpdate, MutationPlan, SubMutation};
use crate::policy::PolicyRegistry;
use crate::recalc::Recalculator;
use crate::rule_engine::{RuleEngine, SkippedEffect};

#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub entity_id: EntityId,
    pub operation: String,
    /// Version of the policy table the plan was checked against.
    pub policy_version: u32,
    pub revision: u64,
    pub sub_mutations: usize,
    pub recalculations: u32,
    pub skipped_effects: Vec<SkippedEffect>,
    pub snapshot: EntitySnapshot,
}

/// Inverse of one store write, replayed during compensation.
#[derive(Debug)]
enum Inverse {
    RestoreField {
        key: String,
        previous: Option<FieldValue>,
    },
    RestoreSubEntity(SubEntity),
    RemoveSubEntity {
        collection: String,
        sub_id: SubEntityId,
    },
    RestoreLedger {
        provenance: ProvenanceTag,
        contribution: Contribution,
    },
    RemoveLedger {
        provenance: ProvenanceTag,
    },
}

/// The gateway's working copy of an entity during one plan. Writes are only
/// legal between `open_write` and `close_write`; anything else is a bug in the
/// caller and aborts.
struct LiveEntity {
    snapshot: EntitySnapshot,
    writable: bool,
}

impl LiveEntity {
    fn new(snapshot: EntitySnapshot) -> Self {
        Self {
            snapshot,
            writable: false,
        }
    }

    fn canonical(&self) -> &CanonicalState {
        &self.snapshot.canonical
    }

    fn assert_writable(&self) {
        if !self.writable {
            panic!(
                "contract violation: entity {} written outside a mutation gateway write scope",
                self.snapshot.entity_id
            );
        }
    }

    fn canonical_mut(&mut self) -> &mut CanonicalState {
        self.assert_writable();
        &mut self.snapshot.canonical
    }

    fn install_derived(&mut self, derived: DerivedFields, revision: u64) {
        self.assert_writable();
        self.snapshot.derived = derived;
        self.snapshot.revision = revision;
    }

    fn open_write(&mut self) {
        self.writable = true;
    }

    fn close_write(mut self) -> EntitySnapshot {
        self.writable = false;
        self.snapshot
    }
}

/// Per-entity mutual exclusion. Plans for one entity queue behind each other;
/// different entities never wait on one another.
#[derive(Default)]
struct EntityLocks {
    busy: Mutex<HashSet<EntityId>>,
    released: Condvar,
}

impl EntityLocks {
    fn acquire(&self, entity_id: EntityId) -> EntityLockGuard<'_> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        while busy.contains(&entity_id) {
            busy = self
                .released
                .wait(busy)
                .unwrap_or_else(PoisonError::into_inner);
        }
        busy.insert(entity_id);
        EntityLockGuard {
            locks: self,
            entity_id,
        }
    }

    fn is_locked(&self, entity_id: EntityId) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&entity_id)
    }
}

struct EntityLockGuard<'a> {
    locks: &'a EntityLocks,
    entity_id: EntityId,
}

impl Drop for EntityLockGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.entity_id);
        self.locks.released.notify_all();
    }
}

pub struct MutationGateway<S: DocumentStore> {
    store: Mutex<S>,
    policies: PolicyRegistry,
    rules: RuleEngine,
    recalculator: Arc<Recalculator>,
    locks: EntityLocks,
}

impl<S: DocumentStore> MutationGateway<S> {
    pub fn new(store: S, policies: PolicyRegistry, recalculator: Arc<Recalculator>) -> Self {
        Self {
            store: Mutex::new(store),
            policies,
            rules: RuleEngine::new(),
            recalculator,
            locks: EntityLocks::default(),
        }
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn recalculator(&self) -> &Arc<Recalculator> {
        &self.recalculator
    }

    /// Whether a plan for `entity_id` is being applied right now.
    pub fn is_applying(&self, entity_id: EntityId) -> bool {
        self.locks.is_locked(entity_id)
    }

    fn store(&self) -> MutexGuard<'_, S> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn load(&self, entity_id: EntityId) -> Result<EntitySnapshot, EngineError> {
        self.store()
            .load_entity(entity_id)?
            .ok_or_else(|| EngineError::EntityNotFound(entity_id))
    }

    /// Persist a new entity with the given canonical fields. Derived fields
    /// are seeded by one recalculation pass.
    pub fn create_entity(
        &self,
        fields: BTreeMap<String, FieldValue>,
    ) -> Result<EntitySnapshot, EngineError> {
        let entity_id = EntityId::new();
        let _guard = self.locks.acquire(entity_id);
        let canonical = CanonicalState::with_fields(fields);
        let derived = self
            .recalculator
            .recompute(entity_id, &canonical)?
            .ok_or(EngineError::RecalculationReentered(entity_id))?;
        let snapshot = EntitySnapshot {
            entity_id,
            revision: 1,
            canonical,
            derived,
        };
        self.store().insert_entity(&snapshot)?;
        info!(entity_id = %entity_id, "entity created");
        Ok(snapshot)
    }

    /// Apply `plan` to `entity_id` under `operation`'s policy.
    ///
    /// Either every sub-mutation lands and the recalculator runs once, or every
    /// write already made is reverted. `CompensationFailed` means the revert
    /// itself failed and the persisted entity needs manual reconciliation.
    pub fn apply_plan(
        &self,
        entity_id: EntityId,
        plan: MutationPlan,
        operation: &str,
    ) -> Result<CommitReceipt, EngineError> {
        let sub_mutations = plan.sub_mutation_count();
        let policy = match self.policies.check(operation, sub_mutations) {
            Ok(policy) => policy,
            Err(err) => {
                warn!(entity_id = %entity_id, operation, sub_mutations, %err, "plan rejected by policy");
                return Err(err);
            }
        };
        let recalculations = policy.required_recalc_count;

        let _guard = self.locks.acquire(entity_id);
        let mut live = LiveEntity::new(self.load(entity_id)?);
        if let Some(expected) = plan.base_revision()
            && expected != live.snapshot.revision
        {
            return Err(EngineError::StaleBase {
                entity_id,
                expected,
                actual: live.snapshot.revision,
            });
        }

        live.open_write();
        let mut journal = Vec::new();
        let mut skipped = Vec::new();
        for mutation in plan.sub_mutations() {
            if let Err(failure) = self.apply_one(&mut live, mutation, &mut journal, &mut skipped) {
                return Err(self.compensate(entity_id, journal, failure));
            }
        }

        let derived = match self.recalculator.recompute(entity_id, live.canonical()) {
            Ok(Some(derived)) => derived,
            Ok(None) => {
                let err = self.compensate(
                    entity_id,
                    journal,
                    StorageError::WriteRejected("recalculation re-entered".into()),
                );
                return Err(match err {
                    EngineError::PersistenceFailure { .. } => {
                        EngineError::RecalculationReentered(entity_id)
                    }
                    other => other,
                });
            }
            Err(core) => return Err(self.compensate(entity_id, journal, StorageError::Core(core))),
        };
        let revision = live.snapshot.revision + 1;
        let written = self.store().write_derived(entity_id, &derived, revision);
        if let Err(failure) = written {
            return Err(self.compensate(entity_id, journal, failure));
        }
        live.install_derived(derived, revision);
        let snapshot = live.close_write();

        info!(entity_id = %entity_id, operation, revision, sub_mutations, "plan applied");
        Ok(CommitReceipt {
            entity_id,
            operation: operation.to_string(),
            policy_version: self.policies.version(),
            revision,
            sub_mutations,
            recalculations,
            skipped_effects: skipped,
            snapshot,
        })
    }

    fn apply_one(
        &self,
        live: &mut LiveEntity,
        mutation: SubMutation<'_>,
        journal: &mut Vec<Inverse>,
        skipped: &mut Vec<SkippedEffect>,
    ) -> Result<(), StorageError> {
        match mutation {
            SubMutation::Create { collection, sub } => {
                self.create_sub_entity(live, collection, sub, journal, skipped)
            }
            SubMutation::Update { collection, update } => match update.sub_id {
                None => self.update_root_field(live, update, journal),
                Some(sub_id) => self.update_sub_entity(live, collection, sub_id, update, journal),
            },
            SubMutation::Delete { collection, sub_id } => {
                self.delete_sub_entity(live, collection, sub_id, journal)
            }
        }
    }

    fn create_sub_entity(
        &self,
        live: &mut LiveEntity,
        collection: &str,
        sub: &SubEntity,
        journal: &mut Vec<Inverse>,
        skipped: &mut Vec<SkippedEffect>,
    ) -> Result<(), StorageError> {
        let entity_id = live.snapshot.entity_id;
        if sub.collection != collection {
            return Err(StorageError::ConstraintViolation(format!(
                "sub-entity {} filed under {collection} but belongs to {}",
                sub.id, sub.collection
            )));
        }
        if live.canonical().sub_entities().any(|s| s.id == sub.id) {
            return Err(StorageError::ConstraintViolation(format!(
                "sub-entity {} already exists",
                sub.id
            )));
        }

        self.store().put_sub_entity(entity_id, sub)?;
        journal.push(Inverse::RemoveSubEntity {
            collection: collection.to_string(),
            sub_id: sub.id,
        });
        live.canonical_mut().insert_sub_entity(sub.clone());

        for effect in &sub.effects {
            if live.canonical().ledger.contains(effect.provenance) {
                return Err(StorageError::ConstraintViolation(format!(
                    "provenance {} already attached",
                    effect.provenance
                )));
            }
            let contribution = match self.rules.apply(live.canonical(), sub.id, effect) {
                Ok(contribution) => contribution,
                Err(reason) => {
                    warn!(entity_id = %entity_id, provenance = %effect.provenance, %reason, "skipping malformed rule element");
                    skipped.push(SkippedEffect {
                        provenance: effect.provenance,
                        carrier: sub.id,
                        reason,
                    });
                    continue;
                }
            };
            self.store()
                .put_ledger_entry(entity_id, effect.provenance, &contribution)?;
            journal.push(Inverse::RemoveLedger {
                provenance: effect.provenance,
            });
            live.canonical_mut()
                .ledger
                .record(effect.provenance, contribution);
        }
        Ok(())
    }

    fn update_root_field(
        &self,
        live: &mut LiveEntity,
        update: &FieldUpdate,
        journal: &mut Vec<Inverse>,
    ) -> Result<(), StorageError> {
        let previous = live.canonical().field(&update.field_key).cloned();
        self.store().set_field(
            live.snapshot.entity_id,
            &update.field_key,
            update.value.as_ref(),
        )?;
        journal.push(Inverse::RestoreField {
            key: update.field_key.clone(),
            previous,
        });
        let fields = &mut live.canonical_mut().fields;
        match &update.value {
            Some(value) => {
                fields.insert(update.field_key.clone(), value.clone());
            }
            None => {
                fields.remove(&update.field_key);
            }
        }
        Ok(())
    }

    fn update_sub_entity(
        &self,
        live: &mut LiveEntity,
        collection: &str,
        sub_id: SubEntityId,
        update: &FieldUpdate,
        journal: &mut Vec<Inverse>,
    ) -> Result<(), StorageError> {
        let previous = live
            .canonical()
            .sub_entity(collection, sub_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("sub-entity {sub_id} in {collection}")))?;
        let mut next = previous.clone();
        match &update.value {
            Some(value) => {
                next.fields.insert(update.field_key.clone(), value.clone());
            }
            None => {
                next.fields.remove(&update.field_key);
            }
        }
        self.store().put_sub_entity(live.snapshot.entity_id, &next)?;
        journal.push(Inverse::RestoreSubEntity(previous));
        live.canonical_mut().insert_sub_entity(next);
        Ok(())
    }

    fn delete_sub_entity(
        &self,
        live: &mut LiveEntity,
        collection: &str,
        sub_id: SubEntityId,
        journal: &mut Vec<Inverse>,
    ) -> Result<(), StorageError> {
        let entity_id = live.snapshot.entity_id;
        let previous = live
            .canonical()
            .sub_entity(collection, sub_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("sub-entity {sub_id} in {collection}")))?;

        for effect in &previous.effects {
            let Some(contribution) = self.rules.remove(live.canonical(), effect) else {
                debug!(entity_id = %entity_id, provenance = %effect.provenance, "effect had no ledger entry");
                continue;
            };
            self.store().remove_ledger_entry(entity_id, effect.provenance)?;
            journal.push(Inverse::RestoreLedger {
                provenance: effect.provenance,
                contribution,
            });
            live.canonical_mut().ledger.take(effect.provenance);
        }

        self.store().remove_sub_entity(entity_id, collection, sub_id)?;
        live.canonical_mut().remove_sub_entity(collection, sub_id);
        journal.push(Inverse::RestoreSubEntity(previous));
        Ok(())
    }

    /// Replay `journal` backwards. Every inverse is attempted even after one
    /// fails, so as much as possible is put back.
    fn compensate(
        &self,
        entity_id: EntityId,
        journal: Vec<Inverse>,
        failure: StorageError,
    ) -> EngineError {
        warn!(entity_id = %entity_id, %failure, writes = journal.len(), "plan failed, compensating");
        let reverted = journal.len();
        let mut unreverted = 0;
        let mut first_error = None;
        let mut store = self.store();
        for inverse in journal.into_iter().rev() {
            let result = match inverse {
                Inverse::RestoreField { key, previous } => {
                    store.set_field(entity_id, &key, previous.as_ref())
                }
                Inverse::RestoreSubEntity(sub) => store.put_sub_entity(entity_id, &sub),
                Inverse::RemoveSubEntity { collection, sub_id } => {
                    store.remove_sub_entity(entity_id, &collection, sub_id)
                }
                Inverse::RestoreLedger {
                    provenance,
                    contribution,
                } => store.put_ledger_entry(entity_id, provenance, &contribution),
                Inverse::RemoveLedger { provenance } => {
                    store.remove_ledger_entry(entity_id, provenance)
                }
            };
            if let Err(err) = result {
                unreverted += 1;
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            None => EngineError::PersistenceFailure {
                entity_id,
                reverted,
                failure,
            },
            Some(compensation) => {
                error!(
                    entity_id = %entity_id,
                    unreverted,
                    %compensation,
                    "compensation failed; persisted entity is partial and needs manual reconciliation"
                );
                EngineError::CompensationFailed {
                    entity_id,
                    unreverted,
                    failure,
                    compensation,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetwright_core::{BonusCategory, EffectInstance, RuleElement};
    use sheetwright_storage::MemoryStore;

    fn gateway() -> MutationGateway<MemoryStore> {
        MutationGateway::new(
            MemoryStore::new(),
            PolicyRegistry::standard().with_policy("tiny", 2),
            Arc::new(Recalculator::standard()),
        )
    }

    fn shield() -> SubEntity {
        SubEntity {
            id: SubEntityId::new(),
            collection: "gear".into(),
            fields: BTreeMap::from([("name".to_string(), FieldValue::Text("buckler".into()))]),
            effects: vec![EffectInstance::new(RuleElement::StatBonus {
                target: "armor_class".into(),
                category: BonusCategory::non_stacking("shield"),
                amount: 1,
            })],
        }
    }

    #[test]
    fn create_entity_runs_one_recalc() {
        let gw = gateway();
        let snapshot = gw
            .create_entity(BTreeMap::from([("level".to_string(), FieldValue::Integer(1))]))
            .unwrap();
        assert_eq!(snapshot.revision, 1);
        assert_eq!(gw.recalculator().passes(), 1);
        assert_eq!(gw.load(snapshot.entity_id).unwrap(), snapshot);
    }

    #[test]
    fn apply_plan_writes_and_recalculates_once() {
        let gw = gateway();
        let entity = gw.create_entity(BTreeMap::new()).unwrap();
        let item = shield();
        let plan = MutationPlan::builder()
            .create(item.clone())
            .set_field("name", FieldValue::Text("Bram".into()))
            .build();
        let receipt = gw.apply_plan(entity.entity_id, plan, "item.acquire").unwrap();

        assert_eq!(receipt.revision, 2);
        assert_eq!(receipt.recalculations, 1);
        assert_eq!(gw.recalculator().passes(), 2);
        assert_eq!(receipt.snapshot.derived.value("armor_class"), Some(1));
        assert_eq!(gw.load(entity.entity_id).unwrap(), receipt.snapshot);
    }

    #[test]
    fn over_budget_plan_touches_nothing() {
        let gw = gateway();
        let entity = gw.create_entity(BTreeMap::new()).unwrap();
        let plan = MutationPlan::builder()
            .create(shield())
            .create(shield())
            .set_field("name", FieldValue::Text("Bram".into()))
            .build();
        let err = gw.apply_plan(entity.entity_id, plan, "tiny").unwrap_err();
        assert!(matches!(err, EngineError::PolicyViolation { requested: 3, budget: 2, .. }));
        assert_eq!(gw.load(entity.entity_id).unwrap(), entity);
        assert_eq!(gw.recalculator().passes(), 1);
    }

    #[test]
    fn failing_delete_reverts_earlier_writes() {
        let gw = gateway();
        let entity = gw.create_entity(BTreeMap::new()).unwrap();
        let plan = MutationPlan::builder()
            .create(shield())
            .set_field("name", FieldValue::Text("Bram".into()))
            .delete("gear", SubEntityId::new())
            .build();
        let err = gw.apply_plan(entity.entity_id, plan, "item.acquire").unwrap_err();
        assert!(matches!(err, EngineError::PersistenceFailure { reverted: 3, .. }));
        assert_eq!(gw.load(entity.entity_id).unwrap(), entity);
    }

    #[test]
    fn stale_base_is_rejected() {
        let gw = gateway();
        let entity = gw.create_entity(BTreeMap::new()).unwrap();
        let plan = MutationPlan::builder()
            .base_revision(7)
            .set_field("name", FieldValue::Text("Bram".into()))
            .build();
        assert!(matches!(
            gw.apply_plan(entity.entity_id, plan, "item.acquire"),
            Err(EngineError::StaleBase { expected: 7, actual: 1, .. })
        ));
        assert!(!gw.is_applying(entity.entity_id));
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn writing_outside_scope_panics() {
        let mut live = LiveEntity::new(EntitySnapshot {
            entity_id: EntityId::new(),
            revision: 1,
            canonical: CanonicalState::default(),
            derived: DerivedFields::default(),
        });
        live.canonical_mut()
            .fields
            .insert("hp".into(), FieldValue::Integer(1));
    }
}
