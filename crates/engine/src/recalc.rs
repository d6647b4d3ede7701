//! Derived-field recalculation.
//!
//! `Recalculator::recompute` is the only producer of `DerivedFields`. It reads
//! canonical state and nothing else, and refuses to nest for the same entity.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use sheetwright_core::{CanonicalState, CoreError, DerivedFields, EntityId};
use tracing::{debug, warn};

/// One derived-value formula. Implementations must be deterministic.
pub trait DerivedRule: Send + Sync {
    fn name(&self) -> &str;

    fn derive(&self, canonical: &CanonicalState, derived: &mut DerivedFields);
}

/// For every ledger target: canonical integer base (0 if absent) plus
/// attribute modifiers plus aggregated bonuses. Also lists granted abilities
/// and trained skills.
#[derive(Debug, Default)]
pub struct TotalsRule;

impl DerivedRule for TotalsRule {
    fn name(&self) -> &str {
        "totals"
    }

    fn derive(&self, canonical: &CanonicalState, derived: &mut DerivedFields) {
        for target in canonical.ledger.targets() {
            let base = canonical.integer(&target).unwrap_or(0);
            let total = base
                .saturating_add(canonical.ledger.attribute_modifier(&target))
                .saturating_add(canonical.bonus_total(&target));
            derived.values.insert(target, total);
        }
        derived.abilities.extend(canonical.ledger.abilities());
        derived.trained.extend(canonical.ledger.trainings());
    }
}

pub struct Recalculator {
    rules: Vec<Box<dyn DerivedRule>>,
    in_flight: Mutex<HashSet<EntityId>>,
    passes: AtomicU64,
}

impl Default for Recalculator {
    fn default() -> Self {
        Self::standard()
    }
}

impl Recalculator {
    /// No formulas at all; derived fields carry only the source digest.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            in_flight: Mutex::new(HashSet::new()),
            passes: AtomicU64::new(0),
        }
    }

    pub fn standard() -> Self {
        Self::new().with_rule(Box::new(TotalsRule))
    }

    /// Rules run in the order they were added; later rules see earlier output.
    pub fn with_rule(mut self, rule: Box<dyn DerivedRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Completed passes since construction.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Compute derived fields for `entity_id` from `canonical`.
    ///
    /// Returns `Ok(None)` without computing anything when a pass for the same
    /// entity is already running on this recalculator.
    pub fn recompute(
        &self,
        entity_id: EntityId,
        canonical: &CanonicalState,
    ) -> Result<Option<DerivedFields>, CoreError> {
        let Some(_guard) = InFlight::enter(&self.in_flight, entity_id) else {
            warn!(entity_id = %entity_id, "nested recalculation ignored");
            return Ok(None);
        };

        let mut derived = DerivedFields {
            source_digest: canonical.digest()?,
            ..DerivedFields::default()
        };
        for rule in &self.rules {
            debug!(entity_id = %entity_id, rule = rule.name(), "deriving");
            rule.derive(canonical, &mut derived);
        }
        self.passes.fetch_add(1, Ordering::SeqCst);
        Ok(Some(derived))
    }
}

struct InFlight<'a> {
    set: &'a Mutex<HashSet<EntityId>>,
    entity_id: EntityId,
}

impl<'a> InFlight<'a> {
    fn enter(set: &'a Mutex<HashSet<EntityId>>, entity_id: EntityId) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_id);
        inserted.then_some(Self { set, entity_id })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.entity_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetwright_core::{
        BonusCategory, Contribution, FieldValue, Grant, ProvenanceTag, SubEntityId,
    };
    use std::sync::{Arc, OnceLock, Weak};

    fn state() -> CanonicalState {
        let mut canonical = CanonicalState::default();
        canonical.fields.insert("dexterity".into(), FieldValue::Integer(14));
        canonical.ledger.record(
            ProvenanceTag::new(),
            Contribution {
                carrier: SubEntityId::new(),
                grants: vec![
                    Grant::AttributeModifier {
                        attribute: "dexterity".into(),
                        amount: 2,
                    },
                    Grant::Bonus {
                        target: "dexterity".into(),
                        category: BonusCategory::non_stacking("enhancement"),
                        amount: 1,
                        condition: None,
                    },
                    Grant::Ability("uncanny_dodge".into()),
                ],
            },
        );
        canonical
    }

    #[test]
    fn totals_combine_base_modifiers_and_bonuses() {
        let recalc = Recalculator::standard();
        let derived = recalc.recompute(EntityId::new(), &state()).unwrap().unwrap();
        assert_eq!(derived.value("dexterity"), Some(17));
        assert!(derived.abilities.contains("uncanny_dodge"));
        assert_eq!(recalc.passes(), 1);
    }

    #[test]
    fn recompute_is_referentially_transparent() {
        let recalc = Recalculator::standard();
        let input = state();
        let before = input.clone();
        let id = EntityId::new();
        let a = recalc.recompute(id, &input).unwrap();
        let b = recalc.recompute(id, &input).unwrap();
        assert_eq!(a, b);
        assert_eq!(input, before);
    }

    struct Reenter {
        entity_id: EntityId,
        outer: Arc<OnceLock<Weak<Recalculator>>>,
        nested: Arc<Mutex<Option<bool>>>,
    }

    impl DerivedRule for Reenter {
        fn name(&self) -> &str {
            "reenter"
        }

        fn derive(&self, canonical: &CanonicalState, _derived: &mut DerivedFields) {
            if let Some(recalc) = self.outer.get().and_then(Weak::upgrade) {
                let result = recalc.recompute(self.entity_id, canonical).unwrap();
                *self.nested.lock().unwrap() = Some(result.is_some());
            }
        }
    }

    #[test]
    fn nested_call_for_same_entity_is_noop() {
        let entity_id = EntityId::new();
        let outer = Arc::new(OnceLock::new());
        let nested = Arc::new(Mutex::new(None));
        let recalc = Arc::new(Recalculator::standard().with_rule(Box::new(Reenter {
            entity_id,
            outer: outer.clone(),
            nested: nested.clone(),
        })));
        outer.set(Arc::downgrade(&recalc)).unwrap();

        let derived = recalc.recompute(entity_id, &state()).unwrap();
        assert!(derived.is_some());
        assert_eq!(*nested.lock().unwrap(), Some(false));
        assert_eq!(recalc.passes(), 1);

        // The guard is released once the outer pass returns.
        assert!(recalc.recompute(entity_id, &state()).unwrap().is_some());
    }
}
