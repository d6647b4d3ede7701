//! Applies and removes rule element effects against the bonus ledger.

use std::collections::BTreeMap;

use sheetwright_core::{
    CanonicalState, Contribution, EffectInstance, Grant, ProvenanceTag, RuleElement, RuleError,
    SubEntity, SubEntityId,
};
use tracing::{debug, warn};

/// An effect instance that could not be applied and was left out of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEffect {
    pub provenance: ProvenanceTag,
    pub carrier: SubEntityId,
    pub reason: RuleError,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RuleEngine;

impl RuleEngine {
    pub fn new() -> Self {
        Self
    }

    /// The ledger contribution `effect` makes when carried by `carrier`.
    /// Reads `state` only; recording the result is the caller's job. An
    /// effect already recorded under its provenance yields the recorded
    /// contribution, so re-applying never counts it twice.
    pub fn apply(
        &self,
        state: &CanonicalState,
        carrier: SubEntityId,
        effect: &EffectInstance,
    ) -> Result<Contribution, RuleError> {
        if let Some(existing) = state.ledger.get(effect.provenance) {
            return Ok(existing.clone());
        }
        let grants = match effect.content.resolve()? {
            RuleElement::StatBonus {
                target,
                category,
                amount,
            } => vec![Grant::Bonus {
                target,
                category,
                amount,
                condition: None,
            }],
            RuleElement::GrantAbility { ability } => vec![Grant::Ability(ability)],
            RuleElement::SkillTraining { skill } => vec![Grant::Training(skill)],
            RuleElement::AttributeModifier { attribute, amount } => {
                vec![Grant::AttributeModifier { attribute, amount }]
            }
            RuleElement::ConditionalBonus {
                target,
                category,
                amount,
                condition,
            } => vec![Grant::Bonus {
                target,
                category,
                amount,
                condition: Some(condition),
            }],
            // Checked by validation, contributes nothing.
            RuleElement::Prerequisite { .. } => Vec::new(),
        };
        Ok(Contribution { carrier, grants })
    }

    /// The contribution recorded for `effect`, which is exactly what removing
    /// it takes back out of the ledger.
    pub fn remove(&self, state: &CanonicalState, effect: &EffectInstance) -> Option<Contribution> {
        state.ledger.get(effect.provenance).cloned()
    }

    /// Apply and record in one step, for in-memory views.
    pub fn attach(
        &self,
        state: &mut CanonicalState,
        carrier: SubEntityId,
        effect: &EffectInstance,
    ) -> Result<(), RuleError> {
        let contribution = self.apply(state, carrier, effect)?;
        state.ledger.record(effect.provenance, contribution);
        Ok(())
    }

    pub fn detach(&self, state: &mut CanonicalState, effect: &EffectInstance) -> Option<Contribution> {
        state.ledger.take(effect.provenance)
    }

    /// Attach every effect a sub-entity carries. Malformed effects are logged
    /// and skipped; the rest still land.
    pub fn attach_all(&self, state: &mut CanonicalState, sub: &SubEntity) -> Vec<SkippedEffect> {
        let mut skipped = Vec::new();
        for effect in &sub.effects {
            if let Err(reason) = self.attach(state, sub.id, effect) {
                warn!(provenance = %effect.provenance, carrier = %sub.id, %reason, "skipping malformed rule element");
                skipped.push(SkippedEffect {
                    provenance: effect.provenance,
                    carrier: sub.id,
                    reason,
                });
            }
        }
        skipped
    }

    pub fn detach_all(&self, state: &mut CanonicalState, sub: &SubEntity) {
        for effect in &sub.effects {
            if self.detach(state, effect).is_none() {
                debug!(provenance = %effect.provenance, "no ledger entry to remove");
            }
        }
    }

    /// Effective modifier per target: aggregated bonuses plus attribute modifiers.
    pub fn effective_bonuses(&self, state: &CanonicalState) -> BTreeMap<String, i64> {
        state
            .ledger
            .targets()
            .into_iter()
            .map(|target| {
                let total = state
                    .bonus_total(&target)
                    .saturating_add(state.ledger.attribute_modifier(&target));
                (target, total)
            })
            .collect()
    }
}
