use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ids::{ProvenanceTag, SubEntityId};
use crate::rules::{BonusCategory, Condition};

/// One additive effect recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grant {
    Bonus {
        target: String,
        category: BonusCategory,
        amount: i64,
        condition: Option<Condition>,
    },
    Ability(String),
    Training(String),
    AttributeModifier { attribute: String, amount: i64 },
}

/// Everything a single effect instance put into the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub carrier: SubEntityId,
    pub grants: Vec<Grant>,
}

/// Contributions keyed by the provenance tag of the effect that produced them.
/// Removal takes out exactly what was recorded, so totals never depend on
/// re-deriving a rule after the fact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusLedger {
    entries: BTreeMap<ProvenanceTag, Contribution>,
}

impl BonusLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the contribution previously held under `tag`, if any.
    pub fn record(&mut self, tag: ProvenanceTag, contribution: Contribution) -> Option<Contribution> {
        self.entries.insert(tag, contribution)
    }

    pub fn take(&mut self, tag: ProvenanceTag) -> Option<Contribution> {
        self.entries.remove(&tag)
    }

    pub fn get(&self, tag: ProvenanceTag) -> Option<&Contribution> {
        self.entries.get(&tag)
    }

    pub fn contains(&self, tag: ProvenanceTag) -> bool {
        self.entries.contains_key(&tag)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ProvenanceTag, &Contribution)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn grants(&self) -> impl Iterator<Item = &Grant> {
        self.entries.values().flat_map(|c| c.grants.iter())
    }

    /// Every target named by a bonus or attribute modifier.
    pub fn targets(&self) -> BTreeSet<String> {
        self.grants()
            .filter_map(|g| match g {
                Grant::Bonus { target, .. } => Some(target.clone()),
                Grant::AttributeModifier { attribute, .. } => Some(attribute.clone()),
                Grant::Ability(_) | Grant::Training(_) => None,
            })
            .collect()
    }

    /// Aggregated bonus for `target`. Stacking categories sum, non-stacking
    /// categories keep their largest source. Conditional bonuses count only
    /// when `active` accepts their condition. Sums saturate at the `i64`
    /// bounds.
    pub fn bonus_total(&self, target: &str, active: impl Fn(&Condition) -> bool) -> i64 {
        let mut by_category: BTreeMap<&BonusCategory, Vec<i64>> = BTreeMap::new();
        for grant in self.grants() {
            if let Grant::Bonus {
                target: t,
                category,
                amount,
                condition,
            } = grant
                && t == target
                && condition.as_ref().is_none_or(&active)
            {
                by_category.entry(category).or_default().push(*amount);
            }
        }
        by_category
            .into_iter()
            .map(|(category, amounts)| {
                if category.stacks() {
                    amounts.iter().fold(0i64, |acc, n| acc.saturating_add(*n))
                } else {
                    amounts.iter().copied().max().unwrap_or(0)
                }
            })
            .fold(0, i64::saturating_add)
    }

    pub fn attribute_modifier(&self, attribute: &str) -> i64 {
        self.grants()
            .filter_map(|g| match g {
                Grant::AttributeModifier { attribute: a, amount } if a == attribute => Some(*amount),
                _ => None,
            })
            .fold(0, i64::saturating_add)
    }

    pub fn abilities(&self) -> BTreeSet<String> {
        self.grants()
            .filter_map(|g| match g {
                Grant::Ability(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn trainings(&self) -> BTreeSet<String> {
        self.grants()
            .filter_map(|g| match g {
                Grant::Training(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}
