//! Rule element content model.
//!
//! Rule elements are authored outside this crate and attached to sub-entities.
//! The variant set is closed: every consumer matches on all six kinds.

use serde::{Deserialize, Serialize};

use crate::error::RuleError;
use crate::field_value::FieldValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stacking {
    /// Same-category sources are summed.
    Stacks,
    /// Only the largest same-category source counts.
    Highest,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BonusCategory {
    pub name: String,
    pub stacking: Stacking,
}

impl BonusCategory {
    pub fn stacking(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stacking: Stacking::Stacks,
        }
    }

    pub fn non_stacking(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stacking: Stacking::Highest,
        }
    }

    pub fn stacks(&self) -> bool {
        self.stacking == Stacking::Stacks
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    FieldEquals { field: String, value: FieldValue },
    FieldAtLeast { field: String, min: i64 },
    HasAbility(String),
    HasTraining(String),
    HasSubEntity { collection: String },
    AllOf(Vec<Condition>),
    AnyOf(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    fn check(&self, kind: &'static str) -> Result<(), RuleError> {
        match self {
            Condition::FieldEquals { field, .. } | Condition::FieldAtLeast { field, .. } => {
                require(kind, "condition.field", field)
            }
            Condition::HasAbility(name) => require(kind, "condition.ability", name),
            Condition::HasTraining(name) => require(kind, "condition.skill", name),
            Condition::HasSubEntity { collection } => {
                require(kind, "condition.collection", collection)
            }
            Condition::AllOf(all) | Condition::AnyOf(all) if all.is_empty() => {
                Err(RuleError::Malformed {
                    kind,
                    reason: "empty condition group".to_string(),
                })
            }
            Condition::AllOf(all) | Condition::AnyOf(all) => {
                all.iter().try_for_each(|c| c.check(kind))
            }
            Condition::Not(inner) => inner.check(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleElement {
    StatBonus {
        target: String,
        category: BonusCategory,
        amount: i64,
    },
    GrantAbility {
        ability: String,
    },
    SkillTraining {
        skill: String,
    },
    AttributeModifier {
        attribute: String,
        amount: i64,
    },
    ConditionalBonus {
        target: String,
        category: BonusCategory,
        amount: i64,
        condition: Condition,
    },
    Prerequisite {
        requirement: Condition,
        message: String,
    },
}

impl RuleElement {
    pub fn kind_name(&self) -> &'static str {
        match self {
            RuleElement::StatBonus { .. } => "StatBonus",
            RuleElement::GrantAbility { .. } => "GrantAbility",
            RuleElement::SkillTraining { .. } => "SkillTraining",
            RuleElement::AttributeModifier { .. } => "AttributeModifier",
            RuleElement::ConditionalBonus { .. } => "ConditionalBonus",
            RuleElement::Prerequisite { .. } => "Prerequisite",
        }
    }

    /// Well-formedness: every name the element refers to must be present and
    /// condition groups must not be empty.
    pub fn check(&self) -> Result<(), RuleError> {
        let kind = self.kind_name();
        match self {
            RuleElement::StatBonus { target, category, .. } => {
                require(kind, "target", target)?;
                require(kind, "category", &category.name)
            }
            RuleElement::GrantAbility { ability } => require(kind, "ability", ability),
            RuleElement::SkillTraining { skill } => require(kind, "skill", skill),
            RuleElement::AttributeModifier { attribute, .. } => {
                require(kind, "attribute", attribute)
            }
            RuleElement::ConditionalBonus {
                target,
                category,
                condition,
                ..
            } => {
                require(kind, "target", target)?;
                require(kind, "category", &category.name)?;
                condition.check(kind)
            }
            RuleElement::Prerequisite { requirement, .. } => requirement.check(kind),
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, RuleError> {
        rmp_serde::from_slice(bytes).map_err(|e| RuleError::Undecodable(e.to_string()))
    }
}

fn require(kind: &'static str, field: &'static str, value: &str) -> Result<(), RuleError> {
    if value.trim().is_empty() {
        Err(RuleError::MissingField { kind, field })
    } else {
        Ok(())
    }
}

/// A rule element as delivered by content authoring: either already typed or
/// still in its encoded form. Decoding happens when the element is applied,
/// so one bad definition only takes out its own effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleContent {
    Typed(RuleElement),
    Encoded(Vec<u8>),
}

impl RuleContent {
    pub fn resolve(&self) -> Result<RuleElement, RuleError> {
        let element = match self {
            RuleContent::Typed(element) => element.clone(),
            RuleContent::Encoded(bytes) => RuleElement::from_msgpack(bytes)?,
        };
        element.check()?;
        Ok(element)
    }
}

impl From<RuleElement> for RuleContent {
    fn from(element: RuleElement) -> Self {
        RuleContent::Typed(element)
    }
}
