//! Rule content shorthands for tests.

use sheetwright_core::{BonusCategory, Condition, RuleContent, RuleElement};

pub fn stat_bonus(target: &str, category: BonusCategory, amount: i64) -> RuleContent {
    RuleElement::StatBonus {
        target: target.to_string(),
        category,
        amount,
    }
    .into()
}

/// A bonus whose category does not stack: only the largest one counts.
pub fn enhancement(target: &str, amount: i64) -> RuleContent {
    stat_bonus(target, BonusCategory::non_stacking("enhancement"), amount)
}

pub fn untyped(target: &str, amount: i64) -> RuleContent {
    stat_bonus(target, BonusCategory::stacking("untyped"), amount)
}

pub fn ability(name: &str) -> RuleContent {
    RuleElement::GrantAbility {
        ability: name.to_string(),
    }
    .into()
}

pub fn training(skill: &str) -> RuleContent {
    RuleElement::SkillTraining {
        skill: skill.to_string(),
    }
    .into()
}

pub fn attribute(attribute: &str, amount: i64) -> RuleContent {
    RuleElement::AttributeModifier {
        attribute: attribute.to_string(),
        amount,
    }
    .into()
}

pub fn conditional(target: &str, amount: i64, condition: Condition) -> RuleContent {
    RuleElement::ConditionalBonus {
        target: target.to_string(),
        category: BonusCategory::stacking("circumstance"),
        amount,
        condition,
    }
    .into()
}

pub fn prerequisite(requirement: Condition, message: &str) -> RuleContent {
    RuleElement::Prerequisite {
        requirement,
        message: message.to_string(),
    }
    .into()
}

/// Bytes that are not a valid encoded rule element.
pub fn garbled() -> RuleContent {
    RuleContent::Encoded(vec![0xc1, 0x00, 0xff])
}
