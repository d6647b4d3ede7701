use std::collections::BTreeMap;

use crate::error::EngineError;

/// Bumped whenever the built-in table changes.
pub const POLICY_TABLE_VERSION: u32 = 1;

pub const CHARACTER_BUILD: &str = "character.build";
pub const CHARACTER_LEVEL_UP: &str = "character.level_up";
pub const CHARACTER_RESPEC: &str = "character.respec";
pub const ITEM_ACQUIRE: &str = "item.acquire";
pub const ITEM_REMOVE: &str = "item.remove";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub operation: String,
    pub max_sub_mutations: usize,
    /// Always 1: a successful plan runs the recalculator exactly once.
    pub required_recalc_count: u32,
}

impl Policy {
    pub fn new(operation: &str, max_sub_mutations: usize) -> Self {
        Self {
            operation: operation.to_string(),
            max_sub_mutations,
            required_recalc_count: 1,
        }
    }
}

/// Operation name to mutation budget. Read-only once handed to the gateway.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    version: u32,
    policies: BTreeMap<String, Policy>,
}

impl PolicyRegistry {
    pub fn empty() -> Self {
        Self {
            version: POLICY_TABLE_VERSION,
            policies: BTreeMap::new(),
        }
    }

    pub fn standard() -> Self {
        Self::empty()
            .with_policy(CHARACTER_BUILD, 128)
            .with_policy(CHARACTER_LEVEL_UP, 48)
            .with_policy(CHARACTER_RESPEC, 96)
            .with_policy(ITEM_ACQUIRE, 8)
            .with_policy(ITEM_REMOVE, 8)
    }

    pub fn with_policy(mut self, operation: &str, max_sub_mutations: usize) -> Self {
        self.policies
            .insert(operation.to_string(), Policy::new(operation, max_sub_mutations));
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn get(&self, operation: &str) -> Result<&Policy, EngineError> {
        self.policies
            .get(operation)
            .ok_or_else(|| EngineError::UnknownOperation(operation.to_string()))
    }

    /// Look up `operation` and reject plans larger than its budget.
    pub fn check(&self, operation: &str, sub_mutations: usize) -> Result<&Policy, EngineError> {
        let policy = self.get(operation)?;
        if sub_mutations > policy.max_sub_mutations {
            return Err(EngineError::PolicyViolation {
                operation: operation.to_string(),
                requested: sub_mutations,
                budget: policy.max_sub_mutations,
            });
        }
        Ok(policy)
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
