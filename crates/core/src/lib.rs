pub mod error;
pub mod field_value;
pub mod ids;
pub mod ledger;
pub mod rules;
pub mod state;

pub use error::{CoreError, RuleError};
pub use field_value::FieldValue;
pub use ids::*;
pub use ledger::{BonusLedger, Contribution, Grant};
pub use rules::{BonusCategory, Condition, RuleContent, RuleElement, Stacking};
pub use state::{CanonicalState, DerivedFields, EffectInstance, EntitySnapshot, SubEntity};
