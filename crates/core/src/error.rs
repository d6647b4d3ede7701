use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A rule element that cannot be applied. Never aborts a plan; the caller
/// logs it and moves on to the next effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("{kind}: missing required field `{field}`")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("{kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("undecodable rule element: {0}")]
    Undecodable(String),
}
