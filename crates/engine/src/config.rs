pub const DEFAULT_EVENT_CAPACITY: usize = 256;
pub const DEFAULT_MAX_STAGED_PATCHES: usize = 256;
pub const DEFAULT_OPERATION: &str = crate::policy::CHARACTER_BUILD;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-subscriber queue depth for commit events. Events beyond it are dropped.
    pub event_capacity: usize,
    /// Policy name used by sessions opened without an explicit operation.
    pub default_operation: String,
    /// Upper bound on patches one overlay may hold.
    pub max_staged_patches: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            default_operation: DEFAULT_OPERATION.to_string(),
            max_staged_patches: DEFAULT_MAX_STAGED_PATCHES,
        }
    }
}
