//! Staging sessions: at most one open session per entity. A session owns a
//! draft, and its commit is the only way the draft reaches the gateway.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sheetwright_core::{DecisionTag, EntityId, EntitySnapshot, SessionId};
use sheetwright_storage::DocumentStore;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::draft::{DraftState, Preview, StageOutcome, StagedPatch, ValidationIssue};
use crate::error::EngineError;
use crate::events::{EntityCommitted, EventBus};
use crate::gateway::{CommitReceipt, MutationGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Committed,
    RolledBack,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Committed => "committed",
            SessionStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != SessionStatus::Open
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Registry<S: DocumentStore> {
    gateway: Arc<MutationGateway<S>>,
    open: Mutex<HashMap<EntityId, SessionId>>,
    events: Arc<EventBus>,
    config: EngineConfig,
}

impl<S: DocumentStore> Registry<S> {
    fn open(&self) -> MutexGuard<'_, HashMap<EntityId, SessionId>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Free the entity's slot if `session_id` still holds it.
    fn release(&self, entity_id: EntityId, session_id: SessionId) {
        let mut open = self.open();
        if open.get(&entity_id) == Some(&session_id) {
            open.remove(&entity_id);
        }
    }
}

pub struct SessionManager<S: DocumentStore> {
    registry: Arc<Registry<S>>,
}

impl<S: DocumentStore> Clone for SessionManager<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<S: DocumentStore> SessionManager<S> {
    pub fn new(gateway: Arc<MutationGateway<S>>, events: Arc<EventBus>, config: EngineConfig) -> Self {
        Self {
            registry: Arc::new(Registry {
                gateway,
                open: Mutex::new(HashMap::new()),
                events,
                config,
            }),
        }
    }

    /// Open a session under the configured default operation.
    pub fn open(&self, entity_id: EntityId) -> Result<Session<S>, EngineError> {
        let operation = self.registry.config.default_operation.clone();
        self.open_for(entity_id, &operation)
    }

    pub fn open_for(&self, entity_id: EntityId, operation: &str) -> Result<Session<S>, EngineError> {
        let registry = &self.registry;
        registry.gateway.policies().get(operation)?;

        let session_id = SessionId::new();
        {
            let mut open = registry.open();
            if let Some(holder) = open.get(&entity_id) {
                warn!(entity_id = %entity_id, holder = %holder, "session already open");
                return Err(EngineError::Conflict {
                    entity_id,
                    holder: *holder,
                });
            }
            open.insert(entity_id, session_id);
        }

        let base = match registry.gateway.load(entity_id) {
            Ok(base) => Arc::new(base),
            Err(err) => {
                registry.release(entity_id, session_id);
                return Err(err);
            }
        };
        info!(entity_id = %entity_id, session_id = %session_id, operation, revision = base.revision, "session opened");

        Ok(Session {
            id: session_id,
            entity_id,
            operation: operation.to_string(),
            status: SessionStatus::Open,
            draft: DraftState::new(base, registry.config.max_staged_patches),
            registry: Arc::clone(registry),
        })
    }

    /// Session currently holding `entity_id`, if any.
    pub fn holder(&self, entity_id: EntityId) -> Option<SessionId> {
        self.registry.open().get(&entity_id).copied()
    }

    pub fn open_sessions(&self) -> usize {
        self.registry.open().len()
    }
}

pub struct Session<S: DocumentStore> {
    id: SessionId,
    entity_id: EntityId,
    operation: String,
    status: SessionStatus,
    draft: DraftState,
    registry: Arc<Registry<S>>,
}

impl<S: DocumentStore> Session<S> {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// The entity as it was when the session opened.
    pub fn base(&self) -> &EntitySnapshot {
        self.draft.base()
    }

    pub fn draft(&self) -> &DraftState {
        &self.draft
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::SessionClosed {
                session_id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    pub fn stage(&mut self, patch: StagedPatch) -> Result<StageOutcome, EngineError> {
        self.ensure_open()?;
        let tag = patch.tag.clone();
        let outcome = self.draft.stage(patch)?;
        if let StageOutcome::Replaced { invalidated } = &outcome
            && !invalidated.is_empty()
        {
            debug!(session_id = %self.id, %tag, dropped = invalidated.len(), "downstream decisions invalidated");
        }
        Ok(outcome)
    }

    pub fn invalidate_downstream(&mut self, tag: &DecisionTag) -> Result<Vec<DecisionTag>, EngineError> {
        self.ensure_open()?;
        Ok(self.draft.invalidate_downstream(tag))
    }

    pub fn validate(&self) -> Result<Vec<ValidationIssue>, EngineError> {
        self.ensure_open()?;
        Ok(self.draft.validate())
    }

    pub fn preview(&self) -> Result<Preview, EngineError> {
        self.ensure_open()?;
        Ok(self.draft.preview())
    }

    /// Validate, build the net plan and hand it to the gateway.
    ///
    /// On success the session is committed and the entity is free again. A
    /// rejected or compensated commit leaves the session open with its
    /// overlay intact. Only `CompensationFailed` forces it closed.
    pub fn commit(&mut self) -> Result<CommitReceipt, EngineError> {
        self.ensure_open()?;
        let errors: Vec<ValidationIssue> = self
            .draft
            .validate()
            .into_iter()
            .filter(ValidationIssue::is_error)
            .collect();
        if !errors.is_empty() {
            warn!(session_id = %self.id, errors = errors.len(), "commit blocked by validation");
            return Err(EngineError::Validation(errors));
        }

        let plan = self.draft.to_mutation_plan();
        let registry = Arc::clone(&self.registry);
        match registry.gateway.apply_plan(self.entity_id, plan, &self.operation) {
            Ok(receipt) => {
                self.finish(SessionStatus::Committed);
                let delivered = registry.events.publish(EntityCommitted {
                    entity_id: self.entity_id,
                    session_id: Some(self.id),
                    operation: self.operation.clone(),
                    revision: receipt.revision,
                    snapshot: Arc::new(receipt.snapshot.clone()),
                });
                info!(session_id = %self.id, entity_id = %self.entity_id, revision = receipt.revision, delivered, "session committed");
                Ok(receipt)
            }
            Err(err @ EngineError::CompensationFailed { .. }) => {
                error!(session_id = %self.id, entity_id = %self.entity_id, "session closed after failed compensation");
                self.finish(SessionStatus::RolledBack);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Discard the overlay. Nothing was persisted, so nothing is undone.
    pub fn rollback(&mut self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.finish(SessionStatus::RolledBack);
        info!(session_id = %self.id, entity_id = %self.entity_id, "session rolled back");
        Ok(())
    }

    fn finish(&mut self, status: SessionStatus) {
        self.status = status;
        self.draft.clear();
        self.registry.release(self.entity_id, self.id);
    }
}

impl<S: DocumentStore> Drop for Session<S> {
    fn drop(&mut self) {
        if self.status == SessionStatus::Open {
            debug!(session_id = %self.id, entity_id = %self.entity_id, "abandoned session released");
            self.registry.release(self.entity_id, self.id);
        }
    }
}
