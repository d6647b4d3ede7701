pub mod config;
pub mod draft;
pub mod error;
pub mod events;
pub mod gateway;
pub mod plan;
pub mod policy;
pub mod recalc;
pub mod rule_engine;
pub mod session;

pub use config::EngineConfig;
pub use draft::{
    DraftState, FieldChange, IssueKind, PatchEdit, Preview, Severity, StageOutcome, StagedPatch,
    ValidationIssue,
};
pub use error::EngineError;
pub use events::{EntityCommitted, EventBus};
pub use gateway::{CommitReceipt, MutationGateway};
pub use plan::{FieldUpdate, MutationPlan, MutationPlanBuilder, ROOT_COLLECTION, SubMutation};
pub use policy::{POLICY_TABLE_VERSION, Policy, PolicyRegistry};
pub use recalc::{DerivedRule, Recalculator, TotalsRule};
pub use rule_engine::{RuleEngine, SkippedEffect};
pub use session::{Session, SessionManager, SessionStatus};

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use sheetwright_core::{
    EffectInstance, EntityId, EntitySnapshot, FieldValue, RuleContent, SubEntity, SubEntityId,
};
use sheetwright_storage::DocumentStore;
use tracing::info;

/// Entry point tying the gateway, sessions and event bus together over one
/// document store.
pub struct Engine<S: DocumentStore> {
    gateway: Arc<MutationGateway<S>>,
    sessions: SessionManager<S>,
    events: Arc<EventBus>,
    config: EngineConfig,
}

impl<S: DocumentStore> Engine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self::with_parts(
            store,
            config,
            PolicyRegistry::standard(),
            Arc::new(Recalculator::standard()),
        )
    }

    pub fn with_parts(
        store: S,
        config: EngineConfig,
        policies: PolicyRegistry,
        recalculator: Arc<Recalculator>,
    ) -> Self {
        let gateway = Arc::new(MutationGateway::new(store, policies, recalculator));
        let events = Arc::new(EventBus::new(config.event_capacity));
        let sessions = SessionManager::new(Arc::clone(&gateway), Arc::clone(&events), config.clone());
        Self {
            gateway,
            sessions,
            events,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<MutationGateway<S>> {
        &self.gateway
    }

    pub fn sessions(&self) -> &SessionManager<S> {
        &self.sessions
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> Receiver<EntityCommitted> {
        self.events.subscribe()
    }

    pub fn create_entity(&self, fields: Vec<(&str, FieldValue)>) -> Result<EntityId, EngineError> {
        let fields: BTreeMap<String, FieldValue> = fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Ok(self.gateway.create_entity(fields)?.entity_id)
    }

    pub fn entity(&self, entity_id: EntityId) -> Result<EntitySnapshot, EngineError> {
        self.gateway.load(entity_id)
    }

    pub fn open_session(&self, entity_id: EntityId) -> Result<Session<S>, EngineError> {
        self.sessions.open(entity_id)
    }

    pub fn open_session_for(&self, entity_id: EntityId, operation: &str) -> Result<Session<S>, EngineError> {
        self.sessions.open_for(entity_id, operation)
    }

    /// Add one sub-entity and its effects in a single plan, outside any
    /// session. An open session on the same entity will see a stale base.
    pub fn acquire_item(
        &self,
        entity_id: EntityId,
        collection: &str,
        fields: Vec<(&str, FieldValue)>,
        effects: Vec<RuleContent>,
    ) -> Result<(SubEntityId, CommitReceipt), EngineError> {
        let sub = SubEntity {
            id: SubEntityId::new(),
            collection: collection.to_string(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            effects: effects.into_iter().map(EffectInstance::new).collect(),
        };
        let sub_id = sub.id;
        let plan = MutationPlan::builder().create(sub).build();
        let receipt = self.apply_one_shot(entity_id, plan, policy::ITEM_ACQUIRE)?;
        Ok((sub_id, receipt))
    }

    /// Remove one sub-entity and take back everything its effects contributed.
    pub fn remove_item(
        &self,
        entity_id: EntityId,
        collection: &str,
        sub_id: SubEntityId,
    ) -> Result<CommitReceipt, EngineError> {
        let plan = MutationPlan::builder().delete(collection, sub_id).build();
        self.apply_one_shot(entity_id, plan, policy::ITEM_REMOVE)
    }

    fn apply_one_shot(
        &self,
        entity_id: EntityId,
        plan: MutationPlan,
        operation: &str,
    ) -> Result<CommitReceipt, EngineError> {
        let receipt = self.gateway.apply_plan(entity_id, plan, operation)?;
        let delivered = self.events.publish(EntityCommitted {
            entity_id,
            session_id: None,
            operation: operation.to_string(),
            revision: receipt.revision,
            snapshot: Arc::new(receipt.snapshot.clone()),
        });
        info!(entity_id = %entity_id, operation, revision = receipt.revision, delivered, "one-shot operation applied");
        Ok(receipt)
    }
}
