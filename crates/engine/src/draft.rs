//! Draft state: an untouched base snapshot plus an ordered overlay of staged
//! patches.
//!
//! Patches are keyed by a decision tag and may depend on one other tag.
//! Restaging a tag with a different patch drops every patch downstream of it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use sheetwright_core::{
    CanonicalState, DecisionTag, EffectInstance, EntitySnapshot, FieldValue, RuleContent,
    RuleElement, SubEntity, SubEntityId,
};

use crate::error::EngineError;
use crate::plan::{MutationPlan, ROOT_COLLECTION};
use crate::rule_engine::{RuleEngine, SkippedEffect};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchEdit {
    SetField {
        key: String,
        value: FieldValue,
    },
    ClearField {
        key: String,
    },
    /// Ids for the new sub-entity and its effects are assigned when staged.
    AddSubEntity {
        collection: String,
        fields: BTreeMap<String, FieldValue>,
        effects: Vec<RuleContent>,
    },
    UpdateSubEntity {
        collection: String,
        sub_id: SubEntityId,
        key: String,
        value: Option<FieldValue>,
    },
    RemoveSubEntity {
        collection: String,
        sub_id: SubEntityId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPatch {
    pub tag: DecisionTag,
    pub depends_on: Option<DecisionTag>,
    pub edits: Vec<PatchEdit>,
}

impl StagedPatch {
    pub fn new(tag: impl Into<DecisionTag>) -> Self {
        Self {
            tag: tag.into(),
            depends_on: None,
            edits: Vec::new(),
        }
    }

    pub fn depends_on(mut self, tag: impl Into<DecisionTag>) -> Self {
        self.depends_on = Some(tag.into());
        self
    }

    pub fn set(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.edits.push(PatchEdit::SetField {
            key: key.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn clear(mut self, key: &str) -> Self {
        self.edits.push(PatchEdit::ClearField {
            key: key.to_string(),
        });
        self
    }

    pub fn add_sub_entity(
        mut self,
        collection: &str,
        fields: Vec<(&str, FieldValue)>,
        effects: Vec<RuleContent>,
    ) -> Self {
        self.edits.push(PatchEdit::AddSubEntity {
            collection: collection.to_string(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            effects,
        });
        self
    }

    pub fn update_sub_entity(
        mut self,
        collection: &str,
        sub_id: SubEntityId,
        key: &str,
        value: Option<FieldValue>,
    ) -> Self {
        self.edits.push(PatchEdit::UpdateSubEntity {
            collection: collection.to_string(),
            sub_id,
            key: key.to_string(),
            value,
        });
        self
    }

    pub fn remove_sub_entity(mut self, collection: &str, sub_id: SubEntityId) -> Self {
        self.edits.push(PatchEdit::RemoveSubEntity {
            collection: collection.to_string(),
            sub_id,
        });
        self
    }

    /// Local well-formedness, independent of any overlay.
    fn check(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut flag = |message: String| {
            issues.push(ValidationIssue::error(
                Some(self.tag.clone()),
                IssueKind::MalformedPatch,
                message,
            ));
        };
        if self.tag.is_empty() {
            flag("patch has an empty tag".to_string());
        }
        if self.edits.is_empty() {
            flag(format!("patch {} has no edits", self.tag));
        }
        if let Some(dep) = &self.depends_on {
            if dep.is_empty() {
                flag(format!("patch {} has an empty dependency tag", self.tag));
            } else if *dep == self.tag {
                flag(format!("patch {} depends on itself", self.tag));
            }
        }
        for edit in &self.edits {
            let (collection, key) = match edit {
                PatchEdit::SetField { key, .. } | PatchEdit::ClearField { key } => (None, Some(key)),
                PatchEdit::AddSubEntity { collection, .. }
                | PatchEdit::RemoveSubEntity { collection, .. } => (Some(collection), None),
                PatchEdit::UpdateSubEntity { collection, key, .. } => (Some(collection), Some(key)),
            };
            if key.is_some_and(|k| k.trim().is_empty()) {
                flag(format!("patch {} writes an empty field key", self.tag));
            }
            if let Some(collection) = collection
                && (collection.trim().is_empty() || collection == ROOT_COLLECTION)
            {
                flag(format!("patch {} targets invalid collection {collection:?}", self.tag));
            }
        }
        issues
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Blocks commit.
    Error,
    /// Reported only.
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    MalformedPatch,
    UnknownDependency,
    InvalidatedDependency,
    DependencyCycle,
    TooManyPatches,
    MissingTarget,
    DanglingReference,
    Prerequisite,
    MalformedEffect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub tag: Option<DecisionTag>,
    pub severity: Severity,
    pub kind: IssueKind,
    pub message: String,
}

impl ValidationIssue {
    fn error(tag: Option<DecisionTag>, kind: IssueKind, message: String) -> Self {
        Self {
            tag,
            severity: Severity::Error,
            kind,
            message,
        }
    }

    fn warning(tag: Option<DecisionTag>, kind: IssueKind, message: String) -> Self {
        Self {
            tag,
            severity: Severity::Warning,
            kind,
            message,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Appended,
    /// Same tag, same patch: nothing changed.
    Unchanged,
    /// Same tag, new patch: the listed downstream tags were dropped.
    Replaced { invalidated: Vec<DecisionTag> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub key: String,
    pub before: Option<FieldValue>,
    pub after: Option<FieldValue>,
}

/// Read-only result of replaying the overlay.
#[derive(Debug, Clone)]
pub struct Preview {
    pub state: CanonicalState,
    pub changes: Vec<FieldChange>,
    pub added: Vec<SubEntity>,
    pub removed: Vec<SubEntity>,
    pub bonuses: BTreeMap<String, i64>,
    pub issues: Vec<ValidationIssue>,
    pub invalidated: Vec<DecisionTag>,
}

#[derive(Debug, Clone)]
struct StagedEntry {
    patch: StagedPatch,
    /// Sub-entities minted for this patch's `AddSubEntity` edits, in edit order.
    created: Vec<SubEntity>,
}

struct Replay {
    state: CanonicalState,
    skipped: Vec<SkippedEffect>,
    issues: Vec<ValidationIssue>,
    /// Which decision introduced each new sub-entity.
    origins: BTreeMap<SubEntityId, DecisionTag>,
}

pub struct DraftState {
    base: Arc<EntitySnapshot>,
    entries: Vec<StagedEntry>,
    /// tag -> tags whose patch depends on it
    dependents: BTreeMap<DecisionTag, BTreeSet<DecisionTag>>,
    invalidated: BTreeSet<DecisionTag>,
    rules: RuleEngine,
    max_patches: usize,
}

impl DraftState {
    pub fn new(base: Arc<EntitySnapshot>, max_patches: usize) -> Self {
        Self {
            base,
            entries: Vec::new(),
            dependents: BTreeMap::new(),
            invalidated: BTreeSet::new(),
            rules: RuleEngine::new(),
            max_patches,
        }
    }

    pub fn base(&self) -> &EntitySnapshot {
        &self.base
    }

    pub fn patches(&self) -> impl Iterator<Item = &StagedPatch> {
        self.entries.iter().map(|e| &e.patch)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tag: &DecisionTag) -> bool {
        self.position(tag).is_some()
    }

    pub fn invalidated(&self) -> &BTreeSet<DecisionTag> {
        &self.invalidated
    }

    fn position(&self, tag: &DecisionTag) -> Option<usize> {
        self.entries.iter().position(|e| e.patch.tag == *tag)
    }

    /// Tags transitively depending on `tag`, not including `tag` itself.
    fn downstream(&self, tag: &DecisionTag) -> BTreeSet<DecisionTag> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<&DecisionTag> = VecDeque::from([tag]);
        while let Some(next) = queue.pop_front() {
            for child in self.dependents.get(next).into_iter().flatten() {
                if found.insert(child.clone()) {
                    queue.push_back(child);
                }
            }
        }
        found
    }

    fn unlink(&mut self, tag: &DecisionTag, depends_on: Option<&DecisionTag>) {
        if let Some(parent) = depends_on
            && let Some(children) = self.dependents.get_mut(parent)
        {
            children.remove(tag);
            if children.is_empty() {
                self.dependents.remove(parent);
            }
        }
    }

    fn link(&mut self, tag: &DecisionTag, depends_on: Option<&DecisionTag>) {
        if let Some(parent) = depends_on {
            self.dependents
                .entry(parent.clone())
                .or_default()
                .insert(tag.clone());
        }
    }

    /// Stage `patch`. On error nothing in the overlay changes.
    pub fn stage(&mut self, patch: StagedPatch) -> Result<StageOutcome, EngineError> {
        let mut issues = patch.check();
        let existing = self.position(&patch.tag);

        if existing.is_none() && self.entries.len() >= self.max_patches {
            issues.push(ValidationIssue::error(
                Some(patch.tag.clone()),
                IssueKind::TooManyPatches,
                format!("overlay already holds {} patches", self.max_patches),
            ));
        }
        if let Some(dep) = &patch.depends_on
            && !dep.is_empty()
            && *dep != patch.tag
        {
            if !self.contains(dep) {
                let (kind, what) = if self.invalidated.contains(dep) {
                    (IssueKind::InvalidatedDependency, "was invalidated")
                } else {
                    (IssueKind::UnknownDependency, "is not staged")
                };
                issues.push(ValidationIssue::error(
                    Some(patch.tag.clone()),
                    kind,
                    format!("patch {} depends on {dep}, which {what}", patch.tag),
                ));
            } else if existing.is_some() && self.downstream(&patch.tag).contains(dep) {
                issues.push(ValidationIssue::error(
                    Some(patch.tag.clone()),
                    IssueKind::DependencyCycle,
                    format!("patch {} cannot depend on its own downstream decision {dep}", patch.tag),
                ));
            }
        }
        if !issues.is_empty() {
            return Err(EngineError::Validation(issues));
        }

        if let Some(index) = existing
            && self.entries[index].patch == patch
        {
            return Ok(StageOutcome::Unchanged);
        }

        let created = mint_sub_entities(&patch);
        let invalidated = match existing {
            Some(_) => Some(self.invalidate_downstream(&patch.tag)),
            None => None,
        };
        // Invalidation may have shifted positions.
        match self.position(&patch.tag) {
            Some(index) => {
                let old_dep = self.entries[index].patch.depends_on.clone();
                self.unlink(&patch.tag, old_dep.as_ref());
                self.link(&patch.tag, patch.depends_on.as_ref());
                self.entries[index] = StagedEntry { patch, created };
                Ok(StageOutcome::Replaced {
                    invalidated: invalidated.unwrap_or_default(),
                })
            }
            None => {
                self.invalidated.remove(&patch.tag);
                self.link(&patch.tag, patch.depends_on.as_ref());
                self.entries.push(StagedEntry { patch, created });
                Ok(StageOutcome::Appended)
            }
        }
    }

    /// Remove every patch whose dependency chain passes through `tag`.
    /// `tag`'s own patch stays. Returns the removed tags in overlay order.
    pub fn invalidate_downstream(&mut self, tag: &DecisionTag) -> Vec<DecisionTag> {
        let doomed = self.downstream(tag);
        if doomed.is_empty() {
            return Vec::new();
        }
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for entry in std::mem::take(&mut self.entries) {
            if doomed.contains(&entry.patch.tag) {
                removed.push(entry.patch);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        for patch in &removed {
            self.unlink(&patch.tag, patch.depends_on.as_ref());
            self.dependents.remove(&patch.tag);
            self.invalidated.insert(patch.tag.clone());
        }
        removed.into_iter().map(|p| p.tag).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.dependents.clear();
        self.invalidated.clear();
    }

    fn replay(&self) -> Replay {
        let mut state = self.base.canonical.clone();
        let mut skipped = Vec::new();
        let mut issues = Vec::new();
        let mut origins = BTreeMap::new();

        for entry in &self.entries {
            let tag = &entry.patch.tag;
            let mut created = entry.created.iter();
            for edit in &entry.patch.edits {
                match edit {
                    PatchEdit::SetField { key, value } => {
                        state.fields.insert(key.clone(), value.clone());
                    }
                    PatchEdit::ClearField { key } => {
                        state.fields.remove(key);
                    }
                    PatchEdit::AddSubEntity { .. } => {
                        if let Some(sub) = created.next() {
                            state.insert_sub_entity(sub.clone());
                            skipped.extend(self.rules.attach_all(&mut state, sub));
                            origins.insert(sub.id, tag.clone());
                        }
                    }
                    PatchEdit::UpdateSubEntity {
                        collection,
                        sub_id,
                        key,
                        value,
                    } => match state.sub_entity_mut(collection, *sub_id) {
                        Some(sub) => match value {
                            Some(value) => {
                                sub.fields.insert(key.clone(), value.clone());
                            }
                            None => {
                                sub.fields.remove(key);
                            }
                        },
                        None => issues.push(missing_target(tag, collection, *sub_id)),
                    },
                    PatchEdit::RemoveSubEntity { collection, sub_id } => {
                        match state.remove_sub_entity(collection, *sub_id) {
                            Some(sub) => self.rules.detach_all(&mut state, &sub),
                            None => issues.push(missing_target(tag, collection, *sub_id)),
                        }
                    }
                }
            }
        }

        Replay {
            state,
            skipped,
            issues,
            origins,
        }
    }

    /// Base with the overlay applied in insertion order. Nothing is persisted.
    pub fn effective_view(&self) -> CanonicalState {
        self.replay().state
    }

    /// Structured problems with the effective view. Never fails.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let replay = self.replay();
        self.issues_for(&replay)
    }

    fn issues_for(&self, replay: &Replay) -> Vec<ValidationIssue> {
        let state = &replay.state;
        let mut issues = replay.issues.clone();

        for skipped in &replay.skipped {
            issues.push(ValidationIssue::warning(
                replay.origins.get(&skipped.carrier).cloned(),
                IssueKind::MalformedEffect,
                format!("effect {} skipped: {}", skipped.provenance, skipped.reason),
            ));
        }

        for sub in state.sub_entities() {
            for effect in &sub.effects {
                if let Ok(RuleElement::Prerequisite {
                    requirement,
                    message,
                }) = effect.content.resolve()
                    && !state.holds(&requirement)
                {
                    issues.push(ValidationIssue::error(
                        replay.origins.get(&sub.id).cloned(),
                        IssueKind::Prerequisite,
                        message,
                    ));
                }
            }
        }

        for (key, value) in &state.fields {
            if let FieldValue::SubEntityRef(sub_id) = value
                && !state.sub_entities().any(|s| s.id == *sub_id)
            {
                issues.push(ValidationIssue::error(
                    self.last_writer(key),
                    IssueKind::DanglingReference,
                    format!("field {key} refers to missing sub-entity {sub_id}"),
                ));
            }
        }
        issues
    }

    fn last_writer(&self, key: &str) -> Option<DecisionTag> {
        self.entries
            .iter()
            .rev()
            .find(|e| {
                e.patch.edits.iter().any(|edit| {
                    matches!(edit, PatchEdit::SetField { key: k, .. } | PatchEdit::ClearField { key: k } if k == key)
                })
            })
            .map(|e| e.patch.tag.clone())
    }

    pub fn preview(&self) -> Preview {
        let replay = self.replay();
        let issues = self.issues_for(&replay);
        let base = &self.base.canonical;
        let state = replay.state;

        let keys: BTreeSet<&String> = base.fields.keys().chain(state.fields.keys()).collect();
        let changes = keys
            .into_iter()
            .filter_map(|key| {
                let before = base.fields.get(key);
                let after = state.fields.get(key);
                (before != after).then(|| FieldChange {
                    key: key.clone(),
                    before: before.cloned(),
                    after: after.cloned(),
                })
            })
            .collect();
        let added = state
            .sub_entities()
            .filter(|s| base.sub_entity(&s.collection, s.id).is_none())
            .cloned()
            .collect();
        let removed = base
            .sub_entities()
            .filter(|s| state.sub_entity(&s.collection, s.id).is_none())
            .cloned()
            .collect();

        Preview {
            bonuses: self.rules.effective_bonuses(&state),
            state,
            changes,
            added,
            removed,
            issues,
            invalidated: self.invalidated.iter().cloned().collect(),
        }
    }

    /// Net difference between base and effective view as a plan. Root fields
    /// whose final value equals the base are left out.
    pub fn to_mutation_plan(&self) -> MutationPlan {
        let base = &self.base.canonical;
        let state = self.replay().state;
        let mut builder = MutationPlan::builder().base_revision(self.base.revision);

        let keys: BTreeSet<&String> = base.fields.keys().chain(state.fields.keys()).collect();
        for key in keys {
            match (base.fields.get(key), state.fields.get(key)) {
                (before, Some(after)) if before != Some(after) => {
                    builder = builder.set_field(key, after.clone());
                }
                (Some(_), None) => builder = builder.clear_field(key),
                _ => {}
            }
        }

        for sub in state.sub_entities() {
            match base.sub_entity(&sub.collection, sub.id) {
                None => builder = builder.create(sub.clone()),
                Some(before) => {
                    let keys: BTreeSet<&String> =
                        before.fields.keys().chain(sub.fields.keys()).collect();
                    for key in keys {
                        let after = sub.fields.get(key);
                        if before.fields.get(key) != after {
                            builder = builder.update_sub_entity(
                                &sub.collection,
                                sub.id,
                                key,
                                after.cloned(),
                            );
                        }
                    }
                }
            }
        }

        for sub in base.sub_entities() {
            if state.sub_entity(&sub.collection, sub.id).is_none() {
                builder = builder.delete(&sub.collection, sub.id);
            }
        }
        builder.build()
    }
}

fn mint_sub_entities(patch: &StagedPatch) -> Vec<SubEntity> {
    patch
        .edits
        .iter()
        .filter_map(|edit| match edit {
            PatchEdit::AddSubEntity {
                collection,
                fields,
                effects,
            } => Some(SubEntity {
                id: SubEntityId::new(),
                collection: collection.clone(),
                fields: fields.clone(),
                effects: effects.iter().cloned().map(EffectInstance::new).collect(),
            }),
            _ => None,
        })
        .collect()
}

fn missing_target(tag: &DecisionTag, collection: &str, sub_id: SubEntityId) -> ValidationIssue {
    ValidationIssue::error(
        Some(tag.clone()),
        IssueKind::MissingTarget,
        format!("patch {tag} targets missing sub-entity {sub_id} in {collection}"),
    )
}
