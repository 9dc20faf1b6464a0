//! Transaction change aggregator.
//!
//! One [`TransactionBuffer`] per unit of work. It collects every recorded lifecycle
//! change, nets repeated changes of the same identity, and builds the [`ChangeSet`]
//! delivered to aggregated listeners at commit.
//!
//! ## Lifecycle
//!
//! ```text
//! Open ──commit()──▶ Committing ──▶ Closed
//!   └───rollback()─▶ RollingBack ─▶ Closed
//! ```
//!
//! Any call on a closed buffer fails with [`ChangeError::InvalidState`].
//!
//! ## Netting
//!
//! | sequence            | result                                                   |
//! |---------------------|----------------------------------------------------------|
//! | CREATE, UPDATE…     | CREATED; previous absent, new = final value               |
//! | CREATE, DELETE      | cancelled                                                |
//! | UPDATE, UPDATE…     | UPDATED; original previous, final new; no-ops dropped    |
//! | UPDATE, DELETE      | DELETED; previous = value before the unit of work         |
//! | DELETE, CREATE      | UPDATED from the deleted image to the re-created image   |
//! | anything else       | `InconsistentLifecycle`                                  |
//!
//! ## Deferred identities
//!
//! Entries whose key is not assigned yet are indexed by the instance token of the
//! entity they came from (a key slot shared by its copies, when the type exposes one),
//! so further changes of the same instance still net in place.
//! Once the key is assigned, later changes arrive with a resolved identity and land in
//! a separate entry; both are merged (in recording order) at commit, after every
//! deferred identity has been resolved. Keys only ever go from unassigned to assigned,
//! so merging at commit yields the same result as netting in place.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dachs_core::{
    ChangeError, ChangeKind, ChangeResult, ChangeSet, EntityDataChange, EntityIdentity,
    EntityRef, FieldPlan, IdentityHandle, InstanceToken, KeyValue, PropertyChange, UnitOfWorkId,
};

/// Lifecycle state of a [`TransactionBuffer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferState {
    Open,
    Committing,
    RollingBack,
    Closed,
}

/// Outcome of netting one change into an existing entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Netting {
    Kept,
    Cancelled,
}

/// Where an entry is indexed while the buffer is open.
#[derive(Debug, Clone)]
enum SlotIndex {
    Identity(EntityIdentity),
    Pending(InstanceToken),
}

/// Net change of one identity so far.
struct WorkingChange {
    identity: IdentityHandle,
    entity_type: &'static str,
    entity: EntityRef,
    kind: ChangeKind,
    properties: BTreeMap<String, PropertyChange>,
    plan: Arc<FieldPlan>,
    /// Captured before the key was assigned.
    deferred: bool,
}

impl core::fmt::Debug for WorkingChange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkingChange")
            .field("identity", &self.identity)
            .field("entity_type", &self.entity_type)
            .field("kind", &self.kind)
            .field("properties", &self.properties)
            .field("deferred", &self.deferred)
            .finish_non_exhaustive()
    }
}

impl WorkingChange {
    fn new(change: EntityDataChange, plan: Arc<FieldPlan>) -> Self {
        let identity = change.identity_handle().clone();
        let entity_type = change.entity_type();
        let entity = Arc::clone(change.entity());
        let kind = change.kind();
        let deferred = identity.is_deferred();
        let properties = change
            .into_property_changes()
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        Self {
            identity,
            entity_type,
            entity,
            kind,
            properties,
            plan,
            deferred,
        }
    }

    /// Net `incoming` (a later change of the same identity) into `self`.
    ///
    /// Leaves `self` untouched when the sequence is invalid.
    fn absorb(&mut self, incoming: WorkingChange) -> Result<Netting, &'static str> {
        use ChangeKind::*;

        match (self.kind, incoming.kind) {
            (Created, Updated) => {
                for (name, change) in incoming.properties {
                    match change.new {
                        Some(value) => {
                            let field_type = change.field_type;
                            self.properties
                                .entry(name)
                                .or_insert_with_key(|name| {
                                    PropertyChange::new(name.clone(), field_type, None, None)
                                })
                                .new = Some(value);
                        }
                        // Created with a null value: absent.
                        None => {
                            self.properties.remove(&name);
                        }
                    }
                }
            }
            (Created, Deleted) => return Ok(Netting::Cancelled),
            (Updated, Updated) => {
                for (name, change) in incoming.properties {
                    match self.properties.entry(name) {
                        Entry::Occupied(mut existing) => existing.get_mut().new = change.new,
                        Entry::Vacant(slot) => {
                            slot.insert(change);
                        }
                    }
                }
                self.properties.retain(|_, p| !p.is_noop());
            }
            (Updated, Deleted) => {
                let mut originals = std::mem::take(&mut self.properties);
                let mut netted = BTreeMap::new();
                for (name, mut change) in incoming.properties {
                    if let Some(original) = originals.remove(&name) {
                        change.previous = original.previous;
                    }
                    change.new = None;
                    if change.previous.is_some() {
                        netted.insert(name, change);
                    }
                }
                // Fields nulled earlier in the unit of work.
                for (name, mut original) in originals {
                    original.new = None;
                    if original.previous.is_some() {
                        netted.insert(name, original);
                    }
                }
                self.properties = netted;
                self.kind = Deleted;
            }
            (Deleted, Created) => {
                let mut deleted = std::mem::take(&mut self.properties);
                let mut netted = BTreeMap::new();
                for (name, change) in incoming.properties {
                    let before = deleted.remove(&name).and_then(|p| p.previous);
                    let change = PropertyChange::new(name.clone(), change.field_type, before, change.new);
                    if !change.is_noop() {
                        netted.insert(name, change);
                    }
                }
                for (name, mut gone) in deleted {
                    gone.new = None;
                    if gone.previous.is_some() {
                        netted.insert(name, gone);
                    }
                }
                self.properties = netted;
                self.kind = Updated;
            }
            (Created | Updated, Created) => return Err("created again while it already exists"),
            (Deleted, Updated | Deleted) => return Err("changed after it was deleted"),
        }

        self.entity = incoming.entity;
        if self.identity.is_deferred() && !incoming.identity.is_deferred() {
            self.identity = incoming.identity;
        }
        self.deferred |= incoming.deferred;
        Ok(Netting::Kept)
    }

    /// Report the assigned key on a created entry that was captured without one.
    fn backfill_key(&mut self, key: &KeyValue) {
        let plan = Arc::clone(&self.plan);
        for field in plan.identity_fields() {
            let Some(value) = key.component(field.name) else {
                continue;
            };
            let change = self
                .properties
                .entry(field.name.to_string())
                .or_insert_with(|| PropertyChange::new(field.name, field.field_type, None, None));
            if change.new.is_none() {
                change.new = Some(value.clone());
            }
        }
    }

    fn into_change(self, key: KeyValue) -> EntityDataChange {
        EntityDataChange::new(
            IdentityHandle::Resolved(key),
            self.entity,
            self.kind,
            self.properties.into_values().collect(),
        )
    }
}

/// Change buffer of one unit of work.
///
/// Aggregating N changes is amortised O(N): entries live in an arena of slots indexed by
/// identity (or by instance token while the key is unassigned).
#[derive(Debug)]
pub struct TransactionBuffer {
    id: UnitOfWorkId,
    state: BufferState,
    slots: Vec<Option<WorkingChange>>,
    by_identity: HashMap<EntityIdentity, usize>,
    pending: HashMap<InstanceToken, usize>,
}

impl TransactionBuffer {
    pub fn new(id: UnitOfWorkId) -> Self {
        Self {
            id,
            state: BufferState::Open,
            slots: Vec::new(),
            by_identity: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn id(&self) -> UnitOfWorkId {
        self.id
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Number of live entries (before the commit-time merge of deferred entries).
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ensure_open(&self) -> ChangeResult<()> {
        match self.state {
            BufferState::Open => Ok(()),
            other => Err(ChangeError::invalid_state(format!(
                "unit of work {} is {other:?}",
                self.id
            ))),
        }
    }

    /// Record one lifecycle change, netting it with earlier changes of the same identity.
    pub fn record(&mut self, change: EntityDataChange, plan: Arc<FieldPlan>) -> ChangeResult<()> {
        self.ensure_open()?;

        let incoming = WorkingChange::new(change, plan);
        let resolved = incoming
            .identity
            .try_resolve()
            .map(|key| EntityIdentity::new(incoming.entity_type, key));

        let existing = incoming
            .identity
            .instance()
            .and_then(|token| self.pending.get(&token).copied())
            .or_else(|| {
                resolved
                    .as_ref()
                    .and_then(|identity| self.by_identity.get(identity).copied())
            });

        let Some(idx) = existing else {
            let index = match (&resolved, incoming.identity.instance()) {
                (Some(identity), _) => SlotIndex::Identity(identity.clone()),
                (None, Some(token)) => SlotIndex::Pending(token),
                (None, None) => {
                    return Err(ChangeError::unresolved(
                        incoming.entity_type,
                        "resolved identity handle produced no key",
                    ));
                }
            };
            self.insert(index, incoming);
            return Ok(());
        };

        let Some(current) = self.slots.get_mut(idx).and_then(Option::as_mut) else {
            return Err(ChangeError::invalid_state(
                "change buffer index points at an empty slot",
            ));
        };

        let label = resolved
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("{}#<unassigned>", incoming.entity_type));

        let token = incoming.identity.instance();
        match current.absorb(incoming) {
            Ok(Netting::Kept) => Ok(()),
            Ok(Netting::Cancelled) => {
                tracing::debug!(unit_of_work = %self.id, identity = %label, "create and delete cancelled out");
                self.slots[idx] = None;
                if let Some(token) = token {
                    if self.pending.get(&token) == Some(&idx) {
                        self.pending.remove(&token);
                    }
                }
                if let Some(identity) = &resolved {
                    if self.by_identity.get(identity) == Some(&idx) {
                        self.by_identity.remove(identity);
                    }
                }
                Ok(())
            }
            Err(reason) => Err(ChangeError::inconsistent(label, reason)),
        }
    }

    fn insert(&mut self, index: SlotIndex, change: WorkingChange) {
        let idx = self.slots.len();
        self.slots.push(Some(change));
        match index {
            SlotIndex::Identity(identity) => {
                self.by_identity.insert(identity, idx);
            }
            SlotIndex::Pending(token) => {
                self.pending.insert(token, idx);
            }
        }
    }

    /// Resolve every identity, merge and partition the entries, and close the buffer.
    ///
    /// The buffer is closed even when finalisation fails.
    pub fn commit(&mut self) -> ChangeResult<ChangeSet> {
        self.ensure_open()?;
        self.state = BufferState::Committing;

        let result = self.finalize();

        self.by_identity.clear();
        self.pending.clear();
        self.slots.clear();
        self.state = BufferState::Closed;
        result
    }

    /// Discard everything and close the buffer. Returns the number of discarded entries.
    pub fn rollback(&mut self) -> ChangeResult<usize> {
        self.ensure_open()?;
        self.state = BufferState::RollingBack;

        let discarded = self.len();
        self.by_identity.clear();
        self.pending.clear();
        self.slots.clear();

        self.state = BufferState::Closed;
        Ok(discarded)
    }

    fn finalize(&mut self) -> ChangeResult<ChangeSet> {
        let slots = std::mem::take(&mut self.slots);
        let mut merged: HashMap<EntityIdentity, WorkingChange> = HashMap::with_capacity(slots.len());

        for working in slots.into_iter().flatten() {
            let key = working.identity.resolve(working.entity_type).inspect_err(|e| {
                tracing::error!(
                    unit_of_work = %self.id,
                    entity_type = working.entity_type,
                    error = %e,
                    "unresolved identity at commit"
                );
            })?;
            let identity = EntityIdentity::new(working.entity_type, key);

            match merged.remove(&identity) {
                None => {
                    merged.insert(identity, working);
                }
                Some(mut earlier) => match earlier.absorb(working) {
                    Ok(Netting::Kept) => {
                        merged.insert(identity, earlier);
                    }
                    Ok(Netting::Cancelled) => {}
                    Err(reason) => {
                        return Err(ChangeError::inconsistent(identity.to_string(), reason));
                    }
                },
            }
        }

        let changes = merged.into_iter().filter_map(|(identity, mut working)| {
            if working.kind == ChangeKind::Updated && working.properties.is_empty() {
                return None;
            }
            if working.kind == ChangeKind::Created && working.deferred {
                working.backfill_key(identity.key());
            }
            let change = working.into_change(identity.key().clone());
            Some((identity, change))
        });

        ChangeSet::from_changes(self.id, changes)
    }
}
