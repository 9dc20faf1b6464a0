//! Change capture engine (lifecycle + transaction boundary entry points).
//!
//! `ChangeCapture` is what a persistence adapter talks to. It turns lifecycle hooks
//! into [`EntityDataChange`]s, hands them to direct listeners, nets them per unit of
//! work, and delivers the finalised [`ChangeSet`] to aggregated listeners at commit.
//!
//! ## Flow
//!
//! ```text
//! on_create / on_update / on_delete
//!   ↓
//! 1. Diff the entity over its cached field plan
//!   ↓
//! 2. Identify the entity (possibly deferred)
//!   ↓
//! 3. Notify direct listeners (fail-fast; a failure aborts the call)
//!   ↓
//! 4. Record into the unit of work's buffer (netting)
//!
//! commit
//!   ↓
//! 5. Finalise the buffer into a ChangeSet (resolve identities, partition)
//!   ↓
//! 6. Notify aggregated listeners (all of them; failures are collected)
//! ```
//!
//! ## Unit of work ownership
//!
//! Each [`UnitOfWork`] owns its buffer and is passed by `&mut` into every call, so a
//! buffer is never shared between threads and needs no locking. The engine itself is
//! `Send + Sync` and can be shared by any number of concurrent units of work.
//!
//! ## Delivery guarantees
//!
//! - Direct listeners see every recorded change, including intermediate states that are
//!   later netted away.
//! - Aggregated listeners are called exactly once per successful commit and never on
//!   rollback. Their failures are reported to the committing caller after the commit
//!   already happened.
//! - An update whose diff is empty is neither delivered nor recorded.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use dachs_core::{
    ChangeError, ChangeKind, ChangeResult, ChangeSet, DeclaredKeyProvider, DefaultFieldFilter,
    EntityDataChange, EntityDescriptor, EntityRef, FieldFilter, FieldPlan, IdentityProvider,
    PropertyChange, Snapshot, UnitOfWorkId, diff,
};
use dachs_events::ListenerRegistry;

use crate::aggregator::{BufferState, TransactionBuffer};
use crate::config::CaptureConfig;

/// Handle of one open unit of work.
///
/// Obtained from [`ChangeCapture::begin_unit_of_work`]; ended by exactly one of
/// [`ChangeCapture::commit`] or [`ChangeCapture::rollback`].
#[derive(Debug)]
pub struct UnitOfWork {
    buffer: TransactionBuffer,
}

impl UnitOfWork {
    pub fn id(&self) -> UnitOfWorkId {
        self.buffer.id()
    }

    pub fn state(&self) -> BufferState {
        self.buffer.state()
    }

    pub fn is_open(&self) -> bool {
        self.buffer.state() == BufferState::Open
    }

    /// Number of buffered (netted) entries.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Change capture engine.
pub struct ChangeCapture {
    listeners: Arc<ListenerRegistry>,
    filter: Arc<dyn FieldFilter>,
    identity: Arc<dyn IdentityProvider>,
    config: CaptureConfig,
    plans: RwLock<HashMap<&'static str, Arc<FieldPlan>>>,
}

impl ChangeCapture {
    /// Engine with the default field policy and declared-key identities.
    pub fn new(listeners: Arc<ListenerRegistry>) -> Self {
        Self {
            listeners,
            filter: Arc::new(DefaultFieldFilter),
            identity: Arc::new(DeclaredKeyProvider),
            config: CaptureConfig::default(),
            plans: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(listeners: Arc<ListenerRegistry>, config: CaptureConfig) -> Self {
        let filter = config.field_filter();
        Self {
            filter,
            config,
            ..Self::new(listeners)
        }
    }

    pub fn with_field_filter<F>(mut self, filter: F) -> Self
    where
        F: FieldFilter + 'static,
    {
        self.filter = Arc::new(filter);
        self.plans
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self
    }

    pub fn with_identity_provider<P>(mut self, provider: P) -> Self
    where
        P: IdentityProvider + 'static,
    {
        self.identity = Arc::new(provider);
        self
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Eligible, name-sorted fields of an entity type (computed once per type).
    pub fn plan_for(&self, descriptor: &'static EntityDescriptor) -> Arc<FieldPlan> {
        if let Some(plan) = self
            .plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(descriptor.entity_type)
        {
            return Arc::clone(plan);
        }

        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        let plan = plans.entry(descriptor.entity_type).or_insert_with(|| {
            let plan = FieldPlan::build(descriptor, &*self.filter);
            tracing::debug!(
                entity_type = descriptor.entity_type,
                fields = plan.fields().len(),
                "built field plan"
            );
            Arc::new(plan)
        });
        Arc::clone(plan)
    }

    pub fn begin_unit_of_work(&self) -> UnitOfWork {
        let id = UnitOfWorkId::new();
        tracing::debug!(unit_of_work = %id, "unit of work started");
        UnitOfWork {
            buffer: TransactionBuffer::new(id),
        }
    }

    /// An entity was inserted.
    pub fn on_create(&self, uow: &mut UnitOfWork, entity: EntityRef) -> ChangeResult<()> {
        uow.buffer.ensure_open()?;
        let plan = self.plan_for(entity.descriptor());
        let after = entity.snapshot();
        let changes = self.diff_entity(uow, &entity, None, Some(&after), &plan)?;
        self.capture(uow, entity, ChangeKind::Created, changes, plan)
    }

    /// An entity was modified; `prior` is its last persisted state.
    pub fn on_update(
        &self,
        uow: &mut UnitOfWork,
        entity: EntityRef,
        prior: &Snapshot,
    ) -> ChangeResult<()> {
        uow.buffer.ensure_open()?;
        let plan = self.plan_for(entity.descriptor());
        let after = entity.snapshot();
        let changes = self.diff_entity(uow, &entity, Some(prior), Some(&after), &plan)?;
        if changes.is_empty() {
            tracing::trace!(
                unit_of_work = %uow.id(),
                entity_type = entity.descriptor().entity_type,
                "update without changes skipped"
            );
            return Ok(());
        }
        self.capture(uow, entity, ChangeKind::Updated, changes, plan)
    }

    /// An entity was removed; `prior` is its last persisted state.
    pub fn on_delete(
        &self,
        uow: &mut UnitOfWork,
        entity: EntityRef,
        prior: &Snapshot,
    ) -> ChangeResult<()> {
        uow.buffer.ensure_open()?;
        let plan = self.plan_for(entity.descriptor());
        let changes = self.diff_entity(uow, &entity, Some(prior), None, &plan)?;
        self.capture(uow, entity, ChangeKind::Deleted, changes, plan)
    }

    /// Finalise the unit of work and deliver its change set.
    ///
    /// Aggregated listener failures are returned as `ListenerFailure` after every
    /// listener has been notified; the unit of work is committed regardless.
    pub fn commit(&self, uow: &mut UnitOfWork) -> ChangeResult<Arc<ChangeSet>> {
        let change_set = Arc::new(uow.buffer.commit()?);

        tracing::info!(
            unit_of_work = %change_set.unit_of_work(),
            change_set = %change_set.id(),
            created = change_set.created().len(),
            updated = change_set.updated().len(),
            deleted = change_set.deleted().len(),
            "change set committed"
        );

        if self.config.aggregated_delivery {
            self.listeners.notify_change_set(&change_set)?;
        }
        Ok(change_set)
    }

    /// Discard the unit of work. No aggregated listener is called.
    pub fn rollback(&self, uow: &mut UnitOfWork) -> ChangeResult<()> {
        let discarded = uow.buffer.rollback()?;
        tracing::debug!(unit_of_work = %uow.id(), discarded, "unit of work rolled back");
        Ok(())
    }

    fn diff_entity(
        &self,
        uow: &UnitOfWork,
        entity: &EntityRef,
        before: Option<&Snapshot>,
        after: Option<&Snapshot>,
        plan: &FieldPlan,
    ) -> ChangeResult<Vec<PropertyChange>> {
        diff(entity.descriptor(), before, after, plan.fields()).inspect_err(|e| {
            if let ChangeError::UnresolvedIdentity { .. } = e {
                tracing::error!(unit_of_work = %uow.id(), error = %e, "cannot identify entity");
            }
        })
    }

    fn capture(
        &self,
        uow: &mut UnitOfWork,
        entity: EntityRef,
        kind: ChangeKind,
        changes: Vec<PropertyChange>,
        plan: Arc<FieldPlan>,
    ) -> ChangeResult<()> {
        let identity = self.identity.identify(&entity);
        let change = EntityDataChange::new(identity, entity, kind, changes);

        tracing::debug!(
            unit_of_work = %uow.id(),
            entity_type = change.entity_type(),
            kind = ?kind,
            deferred = change.identity_handle().is_deferred(),
            properties = change.property_changes().len(),
            "change recorded"
        );

        if self.config.direct_delivery {
            self.listeners.notify_change(&change)?;
        }
        if self.config.aggregated_delivery {
            uow.buffer.record(change, plan)?;
        }
        Ok(())
    }
}

impl core::fmt::Debug for ChangeCapture {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChangeCapture")
            .field("listeners", &self.listeners)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
