//! Listeners that keep what they receive (tests, audit trails, dev tooling).

use std::sync::{Arc, Mutex, PoisonError};

use dachs_core::{ChangeSet, EntityDataChange};

use crate::listener::{EntityChangeListener, EntityChangeSetListener};

/// Direct listener collecting every change in delivery order.
#[derive(Debug, Default)]
pub struct CollectingEntityChangeListener {
    changes: Mutex<Vec<EntityDataChange>>,
}

impl CollectingEntityChangeListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> Vec<EntityDataChange> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.changes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EntityChangeListener for CollectingEntityChangeListener {
    fn name(&self) -> &str {
        "collecting-change-listener"
    }

    fn on_change(&self, change: &EntityDataChange) -> anyhow::Result<()> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change.clone());
        Ok(())
    }
}

/// Aggregated listener collecting every delivered change set.
///
/// Each delivered set is cloned once on receipt; readers then share that copy.
#[derive(Debug, Default)]
pub struct CollectingEntityChangeSetListener {
    change_sets: Mutex<Vec<Arc<ChangeSet>>>,
}

impl CollectingEntityChangeSetListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn change_sets(&self) -> Vec<Arc<ChangeSet>> {
        self.change_sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recently delivered change set.
    pub fn last_change_set(&self) -> Option<Arc<ChangeSet>> {
        self.change_sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn clear(&self) {
        self.change_sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EntityChangeSetListener for CollectingEntityChangeSetListener {
    fn name(&self) -> &str {
        "collecting-change-set-listener"
    }

    fn on_change_set(&self, change_set: &ChangeSet) -> anyhow::Result<()> {
        self.change_sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(change_set.clone()));
        Ok(())
    }
}
