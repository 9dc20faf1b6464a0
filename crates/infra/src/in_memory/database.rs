use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use dachs_core::{
    ChangeError, ChangeResult, ChangeSet, DeclaredKeyProvider, Diffable, EntityIdentity, EntityRef,
    Snapshot,
};

use super::{GeneratedKey, Persistable};
use crate::capture::{ChangeCapture, UnitOfWork};

/// In-memory row store.
#[derive(Debug)]
pub struct InMemoryDatabase {
    capture: Arc<ChangeCapture>,
    rows: RwLock<HashMap<EntityIdentity, Snapshot>>,
    sequence: AtomicI64,
}

impl InMemoryDatabase {
    pub fn new(capture: Arc<ChangeCapture>) -> Self {
        Self {
            capture,
            rows: RwLock::new(HashMap::new()),
            sequence: AtomicI64::new(0),
        }
    }

    pub fn capture(&self) -> &Arc<ChangeCapture> {
        &self.capture
    }

    /// Start a session (one unit of work).
    pub fn session(&self) -> Session<'_> {
        Session {
            db: self,
            uow: self.capture.begin_unit_of_work(),
            staged: HashMap::new(),
            unflushed: Vec::new(),
        }
    }

    /// Committed row of an identity.
    pub fn row(&self, identity: &EntityIdentity) -> Option<Snapshot> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_key(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn apply(&self, staged: HashMap<EntityIdentity, Option<Snapshot>>) {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        for (identity, row) in staged {
            match row {
                Some(row) => {
                    rows.insert(identity, row);
                }
                None => {
                    rows.remove(&identity);
                }
            }
        }
    }
}

fn identity_of(entity: &dyn Diffable) -> ChangeResult<EntityIdentity> {
    let entity_type = entity.descriptor().entity_type;
    DeclaredKeyProvider::extract(entity)
        .map(|key| EntityIdentity::new(entity_type, key))
        .ok_or_else(|| ChangeError::unresolved(entity_type, "entity has no key"))
}

/// One unit of work against an [`InMemoryDatabase`].
///
/// Writes are staged until [`Session::commit`]. Inserted entities are flushed (keys
/// generated, rows staged) explicitly or automatically before any update, delete or
/// commit. Dropping a session without committing discards it.
pub struct Session<'db> {
    db: &'db InMemoryDatabase,
    uow: UnitOfWork,
    /// `None` marks a deleted row.
    staged: HashMap<EntityIdentity, Option<Snapshot>>,
    unflushed: Vec<(EntityRef, Option<GeneratedKey>)>,
}

impl core::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("uow", &self.uow)
            .field("staged", &self.staged.len())
            .field("unflushed", &self.unflushed.len())
            .finish_non_exhaustive()
    }
}

impl Session<'_> {
    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.uow
    }

    pub fn insert<T>(&mut self, entity: Arc<T>) -> ChangeResult<()>
    where
        T: Persistable + 'static,
    {
        if let Ok(identity) = identity_of(&*entity) {
            if self.find(&identity).is_some() {
                return Err(ChangeError::inconsistent(
                    identity.to_string(),
                    "a row with this key already exists",
                ));
            }
        }

        let key = entity.generated_key().cloned();
        let entity: EntityRef = entity;
        self.db.capture.on_create(&mut self.uow, Arc::clone(&entity))?;
        self.unflushed.push((entity, key));
        Ok(())
    }

    /// Assign generated keys and stage inserted rows.
    pub fn flush(&mut self) -> ChangeResult<()> {
        for (entity, key) in std::mem::take(&mut self.unflushed) {
            if let Some(key) = key.filter(|k| !k.is_assigned()) {
                let value = self.db.next_key();
                key.assign(value);
                tracing::debug!(entity_type = entity.descriptor().entity_type, key = value, "key generated");
            }
            let identity = identity_of(&*entity)?;
            self.staged.insert(identity, Some(entity.snapshot()));
        }
        Ok(())
    }

    pub fn update<T>(&mut self, entity: Arc<T>) -> ChangeResult<()>
    where
        T: Persistable + 'static,
    {
        self.flush()?;
        let identity = identity_of(&*entity)?;
        let prior = self.existing(&identity)?;
        let after = entity.snapshot();
        self.db.capture.on_update(&mut self.uow, entity, &prior)?;
        self.staged.insert(identity, Some(after));
        Ok(())
    }

    pub fn delete<T>(&mut self, entity: Arc<T>) -> ChangeResult<()>
    where
        T: Persistable + 'static,
    {
        self.flush()?;
        let identity = identity_of(&*entity)?;
        let prior = self.existing(&identity)?;
        self.db.capture.on_delete(&mut self.uow, entity, &prior)?;
        self.staged.insert(identity, None);
        Ok(())
    }

    /// Row as seen from inside this session (staged writes first).
    pub fn find(&self, identity: &EntityIdentity) -> Option<Snapshot> {
        match self.staged.get(identity) {
            Some(row) => row.clone(),
            None => self.db.row(identity),
        }
    }

    fn existing(&self, identity: &EntityIdentity) -> ChangeResult<Snapshot> {
        self.find(identity).ok_or_else(|| {
            ChangeError::inconsistent(identity.to_string(), "no row with this key exists")
        })
    }

    /// Apply staged rows, then finalise and deliver the change set.
    pub fn commit(mut self) -> ChangeResult<Arc<ChangeSet>> {
        if let Err(e) = self.flush() {
            self.db.capture.rollback(&mut self.uow)?;
            return Err(e);
        }
        let staged = std::mem::take(&mut self.staged);
        tracing::debug!(unit_of_work = %self.uow.id(), rows = staged.len(), "applying staged rows");
        self.db.apply(staged);
        self.db.capture.commit(&mut self.uow)
    }

    /// Discard staged rows. Generated keys stay consumed.
    pub fn rollback(mut self) -> ChangeResult<()> {
        self.staged.clear();
        self.unflushed.clear();
        self.db.capture.rollback(&mut self.uow)
    }
}
