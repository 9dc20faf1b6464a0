//! In-memory persistence adapter.
//!
//! A minimal row store that drives [`crate::capture::ChangeCapture`] the way a real
//! persistence engine would: lifecycle hooks fire on insert/update/delete, keys can be
//! generated by the "database" at flush, and the transaction boundary is the session's
//! `commit` / `rollback`.
//!
//! Intended for tests/dev. Rows are plain [`dachs_core::Snapshot`]s keyed by
//! declared identity; nothing is indexed or persisted.

pub mod database;

use std::sync::{Arc, OnceLock};

use dachs_core::{Diffable, InstanceToken};

pub use database::{InMemoryDatabase, Session};

/// Key assigned by the database at flush.
///
/// Clones share the same slot, so every copy of an entity sees the key once assigned.
#[derive(Debug, Clone, Default)]
pub struct GeneratedKey(Arc<OnceLock<i64>>);

impl GeneratedKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<i64> {
        self.0.get().copied()
    }

    pub fn is_assigned(&self) -> bool {
        self.0.get().is_some()
    }

    /// Token of the shared slot, for [`Diffable::instance_token`].
    pub fn token(&self) -> InstanceToken {
        InstanceToken::of(&self.0)
    }

    /// Assign once; later assignments are ignored.
    pub(crate) fn assign(&self, value: i64) -> bool {
        self.0.set(value).is_ok()
    }
}

impl PartialEq for GeneratedKey {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl Eq for GeneratedKey {}

/// Entity storable in the in-memory database.
///
/// Types with a [`GeneratedKey`] should also return its [`GeneratedKey::token`] from
/// [`Diffable::instance_token`].
pub trait Persistable: Diffable {
    /// Database-generated key slot, if the entity's key is generated.
    fn generated_key(&self) -> Option<&GeneratedKey> {
        None
    }
}
