//! Change descriptions: property changes, per-entity changes, and commit-scoped sets.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Deserialize, Serialize, Serializer};

use crate::entity::{Diffable, EntityRef, downcast_entity};
use crate::error::{ChangeError, ChangeResult};
use crate::id::{ChangeSetId, UnitOfWorkId};
use crate::identity::{EntityIdentity, IdentityHandle, KeyValue};
use crate::value::{FieldType, FieldValue};

/// Lifecycle event kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Change of one property.
///
/// `previous` is `None` for creations (and for fields that were null), `new` is `None`
/// for deletions (and for fields set to null).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyChange {
    pub name: String,
    pub field_type: FieldType,
    pub previous: Option<FieldValue>,
    pub new: Option<FieldValue>,
}

impl PropertyChange {
    pub fn new(
        name: impl Into<String>,
        field_type: FieldType,
        previous: Option<FieldValue>,
        new: Option<FieldValue>,
    ) -> Self {
        Self {
            name: name.into(),
            field_type,
            previous,
            new,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.previous == self.new
    }
}

/// One lifecycle event for one entity, with its property diff.
///
/// Property changes are sorted ascending by name. The identity may still be deferred
/// while the unit of work is open (direct listeners can see such changes); every change
/// inside a [`ChangeSet`] carries a resolved identity.
#[derive(Clone)]
pub struct EntityDataChange {
    identity: IdentityHandle,
    entity_type: &'static str,
    entity: EntityRef,
    kind: ChangeKind,
    property_changes: Vec<PropertyChange>,
}

impl EntityDataChange {
    pub fn new(
        identity: IdentityHandle,
        entity: EntityRef,
        kind: ChangeKind,
        mut property_changes: Vec<PropertyChange>,
    ) -> Self {
        if !property_changes.is_sorted_by(|a, b| a.name <= b.name) {
            property_changes.sort_by(|a, b| a.name.cmp(&b.name));
        }
        let entity_type = entity.descriptor().entity_type;
        Self {
            identity,
            entity_type,
            entity,
            kind,
            property_changes,
        }
    }

    pub fn identity_handle(&self) -> &IdentityHandle {
        &self.identity
    }

    /// Key of the entity, if it is resolvable right now.
    pub fn key(&self) -> Option<KeyValue> {
        self.identity.try_resolve()
    }

    /// Identity of the entity, if it is resolvable right now.
    pub fn identity(&self) -> Option<EntityIdentity> {
        self.key().map(|key| EntityIdentity::new(self.entity_type, key))
    }

    pub fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// The captured entity as its concrete type.
    pub fn entity_as<T: Diffable>(&self) -> Option<&T> {
        downcast_entity::<T>(&self.entity)
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn property_changes(&self) -> &[PropertyChange] {
        &self.property_changes
    }

    pub fn property(&self, name: &str) -> Option<&PropertyChange> {
        self.property_changes
            .binary_search_by(|c| c.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.property_changes[idx])
    }

    pub fn into_property_changes(self) -> Vec<PropertyChange> {
        self.property_changes
    }
}

impl core::fmt::Debug for EntityDataChange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityDataChange")
            .field("identity", &self.identity)
            .field("entity_type", &self.entity_type)
            .field("kind", &self.kind)
            .field("property_changes", &self.property_changes)
            .finish_non_exhaustive()
    }
}

impl Serialize for EntityDataChange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("EntityDataChange", 4)?;
        state.serialize_field("entity_type", self.entity_type)?;
        state.serialize_field("key", &self.key())?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("property_changes", &self.property_changes)?;
        state.end()
    }
}

/// Finalised changes of one unit of work, partitioned by kind.
///
/// Each identity appears in at most one partition. Built once at commit and delivered
/// by shared reference, so listeners cannot alter it.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    id: ChangeSetId,
    unit_of_work: UnitOfWorkId,
    committed_at: DateTime<Utc>,
    created: BTreeMap<EntityIdentity, EntityDataChange>,
    updated: BTreeMap<EntityIdentity, EntityDataChange>,
    deleted: BTreeMap<EntityIdentity, EntityDataChange>,
}

impl ChangeSet {
    /// Partition finalised changes by kind.
    ///
    /// Fails with `InconsistentLifecycle` if an identity is given twice.
    pub fn from_changes<I>(unit_of_work: UnitOfWorkId, changes: I) -> ChangeResult<Self>
    where
        I: IntoIterator<Item = (EntityIdentity, EntityDataChange)>,
    {
        let mut set = Self {
            id: ChangeSetId::new(),
            unit_of_work,
            committed_at: Utc::now(),
            created: BTreeMap::new(),
            updated: BTreeMap::new(),
            deleted: BTreeMap::new(),
        };

        for (identity, change) in changes {
            if set.get(&identity).is_some() {
                return Err(ChangeError::inconsistent(
                    identity.to_string(),
                    "identity appears more than once in the change set",
                ));
            }
            let partition = match change.kind() {
                ChangeKind::Created => &mut set.created,
                ChangeKind::Updated => &mut set.updated,
                ChangeKind::Deleted => &mut set.deleted,
            };
            partition.insert(identity, change);
        }

        Ok(set)
    }

    pub fn id(&self) -> ChangeSetId {
        self.id
    }

    pub fn unit_of_work(&self) -> UnitOfWorkId {
        self.unit_of_work
    }

    pub fn committed_at(&self) -> DateTime<Utc> {
        self.committed_at
    }

    pub fn created(&self) -> &BTreeMap<EntityIdentity, EntityDataChange> {
        &self.created
    }

    pub fn updated(&self) -> &BTreeMap<EntityIdentity, EntityDataChange> {
        &self.updated
    }

    pub fn deleted(&self) -> &BTreeMap<EntityIdentity, EntityDataChange> {
        &self.deleted
    }

    /// Look an identity up across all partitions.
    pub fn get(&self, identity: &EntityIdentity) -> Option<&EntityDataChange> {
        self.created
            .get(identity)
            .or_else(|| self.updated.get(identity))
            .or_else(|| self.deleted.get(identity))
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All changes: created, then updated, then deleted.
    pub fn iter(&self) -> impl Iterator<Item = (&EntityIdentity, &EntityDataChange)> {
        self.created
            .iter()
            .chain(self.updated.iter())
            .chain(self.deleted.iter())
    }

    /// JSON document of this change set, for listeners that persist or ship it.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

struct Partition<'a>(&'a BTreeMap<EntityIdentity, EntityDataChange>);

impl Serialize for Partition<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Identities are structured; entries are keyed by their display form.
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (identity, change) in self.0 {
            map.serialize_entry(&identity.to_string(), change)?;
        }
        map.end()
    }
}

impl Serialize for ChangeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ChangeSet", 6)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("unit_of_work", &self.unit_of_work)?;
        state.serialize_field("committed_at", &self.committed_at)?;
        state.serialize_field("created", &Partition(&self.created))?;
        state.serialize_field("updated", &Partition(&self.updated))?;
        state.serialize_field("deleted", &Partition(&self.deleted))?;
        state.end()
    }
}
