//! Diffable entities: static per-type field metadata + point-in-time snapshots.
//!
//! Instead of reflecting over arbitrary objects at runtime, each persistent type
//! implements [`Diffable`]: it exposes a `'static` [`EntityDescriptor`] (type name and
//! declared fields) and produces a [`Snapshot`] of its current field values.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::identity::InstanceToken;
use crate::value::{FieldType, FieldValue};

/// Shared reference to a captured entity instance.
pub type EntityRef = Arc<dyn Diffable>;

/// Upcast helper so `dyn Diffable` can be downcast to its concrete type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Capability contract implemented once per persistent entity type.
pub trait Diffable: AsAny + Send + Sync {
    /// Static metadata for this entity type.
    fn descriptor(&self) -> &'static EntityDescriptor;

    /// Current values of the declared fields.
    ///
    /// Null fields are simply left out. Fields that cannot be read right now (e.g. a lazy
    /// association outside of its session) are marked with
    /// [`Snapshot::with_unreadable`].
    fn snapshot(&self) -> Snapshot;

    /// Token shared by every copy of this instance, used to group its changes while
    /// the key is still unassigned.
    ///
    /// Types whose key is generated later should return a token derived from the
    /// shared key slot, so clones captured through different `Arc`s are recognised as
    /// one record. `None` falls back to the address of the captured `Arc`.
    fn instance_token(&self) -> Option<InstanceToken> {
        None
    }
}

/// Downcast a captured entity to its concrete type.
pub fn downcast_entity<T: Diffable>(entity: &EntityRef) -> Option<&T> {
    <dyn Diffable as AsAny>::as_any(&**entity).downcast_ref::<T>()
}

/// How a declared field takes part in change capture.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    /// Part of the entity's key. Also diffed like regular state.
    Identity,
    /// Regular instance state.
    State,
    /// Explicitly excluded by the entity's author.
    Ignored,
    /// Storage artifact that is never instance state (e.g. a type-level counter).
    StorageOnly,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub field_type: FieldType,
    pub role: FieldRole,
}

impl FieldDescriptor {
    pub const fn new(name: &'static str, field_type: FieldType, role: FieldRole) -> Self {
        Self {
            name,
            field_type,
            role,
        }
    }

    pub const fn identity(name: &'static str, field_type: FieldType) -> Self {
        Self::new(name, field_type, FieldRole::Identity)
    }

    pub const fn state(name: &'static str, field_type: FieldType) -> Self {
        Self::new(name, field_type, FieldRole::State)
    }

    pub const fn ignored(name: &'static str, field_type: FieldType) -> Self {
        Self::new(name, field_type, FieldRole::Ignored)
    }

    pub const fn storage_only(name: &'static str, field_type: FieldType) -> Self {
        Self::new(name, field_type, FieldRole::StorageOnly)
    }

    pub fn is_identity(&self) -> bool {
        self.role == FieldRole::Identity
    }
}

/// Static metadata of one entity type.
#[derive(Debug)]
pub struct EntityDescriptor {
    pub entity_type: &'static str,
    pub fields: &'static [FieldDescriptor],
}

impl EntityDescriptor {
    pub const fn new(entity_type: &'static str, fields: &'static [FieldDescriptor]) -> Self {
        Self {
            entity_type,
            fields,
        }
    }

    pub fn identity_fields(&self) -> impl Iterator<Item = &FieldDescriptor> + '_ {
        self.fields.iter().filter(|f| f.is_identity())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldRead {
    Value(FieldValue),
    Unreadable(String),
}

/// Point-in-time values of an entity's fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    fields: HashMap<&'static str, FieldRead>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert only when present; `None` means the field is null.
    pub fn with_opt<V: Into<FieldValue>>(mut self, name: &'static str, value: Option<V>) -> Self {
        if let Some(value) = value {
            self.insert(name, value);
        }
        self
    }

    pub fn with_unreadable(mut self, name: &'static str, reason: impl Into<String>) -> Self {
        self.fields.insert(name, FieldRead::Unreadable(reason.into()));
        self
    }

    pub fn insert(&mut self, name: &'static str, value: impl Into<FieldValue>) {
        self.fields.insert(name, FieldRead::Value(value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.remove(name);
    }

    /// Readable, non-null value of a field.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        match self.fields.get(name) {
            Some(FieldRead::Value(value)) => Some(value),
            _ => None,
        }
    }

    /// `Ok(None)` for null, `Err(reason)` when the field could not be read.
    pub fn read(&self, name: &str) -> Result<Option<&FieldValue>, &str> {
        match self.fields.get(name) {
            Some(FieldRead::Value(value)) => Ok(Some(value)),
            Some(FieldRead::Unreadable(reason)) => Err(reason.as_str()),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static NOTE_FIELDS: [FieldDescriptor; 2] = [
        FieldDescriptor::identity("id", FieldType::Integer),
        FieldDescriptor::state("body", FieldType::Text),
    ];
    static NOTE: EntityDescriptor = EntityDescriptor::new("Note", &NOTE_FIELDS);

    #[derive(Debug, PartialEq)]
    struct Note {
        id: i64,
        body: Option<String>,
    }

    impl Diffable for Note {
        fn descriptor(&self) -> &'static EntityDescriptor {
            &NOTE
        }

        fn snapshot(&self) -> Snapshot {
            Snapshot::new()
                .with("id", self.id)
                .with_opt("body", self.body.as_deref())
        }
    }

    #[test]
    fn downcast_returns_concrete_entity() {
        let entity: EntityRef = Arc::new(Note { id: 1, body: None });
        let note = downcast_entity::<Note>(&entity).unwrap();
        assert_eq!(note.id, 1);
    }

    #[test]
    fn null_fields_are_absent_and_unreadable_fields_report_reason() {
        let snapshot = Note { id: 1, body: None }
            .snapshot()
            .with_unreadable("tags", "lazy collection not initialized");

        assert_eq!(snapshot.get("id"), Some(&FieldValue::Integer(1)));
        assert_eq!(snapshot.read("body"), Ok(None));
        assert_eq!(snapshot.read("tags"), Err("lazy collection not initialized"));
        assert!(snapshot.get("tags").is_none());
    }

    #[test]
    fn descriptor_lists_identity_fields() {
        let ids: Vec<_> = NOTE.identity_fields().map(|f| f.name).collect();
        assert_eq!(ids, vec!["id"]);
        assert_eq!(NOTE.field("body").map(|f| f.field_type), Some(FieldType::Text));
    }
}
