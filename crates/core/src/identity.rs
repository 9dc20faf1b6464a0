//! Entity identity: stable keys, two-phase (deferred) resolution, and providers.
//!
//! A persistence engine frequently assigns keys *after* the lifecycle hook that
//! reported the mutation has fired (database identity columns, sequences fetched at
//! flush). Identity is therefore modelled as an [`IdentityHandle`] that is either
//! already [`IdentityHandle::Resolved`] or [`IdentityHandle::Deferred`]:
//!
//! - Providers never fail at identify time; a missing key yields a deferred handle.
//! - Change-set finalisation is the single point where deferred handles must resolve.
//!   A handle that still cannot produce a key there fails with
//!   [`ChangeError::UnresolvedIdentity`].
//!
//! A deferred handle carries the [`InstanceToken`] of the entity instance it was taken
//! from, so repeated mutations of the same not-yet-keyed instance can still be netted.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{Diffable, EntityRef};
use crate::error::ChangeError;
use crate::value::FieldValue;

/// Key value of an entity: a scalar or a composite of several named fields.
///
/// Composite keys compare structurally (field by field), so a key rebuilt from its
/// parts finds the same entry in a [`crate::ChangeSet`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValue {
    Scalar(FieldValue),
    Composite(BTreeMap<String, FieldValue>),
}

impl KeyValue {
    pub fn composite<I, K, V>(parts: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        KeyValue::Composite(
            parts
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Value of one key component.
    ///
    /// A scalar key answers for any single identity field name.
    pub fn component(&self, field: &str) -> Option<&FieldValue> {
        match self {
            KeyValue::Scalar(value) => Some(value),
            KeyValue::Composite(parts) => parts.get(field),
        }
    }
}

impl core::fmt::Display for KeyValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KeyValue::Scalar(value) => write!(f, "{value}"),
            KeyValue::Composite(parts) => {
                f.write_str("{")?;
                for (idx, (k, v)) in parts.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

macro_rules! impl_scalar_key {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for KeyValue {
                fn from(value: $t) -> Self {
                    KeyValue::Scalar(FieldValue::from(value))
                }
            }
        )*
    };
}

impl_scalar_key!(i64, i32, u32, &str, String, Uuid, DateTime<Utc>);

impl From<FieldValue> for KeyValue {
    fn from(value: FieldValue) -> Self {
        KeyValue::Scalar(value)
    }
}

/// Identity of one logical record: entity type + key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityIdentity {
    entity_type: String,
    key: KeyValue,
}

impl EntityIdentity {
    pub fn new(entity_type: impl Into<String>, key: impl Into<KeyValue>) -> Self {
        Self {
            entity_type: entity_type.into(),
            key: key.into(),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn key(&self) -> &KeyValue {
        &self.key
    }

    pub fn into_key(self) -> KeyValue {
        self.key
    }
}

impl core::fmt::Display for EntityIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.key)
    }
}

/// Identity of an entity *instance* (not of the logical record).
///
/// Derived from the address of a shared allocation: either the captured entity itself
/// or a slot its copies share (see [`Diffable::instance_token`]). Stable for as long as
/// that allocation is alive; the transaction buffer keeps the entity until finalisation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InstanceToken(usize);

impl InstanceToken {
    pub fn of<T: ?Sized>(instance: &Arc<T>) -> Self {
        Self(Arc::as_ptr(instance) as *const () as usize)
    }

    /// Token of an entity as the default provider groups it.
    pub fn for_entity(entity: &EntityRef) -> Self {
        entity.instance_token().unwrap_or_else(|| Self::of(entity))
    }
}

type KeyResolver = Arc<dyn Fn() -> Option<KeyValue> + Send + Sync>;

/// Key that is not available yet; resolved on demand.
#[derive(Clone)]
pub struct DeferredKey {
    instance: InstanceToken,
    resolver: KeyResolver,
}

impl DeferredKey {
    pub fn instance(&self) -> InstanceToken {
        self.instance
    }

    pub fn try_resolve(&self) -> Option<KeyValue> {
        (self.resolver)()
    }
}

impl core::fmt::Debug for DeferredKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeferredKey")
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

/// Two-phase identity value.
#[derive(Debug, Clone)]
pub enum IdentityHandle {
    Resolved(KeyValue),
    Deferred(DeferredKey),
}

impl IdentityHandle {
    pub fn resolved(key: impl Into<KeyValue>) -> Self {
        IdentityHandle::Resolved(key.into())
    }

    pub fn deferred<F>(instance: InstanceToken, resolver: F) -> Self
    where
        F: Fn() -> Option<KeyValue> + Send + Sync + 'static,
    {
        IdentityHandle::Deferred(DeferredKey {
            instance,
            resolver: Arc::new(resolver),
        })
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, IdentityHandle::Deferred(_))
    }

    /// Instance token of a deferred handle.
    pub fn instance(&self) -> Option<InstanceToken> {
        match self {
            IdentityHandle::Resolved(_) => None,
            IdentityHandle::Deferred(deferred) => Some(deferred.instance),
        }
    }

    /// Best-effort resolution; `None` while the key is still unassigned.
    pub fn try_resolve(&self) -> Option<KeyValue> {
        match self {
            IdentityHandle::Resolved(key) => Some(key.clone()),
            IdentityHandle::Deferred(deferred) => deferred.try_resolve(),
        }
    }

    /// Resolve or fail with `UnresolvedIdentity`.
    pub fn resolve(&self, entity_type: &str) -> Result<KeyValue, ChangeError> {
        self.try_resolve().ok_or_else(|| {
            ChangeError::unresolved(
                entity_type,
                "identity was still unassigned when the change set was finalised",
            )
        })
    }
}

/// Extracts the identity of an entity instance.
///
/// Implemented per persistence adapter. Must not fail when the key is not assigned yet;
/// return a deferred handle instead. Deferred handles may be queried again at
/// finalisation.
pub trait IdentityProvider: Send + Sync {
    fn identify(&self, entity: &EntityRef) -> IdentityHandle;
}

impl<P> IdentityProvider for Arc<P>
where
    P: IdentityProvider + ?Sized,
{
    fn identify(&self, entity: &EntityRef) -> IdentityHandle {
        (**self).identify(entity)
    }
}

/// Identity from the fields declared with [`crate::FieldRole::Identity`].
///
/// One identity field gives a scalar key, several give a composite key. When any of
/// them is absent (or unreadable) the handle is deferred and re-reads the entity's
/// snapshot when queried.
#[derive(Debug, Default, Copy, Clone)]
pub struct DeclaredKeyProvider;

impl DeclaredKeyProvider {
    pub fn new() -> Self {
        Self
    }

    /// Read the declared key of an entity, if every key component is present.
    pub fn extract(entity: &dyn Diffable) -> Option<KeyValue> {
        let snapshot = entity.snapshot();
        let mut parts = BTreeMap::new();
        for field in entity.descriptor().identity_fields() {
            let value = snapshot.get(field.name)?;
            parts.insert(field.name.to_string(), value.clone());
        }

        match parts.len() {
            0 => None,
            1 => parts.into_values().next().map(KeyValue::Scalar),
            _ => Some(KeyValue::Composite(parts)),
        }
    }
}

impl IdentityProvider for DeclaredKeyProvider {
    fn identify(&self, entity: &EntityRef) -> IdentityHandle {
        if let Some(key) = Self::extract(&**entity) {
            return IdentityHandle::Resolved(key);
        }

        let instance = InstanceToken::for_entity(entity);
        let entity = Arc::clone(entity);
        IdentityHandle::deferred(instance, move || Self::extract(&*entity))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use super::*;
    use crate::entity::{EntityDescriptor, FieldDescriptor, Snapshot};
    use crate::value::FieldType;

    static KEYED_FIELDS: [FieldDescriptor; 2] = [
        FieldDescriptor::identity("id", FieldType::Integer),
        FieldDescriptor::state("name", FieldType::Text),
    ];
    static KEYED: EntityDescriptor = EntityDescriptor::new("Keyed", &KEYED_FIELDS);

    struct Keyed {
        id: Arc<OnceLock<i64>>,
        name: String,
    }

    impl Diffable for Keyed {
        fn descriptor(&self) -> &'static EntityDescriptor {
            &KEYED
        }

        fn snapshot(&self) -> Snapshot {
            Snapshot::new()
                .with_opt("id", self.id.get().copied())
                .with("name", self.name.as_str())
        }
    }

    /// Same as `Keyed`, but copies share one key slot and say so.
    #[derive(Clone)]
    struct Slotted {
        id: Arc<OnceLock<i64>>,
    }

    impl Diffable for Slotted {
        fn descriptor(&self) -> &'static EntityDescriptor {
            &KEYED
        }

        fn snapshot(&self) -> Snapshot {
            Snapshot::new().with_opt("id", self.id.get().copied())
        }

        fn instance_token(&self) -> Option<InstanceToken> {
            Some(InstanceToken::of(&self.id))
        }
    }

    static PAIR_FIELDS: [FieldDescriptor; 3] = [
        FieldDescriptor::identity("owner", FieldType::Reference),
        FieldDescriptor::identity("seq", FieldType::Integer),
        FieldDescriptor::state("note", FieldType::Text),
    ];
    static PAIR: EntityDescriptor = EntityDescriptor::new("Pair", &PAIR_FIELDS);

    struct Pair {
        owner: i64,
        seq: i64,
    }

    impl Diffable for Pair {
        fn descriptor(&self) -> &'static EntityDescriptor {
            &PAIR
        }

        fn snapshot(&self) -> Snapshot {
            Snapshot::new()
                .with("owner", EntityIdentity::new("Owner", self.owner))
                .with("seq", self.seq)
        }
    }

    #[test]
    fn assigned_key_resolves_immediately() {
        let cell = Arc::new(OnceLock::new());
        let _ = cell.set(42);
        let entity: EntityRef = Arc::new(Keyed {
            id: cell,
            name: "a".to_string(),
        });

        let handle = DeclaredKeyProvider.identify(&entity);
        assert!(!handle.is_deferred());
        assert_eq!(handle.try_resolve(), Some(KeyValue::from(42)));
    }

    #[test]
    fn missing_key_is_deferred_until_assigned() {
        let cell = Arc::new(OnceLock::new());
        let entity: EntityRef = Arc::new(Keyed {
            id: Arc::clone(&cell),
            name: "a".to_string(),
        });

        let handle = DeclaredKeyProvider.identify(&entity);
        assert!(handle.is_deferred());
        assert_eq!(handle.instance(), Some(InstanceToken::of(&entity)));
        assert!(handle.try_resolve().is_none());

        let err = handle.resolve("Keyed").unwrap_err();
        match err {
            ChangeError::UnresolvedIdentity { entity_type, .. } => assert_eq!(entity_type, "Keyed"),
            other => panic!("Expected UnresolvedIdentity, got {other:?}"),
        }

        let _ = cell.set(7);
        assert_eq!(handle.resolve("Keyed").unwrap(), KeyValue::from(7));
    }

    #[test]
    fn copies_sharing_a_key_slot_share_a_token() {
        let original = Slotted {
            id: Arc::new(OnceLock::new()),
        };
        let first: EntityRef = Arc::new(original.clone());
        let second: EntityRef = Arc::new(original.clone());

        let a = DeclaredKeyProvider.identify(&first);
        let b = DeclaredKeyProvider.identify(&second);
        assert!(a.is_deferred() && b.is_deferred());
        assert_eq!(a.instance(), b.instance());
        assert_ne!(InstanceToken::of(&first), InstanceToken::of(&second));

        let _ = original.id.set(5);
        assert_eq!(b.try_resolve(), Some(KeyValue::from(5)));
    }

    #[test]
    fn composite_key_is_structural() {
        let entity: EntityRef = Arc::new(Pair { owner: 2, seq: 9 });
        let key = DeclaredKeyProvider.identify(&entity).try_resolve().unwrap();

        let rebuilt = KeyValue::composite([
            ("owner", FieldValue::reference(EntityIdentity::new("Owner", 2))),
            ("seq", FieldValue::from(9)),
        ]);
        assert_eq!(key, rebuilt);
        assert_eq!(key.component("seq"), Some(&FieldValue::from(9)));

        let a = EntityIdentity::new("Pair", key);
        let b = EntityIdentity::new("Pair", rebuilt);
        let mut map = std::collections::HashMap::new();
        map.insert(a, "found");
        assert_eq!(map.get(&b), Some(&"found"));
    }
}
