//! `dachs-core`: change-capture building blocks.
//!
//! This crate contains the **pure** part of the engine (no listeners, no unit-of-work
//! state): field values, identities, the `Diffable` contract, field filter policies,
//! the property diff engine and the change/change-set data types.

pub mod change;
pub mod diff;
pub mod entity;
pub mod error;
pub mod field_filter;
pub mod id;
pub mod identity;
pub mod value;

pub use change::{ChangeKind, ChangeSet, EntityDataChange, PropertyChange};
pub use diff::diff;
pub use entity::{
    Diffable, EntityDescriptor, EntityRef, FieldDescriptor, FieldRole, Snapshot, downcast_entity,
};
pub use error::{ChangeError, ChangeResult, ListenerFailure};
pub use field_filter::{
    Composed, DefaultFieldFilter, ExcludeStorageOnly, FieldFilter, FieldFilterExt, FieldPlan,
    IgnoreFields, filter_fn,
};
pub use id::{ChangeSetId, UnitOfWorkId};
pub use identity::{
    DeclaredKeyProvider, DeferredKey, EntityIdentity, IdentityHandle, IdentityProvider,
    InstanceToken, KeyValue,
};
pub use value::{FieldType, FieldValue};
