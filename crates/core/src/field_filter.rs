//! Field filter policy: which declared fields take part in diffing.
//!
//! Policies are injected rather than hard-coded in the diff engine. A base policy can be
//! combined with a provider-specific one:
//!
//! ```ignore
//! let filter = DefaultFieldFilter.and(ExcludeStorageOnly);
//! let plan = FieldPlan::build(&CUSTOMER, &filter);
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use crate::entity::{EntityDescriptor, FieldDescriptor, FieldRole};

/// Predicate over (entity type, field) deciding diff eligibility.
pub trait FieldFilter: Send + Sync {
    fn is_eligible(&self, entity: &EntityDescriptor, field: &FieldDescriptor) -> bool;
}

impl<F> FieldFilter for Arc<F>
where
    F: FieldFilter + ?Sized,
{
    fn is_eligible(&self, entity: &EntityDescriptor, field: &FieldDescriptor) -> bool {
        (**self).is_eligible(entity, field)
    }
}

impl<F> FieldFilter for Box<F>
where
    F: FieldFilter + ?Sized,
{
    fn is_eligible(&self, entity: &EntityDescriptor, field: &FieldDescriptor) -> bool {
        (**self).is_eligible(entity, field)
    }
}

/// Composition helpers available on every sized filter.
pub trait FieldFilterExt: FieldFilter + Sized {
    /// Both policies must accept the field.
    fn and<G: FieldFilter>(self, other: G) -> Composed<Self, G> {
        Composed {
            base: self,
            provider: other,
        }
    }
}

impl<F: FieldFilter> FieldFilterExt for F {}

/// Excludes fields whose author marked them [`FieldRole::Ignored`].
#[derive(Debug, Default, Copy, Clone)]
pub struct DefaultFieldFilter;

impl FieldFilter for DefaultFieldFilter {
    fn is_eligible(&self, _entity: &EntityDescriptor, field: &FieldDescriptor) -> bool {
        field.role != FieldRole::Ignored
    }
}

/// Excludes [`FieldRole::StorageOnly`] artifacts.
///
/// Some persistence providers surface type-level storage fields next to instance state;
/// adapters for those providers add this policy.
#[derive(Debug, Default, Copy, Clone)]
pub struct ExcludeStorageOnly;

impl FieldFilter for ExcludeStorageOnly {
    fn is_eligible(&self, _entity: &EntityDescriptor, field: &FieldDescriptor) -> bool {
        field.role != FieldRole::StorageOnly
    }
}

/// Excludes caller-named fields, written as `Type.field`.
#[derive(Debug, Default, Clone)]
pub struct IgnoreFields {
    fields: HashSet<(String, String)>,
}

impl IgnoreFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignore(mut self, entity_type: impl Into<String>, field: impl Into<String>) -> Self {
        self.fields.insert((entity_type.into(), field.into()));
        self
    }

    /// Parse `Type.field` entries. Entries without a dot are skipped.
    pub fn from_qualified<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            match entry.split_once('.') {
                Some((entity_type, field)) if !entity_type.is_empty() && !field.is_empty() => {
                    filter = filter.ignore(entity_type, field);
                }
                _ => tracing::warn!(entry, "ignored-field entry is not of the form Type.field"),
            }
        }
        filter
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FieldFilter for IgnoreFields {
    fn is_eligible(&self, entity: &EntityDescriptor, field: &FieldDescriptor) -> bool {
        !self
            .fields
            .contains(&(entity.entity_type.to_string(), field.name.to_string()))
    }
}

/// Closure-backed filter.
pub struct FnFilter<F>(F);

pub fn filter_fn<F>(f: F) -> FnFilter<F>
where
    F: Fn(&EntityDescriptor, &FieldDescriptor) -> bool + Send + Sync,
{
    FnFilter(f)
}

impl<F> FieldFilter for FnFilter<F>
where
    F: Fn(&EntityDescriptor, &FieldDescriptor) -> bool + Send + Sync,
{
    fn is_eligible(&self, entity: &EntityDescriptor, field: &FieldDescriptor) -> bool {
        (self.0)(entity, field)
    }
}

/// Base policy combined with a provider-specific policy.
#[derive(Debug, Clone)]
pub struct Composed<A, B> {
    base: A,
    provider: B,
}

impl<A, B> FieldFilter for Composed<A, B>
where
    A: FieldFilter,
    B: FieldFilter,
{
    fn is_eligible(&self, entity: &EntityDescriptor, field: &FieldDescriptor) -> bool {
        self.base.is_eligible(entity, field) && self.provider.is_eligible(entity, field)
    }
}

/// Eligible fields of one entity type, sorted ascending by name.
#[derive(Debug, Clone)]
pub struct FieldPlan {
    entity_type: &'static str,
    fields: Vec<FieldDescriptor>,
}

impl FieldPlan {
    pub fn build(entity: &EntityDescriptor, filter: &dyn FieldFilter) -> Self {
        let mut fields: Vec<FieldDescriptor> = entity
            .fields
            .iter()
            .filter(|field| filter.is_eligible(entity, field))
            .copied()
            .collect();
        fields.sort_by(|a, b| a.name.cmp(b.name));

        Self {
            entity_type: entity.entity_type,
            fields,
        }
    }

    pub fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn identity_fields(&self) -> impl Iterator<Item = &FieldDescriptor> + '_ {
        self.fields.iter().filter(|f| f.is_identity())
    }
}
