//! Property diff engine.
//!
//! Compares a "before" and an "after" [`Snapshot`] over the eligible fields of one
//! entity and produces the property-level changes:
//!
//! - **Create**: `before` is `None`; every field with a value is reported with
//!   `previous = None`. Empty collections are values, so they are reported too.
//! - **Delete**: symmetric, `after` is `None`.
//! - **Update**: only fields whose value differs (value equality) are reported.
//!
//! Output is always sorted ascending by property name (byte-wise, so case-sensitive),
//! independent of declaration order. Cost is linear in the number of fields.

use crate::change::PropertyChange;
use crate::entity::{EntityDescriptor, FieldDescriptor, Snapshot};
use crate::error::ChangeError;
use crate::value::FieldValue;

enum Read<'a> {
    Value(Option<&'a FieldValue>),
    Skip,
}

fn read_field<'a>(
    entity: &EntityDescriptor,
    snapshot: Option<&'a Snapshot>,
    field: &FieldDescriptor,
) -> Result<Read<'a>, ChangeError> {
    let Some(snapshot) = snapshot else {
        return Ok(Read::Value(None));
    };

    match snapshot.read(field.name) {
        Ok(value) => Ok(Read::Value(value)),
        Err(reason) if field.is_identity() => Err(ChangeError::unresolved(
            entity.entity_type,
            format!("identity field `{}` is unreadable: {reason}", field.name),
        )),
        Err(reason) => {
            tracing::warn!(
                entity_type = entity.entity_type,
                field = field.name,
                reason,
                "skipping unreadable field"
            );
            Ok(Read::Skip)
        }
    }
}

/// Diff two snapshots of the same entity over `fields`.
pub fn diff(
    entity: &EntityDescriptor,
    before: Option<&Snapshot>,
    after: Option<&Snapshot>,
    fields: &[FieldDescriptor],
) -> Result<Vec<PropertyChange>, ChangeError> {
    let mut changes = Vec::with_capacity(fields.len());
    if before.is_none() && after.is_none() {
        return Ok(changes);
    }

    for field in fields {
        let previous = read_field(entity, before, field)?;
        let new = read_field(entity, after, field)?;

        let (Read::Value(previous), Read::Value(new)) = (previous, new) else {
            continue;
        };

        if previous != new {
            changes.push(PropertyChange::new(
                field.name,
                field.field_type,
                previous.cloned(),
                new.cloned(),
            ));
        }
    }

    // Plans are pre-sorted, which makes this a linear pass in practice.
    changes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(changes)
}
