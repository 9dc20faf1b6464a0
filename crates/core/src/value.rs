//! Field values: the materialised state of one entity field.
//!
//! Values are compared **by value**, never by instance. Two lists holding the same
//! elements are equal even when they come from different allocations, which is what
//! makes "re-setting a collection to equal contents" a non-change.
//!
//! References to other entities are carried as their [`EntityIdentity`]; the referenced
//! entity's own fields are never descended into.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::EntityIdentity;

/// Declared type of an entity field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Integer,
    Text,
    Timestamp,
    Uuid,
    Reference,
    List,
    Set,
    Map,
}

/// One-level value of an entity field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Bool(bool),
    Integer(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    /// Another entity, referenced by identity only.
    Reference(Box<EntityIdentity>),
    List(Vec<FieldValue>),
    Set(BTreeSet<FieldValue>),
    /// Embedded value object (e.g. money = amount + currency).
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::Integer(_) => FieldType::Integer,
            FieldValue::Text(_) => FieldType::Text,
            FieldValue::Timestamp(_) => FieldType::Timestamp,
            FieldValue::Uuid(_) => FieldType::Uuid,
            FieldValue::Reference(_) => FieldType::Reference,
            FieldValue::List(_) => FieldType::List,
            FieldValue::Set(_) => FieldType::Set,
            FieldValue::Map(_) => FieldType::Map,
        }
    }

    pub fn reference(identity: EntityIdentity) -> Self {
        FieldValue::Reference(Box::new(identity))
    }

    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FieldValue>,
    {
        FieldValue::List(items.into_iter().map(Into::into).collect())
    }

    pub fn set<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FieldValue>,
    {
        FieldValue::Set(items.into_iter().map(Into::into).collect())
    }

    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        FieldValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl core::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Text(v) => write!(f, "{v:?}"),
            FieldValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            FieldValue::Uuid(v) => write!(f, "{v}"),
            FieldValue::Reference(identity) => write!(f, "&{identity}"),
            FieldValue::List(items) => write_seq(f, "[", items.iter(), "]"),
            FieldValue::Set(items) => write_seq(f, "{", items.iter(), "}"),
            FieldValue::Map(entries) => {
                f.write_str("{")?;
                for (idx, (k, v)) in entries.iter().enumerate() {
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

fn write_seq<'a>(
    f: &mut core::fmt::Formatter<'_>,
    open: &str,
    items: impl Iterator<Item = &'a FieldValue>,
    close: &str,
) -> core::fmt::Result {
    f.write_str(open)?;
    for (idx, item) in items.enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    f.write_str(close)
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Integer(i64::from(value))
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&String> for FieldValue {
    fn from(value: &String) -> Self {
        FieldValue::Text(value.clone())
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        FieldValue::Uuid(value)
    }
}

impl From<EntityIdentity> for FieldValue {
    fn from(value: EntityIdentity) -> Self {
        FieldValue::reference(value)
    }
}
