//! Capture configuration.
//!
//! Loaded from the environment at start-up (or deserialised from whatever config source
//! the application uses) and handed to [`crate::capture::ChangeCapture::from_config`].
//!
//! | variable                     | default | meaning                                   |
//! |------------------------------|---------|-------------------------------------------|
//! | `DACHS_DIRECT_DELIVERY`      | `true`  | notify direct listeners per change         |
//! | `DACHS_AGGREGATED_DELIVERY`  | `true`  | build and deliver change sets at commit    |
//! | `DACHS_EXCLUDE_STORAGE_ONLY` | `false` | drop storage-only fields from diffs        |
//! | `DACHS_IGNORED_FIELDS`       | empty   | comma separated `Type.field` exclusions    |

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use dachs_core::{DefaultFieldFilter, ExcludeStorageOnly, FieldFilter, FieldFilterExt, IgnoreFields};

pub const DIRECT_DELIVERY_VAR: &str = "DACHS_DIRECT_DELIVERY";
pub const AGGREGATED_DELIVERY_VAR: &str = "DACHS_AGGREGATED_DELIVERY";
pub const EXCLUDE_STORAGE_ONLY_VAR: &str = "DACHS_EXCLUDE_STORAGE_ONLY";
pub const IGNORED_FIELDS_VAR: &str = "DACHS_IGNORED_FIELDS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub direct_delivery: bool,
    pub aggregated_delivery: bool,
    pub exclude_storage_only: bool,
    /// `Type.field` entries excluded from diffing.
    pub ignored_fields: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            direct_delivery: true,
            aggregated_delivery: true,
            exclude_storage_only: false,
            ignored_fields: Vec::new(),
        }
    }
}

impl CaptureConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let flag = |name: &str, default: bool| match lookup(name) {
            None => default,
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => {
                    tracing::warn!(variable = name, value = %raw, default, "invalid boolean; using default");
                    default
                }
            },
        };

        let ignored_fields = lookup(IGNORED_FIELDS_VAR)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.ignored_fields);

        Self {
            direct_delivery: flag(DIRECT_DELIVERY_VAR, defaults.direct_delivery),
            aggregated_delivery: flag(AGGREGATED_DELIVERY_VAR, defaults.aggregated_delivery),
            exclude_storage_only: flag(EXCLUDE_STORAGE_ONLY_VAR, defaults.exclude_storage_only),
            ignored_fields,
        }
    }

    /// Field policy described by this configuration.
    pub fn field_filter(&self) -> Arc<dyn FieldFilter> {
        let base = DefaultFieldFilter.and(IgnoreFields::from_qualified(&self.ignored_fields));
        if self.exclude_storage_only {
            Arc::new(base.and(ExcludeStorageOnly))
        } else {
            Arc::new(base)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use dachs_core::{EntityDescriptor, FieldDescriptor, FieldType};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        assert_eq!(CaptureConfig::from_lookup(lookup(&[])), CaptureConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = CaptureConfig::from_lookup(lookup(&[
            (DIRECT_DELIVERY_VAR, "false"),
            (EXCLUDE_STORAGE_ONLY_VAR, "1"),
            (IGNORED_FIELDS_VAR, "Customer.notes, Order.audit ,,"),
        ]));
        assert!(!config.direct_delivery);
        assert!(config.aggregated_delivery);
        assert!(config.exclude_storage_only);
        assert_eq!(config.ignored_fields, vec!["Customer.notes", "Order.audit"]);
    }

    #[test]
    fn malformed_boolean_falls_back_to_default() {
        let config = CaptureConfig::from_lookup(lookup(&[(AGGREGATED_DELIVERY_VAR, "maybe")]));
        assert!(config.aggregated_delivery);
    }

    #[test]
    fn config_deserializes_with_missing_fields() {
        let config: CaptureConfig =
            serde_json::from_str(r#"{ "ignored_fields": ["Customer.notes"] }"#).unwrap();
        assert!(config.direct_delivery);
        assert_eq!(config.ignored_fields.len(), 1);
    }

    static DOC_FIELDS: [FieldDescriptor; 4] = [
        FieldDescriptor::identity("id", FieldType::Integer),
        FieldDescriptor::state("notes", FieldType::Text),
        FieldDescriptor::ignored("cache", FieldType::Text),
        FieldDescriptor::storage_only("instances", FieldType::Integer),
    ];
    static DOC: EntityDescriptor = EntityDescriptor::new("Customer", &DOC_FIELDS);

    #[test]
    fn field_filter_composes_configured_policies() {
        let eligible = |config: &CaptureConfig| -> Vec<&'static str> {
            let filter = config.field_filter();
            DOC.fields
                .iter()
                .filter(|f| filter.is_eligible(&DOC, f))
                .map(|f| f.name)
                .collect()
        };

        assert_eq!(eligible(&CaptureConfig::default()), vec!["id", "notes", "instances"]);

        let config = CaptureConfig {
            exclude_storage_only: true,
            ignored_fields: vec!["Customer.notes".into()],
            ..CaptureConfig::default()
        };
        assert_eq!(eligible(&config), vec!["id"]);
    }
}
