//! Outbound listener contracts.
//!
//! Two independent delivery modes:
//!
//! - **Direct** ([`EntityChangeListener`]): called synchronously once per recorded
//!   lifecycle event, *before* netting. Runs inline with the still-open unit of work, so
//!   it may see intermediate states that are later netted away. A failure aborts the
//!   mutation call that triggered it.
//! - **Aggregated** ([`EntityChangeSetListener`]): called exactly once per successful
//!   commit with the finalised [`ChangeSet`]; never on rollback. The commit has already
//!   happened when it runs, so a failure is reported but cannot undo the write.
//!
//! Listeners must not assume an ordering relative to each other.

use dachs_core::{ChangeSet, EntityDataChange};

/// Direct (per-event) listener.
pub trait EntityChangeListener: Send + Sync {
    /// Name used in failure reports and logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_change(&self, change: &EntityDataChange) -> anyhow::Result<()>;
}

/// Aggregated (per-commit) listener.
pub trait EntityChangeSetListener: Send + Sync {
    /// Name used in failure reports and logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_change_set(&self, change_set: &ChangeSet) -> anyhow::Result<()>;
}
