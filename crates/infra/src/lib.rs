//! Infrastructure layer: change aggregation, the capture engine, config, adapters.

pub mod aggregator;
pub mod capture;
pub mod config;
pub mod in_memory;

pub use aggregator::{BufferState, TransactionBuffer};
pub use capture::{ChangeCapture, UnitOfWork};
pub use config::CaptureConfig;
pub use in_memory::{GeneratedKey, InMemoryDatabase, Persistable, Session};
