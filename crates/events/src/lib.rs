//! Change listeners and their registry.

pub mod collecting;
pub mod listener;
pub mod registry;

pub use collecting::{CollectingEntityChangeListener, CollectingEntityChangeSetListener};
pub use listener::{EntityChangeListener, EntityChangeSetListener};
pub use registry::ListenerRegistry;
