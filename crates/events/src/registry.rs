//! Listener registry (explicit, owned, shared by reference).
//!
//! The registry is the only process-wide mutable state of the engine. It is created by
//! the application at start-up, mutated only through `add_*` / `remove_*`, and read
//! during dispatch.
//!
//! Dispatch iterates over a snapshot of the registrations taken under a short read
//! lock, so listeners may be added or removed concurrently with (or from inside) a
//! notification without deadlocking.

use std::sync::{Arc, PoisonError, RwLock};

use dachs_core::{ChangeError, ChangeResult, ChangeSet, EntityDataChange, ListenerFailure};

use crate::listener::{EntityChangeListener, EntityChangeSetListener};

/// Registered direct and aggregated listeners, in registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    direct: RwLock<Vec<Arc<dyn EntityChangeListener>>>,
    aggregated: RwLock<Vec<Arc<dyn EntityChangeSetListener>>>,
}

fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    // Compare data pointers only; vtable pointers are not guaranteed unique.
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_direct(&self, listener: Arc<dyn EntityChangeListener>) {
        self.direct
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Remove a direct listener by reference. Returns whether it was registered.
    pub fn remove_direct(&self, listener: &Arc<dyn EntityChangeListener>) -> bool {
        let mut direct = self.direct.write().unwrap_or_else(PoisonError::into_inner);
        let before = direct.len();
        direct.retain(|l| !same_listener(l, listener));
        direct.len() != before
    }

    pub fn add_aggregated(&self, listener: Arc<dyn EntityChangeSetListener>) {
        self.aggregated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Remove an aggregated listener by reference. Returns whether it was registered.
    pub fn remove_aggregated(&self, listener: &Arc<dyn EntityChangeSetListener>) -> bool {
        let mut aggregated = self
            .aggregated
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = aggregated.len();
        aggregated.retain(|l| !same_listener(l, listener));
        aggregated.len() != before
    }

    pub fn direct_count(&self) -> usize {
        self.direct.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn aggregated_count(&self) -> usize {
        self.aggregated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn direct_snapshot(&self) -> Vec<Arc<dyn EntityChangeListener>> {
        self.direct
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn aggregated_snapshot(&self) -> Vec<Arc<dyn EntityChangeSetListener>> {
        self.aggregated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver one change to every direct listener.
    ///
    /// Fail-fast: the first failing listener stops delivery and its error is returned.
    pub fn notify_change(&self, change: &EntityDataChange) -> ChangeResult<()> {
        for listener in self.direct_snapshot() {
            if let Err(error) = listener.on_change(change) {
                tracing::error!(
                    listener = listener.name(),
                    entity_type = change.entity_type(),
                    kind = ?change.kind(),
                    error = %format!("{error:#}"),
                    "direct listener failed"
                );
                return Err(ChangeError::listeners(vec![ListenerFailure::new(
                    listener.name(),
                    error,
                )]));
            }
        }
        Ok(())
    }

    /// Deliver a finalised change set to every aggregated listener.
    ///
    /// Every listener is notified even if an earlier one fails; all failures are
    /// returned together.
    pub fn notify_change_set(&self, change_set: &ChangeSet) -> ChangeResult<()> {
        let mut failures = Vec::new();
        for listener in self.aggregated_snapshot() {
            if let Err(error) = listener.on_change_set(change_set) {
                tracing::error!(
                    listener = listener.name(),
                    change_set = %change_set.id(),
                    error = %format!("{error:#}"),
                    "change set listener failed"
                );
                failures.push(ListenerFailure::new(listener.name(), error));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ChangeError::listeners(failures))
        }
    }
}

impl core::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("direct", &self.direct_count())
            .field("aggregated", &self.aggregated_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Barrier, Mutex};

    use super::*;
    use dachs_core::{
        ChangeKind, Diffable, EntityDescriptor, EntityRef, FieldDescriptor, FieldType,
        IdentityHandle, PropertyChange, Snapshot, UnitOfWorkId,
    };

    static PING_FIELDS: [FieldDescriptor; 1] = [FieldDescriptor::identity("id", FieldType::Integer)];
    static PING: EntityDescriptor = EntityDescriptor::new("Ping", &PING_FIELDS);

    struct Ping;

    impl Diffable for Ping {
        fn descriptor(&self) -> &'static EntityDescriptor {
            &PING
        }

        fn snapshot(&self) -> Snapshot {
            Snapshot::new().with("id", 1)
        }
    }

    fn ping_change() -> EntityDataChange {
        let entity: EntityRef = Arc::new(Ping);
        EntityDataChange::new(
            IdentityHandle::resolved(1),
            entity,
            ChangeKind::Created,
            vec![PropertyChange::new("id", FieldType::Integer, None, Some(1.into()))],
        )
    }

    /// Records its label into a shared journal, optionally failing.
    struct Journal {
        label: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl EntityChangeListener for Journal {
        fn name(&self) -> &str {
            self.label
        }

        fn on_change(&self, _change: &EntityDataChange) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.label);
            if self.fail {
                anyhow::bail!("{} refused", self.label);
            }
            Ok(())
        }
    }

    impl EntityChangeSetListener for Journal {
        fn name(&self) -> &str {
            self.label
        }

        fn on_change_set(&self, _change_set: &ChangeSet) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.label);
            if self.fail {
                anyhow::bail!("{} refused", self.label);
            }
            Ok(())
        }
    }

    fn journal(label: &'static str, fail: bool, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Journal> {
        Arc::new(Journal {
            label,
            fail,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn direct_delivery_follows_registration_order_and_fails_fast() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::new();
        registry.add_direct(journal("first", false, &log));
        registry.add_direct(journal("second", true, &log));
        registry.add_direct(journal("third", false, &log));

        let err = registry.notify_change(&ping_change()).unwrap_err();
        match err {
            ChangeError::ListenerFailure { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].listener, "second");
            }
            other => panic!("Expected ListenerFailure, got {other:?}"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn aggregated_delivery_notifies_everyone_and_collects_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::new();
        registry.add_aggregated(journal("a", true, &log));
        registry.add_aggregated(journal("b", false, &log));
        registry.add_aggregated(journal("c", true, &log));

        let set = ChangeSet::from_changes(UnitOfWorkId::new(), Vec::new()).unwrap();
        let err = registry.notify_change_set(&set).unwrap_err();
        match err {
            ChangeError::ListenerFailure { failures } => {
                let names: Vec<_> = failures.iter().map(|f| f.listener.as_str()).collect();
                assert_eq!(names, vec!["a", "c"]);
            }
            other => panic!("Expected ListenerFailure, got {other:?}"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn listeners_are_removed_by_reference() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::new();
        let kept: Arc<dyn EntityChangeListener> = journal("kept", false, &log);
        let removed: Arc<dyn EntityChangeListener> = journal("removed", false, &log);
        let stranger: Arc<dyn EntityChangeListener> = journal("removed", false, &log);
        registry.add_direct(Arc::clone(&kept));
        registry.add_direct(Arc::clone(&removed));

        assert!(!registry.remove_direct(&stranger));
        assert!(registry.remove_direct(&removed));
        assert_eq!(registry.direct_count(), 1);

        registry.notify_change(&ping_change()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["kept"]);
    }

    /// Unregisters itself while being notified.
    struct OneShot {
        registry: Arc<ListenerRegistry>,
        me: Mutex<Option<Arc<dyn EntityChangeListener>>>,
        calls: Mutex<u32>,
    }

    impl EntityChangeListener for OneShot {
        fn on_change(&self, _change: &EntityDataChange) -> anyhow::Result<()> {
            *self.calls.lock().unwrap() += 1;
            if let Some(me) = self.me.lock().unwrap().take() {
                self.registry.remove_direct(&me);
            }
            Ok(())
        }
    }

    #[test]
    fn registry_can_be_mutated_during_dispatch() {
        let registry = Arc::new(ListenerRegistry::new());
        let one_shot = Arc::new(OneShot {
            registry: Arc::clone(&registry),
            me: Mutex::new(None),
            calls: Mutex::new(0),
        });
        let as_listener: Arc<dyn EntityChangeListener> = one_shot.clone();
        *one_shot.me.lock().unwrap() = Some(Arc::clone(&as_listener));
        registry.add_direct(as_listener);

        registry.notify_change(&ping_change()).unwrap();
        registry.notify_change(&ping_change()).unwrap();

        assert_eq!(*one_shot.calls.lock().unwrap(), 1);
        assert_eq!(registry.direct_count(), 0);
    }

    /// Holds the first dispatch open until another thread has changed the registry.
    struct Gate {
        armed: AtomicBool,
        entered: Barrier,
        resume: Barrier,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl EntityChangeListener for Gate {
        fn on_change(&self, _change: &EntityDataChange) -> anyhow::Result<()> {
            self.log.lock().unwrap().push("gate");
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.wait();
                self.resume.wait();
            }
            Ok(())
        }
    }

    #[test]
    fn registry_can_be_changed_from_another_thread_during_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::new();
        let gate = Arc::new(Gate {
            armed: AtomicBool::new(true),
            entered: Barrier::new(2),
            resume: Barrier::new(2),
            log: Arc::clone(&log),
        });
        let victim: Arc<dyn EntityChangeListener> = journal("victim", false, &log);
        let late: Arc<dyn EntityChangeListener> = journal("late", false, &log);
        registry.add_direct(gate.clone());
        registry.add_direct(Arc::clone(&victim));

        std::thread::scope(|scope| {
            scope.spawn(|| {
                gate.entered.wait();
                registry.add_direct(Arc::clone(&late));
                assert!(registry.remove_direct(&victim));
                gate.resume.wait();
            });
            registry.notify_change(&ping_change()).unwrap();
        });

        // The running dispatch kept its snapshot; the next one sees the new list.
        registry.notify_change(&ping_change()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["gate", "victim", "gate", "late"]);
        assert_eq!(registry.direct_count(), 2);
    }
}
