use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::pending::PendingTable;
use crate::sync::lock;

/// Transport lifecycle notifications delivered to session observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A transport attached and a fresh pending-request table is live.
    Attached,
    /// The transport closed; pending requests have been failed.
    Detached,
}

type Observer = Box<dyn Fn(LinkEvent) + Send + Sync>;

/// Long-lived per-endpoint device state on the server side.
///
/// A session is created the first time its endpoint key is observed and
/// survives transport reconnects from the same key; only the attached
/// pending-request table churns with the transport. Higher layers (the
/// device facade) subscribe to [`LinkEvent`]s to follow the lifecycle.
pub struct Session {
    key: String,
    table: Mutex<Option<PendingTable>>,
    observers: Mutex<Vec<Observer>>,
}

impl Session {
    /// Create a detached session for `key`.
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            table: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// The endpoint key (`remote_addr:remote_port`) this session tracks.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The currently attached pending-request table, if any.
    pub fn table(&self) -> Option<PendingTable> {
        lock(&self.table).clone()
    }

    /// Whether a transport is currently attached.
    pub fn is_attached(&self) -> bool {
        lock(&self.table).is_some()
    }

    /// Register a transport lifecycle observer.
    ///
    /// Observers run on the session manager's connection threads; keep
    /// them short or hand off to a worker.
    pub fn on_link(&self, observer: impl Fn(LinkEvent) + Send + Sync + 'static) {
        lock(&self.observers).push(Box::new(observer));
    }

    /// Attach a fresh pending-request table for a newly connected
    /// transport, replacing (and closing) any table still live from a
    /// raced reconnect.
    pub fn attach(&self, table: PendingTable) {
        let previous = lock(&self.table).replace(table);
        if let Some(old) = previous {
            // A reconnect raced the old transport's teardown.
            debug!(key = %self.key, "replacing live table on reattach");
            old.close();
        }
        self.notify(LinkEvent::Attached);
    }

    /// Detach only if `table` is still the attached one, so a stale
    /// reader thread cannot tear down its successor.
    pub fn detach_if(&self, table: &PendingTable) -> bool {
        let mut current = lock(&self.table);
        let matches = current
            .as_ref()
            .is_some_and(|attached| attached.shares_state_with(table));
        if matches {
            *current = None;
            drop(current);
            self.notify(LinkEvent::Detached);
        }
        matches
    }

    fn notify(&self, event: LinkEvent) {
        for observer in lock(&self.observers).iter() {
            observer(event);
        }
    }
}
