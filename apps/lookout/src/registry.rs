use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use lookout_core::{PairingToken, VisitorReport};

/// Live transport handle for the host side of one pairing.
///
/// The registry owns the current handle per token; the relay clones it out
/// and pushes reports through the channel. Once the socket task that holds
/// the receiver is gone, sends fail fast instead of blocking, which is how a
/// superseded handle rejects late deliveries.
#[derive(Clone)]
pub struct HostHandle {
    connection_id: Uuid,
    sender: mpsc::UnboundedSender<VisitorReport>,
    registered_at: DateTime<Utc>,
}

impl HostHandle {
    pub fn new(sender: mpsc::UnboundedSender<VisitorReport>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            sender,
            registered_at: Utc::now(),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub(crate) fn forward(
        &self,
        report: VisitorReport,
    ) -> Result<(), mpsc::error::SendError<VisitorReport>> {
        self.sender.send(report)
    }
}

/// Concurrency-safe mapping from pairing token to the currently-active host
/// handle. The only shared mutable state in the service; none of the
/// operations hold a map guard across I/O.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<DashMap<PairingToken, HostHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handle` as current for `token`, atomically replacing any
    /// previous entry. Returns the superseded handle so the caller can log
    /// the race.
    pub fn register(&self, token: PairingToken, handle: HostHandle) -> Option<HostHandle> {
        self.entries.insert(token, handle)
    }

    pub fn lookup(&self, token: &PairingToken) -> Option<HostHandle> {
        self.entries.get(token).map(|entry| entry.value().clone())
    }

    /// Compare-and-remove: clears the entry only while it still belongs to
    /// `connection_id`, so a stale close never evicts a newer registration.
    /// Returns whether anything was removed.
    pub fn remove(&self, token: &PairingToken, connection_id: Uuid) -> bool {
        self.entries
            .remove_if(token, |_, handle| handle.connection_id() == connection_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
