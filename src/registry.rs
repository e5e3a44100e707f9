//! Connection registry: the relay's single current-host slot.
//!
//! At most one host connection is honored at any time. A newer host
//! connection simply wins: installing it bumps the generation, notifies the
//! superseded connection so it can close, and leaves requests that were in
//! flight to the old host to resolve via timeout. Controller connections are
//! not tracked here; they only need unique owner ids for the correlation
//! table, which the registry also hands out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

/// The currently registered host connection.
#[derive(Clone)]
pub struct HostSlot {
    /// Monotonic connection generation; correlation entries record the
    /// generation they were forwarded to.
    pub generation: u64,
    /// Channel into the host connection's writer task.
    pub sender: mpsc::Sender<Vec<u8>>,
    /// Notified when a newer host connection supersedes this one.
    pub superseded: Arc<Notify>,
}

/// Registry of active connections, owned exclusively by the relay server.
#[derive(Default)]
pub struct ConnectionRegistry {
    host: Mutex<Option<HostSlot>>,
    generations: AtomicU64,
    owners: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new host connection, superseding any previous one.
    /// Returns the generation assigned to the new connection.
    pub fn install_host(&self, sender: mpsc::Sender<Vec<u8>>, superseded: Arc<Notify>) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = HostSlot {
            generation,
            sender,
            superseded,
        };
        let previous = match self.host.lock() {
            Ok(mut host) => host.replace(slot),
            Err(_) => None,
        };
        if let Some(old) = previous {
            // notify_one stores a permit, so the old connection's select loop
            // sees the supersession even if it isn't parked on notified()
            // right now.
            old.superseded.notify_one();
        }
        generation
    }

    /// The current host connection, if any.
    pub fn current_host(&self) -> Option<HostSlot> {
        self.host.lock().ok().and_then(|host| host.clone())
    }

    /// Clear the host slot, but only if the given generation is still the
    /// current one, since a superseded connection must not evict its successor.
    /// Returns whether the slot was cleared.
    pub fn clear_host(&self, generation: u64) -> bool {
        let Ok(mut host) = self.host.lock() else {
            return false;
        };
        if host.as_ref().is_some_and(|slot| slot.generation == generation) {
            *host = None;
            true
        } else {
            false
        }
    }

    pub fn has_host(&self) -> bool {
        self.current_host().is_some()
    }

    /// Allocate a fresh owner id for a controller connection. Owner 0 is
    /// reserved for in-process submitters.
    pub fn next_owner(&self) -> u64 {
        self.owners.fetch_add(1, Ordering::Relaxed) + 1
    }
}
