//! Viewer registry and per-cycle fan-out.
//!
//! Each registered viewer owns a small bounded channel. Broadcast attempts a
//! non-blocking send to every viewer, so one slow or dead connection never
//! delays the cycle or the remaining viewers; failed viewers are collected
//! and removed after the iteration, never while it is underway. A removed
//! viewer gets no retry; the transport layer re-registers on reconnect.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::data::BroadcastPayload;

/// Messages a viewer may fall behind by before it is considered dead.
pub const VIEWER_BUFFER: usize = 8;

pub struct ViewerRegistry {
    viewers: Mutex<HashMap<u64, mpsc::Sender<Arc<BroadcastPayload>>>>,
    next_id: AtomicU64,
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self {
            viewers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self) -> (u64, mpsc::Receiver<Arc<BroadcastPayload>>) {
        let (tx, rx) = mpsc::channel(VIEWER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, tx);
        debug!("Viewer #{id} registered");
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            debug!("Viewer #{id} unregistered");
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver one payload to every registered viewer. Returns how many
    /// sends succeeded.
    pub fn broadcast(&self, payload: Arc<BroadcastPayload>) -> usize {
        let mut guard = self.lock();
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, sender) in guard.iter() {
            match sender.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Viewer #{id} fell behind; dropping it");
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => failed.push(*id),
            }
        }

        for id in failed {
            guard.remove(&id);
            metrics::counter!("sitewatch_viewers_dropped_total").increment(1);
        }

        delivered
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<Arc<BroadcastPayload>>>> {
        self.viewers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ViewerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters the viewer when the owning connection goes away.
pub struct ViewerGuard {
    id: u64,
    registry: Arc<ViewerRegistry>,
}

impl ViewerGuard {
    pub fn new(id: u64, registry: Arc<ViewerRegistry>) -> Self {
        Self { id, registry }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
