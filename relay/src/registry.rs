//! Correlation registry
//!
//! Maps correlation ids to the oneshot sender of the HTTP task waiting on
//! them. Every operation runs under one mutex, so an entry is delivered,
//! cancelled or removed exactly once. The lock is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::debug;
use webexpose_shared::{CorrelationId, Error, Result, TunnelResponse};

type Completion = Result<TunnelResponse>;

#[derive(Default)]
struct RegistryState {
    pending: HashMap<CorrelationId, oneshot::Sender<Completion>>,
    /// Set by `shutdown`; new registrations are refused with this reason
    sealed: Option<String>,
}

#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a pending entry and hand back its completion handle
    pub fn register(&self, id: CorrelationId) -> Result<PendingResponse> {
        let mut state = self.lock();
        if let Some(reason) = &state.sealed {
            return Err(Error::Cancelled(reason.clone()));
        }
        if state.pending.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }

        let (tx, rx) = oneshot::channel();
        state.pending.insert(id, tx);
        Ok(PendingResponse {
            id,
            rx,
            registry: self.clone(),
        })
    }

    /// Deliver `response` to the task waiting on `id`.
    ///
    /// `UnknownCorrelation` means nobody is waiting any more: the request
    /// timed out, was cancelled, or its task went away.
    pub fn resolve(&self, id: CorrelationId, response: TunnelResponse) -> Result<()> {
        let mut state = self.lock();
        match state.pending.remove(&id) {
            Some(tx) => tx
                .send(Ok(response))
                .map_err(|_| Error::UnknownCorrelation(id)),
            None => Err(Error::UnknownCorrelation(id)),
        }
    }

    /// Fail every pending entry with `Cancelled(reason)` and clear the table
    pub fn cancel_all(&self, reason: &str) -> usize {
        let mut state = self.lock();
        Self::cancel_locked(&mut state, reason)
    }

    /// `cancel_all`, then refuse further registrations.
    ///
    /// Used when the owning connection is gone; the first reason sticks.
    pub fn shutdown(&self, reason: &str) -> usize {
        let mut state = self.lock();
        if state.sealed.is_none() {
            state.sealed = Some(reason.to_string());
        }
        Self::cancel_locked(&mut state, reason)
    }

    fn cancel_locked(state: &mut RegistryState, reason: &str) -> usize {
        let count = state.pending.len();
        for (id, tx) in state.pending.drain() {
            if tx.send(Err(Error::Cancelled(reason.to_string()))).is_err() {
                debug!(%id, "Waiter already gone during cancel");
            }
        }
        count
    }

    /// Drop the entry for `id` if present. Idempotent.
    pub fn remove(&self, id: CorrelationId) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.lock().pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Completion handle for one registered request.
///
/// Dropping the handle removes its entry, so an aborted HTTP task cannot
/// leave anything behind.
pub struct PendingResponse {
    id: CorrelationId,
    rx: oneshot::Receiver<Completion>,
    registry: CorrelationRegistry,
}

impl PendingResponse {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Wait for the response, a cancellation, or the deadline
    pub async fn wait(mut self, limit: Duration) -> Result<TunnelResponse> {
        match timeout(limit, &mut self.rx).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => Err(Error::Cancelled("completion handle dropped".into())),
            Err(_) => {
                debug!(id = %self.id, "Timed out waiting for response");
                Err(Error::Timeout)
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
