use super::{CorrelationId, ResponseEnvelope};
use crate::error::RpcError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Outcome a pending request is settled with
pub type ReplyOutcome = Result<ResponseEnvelope, RpcError>;

type PendingMap = HashMap<CorrelationId, oneshot::Sender<ReplyOutcome>>;

/// Bookkeeping of requests that are awaiting a reply
///
/// The registry is shared between the tasks issuing requests and the listeners receiving
/// replies from a substrate. Every registered request is settled exactly once, either by a
/// matching reply, by expiring, or by the connection going away. Replies for identifiers that are
/// not (or no longer) pending are dropped silently, as they are expected on shared reply channels
/// and with at-least-once delivery.
#[derive(Default)]
pub struct CorrelationRegistry {
    pending: Mutex<PendingMap>,
}

impl CorrelationRegistry {
    /// Creates a new, empty registry wrapped in an [`Arc`]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, PendingMap> {
        // Entries are independent of each other so a panic while holding the lock leaves no broken invariant behind
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a pending request and returns a handle to await its outcome
    ///
    /// # Panics
    ///
    /// Registering an identifier which is still pending is a programming error and panics.
    pub fn register(self: &Arc<Self>, id: CorrelationId) -> PendingReply {
        let (tx, rx) = oneshot::channel();

        let previous = self.lock().insert(id.clone(), tx);
        assert!(
            previous.is_none(),
            "Correlation id {} has been registered twice!",
            id
        );

        trace!(%id, "Registered pending request");

        PendingReply {
            id,
            rx,
            registry: self.clone(),
        }
    }

    /// Settles the pending request with the given id, returns whether one existed
    pub fn resolve(&self, id: &CorrelationId, outcome: ReplyOutcome) -> bool {
        let sender = self.lock().remove(id);

        match sender {
            Some(sender) => {
                trace!(%id, "Resolving pending request");
                // The receiving side may have been dropped in the meantime, nobody is left to care
                sender.send(outcome).ok();
                true
            }
            None => {
                trace!(%id, "Ignoring reply without pending request");
                false
            }
        }
    }

    /// Settles the pending request with [`RpcError::Timeout`]
    pub fn expire(&self, id: &CorrelationId) -> bool {
        let expired = self.resolve(id, Err(RpcError::Timeout));

        if expired {
            debug!(%id, "Pending request expired");
        }

        expired
    }

    /// Settles every pending request with [`RpcError::ConnectionLost`] and clears the registry
    pub fn resolve_all(&self) -> usize {
        let pending: Vec<_> = self.lock().drain().collect();
        let count = pending.len();

        for (id, sender) in pending {
            trace!(%id, "Failing pending request due to connection loss");
            sender.send(Err(RpcError::ConnectionLost)).ok();
        }

        if count > 0 {
            debug!(count, "Failed all pending requests");
        }

        count
    }

    /// Whether a request with the given id is currently pending
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of currently pending requests
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no requests are pending
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn forget(&self, id: &CorrelationId) {
        if self.lock().remove(id).is_some() {
            trace!(%id, "Discarded abandoned pending request");
        }
    }
}

/// Handle to await the outcome of a registered request
///
/// Dropping the handle before the request has been settled removes it from the registry.
pub struct PendingReply {
    id: CorrelationId,
    rx: oneshot::Receiver<ReplyOutcome>,
    registry: Arc<CorrelationRegistry>,
}

impl PendingReply {
    /// Identifier this handle is waiting for
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Waits for the request to be settled, expiring it after the given duration
    ///
    /// When a reply races the deadline, whichever settled the request first wins.
    pub async fn wait(mut self, timeout: Duration) -> ReplyOutcome {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::ConnectionLost),
            Err(_) => {
                self.registry.expire(&self.id);
                self.rx.try_recv().unwrap_or(Err(RpcError::Timeout))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.registry.forget(&self.id);
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn reply(id: &CorrelationId) -> ReplyOutcome {
        Ok(ResponseEnvelope::success(Some(id.clone()), json!({ "sum": 3 })))
    }

    #[tokio::test]
    async fn deliver_matching_replies() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let pending = registry.register(id.clone());

        assert!(registry.resolve(&id, reply(&id)));

        let outcome = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.response, Some(json!({ "sum": 3 })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn ignore_unknown_ids() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let foreign = CorrelationId::new();
        let pending = registry.register(id.clone());

        assert!(!registry.resolve(&foreign, reply(&foreign)));
        assert!(registry.contains(&id));

        registry.resolve(&id, reply(&id));
        assert_eq!(
            pending.wait(Duration::from_secs(1)).await.unwrap().id,
            Some(id)
        );
    }

    #[tokio::test]
    async fn settle_only_once() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let _pending = registry.register(id.clone());

        assert!(registry.resolve(&id, reply(&id)));
        assert!(!registry.resolve(&id, reply(&id)));
    }

    #[tokio::test]
    async fn expire_after_timeout() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let pending = registry.register(id.clone());

        let outcome = pending.wait(Duration::from_millis(10)).await;

        assert!(matches!(outcome, Err(RpcError::Timeout)));
        assert!(!registry.contains(&id));
        assert!(!registry.resolve(&id, reply(&id)));
    }

    #[tokio::test]
    async fn fail_everything_on_connection_loss() {
        let registry = CorrelationRegistry::new();
        let first = registry.register(CorrelationId::new());
        let second = registry.register(CorrelationId::new());

        assert_eq!(registry.resolve_all(), 2);
        assert!(registry.is_empty());

        assert!(matches!(
            first.wait(Duration::from_secs(1)).await,
            Err(RpcError::ConnectionLost)
        ));
        assert!(matches!(
            second.wait(Duration::from_secs(1)).await,
            Err(RpcError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn forget_dropped_handles() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();

        drop(registry.register(id.clone()));

        assert!(!registry.contains(&id));
    }

    #[tokio::test]
    async fn resolve_from_other_tasks() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let pending = registry.register(id.clone());

        let listener = registry.clone();
        let reply_id = id.clone();
        tokio::spawn(async move {
            listener.resolve(&reply_id, reply(&reply_id));
        });

        assert!(pending.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[test]
    #[should_panic]
    fn reject_duplicate_registrations() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();

        let _first = registry.register(id.clone());
        let _second = registry.register(id);
    }
}
