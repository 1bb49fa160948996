// ── Request/response correlation ──
//
// One waiter per outstanding id. A waiter leaves the table exactly once:
// resolved by a response, removed by its own timeout, or rejected in bulk
// when the socket drops.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::Error;

type Waiter<T> = oneshot::Sender<Result<T, Error>>;

pub(crate) struct PendingRequests<T> {
    waiters: DashMap<u64, Waiter<T>>,
}

impl<T> PendingRequests<T> {
    pub(crate) fn new() -> Self {
        Self {
            waiters: DashMap::new(),
        }
    }

    /// Register a waiter for `id`. A second registration for the same id
    /// replaces (and thereby rejects) the first.
    pub(crate) fn register(&self, id: u64) -> oneshot::Receiver<Result<T, Error>> {
        let (tx, rx) = oneshot::channel();
        if self.waiters.insert(id, tx).is_some() {
            tracing::warn!(id, "duplicate pending request id, previous waiter dropped");
        }
        rx
    }

    /// Deliver an outcome. Returns `false` if nobody was waiting on `id`.
    pub(crate) fn resolve(&self, id: u64, outcome: Result<T, Error>) -> bool {
        match self.waiters.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.waiters.remove(&id).is_some()
    }

    /// Reject every outstanding waiter with a clone of `err`.
    pub(crate) fn reject_all(&self, err: &Error) -> usize {
        let ids: Vec<u64> = self.waiters.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, tx)) = self.waiters.remove(&id) {
                let _ = tx.send(Err(err.clone()));
                rejected += 1;
            }
        }
        rejected
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Await a registered waiter, deregistering it if the deadline passes.
    pub(crate) async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<Result<T, Error>>,
        deadline: Duration,
    ) -> Result<T, Error> {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an answer: the table was torn down.
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.remove(id);
                Err(Error::Timeout {
                    timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_to_waiter() {
        let pending = PendingRequests::<u32>::new();
        let rx = pending.register(1);

        assert!(pending.resolve(1, Ok(42)));
        assert_eq!(rx.await.ok().and_then(Result::ok), Some(42));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn resolve_unknown_id_is_reported() {
        let pending = PendingRequests::<u32>::new();
        assert!(!pending.resolve(99, Ok(1)));
    }

    #[tokio::test]
    async fn reject_all_fails_every_waiter() {
        let pending = PendingRequests::<u32>::new();
        let receivers: Vec<_> = (1..=3).map(|id| pending.register(id)).collect();

        assert_eq!(pending.reject_all(&Error::ConnectionClosed), 3);
        assert_eq!(pending.len(), 0);

        for rx in receivers {
            let outcome = rx.await.expect("waiter must be answered");
            assert!(matches!(outcome, Err(Error::ConnectionClosed)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_and_deregisters() {
        let pending = PendingRequests::<u32>::new();
        let rx = pending.register(7);

        let outcome = pending.wait(7, rx, Duration::from_millis(250)).await;

        assert!(matches!(outcome, Err(Error::Timeout { timeout_ms: 250 })));
        assert_eq!(pending.len(), 0);
        // A late response finds nobody waiting.
        assert!(!pending.resolve(7, Ok(1)));
    }
}
