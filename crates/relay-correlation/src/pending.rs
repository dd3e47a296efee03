//! Pending-request table: the channel-based correlation shape.
//!
//! Maps request ids to a response channel and a done channel. Entries are
//! issued before the request is published and removed unconditionally when
//! the wait resolves, exactly like `wait_for` registrations.
//!
//! Flow:
//! 1. Caller calls `issue(id)` and keeps the ticket
//! 2. Caller publishes the request under `id`
//! 3. A registry sink, or a batch worker polling a [`PendingSource`], calls `complete()`
//! 4. Caller awaits `wait(ticket, timeout)`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_types::Envelope;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DEFAULT_WAIT_TIMEOUT;
use crate::error::RegistryError;
use crate::handler::SinkHandler;

struct PendingEntry {
    response: Option<oneshot::Sender<Envelope>>,
    done: Option<oneshot::Sender<()>>,
    created_at: Instant,
    issue: u64,
}

/// Statistics for the pending table
#[derive(Debug, Default)]
pub struct PendingStats {
    pub total_issued: AtomicU64,
    pub total_completed: AtomicU64,
    pub total_timeouts: AtomicU64,
    pub total_cancelled: AtomicU64,
    /// Completions for ids that were not pending, or already answered
    pub total_unmatched: AtomicU64,
}

/// Receiving halves handed to the caller by [`PendingRequestTable::issue`].
pub struct PendingTicket {
    id: String,
    issue: u64,
    response: oneshot::Receiver<Envelope>,
    done: oneshot::Receiver<()>,
}

impl PendingTicket {
    pub fn id(&self) -> &str {
        &self.id
    }
}

pub struct PendingRequestTable {
    pending: DashMap<String, PendingEntry>,
    default_timeout: Duration,
    next_issue: AtomicU64,
    stats: PendingStats,
}

impl PendingRequestTable {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            default_timeout,
            next_issue: AtomicU64::new(0),
            stats: PendingStats::default(),
        }
    }

    /// Create the entry for `id`. Fails if `id` is already pending.
    pub fn issue(&self, id: &str) -> Result<PendingTicket, RegistryError> {
        let (response_tx, response_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let issue = self.next_issue.fetch_add(1, Ordering::Relaxed);

        match self.pending.entry(id.to_string()) {
            Entry::Occupied(_) => return Err(RegistryError::AlreadyRegistered(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    response: Some(response_tx),
                    done: Some(done_tx),
                    created_at: Instant::now(),
                    issue,
                });
            }
        }

        self.stats.total_issued.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id = %id, "Issued pending request");

        Ok(PendingTicket {
            id: id.to_string(),
            issue,
            response: response_rx,
            done: done_rx,
        })
    }

    /// Deliver a response. Returns false if `envelope.id` is not pending or
    /// was already answered.
    pub fn complete(&self, envelope: Envelope) -> bool {
        let sender = self
            .pending
            .get_mut(&envelope.id)
            .and_then(|mut entry| entry.response.take());

        let Some(sender) = sender else {
            self.stats.total_unmatched.fetch_add(1, Ordering::Relaxed);
            warn!(correlation_id = %envelope.id, "Response for unknown or answered request");
            return false;
        };

        let id = envelope.id.clone();
        match sender.send(envelope) {
            Ok(()) => {
                self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %id, "Completed pending request");
                true
            }
            Err(_) => {
                debug!(correlation_id = %id, "Pending request receiver dropped");
                false
            }
        }
    }

    /// Signal that no response will come for `id`.
    pub fn finish(&self, id: &str) -> bool {
        let sender = self
            .pending
            .get_mut(id)
            .and_then(|mut entry| entry.done.take());
        match sender {
            Some(done) => done.send(()).is_ok(),
            None => false,
        }
    }

    /// Wait on a ticket for a response, a done signal, or the timeout. The
    /// entry is removed on every exit path.
    pub async fn wait(
        &self,
        ticket: PendingTicket,
        timeout: Option<Duration>,
    ) -> Result<Envelope, RegistryError> {
        let waited = timeout.unwrap_or(self.default_timeout);
        let PendingTicket {
            id,
            issue,
            response,
            done,
        } = ticket;
        let _cleanup = PendingCleanup {
            pending: &self.pending,
            id: &id,
            issue,
        };

        tokio::select! {
            biased;
            answer = response => match answer {
                Ok(envelope) => Ok(envelope),
                Err(_) => {
                    self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
                    Err(RegistryError::Cancelled { id: id.clone() })
                }
            },
            _ = done => {
                self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %id, "Pending request finished without response");
                Err(RegistryError::Cancelled { id: id.clone() })
            }
            _ = tokio::time::sleep(waited) => {
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(RegistryError::Timeout { id: id.clone(), waited })
            }
        }
    }

    /// Issue and wait in one step.
    pub async fn wait_for(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<Envelope, RegistryError> {
        let ticket = self.issue(id)?;
        self.wait(ticket, timeout).await
    }

    /// Drop entries older than the default timeout. A waiter still blocked
    /// on a dropped entry resolves as cancelled.
    ///
    /// Returns the number of entries removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.pending.retain(|id, entry| {
            let elapsed = now.duration_since(entry.created_at);
            if elapsed > self.default_timeout {
                warn!(
                    correlation_id = %id,
                    elapsed_ms = elapsed.as_millis(),
                    "Removing expired pending request"
                );
                removed += 1;
                false
            } else {
                true
            }
        });

        removed
    }

    /// Ids still waiting for a response.
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending
            .iter()
            .filter(|entry| entry.response.is_some())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }

    /// A registry handler that completes pending requests with the bodies
    /// it receives, tagged with `event`.
    pub fn sink_handler(self: &Arc<Self>, event: impl Into<String>) -> impl SinkHandler {
        let table = self.clone();
        let event: String = event.into();
        move |id: String, body: serde_json::Value| {
            table.complete(Envelope::new(id, event.clone(), body));
            futures::future::ready(())
        }
    }
}

impl Default for PendingRequestTable {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT_TIMEOUT)
    }
}

/// Removes the waiter's own entry. A later issue under the same id is left
/// alone.
struct PendingCleanup<'a> {
    pending: &'a DashMap<String, PendingEntry>,
    id: &'a str,
    issue: u64,
}

impl Drop for PendingCleanup<'_> {
    fn drop(&mut self) {
        self.pending
            .remove_if(self.id, |_, entry| entry.issue == self.issue);
    }
}

/// Answers outstanding requests on behalf of [`poll_worker`].
#[async_trait]
pub trait PendingSource: Send + Sync {
    /// The response for `id`, if one is ready.
    async fn answer(&self, id: &str) -> Option<Envelope>;
}

/// Batch worker: on every tick, ask `source` about each outstanding request
/// and complete the ones it can answer.
pub async fn poll_worker(
    table: Arc<PendingRequestTable>,
    interval: Duration,
    source: Arc<dyn PendingSource>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        for id in table.pending_ids() {
            if let Some(mut envelope) = source.answer(&id).await {
                envelope.id = id;
                table.complete(envelope);
            }
        }
    }
}

/// Background task to remove abandoned entries
pub async fn cleanup_task(
    table: Arc<PendingRequestTable>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut cleanup_interval = tokio::time::interval(interval);
    cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = cleanup_interval.tick() => {}
        }
        let removed = table.remove_expired();
        if removed > 0 {
            debug!(removed = removed, "Cleaned up expired pending requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_issue_complete_wait() {
        let table = PendingRequestTable::default();
        let ticket = table.issue("a").unwrap();
        assert!(table.is_pending("a"));

        assert!(table.complete(Envelope::new("a", "Reply", json!(1))));
        let envelope = table.wait(ticket, None).await.unwrap();
        assert_eq!(envelope.body, json!(1));
        assert!(!table.is_pending("a"));
    }

    #[tokio::test]
    async fn test_duplicate_issue_rejected() {
        let table = PendingRequestTable::default();
        let _ticket = table.issue("a").unwrap();
        assert!(matches!(
            table.issue("a"),
            Err(RegistryError::AlreadyRegistered(id)) if id == "a"
        ));
    }

    #[tokio::test]
    async fn test_second_completion_unmatched() {
        let table = PendingRequestTable::default();
        let _ticket = table.issue("a").unwrap();
        assert!(table.complete(Envelope::new("a", "Reply", json!(1))));
        assert!(!table.complete(Envelope::new("a", "Reply", json!(2))));
        assert!(!table.complete(Envelope::new("zzz", "Reply", json!(3))));
        assert_eq!(table.stats().total_unmatched.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let table = PendingRequestTable::default();
        let err = table
            .wait_for("a", Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!table.is_pending("a"));
        assert_eq!(table.stats().total_timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_finish_cancels_wait() {
        let table = Arc::new(PendingRequestTable::default());
        let ticket = table.issue("a").unwrap();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait(ticket, None).await })
        };
        tokio::task::yield_now().await;
        assert!(table.finish("a"));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, RegistryError::Cancelled { .. }));
        assert!(!table.is_pending("a"));
    }

    #[tokio::test]
    async fn test_response_beats_done() {
        let table = PendingRequestTable::default();
        let ticket = table.issue("a").unwrap();
        table.complete(Envelope::new("a", "Reply", json!("first")));
        table.finish("a");

        let envelope = table.wait(ticket, None).await.unwrap();
        assert_eq!(envelope.body, json!("first"));
    }

    #[tokio::test]
    async fn test_pending_ids_skip_answered() {
        let table = PendingRequestTable::default();
        let _a = table.issue("a").unwrap();
        let _b = table.issue("b").unwrap();
        table.complete(Envelope::new("a", "Reply", json!(null)));
        assert_eq!(table.pending_ids(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_expired() {
        let table = PendingRequestTable::new(Duration::from_millis(10));
        let _a = table.issue("a").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(table.remove_expired(), 1);
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_expires_abandoned_entries() {
        let table = Arc::new(PendingRequestTable::new(Duration::from_millis(100)));
        let cancel = CancellationToken::new();
        let sweeper = tokio::spawn(cleanup_task(
            table.clone(),
            Duration::from_millis(50),
            cancel.clone(),
        ));

        let ticket = table.issue("stale").unwrap();
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait(ticket, Some(Duration::from_secs(60))).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!table.is_pending("stale"));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, RegistryError::Cancelled { ref id } if id == "stale"));

        cancel.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_waiter_leaves_reissued_entry() {
        let table = PendingRequestTable::new(Duration::from_millis(10));
        let first = table.issue("a").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(table.remove_expired(), 1);

        // Same id issued again while the first waiter has not run yet
        let _second = table.issue("a").unwrap();
        let err = table.wait(first, None).await.unwrap_err();
        assert!(matches!(err, RegistryError::Cancelled { .. }));

        assert!(table.is_pending("a"));
        assert!(table.complete(Envelope::new("a", "Reply", json!("second"))));
    }

    struct EchoSource;

    #[async_trait]
    impl PendingSource for EchoSource {
        async fn answer(&self, id: &str) -> Option<Envelope> {
            Some(Envelope::new(id, "Echo", json!({"echo": id})))
        }
    }

    #[tokio::test]
    async fn test_poll_worker_answers_batch() {
        let table = Arc::new(PendingRequestTable::default());
        let cancel = CancellationToken::new();
        tokio::spawn(poll_worker(
            table.clone(),
            Duration::from_millis(5),
            Arc::new(EchoSource),
            cancel.clone(),
        ));

        let (a, b) = tokio::join!(
            table.wait_for("a", Some(Duration::from_secs(1))),
            table.wait_for("b", Some(Duration::from_secs(1))),
        );
        cancel.cancel();

        assert_eq!(a.unwrap().body, json!({"echo": "a"}));
        assert_eq!(b.unwrap().body, json!({"echo": "b"}));
    }

    #[tokio::test]
    async fn test_sink_handler_completes() {
        let table = Arc::new(PendingRequestTable::default());
        let ticket = table.issue("a").unwrap();
        let handler = table.sink_handler("Reply");

        handler.call("a".to_string(), json!(42)).await;
        let envelope = table.wait(ticket, None).await.unwrap();
        assert_eq!(envelope.event, "Reply");
        assert_eq!(envelope.body, json!(42));
    }
}
