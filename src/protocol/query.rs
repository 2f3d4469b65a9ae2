//! Query correlation
//!
//! Tracks outstanding queries by correlation id. Each pending query ends in
//! exactly one of three ways:
//! - a response with the same id arrives
//! - its timeout elapses
//! - the owning channel closes
//!
//! All three paths remove the entry from the table under one lock, and only
//! the path that removed it may resolve the caller, so a racing response and
//! timeout always have a single winner.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::Packet;

/// Query errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel closed before the query completed")]
    ChannelClosed,

    #[error("Correlation id {0} is already pending")]
    DuplicateCorrelationId(Uuid),
}

pub type QueryResult<T> = Result<T, QueryError>;

type Completion = oneshot::Sender<QueryResult<Packet>>;

struct PendingQuery {
    completion: Completion,
    deadline: Instant,
    timer: Option<AbortHandle>,
}

impl PendingQuery {
    fn resolve(self, result: QueryResult<Packet>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have dropped its handle; nobody is left to tell
        let _ = self.completion.send(result);
    }
}

#[derive(Default)]
struct QueryTable {
    pending: HashMap<Uuid, PendingQuery>,
    closed: bool,
}

/// Correlation table for one channel
#[derive(Clone)]
pub struct QueryManager {
    table: Arc<Mutex<QueryTable>>,
    runtime: Handle,
}

impl QueryManager {
    /// Create a manager whose timeouts run on the given runtime
    pub fn new(runtime: Handle) -> Self {
        Self {
            table: Arc::new(Mutex::new(QueryTable::default())),
            runtime,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueryTable> {
        // A panic while holding the lock cannot leave the table half-updated
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a pending query.
    ///
    /// The returned handle resolves with the response packet, or fails with
    /// [`QueryError::Timeout`] once `timeout` elapses, or with
    /// [`QueryError::ChannelClosed`] if [`QueryManager::cancel_all`] runs
    /// first.
    pub fn register(&self, unique_id: Uuid, timeout: Duration) -> QueryResult<QueryHandle> {
        let (tx, rx) = oneshot::channel();

        {
            let mut table = self.lock();
            if table.closed {
                return Err(QueryError::ChannelClosed);
            }
            if table.pending.contains_key(&unique_id) {
                return Err(QueryError::DuplicateCorrelationId(unique_id));
            }
            table.pending.insert(
                unique_id,
                PendingQuery {
                    completion: tx,
                    deadline: Instant::now() + timeout,
                    timer: None,
                },
            );
        }

        let manager = self.clone();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.expire(unique_id, timeout);
        });

        // The timer may already have fired for very short timeouts
        if let Some(entry) = self.lock().pending.get_mut(&unique_id) {
            entry.timer = Some(timer.abort_handle());
        }

        Ok(QueryHandle { unique_id, rx })
    }

    /// Resolve the pending query matching `packet`'s correlation id.
    ///
    /// Returns false, without side effects, when nothing is pending for the
    /// id: late responses after a timeout and duplicates end up here.
    pub fn complete_query(&self, packet: &Packet) -> bool {
        let Some(unique_id) = packet.unique_id() else {
            return false;
        };

        let entry = self.lock().pending.remove(&unique_id);
        match entry {
            Some(entry) => {
                tracing::trace!("Query {} answered", unique_id);
                entry.resolve(Ok(packet.clone()));
                true
            }
            None => {
                tracing::debug!("No pending query for correlation id {}", unique_id);
                false
            }
        }
    }

    /// Whether a query with this id is waiting for its response
    pub fn is_pending(&self, unique_id: &Uuid) -> bool {
        self.lock().pending.contains_key(unique_id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Deadline of a pending query
    pub fn deadline(&self, unique_id: &Uuid) -> Option<Instant> {
        self.lock().pending.get(unique_id).map(|entry| entry.deadline)
    }

    /// Fail one pending query with [`QueryError::ChannelClosed`].
    /// Used when the request could not be handed to the transport.
    pub fn cancel(&self, unique_id: &Uuid) -> bool {
        let entry = self.lock().pending.remove(unique_id);
        match entry {
            Some(entry) => {
                entry.resolve(Err(QueryError::ChannelClosed));
                true
            }
            None => false,
        }
    }

    /// Fail every pending query with [`QueryError::ChannelClosed`] and refuse
    /// new registrations. Returns how many queries were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingQuery> = {
            let mut table = self.lock();
            table.closed = true;
            table.pending.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            entry.resolve(Err(QueryError::ChannelClosed));
        }
        if count > 0 {
            tracing::debug!("Cancelled {} pending queries", count);
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn expire(&self, unique_id: Uuid, timeout: Duration) {
        let entry = self.lock().pending.remove(&unique_id);
        if let Some(entry) = entry {
            tracing::debug!("Query {} timed out after {:?}", unique_id, timeout);
            // Resolving from inside the timer task; no need to abort it
            let _ = entry.completion.send(Err(QueryError::Timeout(timeout)));
        }
    }
}

/// Handle to the eventual result of a query
#[derive(Debug)]
pub struct QueryHandle {
    unique_id: Uuid,
    rx: oneshot::Receiver<QueryResult<Packet>>,
}

impl QueryHandle {
    /// Correlation id the query was sent with
    pub fn unique_id(&self) -> Uuid {
        self.unique_id
    }

    /// Block the current thread until the query resolves.
    ///
    /// Must not be called from within an async context; use `.await` there.
    pub fn wait(self) -> QueryResult<Packet> {
        self.rx.blocking_recv().unwrap_or(Err(QueryError::ChannelClosed))
    }
}

impl Future for QueryHandle {
    type Output = QueryResult<Packet>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The manager was dropped along with its channel
            Poll::Ready(Err(_)) => Poll::Ready(Err(QueryError::ChannelClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{DataBuf, DataBufMut, DataRead};
    use std::collections::HashSet;

    fn manager() -> QueryManager {
        QueryManager::new(Handle::current())
    }

    fn response_for(request: &Packet, text: &str) -> Packet {
        let mut buf = DataBufMut::new();
        buf.write_string(text);
        request.response(buf.freeze()).unwrap()
    }

    #[tokio::test]
    async fn test_response_resolves_query() {
        let manager = manager();
        let request = Packet::new_query(5, DataBuf::empty());
        let handle = manager
            .register(request.unique_id().unwrap(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(manager.pending_count(), 1);

        assert!(manager.complete_query(&response_for(&request, "pong")));
        let response = handle.await.unwrap();
        assert_eq!(response.content().read_string().unwrap(), "pong");
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let manager = manager();
        let id = Uuid::new_v4();
        let started = Instant::now();
        let handle = manager.register(id, Duration::from_millis(100)).unwrap();

        assert_eq!(handle.await, Err(QueryError::Timeout(Duration::from_millis(100))));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(!manager.is_pending(&id));
    }

    #[tokio::test]
    async fn test_late_and_duplicate_responses_are_ignored() {
        let manager = manager();
        let request = Packet::new_query(5, DataBuf::empty());
        let handle = manager
            .register(request.unique_id().unwrap(), Duration::from_secs(5))
            .unwrap();

        assert!(manager.complete_query(&response_for(&request, "first")));
        assert!(!manager.complete_query(&response_for(&request, "second")));

        let response = handle.await.unwrap();
        assert_eq!(response.content().read_string().unwrap(), "first");
    }

    #[tokio::test]
    async fn test_plain_packet_does_not_complete_anything() {
        let manager = manager();
        assert!(!manager.complete_query(&Packet::new(5, DataBuf::empty())));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let manager = manager();
        let id = Uuid::new_v4();
        let _first = manager.register(id, Duration::from_secs(5)).unwrap();
        let err = manager.register(id, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err, QueryError::DuplicateCorrelationId(id));
    }

    #[tokio::test]
    async fn test_cancel_all_fails_every_pending_query() {
        let manager = manager();
        let handles: Vec<_> = (0..10)
            .map(|_| manager.register(Uuid::new_v4(), Duration::from_secs(5)).unwrap())
            .collect();

        assert_eq!(manager.cancel_all(), 10);
        for handle in handles {
            assert_eq!(handle.await, Err(QueryError::ChannelClosed));
        }

        assert_eq!(manager.pending_count(), 0);
        assert!(manager.is_closed());
        assert_eq!(
            manager.register(Uuid::new_v4(), Duration::from_secs(5)).unwrap_err(),
            QueryError::ChannelClosed
        );
    }

    #[tokio::test]
    async fn test_response_after_cancel_is_dropped() {
        let manager = manager();
        let request = Packet::new_query(5, DataBuf::empty());
        let handle = manager
            .register(request.unique_id().unwrap(), Duration::from_secs(5))
            .unwrap();

        manager.cancel_all();
        assert!(!manager.complete_query(&response_for(&request, "late")));
        assert_eq!(handle.await, Err(QueryError::ChannelClosed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_response_and_timeout_race_has_one_winner() {
        let manager = manager();
        let mut tasks = Vec::new();

        for i in 0..200u64 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                let request = Packet::new_query(1, DataBuf::empty());
                let timeout = Duration::from_millis(i % 5);
                let handle = manager.register(request.unique_id().unwrap(), timeout).unwrap();

                tokio::time::sleep(Duration::from_millis(i % 3)).await;
                let delivered = manager.complete_query(&response_for(&request, "pong"));

                let result = handle.await;
                match result {
                    Ok(_) => assert!(delivered),
                    Err(QueryError::Timeout(_)) => assert!(!delivered),
                    Err(other) => panic!("unexpected outcome: {}", other),
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations_are_unique() {
        let manager = manager();
        let mut tasks = Vec::new();

        for _ in 0..8 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                (0..50)
                    .map(|_| {
                        let id = Uuid::new_v4();
                        manager.register(id, Duration::from_secs(5)).unwrap();
                        id
                    })
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(manager.pending_count(), 400);
        assert_eq!(manager.cancel_all(), 400);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_wait() {
        let manager = manager();
        let request = Packet::new_query(5, DataBuf::empty());
        let handle = manager
            .register(request.unique_id().unwrap(), Duration::from_secs(5))
            .unwrap();

        let waiter = tokio::task::spawn_blocking(move || handle.wait());
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.complete_query(&response_for(&request, "done"));

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.content().read_string().unwrap(), "done");
    }
}
