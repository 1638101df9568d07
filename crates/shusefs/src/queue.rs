//! Pending-request table: allocates correlation ids, tracks each request
//! through QUEUED → PENDING → {COMPLETED | TIMEOUT}, matches responses back
//! to requests, and reclaims finished slots on a periodic sweep.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

/// Maximum number of in-flight requests.
pub const MAX_PENDING_REQUESTS: usize = 64;

/// Seconds a request may sit PENDING before the sweep marks it timed out.
/// Measured from the moment it was sent, not from enqueue.
pub const REQUEST_TIMEOUT_SECS: i64 = 30;

// ---------------------------------------------------------------------------
// Entry state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Queued, not yet handed to the transport.
    Queued,
    /// Sent, awaiting the correlated response.
    Pending,
    Completed,
    TimedOut,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    state: RequestState,
    request: String,
    response: Option<String>,
    /// Epoch seconds; reset when the entry transitions QUEUED → PENDING.
    timestamp: i64,
    notify: Arc<Notify>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("request queue is full")]
pub struct QueueFull;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("no such request id")]
    NotFound,
    #[error("request is not in the expected state")]
    WrongState,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Inner {
    slots: Vec<Entry>,
    next_id: u64,
}

/// Bounded table of correlated requests. All operations take the internal
/// mutex for the duration of the call only; payloads are returned as owned
/// copies so no lock is held while the caller does I/O.
#[derive(Debug)]
pub struct RequestQueue {
    inner: Mutex<Inner>,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::with_capacity(MAX_PENDING_REQUESTS),
                next_id: 1,
            }),
        }
    }

    /// Peek the id the next `enqueue` will assign, for request construction
    /// that must embed its own correlation id.
    pub fn next_id(&self) -> u64 {
        self.inner.lock().unwrap().next_id
    }

    /// Reserve a slot and queue a request payload. Ids are issued
    /// monotonically and never reused within a session.
    pub fn enqueue(&self, request: String, now: i64) -> Result<u64, QueueFull> {
        let mut inner = self.inner.lock().unwrap();

        if inner.slots.len() >= MAX_PENDING_REQUESTS {
            return Err(QueueFull);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.slots.push(Entry {
            id,
            state: RequestState::Queued,
            request,
            response: None,
            timestamp: now,
            notify: Arc::new(Notify::new()),
        });

        Ok(id)
    }

    /// Oldest QUEUED entry (FIFO by id), without changing its state.
    pub fn next_to_send(&self) -> Option<(u64, String)> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .filter(|e| e.state == RequestState::Queued)
            .min_by_key(|e| e.id)
            .map(|e| (e.id, e.request.clone()))
    }

    /// Transition QUEUED → PENDING after a successful send. The timestamp
    /// resets so time spent waiting to send does not count against the
    /// response timeout.
    pub fn mark_sent(&self, id: u64, now: i64) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .slots
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(QueueError::NotFound)?;

        if entry.state != RequestState::Queued {
            return Err(QueueError::WrongState);
        }
        entry.state = RequestState::Pending;
        entry.timestamp = now;
        Ok(())
    }

    /// Match a correlated response to its PENDING request. Unknown or
    /// non-pending ids are the caller's cue to treat the frame as
    /// unsolicited.
    pub fn complete(&self, id: u64, response: String) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .slots
            .iter_mut()
            .find(|e| e.id == id && e.state == RequestState::Pending)
            .ok_or(QueueError::NotFound)?;

        entry.response = Some(response);
        entry.state = RequestState::Completed;
        entry.notify.notify_waiters();
        Ok(())
    }

    /// Original request payload for a correlation id, any state.
    pub fn request_of(&self, id: u64) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.request.clone())
    }

    /// Stored response payload, if the entry completed and has not yet been
    /// reclaimed.
    pub fn response_of(&self, id: u64) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .find(|e| e.id == id)
            .and_then(|e| e.response.clone())
    }

    /// Notification handle for waiters on a given entry.
    pub fn notified(&self, id: u64) -> Option<Arc<Notify>> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .find(|e| e.id == id)
            .map(|e| Arc::clone(&e.notify))
    }

    /// Age out PENDING entries past the timeout and reclaim finished slots.
    pub fn sweep(&self, now: i64) {
        let mut inner = self.inner.lock().unwrap();

        for entry in &mut inner.slots {
            if entry.state == RequestState::Pending
                && now - entry.timestamp >= REQUEST_TIMEOUT_SECS
            {
                warn!(req_id = entry.id, "request timed out");
                entry.state = RequestState::TimedOut;
                entry.notify.notify_waiters();
            }
        }

        inner
            .slots
            .retain(|e| !matches!(e.state, RequestState::Completed | RequestState::TimedOut));
    }

    /// Number of occupied slots (any state).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// State of a given entry, if it still occupies a slot.
    pub fn state_of(&self, id: u64) -> Option<RequestState> {
        let inner = self.inner.lock().unwrap();
        inner.slots.iter().find(|e| e.id == id).map(|e| e.state)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
