//! Transaction ids and the table of in-flight correlated requests.
//!
//! DESIGN
//! ======
//! Every outbound request carries a `transac-id` derived from the wall clock
//! and forced strictly above the previous id, so ids stay unique even when
//! several requests go out within the same millisecond.
//!
//! Each pending entry leaves the table exactly once, through one of three
//! settlements: a matching reply, its own timeout, or a socket close. The
//! entry owns its timer handle; settling by reply or close aborts the timer.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use frames::HttpMessage;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ClientError;

/// What a correlated caller eventually receives.
pub(crate) type Reply = Result<HttpMessage, ClientError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Settlement {
    Resolved,
    Rejected,
    TimedOut,
}

#[derive(Debug)]
struct PendingRequest {
    reply: oneshot::Sender<Reply>,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn settle(self, settlement: Settlement, outcome: Reply) {
        // The timeout path runs inside the timer task itself.
        if settlement != Settlement::TimedOut {
            if let Some(timer) = self.timer {
                timer.abort();
            }
        }
        // The caller may have stopped waiting.
        let _ = self.reply.send(outcome);
    }
}

#[derive(Debug, Default)]
pub(crate) struct Correlator {
    last_id: i64,
    pending: HashMap<String, PendingRequest>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_transaction_id(&mut self) -> String {
        self.next_id_at(now_ms())
    }

    pub(crate) fn next_id_at(&mut self, now: i64) -> String {
        let id = if now > self.last_id { now } else { self.last_id + 1 };
        self.last_id = id;
        id.to_string()
    }

    pub(crate) fn register(&mut self, id: String, reply: oneshot::Sender<Reply>, timer: Option<JoinHandle<()>>) {
        if let Some(previous) = self.pending.insert(id.clone(), PendingRequest { reply, timer }) {
            tracing::warn!(transaction_id = %id, "replacing pending request with duplicate id");
            previous.settle(Settlement::Rejected, Err(ClientError::ClosedWhilePending { transaction_id: id }));
        }
    }

    /// Hand `message` to the request waiting on its transaction id, or give it
    /// back when nothing is waiting.
    pub(crate) fn resolve(&mut self, message: HttpMessage) -> Result<(), HttpMessage> {
        let Some(entry) = message.transaction_id().and_then(|id| self.pending.remove(id)) else {
            return Err(message);
        };
        entry.settle(Settlement::Resolved, Ok(message));
        Ok(())
    }

    /// Reject `id` with a timeout. Returns false if it had already settled.
    pub(crate) fn expire(&mut self, id: &str, timeout: Duration) -> bool {
        let Some(entry) = self.pending.remove(id) else {
            return false;
        };
        entry.settle(
            Settlement::TimedOut,
            Err(ClientError::Timeout { transaction_id: id.to_owned(), timeout }),
        );
        true
    }

    /// Drop `id` without notifying its caller; used when the send itself failed.
    pub(crate) fn remove(&mut self, id: &str) -> bool {
        let Some(entry) = self.pending.remove(id) else {
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        true
    }

    /// Reject everything still pending; returns how many were rejected.
    pub(crate) fn reject_all(&mut self) -> usize {
        let count = self.pending.len();
        for (id, entry) in self.pending.drain() {
            entry.settle(Settlement::Rejected, Err(ClientError::ClosedWhilePending { transaction_id: id }));
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }
}

fn now_ms() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(duration.as_millis()).unwrap_or(0)
}

#[cfg(test)]
#[path = "correlator_test.rs"]
mod tests;
