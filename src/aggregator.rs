//! Follow-up collection for polling commands.
//!
//! DESIGN
//! ======
//! A `cdata` command gets an empty first reply; the data arrives afterwards as
//! pushed messages reusing the command's transaction id. [`FollowUpRouter`]
//! maps transaction ids to subscriber channels, and [`collect`] drains one
//! subscription until the stream goes quiet for the debounce period or the
//! absolute ceiling passes, whichever comes first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use frames::HttpMessage;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<HttpMessage>)>>;

/// Per-transaction subscriber table for follow-up messages.
#[derive(Debug, Default)]
pub(crate) struct FollowUpRouter {
    subscribers: Arc<Mutex<Subscribers>>,
    next_key: AtomicU64,
}

impl FollowUpRouter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start receiving follow-ups for `transaction_id`. Dropping the returned
    /// subscription detaches it.
    pub(crate) fn subscribe(&self, transaction_id: &str) -> Subscription {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().entry(transaction_id.to_owned()).or_default().push((key, tx));
        Subscription {
            subscribers: Arc::clone(&self.subscribers),
            transaction_id: transaction_id.to_owned(),
            key,
            receiver: rx,
        }
    }

    /// Send `message` to every subscriber of its transaction id. Returns the
    /// number of subscribers reached.
    pub(crate) fn deliver(&self, message: &HttpMessage) -> usize {
        let Some(id) = message.transaction_id() else {
            return 0;
        };
        let guard = self.lock();
        let Some(targets) = guard.get(id) else {
            return 0;
        };
        targets.iter().filter(|(_, tx)| tx.send(message.clone()).is_ok()).count()
    }

    /// Close every subscription's channel; their collectors finish with what
    /// they have accumulated so far.
    pub(crate) fn detach_all(&self) -> usize {
        let mut guard = self.lock();
        let count = guard.values().map(Vec::len).sum();
        guard.clear();
        count
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A live follow-up subscription; detaches from the router on drop.
#[derive(Debug)]
pub(crate) struct Subscription {
    subscribers: Arc<Mutex<Subscribers>>,
    transaction_id: String,
    key: u64,
    receiver: mpsc::UnboundedReceiver<HttpMessage>,
}

impl Subscription {
    async fn recv(&mut self) -> Option<HttpMessage> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut guard = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(targets) = guard.get_mut(&self.transaction_id) {
            targets.retain(|(key, _)| *key != self.key);
            if targets.is_empty() {
                guard.remove(&self.transaction_id);
            }
        }
    }
}

// =============================================================================
// FOLLOW-UP SHAPES
// =============================================================================

/// What a single follow-up body carries.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum FollowUp {
    /// `[{endpoints: [{cdata: [{values: ...}]}]}]`
    Values(Value),
    /// `[{endpoints: [{cdata: [{EOR: ...}]}]}]`
    EndOfResponse,
    Unrecognized,
}

pub(crate) fn classify(body: &Value) -> FollowUp {
    let Some(cdata) = body.pointer("/0/endpoints/0/cdata/0") else {
        return FollowUp::Unrecognized;
    };
    match cdata.get("values") {
        Some(values) if !values.is_null() => FollowUp::Values(values.clone()),
        _ if cdata.get("EOR").is_some() => FollowUp::EndOfResponse,
        _ => FollowUp::Unrecognized,
    }
}

/// Accumulate follow-up `values` payloads until `debounce` passes without a
/// new follow-up, `ceiling` is reached, or the subscription is closed.
pub(crate) async fn collect(mut subscription: Subscription, debounce: Duration, ceiling: Instant) -> Vec<Value> {
    let mut values = Vec::new();
    let mut quiet_at: Option<Instant> = None;
    let ceiling_sleep = sleep_until(ceiling);
    tokio::pin!(ceiling_sleep);

    loop {
        let quiet = async move {
            match quiet_at {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = &mut ceiling_sleep => {
                tracing::debug!(
                    transaction_id = %subscription.transaction_id,
                    collected = values.len(),
                    "command ceiling reached"
                );
                break;
            }
            () = quiet => break,
            message = subscription.recv() => {
                let Some(message) = message else {
                    break;
                };
                match classify(&message.body) {
                    FollowUp::Values(payload) => values.push(payload),
                    FollowUp::EndOfResponse => {}
                    FollowUp::Unrecognized => tracing::warn!(
                        transaction_id = %subscription.transaction_id,
                        body = %message.body,
                        "unexpected command follow-up"
                    ),
                }
                quiet_at = Some(Instant::now() + debounce);
            }
        }
    }
    values
}

#[cfg(test)]
#[path = "aggregator_test.rs"]
mod tests;
