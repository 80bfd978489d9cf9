use std::{collections::HashMap, time::Duration};

use shared::{
    error::ApiError,
    protocol::{ClientRef, MessagePayload},
};
use tokio::sync::oneshot;

pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Confirmed(MessagePayload),
    Rejected(ApiError),
    TimedOut,
}

/// Sends waiting for `message-sent`, keyed by correlation id. Each entry is
/// resolved exactly once: by the confirmation, by an error carrying the same
/// id, or by its timeout.
#[derive(Debug, Default)]
pub struct PendingSends {
    entries: HashMap<ClientRef, oneshot::Sender<SendOutcome>>,
}

impl PendingSends {
    pub fn register(&mut self, client_ref: ClientRef) -> oneshot::Receiver<SendOutcome> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(client_ref, tx);
        rx
    }

    /// Returns false when the entry was already resolved.
    pub fn resolve(&mut self, client_ref: &str, outcome: SendOutcome) -> bool {
        match self.entries.remove(client_ref) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, client_ref: &str) -> bool {
        self.entries.contains_key(client_ref)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every waiter; their tickets observe a timeout.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Handle for one submitted message.
#[derive(Debug)]
pub struct SendTicket {
    pub client_ref: ClientRef,
    pub(crate) outcome: oneshot::Receiver<SendOutcome>,
}

impl SendTicket {
    pub async fn outcome(self) -> SendOutcome {
        self.outcome.await.unwrap_or(SendOutcome::TimedOut)
    }
}

#[cfg(test)]
#[path = "tests/pending_tests.rs"]
mod tests;
