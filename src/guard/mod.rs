// Echo suppression for locally originated broker publishes.
//
// Keyed by raw payload text, not by message identity: two unrelated messages
// with identical text are indistinguishable here.

use std::collections::HashMap;
use std::sync::Mutex;

/// Pending-echo ledger shared by the bridge paths and the poller.
///
/// Every `record_local` must happen before the matching publish is handed to
/// the broker, otherwise the echo can arrive before it is registered.
#[derive(Debug, Default)]
pub struct LoopGuard {
    pending: Mutex<HashMap<String, usize>>,
}

impl LoopGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one locally originated publish of `payload`.
    pub fn record_local(&self, payload: &str) {
        let mut pending = self.pending.lock().unwrap();
        *pending.entry(payload.to_string()).or_insert(0) += 1;
    }

    /// Consume one pending echo for `payload`.
    ///
    /// Returns true if the inbound message is our own echo and must be dropped.
    pub fn should_ignore(&self, payload: &str) -> bool {
        let mut pending = self.pending.lock().unwrap();
        match pending.get_mut(payload) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                pending.remove(payload);
                true
            }
            None => false,
        }
    }

    /// Outstanding echoes for `payload`.
    pub fn pending(&self, payload: &str) -> usize {
        self.pending
            .lock()
            .unwrap()
            .get(payload)
            .copied()
            .unwrap_or(0)
    }

    /// Number of distinct payloads awaiting their echo.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
