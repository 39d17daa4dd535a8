//! Transaction Correlator
//!
//! Maps server-issued transaction ids to the handler expecting the response.
//! A record is created when a job's execution yields a transaction id and
//! removed when the matching response arrives or the session resets.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use msgcenter_core::{MessageCenterError, MessageCenterResult, ProtocolResponse, ResponseHandler, TransactionId};
use tracing::{debug, warn};

/// Transaction record table
#[derive(Default)]
pub struct TransactionCorrelator {
    handlers: DashMap<TransactionId, ResponseHandler>,
}

impl TransactionCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a transaction id
    ///
    /// A transaction id carries at most one handler: a second registration is
    /// rejected and the first handler kept.
    pub fn register(&self, tx_id: TransactionId, handler: ResponseHandler) -> MessageCenterResult<()> {
        match self.handlers.entry(tx_id) {
            Entry::Occupied(entry) => Err(MessageCenterError::DuplicateTransaction {
                tx_id: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                debug!(tx_id = %entry.key(), "awaiting response");
                entry.insert(handler);
                Ok(())
            }
        }
    }

    /// Hand a response to its handler; unsolicited responses are logged and dropped
    pub fn dispatch(&self, tx_id: &TransactionId, response: ProtocolResponse) -> bool {
        match self.handlers.remove(tx_id) {
            Some((_, handler)) => {
                handler(response);
                true
            }
            None => {
                warn!(tx_id = %tx_id, ?response, "unsolicited response dropped");
                false
            }
        }
    }

    /// Drop the record for a transaction whose response is consumed elsewhere
    pub fn forget(&self, tx_id: &TransactionId) -> bool {
        self.handlers.remove(tx_id).is_some()
    }

    /// Drop every record
    pub fn clear(&self) {
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn is_pending(&self, tx_id: &TransactionId) -> bool {
        self.handlers.contains_key(tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgcenter_core::UpdateStatus;
    use std::sync::{Arc, Mutex};

    fn recording() -> (Arc<Mutex<Vec<ProtocolResponse>>>, ResponseHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: ResponseHandler = Box::new(move |response| sink.lock().unwrap().push(response));
        (seen, handler)
    }

    #[test]
    fn test_dispatch_runs_handler_once() {
        let correlator = TransactionCorrelator::new();
        let (seen, handler) = recording();
        correlator.register(TransactionId::new("tx-1"), handler).unwrap();

        let response = ProtocolResponse::UserInfoUpdate(UpdateStatus::Success);
        assert!(correlator.dispatch(&TransactionId::new("tx-1"), response.clone()));
        assert!(!correlator.dispatch(&TransactionId::new("tx-1"), response));

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(correlator.is_empty());
    }

    #[test]
    fn test_duplicate_registration_keeps_first_handler() {
        let correlator = TransactionCorrelator::new();
        let (first, handler_a) = recording();
        let (second, handler_b) = recording();

        correlator.register(TransactionId::new("tx-1"), handler_a).unwrap();
        let err = correlator
            .register(TransactionId::new("tx-1"), handler_b)
            .unwrap_err();
        assert!(matches!(err, MessageCenterError::DuplicateTransaction { .. }));

        correlator.dispatch(
            &TransactionId::new("tx-1"),
            ProtocolResponse::Authenticate { valid: true },
        );
        assert_eq!(first.lock().unwrap().len(), 1);
        assert!(second.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsolicited_response_is_dropped() {
        let correlator = TransactionCorrelator::new();
        assert!(!correlator.dispatch(
            &TransactionId::new("nobody"),
            ProtocolResponse::Authenticate { valid: true }
        ));
    }

    #[test]
    fn test_clear_discards_records() {
        let correlator = TransactionCorrelator::new();
        let (seen, handler) = recording();
        correlator.register(TransactionId::new("tx-9"), handler).unwrap();
        correlator.clear();
        assert!(!correlator.is_pending(&TransactionId::new("tx-9")));
        correlator.dispatch(
            &TransactionId::new("tx-9"),
            ProtocolResponse::Authenticate { valid: true },
        );
        assert!(seen.lock().unwrap().is_empty());
    }
}
