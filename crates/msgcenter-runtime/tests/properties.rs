//! Property tests for acknowledgement merging and response correlation

use msgcenter_runtime::{
    AckJob, DeliveryId, Job, ProtocolResponse, TransactionCorrelator, TransactionId,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn delivery_ids() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("m[0-9]{1,2}", 1..40)
}

proptest! {
    #[test]
    fn ack_keeps_first_occurrence_order(ids in delivery_ids()) {
        let job = AckJob::new();
        for id in &ids {
            prop_assert!(job.merge(DeliveryId::new(id.clone())));
        }

        let mut expected: Vec<DeliveryId> = Vec::new();
        for id in ids {
            let id = DeliveryId::new(id);
            if !expected.contains(&id) {
                expected.push(id);
            }
        }
        prop_assert_eq!(job.ids(), expected);
    }

    #[test]
    fn sealed_ack_refuses_every_merge(before in delivery_ids(), after in delivery_ids()) {
        let job = AckJob::new();
        for id in before {
            job.merge(DeliveryId::new(id));
        }
        let sealed = job.ids();
        job.seal();

        for id in after {
            prop_assert!(!job.merge(DeliveryId::new(id)));
        }
        prop_assert_eq!(job.ids(), sealed);
    }

    #[test]
    fn each_handler_runs_at_most_once(dispatches in prop::collection::vec(0u8..8, 0..32)) {
        let correlator = TransactionCorrelator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for tx in 0u8..4 {
            let calls = calls.clone();
            correlator
                .register(
                    TransactionId::new(format!("tx-{tx}")),
                    Box::new(move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }

        let mut answered = std::collections::HashSet::new();
        for tx in dispatches {
            let tx_id = TransactionId::new(format!("tx-{tx}"));
            let handled = correlator.dispatch(&tx_id, ProtocolResponse::Authenticate { valid: true });
            prop_assert_eq!(handled, tx < 4 && answered.insert(tx));
        }
        prop_assert_eq!(calls.load(Ordering::SeqCst), answered.len());
        prop_assert_eq!(correlator.len(), 4 - answered.len());
    }
}
