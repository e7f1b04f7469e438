//! Timeouts, retry requests and the retry budget.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tx_lifecycle::LifecycleState::*;
mod common;

const SETTLE: Duration = Duration::from_secs(3);

#[tokio::test]
async fn timeout_with_retry_replaces_the_lifecycle() {
    let h = common::harness(common::fast_config().with_timeout(Duration::from_millis(50)));
    h.chain.set_stalled(true);
    let chain = h.chain.clone();
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let intent = common::server_intent("resolve game")
        .on_error(move |lc| {
            c.fetch_add(1, Ordering::SeqCst);
            assert!(lc.is_timed_out());
            chain.set_stalled(false);
            lc.retry_count() == 0
        })
        .build()
        .unwrap();
    let lc = h.manager.submit(intent).unwrap();
    let retry = h.manager.wait_settled(&lc, SETTLE).await.unwrap();

    assert!(lc.is_timed_out());
    assert!(lc.is_deleted());
    assert!(lc.is_retry_requested());
    assert!(!Arc::ptr_eq(&lc, &retry));
    assert!(Arc::ptr_eq(&lc.successor().unwrap(), &retry));
    assert_eq!(retry.retry_count(), 1);
    assert_eq!(retry.origin(), lc.id());
    assert_ne!(retry.id(), lc.id());
    assert_eq!(retry.state_trace(), vec![ReadyToSend, RawTransactionCheck, Succeeded]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // the previous log is carried forward untouched
    let old = lc.history();
    let new = retry.history();
    assert!(new.len() > old.len());
    assert_eq!(&new.entries()[..old.len()], old.entries());
    assert!(old.entries().iter().any(|e| e.message.starts_with("TIMEOUT in RawTransactionCheck")));

    // one submission per lifecycle
    assert_eq!(h.chain.submission_count(), 2);
    let nonces: Vec<u64> = h.chain.submissions().iter().map(|t| t.nonce).collect();
    assert_eq!(nonces, vec![0, 1]);

    let archive = h.manager.archive().unwrap().clone();
    assert!(common::wait_for_archive(archive.clone(), lc.id(), 2).await);
    let lineage = archive.read_lineage(lc.id()).await;
    assert_eq!(lineage.len(), 2);
    assert_eq!(lineage[0].id, lc.id());
    assert_eq!(lineage[1].id, retry.id());
    h.manager.stop();
}

#[tokio::test]
async fn timed_out_lifecycle_runs_no_further_phase() {
    let h = common::harness(common::fast_config().with_timeout(Duration::from_millis(40)));
    h.chain.set_stalled(true);
    let lc = h.manager.submit(common::server_intent("stuck").build().unwrap()).unwrap();
    let settled = h.manager.wait_settled(&lc, SETTLE).await.unwrap();
    assert!(Arc::ptr_eq(&settled, &lc));
    assert!(lc.is_timed_out());
    assert!(lc.elapsed_ms() > 40);
    assert!(common::wait_for_state(&lc, Failed, 1_000).await);

    let history = lc.history();
    let entries = history.entries();
    let timeout_at = entries
        .iter()
        .position(|e| e.message.starts_with("TIMEOUT"))
        .expect("timeout recorded");
    assert!(entries[timeout_at..].iter().all(|e| e.message != "BEGIN"));
    assert_eq!(lc.last_error().as_deref(), Some(format!("timed out after {} ms", lc.elapsed_ms()).as_str()));
    assert_eq!(h.chain.submission_count(), 1);
    assert_eq!(h.sink.matching("timed out in RawTransactionCheck").len(), 1);

    // the driver stops polling the chain once the lifecycle timed out
    let lookups = h.chain.lookup_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.chain.lookup_count(), lookups);
    h.manager.stop();
}

#[tokio::test]
async fn zero_budget_never_retries() {
    let h = common::harness(common::fast_config().with_max_retries(0));
    h.chain.set_revert(true);
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let intent = common::server_intent("no retries")
        .on_error(move |_lc| {
            c.fetch_add(1, Ordering::SeqCst);
            true
        })
        .build()
        .unwrap();
    let lc = h.manager.submit(intent).unwrap();
    let settled = h.manager.wait_settled(&lc, SETTLE).await.unwrap();

    assert!(Arc::ptr_eq(&settled, &lc));
    assert_eq!(lc.state(), Failed);
    assert!(!lc.is_retry_requested());
    assert!(lc.successor().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.sink.matching("retry budget exhausted (0 of 0)").len(), 1);
    assert_eq!(h.chain.submission_count(), 1);
    h.manager.stop();
}

#[tokio::test]
async fn retries_stop_at_the_budget() {
    let h = common::harness(common::fast_config().with_max_retries(2));
    h.chain.set_revert(true);
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let intent = common::server_intent("always reverts")
        .on_error(move |_lc| {
            c.fetch_add(1, Ordering::SeqCst);
            true
        })
        .build()
        .unwrap();
    let lc = h.manager.submit(intent).unwrap();
    let last = h.manager.wait_settled(&lc, SETTLE).await.unwrap();

    assert_eq!(last.retry_count(), 2);
    assert_eq!(last.state(), Failed);
    assert!(!last.is_retry_requested());
    assert_eq!(last.origin(), lc.id());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.chain.submission_count(), 3);

    let archive = h.manager.archive().unwrap().clone();
    assert!(common::wait_for_archive(archive.clone(), lc.id(), 3).await);
    let retries: Vec<u32> = archive
        .read_lineage(lc.id())
        .await
        .iter()
        .map(|s| s.retry_count)
        .collect();
    assert_eq!(retries, vec![0, 1, 2]);

    // every attempt's log is a prefix of the next one
    let lineage = archive.read_lineage(lc.id()).await;
    for pair in lineage.windows(2) {
        let (a, b) = (&pair[0].history, &pair[1].history);
        assert_eq!(&b.entries()[..a.len()], a.entries());
    }
    h.manager.stop();
}

#[tokio::test]
async fn rejected_submission_resyncs_the_nonce() {
    let h = common::harness(common::fast_config());
    h.chain.reject_next_submission("nonce too low");
    let first = h.manager.submit(common::server_intent("first").build().unwrap()).unwrap();
    h.manager.wait_settled(&first, SETTLE).await.unwrap();
    assert_eq!(first.state_trace(), vec![ReadyToSend, Failed]);
    assert_eq!(first.last_error().as_deref(), Some("submission rejected: nonce too low"));
    assert!(first.tx_hash().is_none());
    assert!(!first.is_transaction_sent());

    let second = h.manager.submit(common::server_intent("second").build().unwrap()).unwrap();
    h.manager.wait_settled(&second, SETTLE).await.unwrap();
    assert_eq!(second.state(), Succeeded);
    assert_eq!(h.chain.submissions()[0].nonce, 0);
    h.manager.stop();
}
