//! Supervisor behaviour: concurrency, manual ticks, stop, archives and
//! pluggable step runners.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tx_lifecycle::chain::{JsonSigner, SimulatedChain};
use tx_lifecycle::providers::{FsHistoryArchive, HistoryArchive, InMemoryHistoryArchive};
use tx_lifecycle::runtime::step::{HistoryStepRunner, StepFuture, StepRunner};
use tx_lifecycle::LifecycleState::*;
use tx_lifecycle::{
    ChainHandle, IntentError, LifecycleState, MemoryLogSink, OperationLifecycle, OperationManager, WaitError,
};
mod common;

const SETTLE: Duration = Duration::from_secs(3);

#[tokio::test]
async fn concurrent_submissions_get_distinct_nonces() {
    let h = common::harness(common::fast_config());
    h.chain.set_mine_after_lookups(1);
    let lcs: Vec<_> = (0..12)
        .map(|i| {
            h.manager
                .submit(common::server_intent(&format!("op {i}")).build().unwrap())
                .unwrap()
        })
        .collect();
    let ids: std::collections::HashSet<_> = lcs.iter().map(|lc| lc.id()).collect();
    assert_eq!(ids.len(), 12);

    let settled = futures::future::join_all(lcs.iter().map(|lc| h.manager.wait_settled(lc, SETTLE))).await;
    for r in settled {
        assert_eq!(r.unwrap().state(), Succeeded);
    }
    let mut nonces: Vec<u64> = h.chain.submissions().iter().map(|t| t.nonce).collect();
    nonces.sort_unstable();
    assert_eq!(nonces, (0..12).collect::<Vec<_>>());
    let hashes: std::collections::HashSet<_> = lcs.iter().map(|lc| lc.tx_hash().unwrap()).collect();
    assert_eq!(hashes.len(), 12);
    assert_eq!(h.manager.active_count(), 0);
    h.manager.stop();
}

fn unstarted(chain: Arc<SimulatedChain>, config: tx_lifecycle::ManagerConfig) -> Arc<OperationManager> {
    OperationManager::builder(chain, Arc::new(JsonSigner::new(common::SERVER)), ChainHandle::new(1, "0xgame"))
        .config(config)
        .log_sink(Arc::new(MemoryLogSink::new()))
        .archive(Arc::new(InMemoryHistoryArchive::new()))
        .build()
}

#[tokio::test]
async fn manual_ticks_age_and_finalize() {
    let chain = Arc::new(SimulatedChain::new());
    chain.set_stalled(true);
    let config = common::fast_config()
        .with_tick_interval(Duration::from_millis(10))
        .with_timeout(Duration::from_millis(30));
    let manager = unstarted(chain.clone(), config);

    let lc = manager.submit(common::server_intent("aging").build().unwrap()).unwrap();
    assert!(common::wait_for(1_000, || lc.is_transaction_sent()).await);
    assert_eq!(manager.active().len(), 1);
    assert!(Arc::ptr_eq(&manager.get(lc.id()).unwrap(), &lc));

    for expected in [10, 20, 30] {
        manager.tick().await;
        assert_eq!(lc.elapsed_ms(), expected);
        assert!(!lc.is_timed_out());
    }
    manager.tick().await;
    assert!(lc.is_timed_out());
    assert!(lc.is_deleted());
    assert_eq!(manager.active_count(), 0);
    assert!(manager.get(lc.id()).is_none());

    // finalized lifecycles are never touched again
    manager.tick().await;
    assert_eq!(lc.elapsed_ms(), 40);
    manager.stop();
}

#[tokio::test]
async fn terminal_lifecycles_finalize_on_the_next_tick() {
    let chain = Arc::new(SimulatedChain::new());
    let manager = unstarted(chain, common::fast_config());
    let lc = manager.submit(common::server_intent("done").build().unwrap()).unwrap();
    assert!(common::wait_for_state(&lc, Succeeded, 1_000).await);
    assert!(!lc.is_deleted());
    assert_eq!(manager.active_count(), 1);

    manager.tick().await;
    assert!(lc.is_deleted());
    assert!(lc.is_settled());
    assert_eq!(manager.active_count(), 0);
    let archived = manager.archive().unwrap().read(lc.id()).await.unwrap();
    assert_eq!(archived.state, LifecycleState::Succeeded);
    assert_eq!(archived.history, lc.history());
    manager.stop();
}

#[tokio::test]
async fn stop_rejects_new_work_and_abandons_drivers() {
    let h = common::harness(common::fast_config());
    h.chain.set_stalled(true);
    let lc = h.manager.submit(common::server_intent("in flight").build().unwrap()).unwrap();
    assert!(common::wait_for(1_000, || lc.is_transaction_sent()).await);

    h.manager.stop();
    assert!(h.manager.is_stopped());
    let err = h
        .manager
        .submit(common::server_intent("too late").build().unwrap())
        .unwrap_err();
    assert_eq!(err, IntentError::ManagerStopped);

    // abandoned, not finalized
    assert_eq!(h.manager.active_count(), 1);
    assert!(!lc.is_deleted());
    let elapsed = lc.elapsed_ms();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(lc.elapsed_ms(), elapsed);
    assert_eq!(
        h.manager.wait_settled(&lc, Duration::from_millis(100)).await.unwrap_err(),
        WaitError::Other("operation manager is stopped".into())
    );
    assert_eq!(h.sink.matching("1 driver(s) abandoned").len(), 1);
}

#[tokio::test]
async fn wait_settled_times_out() {
    let h = common::harness(common::fast_config());
    let intent = common::server_intent("never ready")
        .check_prerequisites(|_lc| async { Ok(false) })
        .build()
        .unwrap();
    let lc = h.manager.submit(intent).unwrap();
    let err = h
        .manager
        .wait_settled(&lc, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err, WaitError::Timeout);
    assert!(Arc::ptr_eq(&h.manager.latest(lc.id()).unwrap(), &lc));
    h.manager.stop();
}

#[tokio::test]
async fn fs_archive_keeps_lineages_across_reopen() {
    let td = tempfile::tempdir().unwrap();
    let archive = Arc::new(FsHistoryArchive::new(td.path(), true)) as Arc<dyn HistoryArchive>;
    let a = archive.clone();
    let h = common::harness_with(common::fast_config(), move |b| b.archive(a));
    let lc = h.manager.submit(common::server_intent("archived").build().unwrap()).unwrap();
    h.manager.wait_settled(&lc, SETTLE).await.unwrap();
    assert!(common::wait_for_archive(archive.clone(), lc.origin(), 1).await);

    let snap = archive.read(lc.id()).await.unwrap();
    assert_eq!(snap.state, Succeeded);
    assert_eq!(snap.history, lc.history());
    assert_eq!(snap.tx_hash, lc.tx_hash());
    assert_eq!(snap.gas_used, Some(42_000));
    assert!(snap.is_deleted);
    h.manager.stop();

    let reopened = FsHistoryArchive::new(td.path(), false);
    assert_eq!(reopened.list().await, vec![lc.origin()]);
    assert_eq!(reopened.read_lineage(lc.origin()).await, vec![snap.clone()]);
    let dump = reopened.dump_all_pretty().await;
    assert!(dump.contains("lineage=lc-1"));
    assert!(dump.contains("FINALIZED in Succeeded"));
    assert!(reopened.store(&snap).await.is_err());
}

#[tokio::test]
async fn archiving_can_be_disabled() {
    let h = common::harness(common::fast_config().with_archive_on_finalize(false));
    let lc = h.manager.submit(common::server_intent("unarchived").build().unwrap()).unwrap();
    h.manager.wait_settled(&lc, SETTLE).await.unwrap();
    assert!(h.manager.archive().unwrap().list().await.is_empty());
    // the history dump still reaches the log sink
    assert!(!h.sink.matching("FINALIZED in Succeeded").is_empty());
    h.manager.stop();
}

#[tokio::test]
async fn nothing_is_archived_by_default() {
    let chain = Arc::new(SimulatedChain::new());
    let manager = OperationManager::builder(chain, Arc::new(JsonSigner::new(common::SERVER)), ChainHandle::new(1, "0xgame"))
        .config(common::fast_config())
        .log_sink(Arc::new(MemoryLogSink::new()))
        .build();
    assert!(manager.archive().is_none());
    manager.start();
    let lc = manager.submit(common::server_intent("transient").build().unwrap()).unwrap();
    let settled = manager.wait_settled(&lc, SETTLE).await.unwrap();
    assert_eq!(settled.state(), Succeeded);
    assert_eq!(manager.active_count(), 0);
    manager.stop();
}

struct CountingRunner {
    inner: HistoryStepRunner,
    steps: AtomicU32,
}

impl StepRunner for CountingRunner {
    fn run<'a>(&'a self, lifecycle: &'a OperationLifecycle, phase: LifecycleState, step: StepFuture<'a>) -> StepFuture<'a> {
        self.steps.fetch_add(1, Ordering::SeqCst);
        self.inner.run(lifecycle, phase, step)
    }
}

#[tokio::test]
async fn custom_step_runner_wraps_every_phase() {
    let runner = Arc::new(CountingRunner {
        inner: HistoryStepRunner::new(Arc::new(MemoryLogSink::new())),
        steps: AtomicU32::new(0),
    });
    let r = runner.clone();
    let h = common::harness_with(common::fast_config(), move |b| b.step_runner(r));
    let lc = h.manager.submit(common::server_intent("counted").build().unwrap()).unwrap();
    h.manager.wait_settled(&lc, SETTLE).await.unwrap();
    // ReadyToSend + one RawTransactionCheck
    assert_eq!(runner.steps.load(Ordering::SeqCst), 2);
    assert_eq!(common::phase_messages(&lc, "ReadyToSend")[0], "BEGIN");
    h.manager.stop();
}
