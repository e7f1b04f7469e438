#![allow(dead_code)]
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tx_lifecycle::chain::{JsonSigner, SimulatedChain};
use tx_lifecycle::intent::JsonPayload;
use tx_lifecycle::providers::{HistoryArchive, InMemoryHistoryArchive};
use tx_lifecycle::{
    ChainHandle, LifecycleState, ManagerConfig, MemoryLogSink, OperationIntent, OperationIntentBuilder,
    OperationLifecycle, OperationManager, PendingCall,
};

pub const SERVER: &str = "0xserver";

/// Short intervals so lifecycles settle within a few hundred milliseconds.
pub fn fast_config() -> ManagerConfig {
    ManagerConfig::default()
        .with_tick_interval(Duration::from_millis(10))
        .with_step_interval(Duration::from_millis(5))
        .with_timeout(Duration::from_secs(5))
        .with_max_retries(2)
}

pub struct Harness {
    pub chain: Arc<SimulatedChain>,
    pub sink: Arc<MemoryLogSink>,
    pub manager: Arc<OperationManager>,
}

pub fn harness(config: ManagerConfig) -> Harness {
    harness_with(config, |b| b)
}

/// Like `harness` but lets the caller adjust the builder (archive, runner).
/// Lifecycles are archived in memory unless `f` installs another archive.
pub fn harness_with(
    config: ManagerConfig,
    f: impl FnOnce(tx_lifecycle::runtime::OperationManagerBuilder) -> tx_lifecycle::runtime::OperationManagerBuilder,
) -> Harness {
    let chain = Arc::new(SimulatedChain::new());
    let sink = Arc::new(MemoryLogSink::new());
    let builder = OperationManager::builder(
        chain.clone(),
        Arc::new(JsonSigner::new(SERVER)),
        ChainHandle::new(31337, "0xgame"),
    )
    .config(config)
    .log_sink(sink.clone())
    .archive(Arc::new(InMemoryHistoryArchive::new()));
    let manager = f(builder).build();
    manager.start();
    Harness { chain, sink, manager }
}

/// Server-submitted intent calling `0xgame` with a JSON payload.
pub fn server_intent(description: &str) -> OperationIntentBuilder {
    OperationIntent::builder(description)
        .payload(JsonPayload::new(json!({"gameId": 7})).require("gameId"))
        .build_call(|h| Ok(PendingCall::new(h.contract.clone(), vec![0xca, 0xfe])))
}

/// Poll `pred` until it holds or `timeout_ms` elapses.
pub async fn wait_for(timeout_ms: u64, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if pred() {
            return true;
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state(lc: &Arc<OperationLifecycle>, state: LifecycleState, timeout_ms: u64) -> bool {
    wait_for(timeout_ms, || lc.state() == state).await
}

/// Poll the archive until `origin` has `attempts` snapshots stored.
pub async fn wait_for_archive(archive: Arc<dyn HistoryArchive>, origin: tx_lifecycle::LifecycleId, attempts: usize) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if archive.read_lineage(origin).await.len() >= attempts {
            return true;
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Messages recorded under `phase`, in order.
pub fn phase_messages(lc: &OperationLifecycle, phase: &str) -> Vec<String> {
    lc.history()
        .entries()
        .iter()
        .filter(|e| e.phase == phase)
        .map(|e| e.message.clone())
        .collect()
}
