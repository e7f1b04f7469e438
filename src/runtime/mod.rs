use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod config;
pub mod lifecycle;
pub mod registry;
pub mod step;

use crate::chain::{ChainClient, ChainContext, ChainHandle, TransactionSigner};
use crate::error::{IntentError, WaitError};
use crate::history::{Clock, HistoryLog, SystemClock};
use crate::intent::OperationIntent;
use crate::logging::{LogLevel, LogSink, TracingLogSink};
use crate::providers::HistoryArchive;
use crate::{LifecycleId, LifecycleState};
use config::ManagerConfig;
use lifecycle::{DriverEnv, OperationLifecycle};
use registry::LifecycleRegistry;
use step::{HistoryStepRunner, StepRunner};

/// Supervisor for every in-flight operation.
///
/// `submit` starts a lifecycle's driver loop and returns immediately. A
/// background tick (see [`OperationManager::start`]) ages submitted
/// lifecycles, times them out, finalizes terminal ones and turns retry
/// requests into fresh lifecycles that carry the previous history forward.
pub struct OperationManager {
    config: ManagerConfig,
    env: Arc<DriverEnv>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn LogSink>,
    archive: Option<Arc<dyn HistoryArchive>>,
    registry: LifecycleRegistry,
    next_id: AtomicU64,
    // single-flight guard for tick
    busy: AtomicBool,
    stopped: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

pub struct OperationManagerBuilder {
    chain: ChainContext,
    config: ManagerConfig,
    sink: Option<Arc<dyn LogSink>>,
    clock: Option<Arc<dyn Clock>>,
    archive: Option<Arc<dyn HistoryArchive>>,
    step_runner: Option<Arc<dyn StepRunner>>,
}

impl OperationManagerBuilder {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Where finalized snapshots go. Nothing is archived unless one is set.
    pub fn archive(mut self, archive: Arc<dyn HistoryArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Replace the runner wrapping every phase. Defaults to `HistoryStepRunner`.
    pub fn step_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.step_runner = Some(runner);
        self
    }

    pub fn build(self) -> Arc<OperationManager> {
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingLogSink));
        let runner = self
            .step_runner
            .unwrap_or_else(|| Arc::new(HistoryStepRunner::new(sink.clone())));
        let env = Arc::new(DriverEnv {
            chain: self.chain,
            runner,
            sink: sink.clone(),
            step_interval: self.config.step_interval,
            max_retries: self.config.max_retries,
        });
        Arc::new(OperationManager {
            config: self.config,
            env,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            sink,
            archive: self.archive,
            registry: LifecycleRegistry::new(),
            next_id: AtomicU64::new(1),
            busy: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            ticker: Mutex::new(None),
        })
    }
}

/// Releases the busy flag even if the tick body panics.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OperationManager {
    pub fn builder(
        client: Arc<dyn ChainClient>,
        signer: Arc<dyn TransactionSigner>,
        handle: ChainHandle,
    ) -> OperationManagerBuilder {
        OperationManagerBuilder {
            chain: ChainContext::new(client, signer, handle),
            config: ManagerConfig::default(),
            sink: None,
            clock: None,
            archive: None,
            step_runner: None,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn archive(&self) -> Option<&Arc<dyn HistoryArchive>> {
        self.archive.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Start the background tick. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        crate::logging::init_tracing();
        let mut ticker = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if ticker.is_some() || self.is_stopped() {
            return;
        }
        let me = self.clone();
        let period = self.config.tick_interval;
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if me.is_stopped() {
                    break;
                }
                // a bug in one tick must not stop aging
                let body = me.clone();
                if let Err(e) = tokio::spawn(async move { body.tick().await }).await {
                    error!(error = %e, "tick failed");
                    me.sink.emit(LogLevel::Error, &format!("tick failed: {e}"));
                }
            }
        }));
        info!(tick_ms = period.as_millis() as u64, "operation manager started");
    }

    /// Stop ticking and abandon every in-flight driver loop. Lifecycles stay
    /// registered for inspection; `submit` is rejected from now on.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(t) = self.ticker.lock().unwrap_or_else(|p| p.into_inner()).take() {
            t.abort();
        }
        let aborted = self.registry.abort_all();
        info!(aborted, "operation manager stopped");
        self.sink
            .emit(LogLevel::Info, &format!("operation manager stopped; {aborted} driver(s) abandoned"));
    }

    /// Stop on the first Ctrl-C.
    pub fn stop_on_ctrl_c(self: &Arc<Self>) -> JoinHandle<()> {
        let me = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => me.stop(),
                Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
            }
        })
    }

    fn allocate_id(&self) -> LifecycleId {
        LifecycleId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Validate `intent`, create its lifecycle and start driving it.
    /// Must be called from within a tokio runtime; never waits on the chain.
    pub fn submit(&self, intent: OperationIntent) -> Result<Arc<OperationLifecycle>, IntentError> {
        if self.is_stopped() {
            return Err(IntentError::ManagerStopped);
        }
        intent.validate()?;
        let id = self.allocate_id();
        let lc = Arc::new(OperationLifecycle::new(
            id,
            id,
            intent,
            self.clock.clone(),
            0,
            HistoryLog::new(),
        ));
        info!(lifecycle = %id, description = %lc.intent().description(), state = ?lc.state(), "submitted");
        self.launch(lc.clone());
        Ok(lc)
    }

    fn launch(&self, lc: Arc<OperationLifecycle>) {
        self.registry.insert(lc.clone());
        let driver = tokio::spawn(lc.clone().drive(self.env.clone()));
        self.registry.attach_driver(lc.id(), driver);
    }

    /// One aging pass. Skipped when another pass is still running.
    pub async fn tick(&self) {
        if self.is_stopped() {
            return;
        }
        if self.busy.swap(true, Ordering::AcqRel) {
            debug!("tick skipped: previous tick still running");
            return;
        }
        let _guard = BusyGuard(&self.busy);

        let tick_ms = self.config.tick_ms();
        let timeout_ms = self.config.timeout_ms();
        let mut retries = Vec::new();

        for lc in self.registry.snapshot() {
            if lc.is_deleted() {
                continue;
            }
            if lc.is_retry_requested() {
                self.finalize(&lc).await;
                retries.push(lc);
                continue;
            }
            let state = lc.state();
            if state.is_terminal() {
                // the driver is still recording its retry decision
                if state == LifecycleState::Failed && !lc.is_error_resolved() {
                    continue;
                }
                self.finalize(&lc).await;
                continue;
            }
            if lc.age(tick_ms, timeout_ms) {
                warn!(lifecycle = %lc.id(), %state, elapsed_ms = lc.elapsed_ms(), "lifecycle timed out");
                self.sink.emit(
                    LogLevel::Warn,
                    &format!(
                        "{} '{}' timed out in {state} after {} ms",
                        lc.id(),
                        lc.intent().description(),
                        lc.elapsed_ms()
                    ),
                );
                let retry = lc.resolve_error(self.config.max_retries, self.sink.as_ref());
                if !lc.is_error_resolved() {
                    // the driver claimed the failure first; finalize once it decides
                    continue;
                }
                self.finalize(&lc).await;
                if retry {
                    retries.push(lc);
                }
            }
        }

        for old in retries {
            self.spawn_retry(&old);
        }
    }

    /// Mark `lc` deleted, dump its history, archive it and forget it.
    async fn finalize(&self, lc: &Arc<OperationLifecycle>) {
        if !lc.mark_deleted() {
            return;
        }
        let snap = lc.snapshot();
        let level = if snap.state == LifecycleState::Succeeded {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        self.sink.emit(
            level,
            &format!(
                "{} '{}' finalized in {} after {} ms (retry {}, {} history entries)",
                snap.id,
                snap.description,
                snap.state,
                snap.duration_ms,
                snap.retry_count,
                snap.history.len()
            ),
        );
        for line in snap.history.render() {
            self.sink.emit(LogLevel::Info, &format!("{}   {line}", snap.id));
        }
        if self.config.archive_on_finalize {
            if let Some(archive) = &self.archive {
                if let Err(e) = archive.store(&snap).await {
                    warn!(lifecycle = %snap.id, error = %e, "archiving failed");
                }
            }
        }
        self.registry.remove(lc.id());
        if !snap.is_retry_requested {
            self.registry.prune_lineage(lc.id());
        }
        debug!(lifecycle = %snap.id, state = %snap.state, "finalized");
    }

    /// Replace a finalized lifecycle with a fresh attempt of the same intent.
    fn spawn_retry(&self, old: &Arc<OperationLifecycle>) {
        let id = self.allocate_id();
        let lc = Arc::new(OperationLifecycle::new(
            id,
            old.origin(),
            old.intent().clone(),
            self.clock.clone(),
            old.retry_count() + 1,
            old.history(),
        ));
        old.set_successor(lc.clone());
        self.registry.link_retry(old.id(), id);
        info!(lifecycle = %id, previous = %old.id(), retry = lc.retry_count(), "retrying");
        self.sink.emit(
            LogLevel::Info,
            &format!(
                "{} '{}' retry {} of {} as {id}",
                old.id(),
                old.intent().description(),
                lc.retry_count(),
                self.config.max_retries
            ),
        );
        self.launch(lc);
    }

    /// Registered (not yet finalized) lifecycles, ordered by id.
    pub fn active(&self) -> Vec<Arc<OperationLifecycle>> {
        self.registry.snapshot()
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub fn get(&self, id: LifecycleId) -> Option<Arc<OperationLifecycle>> {
        self.registry.get(id)
    }

    /// The registered attempt that replaced `id` through retries, or `id` itself.
    pub fn latest(&self, id: LifecycleId) -> Option<Arc<OperationLifecycle>> {
        self.registry.get(self.registry.latest_id(id))
    }

    /// Wait until the latest attempt of `lc` is finalized for good, following
    /// retries, or the timeout elapses.
    pub async fn wait_settled(
        &self,
        lc: &Arc<OperationLifecycle>,
        timeout: Duration,
    ) -> Result<Arc<OperationLifecycle>, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        // poll with backoff
        let mut delay_ms: u64 = 5;
        loop {
            let latest = lc.latest_attempt();
            if latest.is_settled() && self.registry.get(latest.id()).is_none() {
                return Ok(latest);
            }
            if std::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            if self.is_stopped() {
                return Err(WaitError::Other("operation manager is stopped".into()));
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms.saturating_mul(2)).min(100);
        }
    }
}
