//! Scheduled dispatch cycles
//!
//! A cycle fetches one page of eligible records, splits it into sub-batches
//! and sends them through the [`BatchDispatcher`] on a bounded set of worker
//! tasks. At most one cycle runs at a time; a trigger that finds a cycle in
//! progress returns immediately without touching storage.

mod guard;

use std::sync::Arc;

use postbag_common::{
    Signal, cycle, internal,
    tracing::{error, warn},
};
use postbag_metrics::DispatchMetrics;
use tokio::{sync::broadcast, task::JoinSet, time::Instant};

pub use self::guard::{FlightPermit, SingleFlight};
use crate::{
    config::DispatchConfig,
    dispatcher::{BatchDispatcher, BatchOutcome},
    error::DispatchError,
    record::{BatchId, MessageRecord, MessageStatus},
    store::MessageStore,
    transport::Transport,
};

/// Totals across every sub-batch of one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub batch_id: BatchId,
    /// Sub-batches run
    pub batches: u64,
    pub attempted: u64,
    pub sent: u64,
    pub retrying: u64,
    pub failed: u64,
    pub skipped: u64,
    pub update_errors: u64,
    pub restored: u64,
    /// Sub-batches rejected by an open circuit breaker
    pub short_circuited: u64,
    /// Sub-batches whose transport call failed as a whole
    pub transport_errors: u64,
    /// Sub-batch tasks that panicked
    pub panicked: u64,
}

impl CycleSummary {
    #[must_use]
    pub const fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            batches: 0,
            attempted: 0,
            sent: 0,
            retrying: 0,
            failed: 0,
            skipped: 0,
            update_errors: 0,
            restored: 0,
            short_circuited: 0,
            transport_errors: 0,
            panicked: 0,
        }
    }

    fn absorb(&mut self, outcome: &BatchOutcome) {
        self.batches += 1;
        self.attempted += outcome.attempted;
        self.sent += outcome.sent;
        self.retrying += outcome.retrying;
        self.failed += outcome.failed;
        self.skipped += outcome.skipped;
        self.update_errors += outcome.update_errors;
        self.restored += outcome.restored;
        self.short_circuited += u64::from(outcome.short_circuited);
        self.transport_errors += u64::from(outcome.transport_error.is_some());
    }
}

/// Result of one call to [`Scheduler::trigger`]
#[derive(Debug)]
pub enum CycleReport {
    /// Another cycle held the guard; nothing was done
    Skipped,
    /// No eligible records
    Idle,
    Completed(CycleSummary),
    /// The eligible page could not be fetched
    Failed(DispatchError),
}

impl CycleReport {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Idle => "idle",
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
        }
    }

    #[must_use]
    pub const fn summary(&self) -> Option<&CycleSummary> {
        match self {
            Self::Completed(summary) => Some(summary),
            _ => None,
        }
    }
}

/// Drives dispatch cycles on a fixed interval
pub struct Scheduler {
    config: DispatchConfig,
    store: Arc<dyn MessageStore>,
    dispatcher: Arc<BatchDispatcher>,
    flight: SingleFlight,
    metrics: Option<Arc<DispatchMetrics>>,
}

impl Scheduler {
    /// Build a scheduler and its dispatcher
    ///
    /// # Errors
    /// Returns [`DispatchError::Configuration`] if `config` is invalid
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
        metrics: Option<Arc<DispatchMetrics>>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;

        let mut dispatcher = BatchDispatcher::new(&config, Arc::clone(&store), transport);
        if let Some(metrics) = &metrics {
            dispatcher = dispatcher.with_metrics(Arc::clone(metrics));
        }

        Ok(Self {
            config,
            store,
            dispatcher: Arc::new(dispatcher),
            flight: SingleFlight::new(),
            metrics,
        })
    }

    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &BatchDispatcher {
        &self.dispatcher
    }

    /// Whether a cycle currently holds the guard
    pub fn is_running(&self) -> bool {
        self.flight.is_active()
    }

    /// Run one dispatch cycle unless one is already running
    ///
    /// Never waits for the guard. Errors are logged and reported, never
    /// propagated.
    pub async fn trigger(&self) -> CycleReport {
        let Some(_permit) = self.flight.try_acquire() else {
            cycle!(
                level = INFO,
                "Dispatch cycle already in progress, skipping trigger"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_skipped_cycle();
            }
            return CycleReport::Skipped;
        };

        let started = Instant::now();
        let report = self.run_cycle().await;

        if let Some(metrics) = &self.metrics {
            metrics.record_cycle(report.as_str(), started.elapsed().as_secs_f64());
        }

        report
    }

    async fn run_cycle(&self) -> CycleReport {
        let batch_id = BatchId::generate();

        let page = match self
            .store
            .find_eligible(&MessageStatus::ELIGIBLE, self.config.page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                error!(batch_id = %batch_id, error = %e, "Failed to fetch eligible messages");
                return CycleReport::Failed(e.into());
            }
        };

        if page.is_empty() {
            cycle!("No eligible messages");
            return CycleReport::Idle;
        }

        cycle!(
            level = INFO,
            batch_id = %batch_id,
            count = page.len(),
            workers = self.config.worker_pool_size,
            "Dispatching eligible messages"
        );

        let mut summary = CycleSummary::new(batch_id);
        let mut join_set: JoinSet<BatchOutcome> = JoinSet::new();
        let mut pending = page
            .chunks(self.config.chunk_size())
            .map(<[MessageRecord]>::to_vec)
            .collect::<Vec<_>>()
            .into_iter();

        // Spawn initial set of sub-batches (up to worker_pool_size)
        for chunk in pending.by_ref().take(self.config.worker_pool_size) {
            self.spawn_batch(&mut join_set, batch_id, chunk);
        }

        // As sub-batches complete, spawn the next one
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(outcome) => summary.absorb(&outcome),
                Err(e) => {
                    error!(batch_id = %batch_id, error = %e, "Dispatch task failed");
                    summary.panicked += 1;
                }
            }

            if let Some(chunk) = pending.next() {
                self.spawn_batch(&mut join_set, batch_id, chunk);
            }
        }

        cycle!(
            level = INFO,
            batch_id = %batch_id,
            sent = summary.sent,
            retrying = summary.retrying,
            failed = summary.failed,
            restored = summary.restored,
            short_circuited = summary.short_circuited,
            update_errors = summary.update_errors,
            "Dispatch cycle complete"
        );

        CycleReport::Completed(summary)
    }

    fn spawn_batch(
        &self,
        join_set: &mut JoinSet<BatchOutcome>,
        batch_id: BatchId,
        records: Vec<MessageRecord>,
    ) {
        let dispatcher = Arc::clone(&self.dispatcher);
        join_set.spawn(async move { dispatcher.dispatch(batch_id, records).await });
    }

    /// Trigger cycles on the configured interval until shutdown
    ///
    /// Ticks are fixed-rate. Each tick spawns its cycle, so a cycle that
    /// outlasts the interval turns the next tick into a skipped trigger
    /// instead of delaying it.
    ///
    /// ## Graceful Shutdown
    ///
    /// When a shutdown signal is received:
    /// 1. Stop triggering new cycles
    /// 2. Wait for every spawned cycle to finish (up to `shutdown_timeout_secs`)
    /// 3. Exit cleanly
    ///
    /// Cycles still running at the timeout are aborted. Their records keep
    /// whatever state their last completed update gave them and are picked
    /// up after restart.
    pub async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        if !self.config.enabled {
            internal!(level = INFO, "Dispatch scheduler disabled");
            return;
        }

        internal!(
            level = INFO,
            interval_secs = self.config.interval_secs,
            initial_delay_secs = self.config.initial_delay_secs,
            page_size = self.config.page_size,
            "Dispatch scheduler starting"
        );

        tokio::select! {
            () = tokio::time::sleep(self.config.initial_delay()) => {}
            sig = shutdown.recv() => {
                internal!(level = INFO, ?sig, "Dispatch scheduler stopped before first cycle");
                return;
            }
        }

        let mut timer = tokio::time::interval(self.config.interval());
        let mut cycles = JoinSet::new();

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let scheduler = Arc::clone(&self);
                    cycles.spawn(async move {
                        if let CycleReport::Failed(e) = scheduler.trigger().await {
                            error!(error = %e, "Dispatch cycle failed");
                        }
                    });
                }
                Some(result) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "Dispatch cycle task failed");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Dispatch scheduler received shutdown signal");
                        }
                        Err(e) => {
                            error!("Dispatch scheduler shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        self.drain(cycles).await;
        internal!(level = INFO, "Dispatch scheduler shutdown complete");
    }

    /// Wait for spawned cycles, bounded by the shutdown timeout
    async fn drain(&self, mut cycles: JoinSet<()>) {
        let timeout = self.config.shutdown_timeout();

        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = cycles.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Dispatch cycle task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                timeout_secs = timeout.as_secs(),
                remaining = cycles.len(),
                "Shutdown timeout exceeded, abandoning in-flight dispatch cycle"
            );
            cycles.shutdown().await;
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("flight", &self.flight)
            .finish_non_exhaustive()
    }
}
