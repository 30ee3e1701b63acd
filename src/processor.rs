// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use prometheus::Registry;
use tracing::info;

use crate::{
    EventHandlerInvoker,
    errors::{ProcessorError, ProcessorResult},
    launcher::Launcher,
    metrics::TrackingMetrics,
    monitor::{ErrorHandler, MessageMonitor, NoopMessageMonitor, PropagatingErrorHandler},
    state::{ProcessorState, TrackingState},
    stream::MessageSource,
    token::{ReplayToken, TrackingToken},
    token_store::TokenStore,
    transaction::{NoTransactionManager, TransactionManager, in_transaction},
    worker_pool::WorkerPool,
};

/// Granularity at which sleeping loops re-check the lifecycle state.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Whether a propagated handler error rolls the unit of work back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackPolicy {
    /// Roll back: neither handler side effects nor the token advance of the
    /// failed batch survive, and the batch is redelivered.
    #[default]
    AnyError,
    /// Commit what succeeded, token advance included; the failed event is
    /// skipped on redelivery.
    Never,
}

/// Tuning knobs of a [`TrackingProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Maximum number of events handled per transactional batch. Events
    /// sharing one tracking token (upcast groups) commit together and may
    /// push a batch past this bound.
    ///
    /// Default: 1.
    pub batch_size: usize,
    /// Number of segments created when the token store holds none at
    /// startup. Zero disables initialization.
    ///
    /// Default: 1.
    pub initial_segment_count: u32,
    /// Upper bound on concurrently processed segments per node, the worker
    /// running on the launcher task included.
    ///
    /// Default: 1.
    pub max_worker_count: usize,
    /// How long a quiet stream is polled for an event before the claim is
    /// refreshed instead.
    ///
    /// Default: 1 second.
    pub event_availability_timeout: Duration,
    /// Pause between the launcher's claim sweeps when every claimable
    /// segment is taken.
    ///
    /// Default: 5 seconds.
    pub token_claim_interval: Duration,
    /// What a propagated handler error does to the running batch.
    ///
    /// Default: [`RollbackPolicy::AnyError`].
    pub rollback_policy: RollbackPolicy,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            initial_segment_count: 1,
            max_worker_count: 1,
            event_availability_timeout: Duration::from_secs(1),
            token_claim_interval: Duration::from_secs(5),
            rollback_policy: RollbackPolicy::default(),
        }
    }
}

/// Event processor tracking its progress through tokens in a [`TokenStore`].
///
/// The processor partitions the stream into segments and claims each segment
/// through the store before processing it, so any number of nodes sharing a
/// store divide the segments among themselves without double-processing.
/// Within one segment events are dispatched and committed in stream order;
/// across segments there is no ordering.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use async_trait::async_trait;
/// use event_tracking_core::{
///     EventHandlerInvoker, InMemoryMessageSource, InMemoryTokenStore, ProcessorError,
///     ProcessorOptions, Segment, TrackedEventMessage, TrackingProcessor,
/// };
///
/// struct Projector;
///
/// #[async_trait]
/// impl EventHandlerInvoker for Projector {
///     type Error = ProcessorError;
///
///     async fn handle(
///         &self,
///         event: &TrackedEventMessage,
///         _segment: &Segment,
///     ) -> Result<(), Self::Error> {
///         println!("projecting event {}", event.identifier);
///         Ok(())
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let source = InMemoryMessageSource::new();
///     let store = InMemoryTokenStore::new("node-1");
///     let processor = TrackingProcessor::new(
///         "projector",
///         Projector,
///         Arc::new(source.clone()),
///         Arc::new(store),
///         ProcessorOptions::default(),
///     );
///     processor.start();
///     // ... publish events through `source` ...
///     processor.shut_down().await;
/// }
/// ```
pub struct TrackingProcessor<I: EventHandlerInvoker> {
    context: Arc<ProcessorContext<I>>,
}

impl<I: EventHandlerInvoker + 'static> TrackingProcessor<I> {
    /// A processor with default collaborators: no transaction manager, the
    /// propagating error handler, no monitor, and metrics on a private
    /// registry. Use [`builder`](TrackingProcessor::builder) to swap any of
    /// them.
    pub fn new(
        name: impl Into<String>,
        invoker: I,
        source: Arc<dyn MessageSource>,
        token_store: Arc<dyn TokenStore>,
        options: ProcessorOptions,
    ) -> Self {
        Self::builder(name, invoker, source, token_store)
            .options(options)
            .build()
    }

    pub fn builder(
        name: impl Into<String>,
        invoker: I,
        source: Arc<dyn MessageSource>,
        token_store: Arc<dyn TokenStore>,
    ) -> TrackingProcessorBuilder<I> {
        TrackingProcessorBuilder {
            name: name.into(),
            invoker,
            source,
            token_store,
            options: ProcessorOptions::default(),
            transactions: Arc::new(NoTransactionManager),
            error_handler: Arc::new(PropagatingErrorHandler),
            monitor: Arc::new(NoopMessageMonitor),
            metrics: None,
        }
    }

    /// Moves the processor to `Started` and, unless it was already running,
    /// spawns the segment launcher. Must be called within a Tokio runtime.
    pub fn start(&self) {
        let previous = self.context.state.set(TrackingState::Started);
        if previous == TrackingState::Started {
            return;
        }
        info!("Starting tracking processor `{}`", self.context.name);
        let launcher = Launcher::new(self.context.clone());
        self.context.pool.spawn(launcher.run());
    }

    /// Requests shutdown and waits for every launcher and worker task to
    /// exit. Claims are released on the way out.
    pub async fn shut_down(&self) {
        let previous = self.context.state.set(TrackingState::ShutDown);
        if previous != TrackingState::ShutDown {
            info!("Shutting down tracking processor `{}`", self.context.name);
        }
        self.context.pool.wait_idle().await;
    }

    pub fn is_running(&self) -> bool {
        self.context.state.is_running()
    }

    /// Whether the processor paused itself after an unrecoverable error.
    pub fn is_error(&self) -> bool {
        self.context.state.load() == TrackingState::PausedError
    }

    pub fn state(&self) -> TrackingState {
        self.context.state.load()
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    /// Ids of the segments this node currently processes.
    pub fn active_segments(&self) -> Vec<u32> {
        self.context.active_segment_ids()
    }

    pub fn active_segment_count(&self) -> usize {
        self.context.active_segment_count()
    }

    /// Live launcher and worker tasks.
    pub fn active_processor_tasks(&self) -> usize {
        self.context.pool.live_count()
    }

    /// Rewinds every segment to the beginning of the stream for a replay.
    ///
    /// Each stored token is wrapped in a replay marker carrying the position
    /// the segment had reached, so handlers can distinguish redeliveries
    /// until the stream catches back up. Requires an invoker that supports
    /// reset, and a processor that is neither running nor still winding down
    /// workers. Runs in one transaction: either every segment is rewound or
    /// none is.
    pub async fn reset_tokens(&self) -> ProcessorResult<()> {
        if !self.context.invoker.supports_reset() {
            return Err(ProcessorError::ResetNotSupported);
        }
        if self.context.state.is_running() || self.context.active_segment_count() > 0 {
            return Err(ProcessorError::ResetRejected);
        }
        info!("Resetting tokens of tracking processor `{}`", self.context.name);
        let context = &self.context;
        in_transaction(context.transactions.as_ref(), async {
            let store = context.token_store.as_ref();
            let segment_ids = store.fetch_segments(&context.name).await?;
            let mut tokens = Vec::with_capacity(segment_ids.len());
            for segment_id in &segment_ids {
                tokens.push(store.fetch_token(&context.name, *segment_id).await?);
            }
            context
                .invoker
                .perform_reset()
                .await
                .map_err(|err| ProcessorError::EventHandling(err.to_string()))?;
            for (segment_id, token) in segment_ids.iter().zip(tokens) {
                if let Some(token) = token {
                    store
                        .store_token(&ReplayToken::wrap(token), &context.name, *segment_id)
                        .await?;
                }
                store.release_claim(&context.name, *segment_id).await?;
            }
            Ok(())
        })
        .await
    }
}

/// Assembles a [`TrackingProcessor`] with non-default collaborators.
pub struct TrackingProcessorBuilder<I: EventHandlerInvoker> {
    name: String,
    invoker: I,
    source: Arc<dyn MessageSource>,
    token_store: Arc<dyn TokenStore>,
    options: ProcessorOptions,
    transactions: Arc<dyn TransactionManager>,
    error_handler: Arc<dyn ErrorHandler>,
    monitor: Arc<dyn MessageMonitor>,
    metrics: Option<TrackingMetrics>,
}

impl<I: EventHandlerInvoker + 'static> TrackingProcessorBuilder<I> {
    pub fn options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn transaction_manager(mut self, transactions: Arc<dyn TransactionManager>) -> Self {
        self.transactions = transactions;
        self
    }

    pub fn error_handler(mut self, error_handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = error_handler;
        self
    }

    pub fn message_monitor(mut self, monitor: Arc<dyn MessageMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn metrics(mut self, metrics: TrackingMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> TrackingProcessor<I> {
        let pool = WorkerPool::new();
        TrackingProcessor {
            context: Arc::new(ProcessorContext {
                name: self.name,
                options: self.options,
                state: ProcessorState::new(),
                active_segments: Mutex::new(BTreeSet::new()),
                pool,
                source: self.source,
                token_store: self.token_store,
                transactions: self.transactions,
                invoker: Arc::new(self.invoker),
                error_handler: self.error_handler,
                monitor: self.monitor,
                metrics: self
                    .metrics
                    .unwrap_or_else(|| TrackingMetrics::new(&Registry::new())),
            }),
        }
    }
}

/// Everything the launcher and the segment workers share.
pub(crate) struct ProcessorContext<I> {
    pub(crate) name: String,
    pub(crate) options: ProcessorOptions,
    pub(crate) state: ProcessorState,
    active_segments: Mutex<BTreeSet<u32>>,
    pub(crate) pool: WorkerPool,
    pub(crate) source: Arc<dyn MessageSource>,
    pub(crate) token_store: Arc<dyn TokenStore>,
    pub(crate) transactions: Arc<dyn TransactionManager>,
    pub(crate) invoker: Arc<I>,
    pub(crate) error_handler: Arc<dyn ErrorHandler>,
    pub(crate) monitor: Arc<dyn MessageMonitor>,
    pub(crate) metrics: TrackingMetrics,
}

impl<I: EventHandlerInvoker> ProcessorContext<I> {
    /// Registers a segment as actively processed. `false` when it already
    /// was, in which case the caller must not touch its claim.
    pub(crate) fn add_active_segment(&self, segment_id: u32) -> bool {
        let mut active = self.lock_active_segments();
        let added = active.insert(segment_id);
        let count = active.len();
        drop(active);
        if added {
            self.set_active_segments_gauge(count);
        }
        added
    }

    pub(crate) fn remove_active_segment(&self, segment_id: u32) {
        let mut active = self.lock_active_segments();
        active.remove(&segment_id);
        let count = active.len();
        drop(active);
        self.set_active_segments_gauge(count);
    }

    pub(crate) fn active_segment_count(&self) -> usize {
        self.lock_active_segments().len()
    }

    pub(crate) fn active_segment_ids(&self) -> Vec<u32> {
        self.lock_active_segments().iter().copied().collect()
    }

    /// Sleeps in short slices, returning early once the processor stops
    /// running.
    pub(crate) async fn sleep_while_running(&self, duration: Duration) {
        let mut remaining = duration;
        while !remaining.is_zero() && self.state.is_running() {
            let slice = remaining.min(SLEEP_SLICE);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
    }

    /// Fetches (and thereby claims) the segment's token in a transaction.
    pub(crate) async fn claim_token(
        &self,
        segment_id: u32,
    ) -> ProcessorResult<Option<TrackingToken>> {
        in_transaction(self.transactions.as_ref(), async {
            Ok(self.token_store.fetch_token(&self.name, segment_id).await?)
        })
        .await
    }

    pub(crate) async fn extend_claim(&self, segment_id: u32) -> ProcessorResult<()> {
        in_transaction(self.transactions.as_ref(), async {
            Ok(self.token_store.extend_claim(&self.name, segment_id).await?)
        })
        .await
    }

    pub(crate) async fn store_token(
        &self,
        token: &TrackingToken,
        segment_id: u32,
    ) -> ProcessorResult<()> {
        in_transaction(self.transactions.as_ref(), async {
            Ok(self
                .token_store
                .store_token(token, &self.name, segment_id)
                .await?)
        })
        .await
    }

    pub(crate) async fn release_claim(&self, segment_id: u32) -> ProcessorResult<()> {
        in_transaction(self.transactions.as_ref(), async {
            Ok(self
                .token_store
                .release_claim(&self.name, segment_id)
                .await?)
        })
        .await
    }

    pub(crate) fn record_token_position(&self, segment_id: u32, token: &TrackingToken) {
        if let Some(position) = token.position() {
            self.metrics
                .tracked_token_position
                .with_label_values(&[&self.name, &segment_id.to_string()])
                .set(position as i64);
        }
    }

    fn set_active_segments_gauge(&self, count: usize) {
        self.metrics
            .active_segments
            .with_label_values(&[&self.name])
            .set(count as i64);
    }

    fn lock_active_segments(&self) -> std::sync::MutexGuard<'_, BTreeSet<u32>> {
        self.active_segments
            .lock()
            .expect("active segment lock poisoned")
    }
}
