// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::{
    EventHandlerInvoker,
    errors::ProcessorResult,
    processor::ProcessorContext,
    segment::Segment,
    transaction::in_transaction,
    worker::SegmentWorker,
};

/// Discovers segments, claims their tokens and dispatches segment workers.
///
/// One launcher task runs per started processor. It sweeps the token store
/// for claimable segments until the processor stops; when dispatching the
/// last worker the pool can hold, the launcher becomes that worker itself
/// instead of spawning one more task.
pub(crate) struct Launcher<I: EventHandlerInvoker> {
    context: Arc<ProcessorContext<I>>,
}

impl<I: EventHandlerInvoker + 'static> Launcher<I> {
    pub(crate) fn new(context: Arc<ProcessorContext<I>>) -> Self {
        Self { context }
    }

    pub(crate) async fn run(self) {
        let name = &self.context.name;
        info!("Starting segment launcher for processor `{name}`");
        if let Err(err) = self.dispatch_loop().await {
            error!("segment launcher of `{name}` failed: {err}");
            if self.context.state.pause_on_error() {
                error!("tracking processor `{name}` paused after error");
            }
        }
        info!("Segment launcher for processor `{name}` stopped");
    }

    async fn dispatch_loop(&self) -> ProcessorResult<()> {
        let context = &self.context;
        while context.state.is_running() {
            let mut immediate_retry = false;

            let segment_ids = match self.known_segment_ids().await {
                Ok(segment_ids) => segment_ids,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(
                        "unable to fetch segments of `{}`, retrying: {err}",
                        context.name
                    );
                    context
                        .sleep_while_running(context.options.token_claim_interval)
                        .await;
                    continue;
                }
            };

            let mut inline_worker = None;
            for segment in Segment::compute_segments(&segment_ids) {
                if !context.state.is_running()
                    || context.active_segment_count() >= context.options.max_worker_count
                {
                    break;
                }
                let segment_id = segment.segment_id();
                if !context.add_active_segment(segment_id) {
                    continue;
                }
                match context.claim_token(segment_id).await {
                    Ok(_) => {}
                    Err(err) if err.is_claim_conflict() => {
                        context.remove_active_segment(segment_id);
                        immediate_retry = true;
                        continue;
                    }
                    Err(err) if err.is_fatal() => {
                        context.remove_active_segment(segment_id);
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(
                            "unable to claim segment {segment_id} of `{}`: {err}",
                            context.name
                        );
                        context.remove_active_segment(segment_id);
                        continue;
                    }
                }
                let worker = SegmentWorker::new(context.clone(), segment);
                if context.pool.live_count() < context.options.max_worker_count {
                    context.pool.spawn(worker.run());
                } else {
                    // The pool is full; run this worker on the launcher task
                    // itself so `max_worker_count` tasks always suffice.
                    inline_worker = Some(worker);
                    break;
                }
            }

            if let Some(worker) = inline_worker {
                // The launcher's own pool entry keeps shutdown waiting for
                // this worker too.
                worker.run().await;
                return Ok(());
            }
            if immediate_retry {
                // Contended claims are retried without the sweep pause, but
                // co-scheduled tasks must not be starved by the tight loop.
                tokio::task::yield_now().await;
            } else {
                context
                    .sleep_while_running(context.options.token_claim_interval)
                    .await;
            }
        }
        Ok(())
    }

    /// The segment ids present in the token store, initializing the
    /// configured number of segments when the store holds none yet.
    async fn known_segment_ids(&self) -> ProcessorResult<Vec<u32>> {
        let context = &self.context;
        let store = context.token_store.as_ref();
        let name = context.name.as_str();
        let segment_ids = in_transaction(context.transactions.as_ref(), async {
            Ok(store.fetch_segments(name).await?)
        })
        .await?;
        if !segment_ids.is_empty() || context.options.initial_segment_count == 0 {
            return Ok(segment_ids);
        }
        info!(
            "initializing {} token segments for processor `{name}`",
            context.options.initial_segment_count
        );
        in_transaction(context.transactions.as_ref(), async {
            Ok(store
                .initialize_token_segments(name, context.options.initial_segment_count)
                .await?)
        })
        .await?;
        in_transaction(context.transactions.as_ref(), async {
            Ok(store.fetch_segments(name).await?)
        })
        .await
    }
}
