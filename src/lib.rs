// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Tracking event processor: a long-running consumer that pulls events from
//! an append-only, totally ordered stream, dispatches them to handlers in
//! batches and durably records its progress as tracking tokens in a token
//! store.
//! <br>
//!
//! The stream is partitioned into segments. Before touching a segment a node
//! claims it through the [`TokenStore`], which guarantees that at most one
//! worker in the entire cluster processes it at a time; nodes sharing a
//! store therefore divide the segments among themselves. Delivery is
//! at-least-once: handlers must be idempotent, in particular under
//! [replays](TrackingProcessor::reset_tokens), where redelivered events are
//! marked through their [`ReplayToken`]s.
//!
//! ## Graceful shutdown
//!
//! Shutdown is cooperative and hierarchical. A single atomic lifecycle state
//! is polled by every processing loop at its head and at each sleep slice:
//! 1. Segment workers finish the batch in flight, release their claims and
//!    deregister their segments.
//! 2. The launcher stops sweeping the store for claimable segments.
//! 3. [`TrackingProcessor::shut_down`] flips the state and waits until the
//!    worker pool's live-task count reaches zero.

mod batch;
mod errors;
mod launcher;
mod metrics;
mod monitor;
mod processor;
mod segment;
mod state;
mod stream;
#[cfg(test)]
mod tests;
mod token;
mod token_store;
mod transaction;
mod worker;
mod worker_pool;

use std::fmt::{Debug, Display};

use async_trait::async_trait;
pub use errors::{ProcessorError, ProcessorResult, TokenStoreError};
pub use metrics::TrackingMetrics;
pub use monitor::{
    ErrorHandler, LoggingErrorHandler, MessageMonitor, NoopMessageMonitor,
    PropagatingErrorHandler,
};
pub use processor::{
    ProcessorOptions, RollbackPolicy, TrackingProcessor, TrackingProcessorBuilder,
};
pub use segment::Segment;
pub use state::TrackingState;
pub use stream::{
    InMemoryMessageSource, MessageSource, MessageStream, ReplayingStream, TrackedEventMessage,
};
pub use token::{ReplayToken, TrackingToken};
pub use token_store::{FileTokenStore, InMemoryTokenStore, TokenStore, TokenStoreBackend};
pub use transaction::{NoTransactionManager, Transaction, TransactionManager};
pub use worker_pool::WorkerPool;

/// The bridge between a [`TrackingProcessor`] and the registered event
/// handlers.
#[async_trait]
pub trait EventHandlerInvoker: Send + Sync {
    type Error: Debug + Display;

    /// Whether any handler is interested in `event` within `segment`.
    /// Events turned down here are not dispatched but still advance the
    /// segment's token.
    fn can_handle(&self, _event: &TrackedEventMessage, _segment: &Segment) -> bool {
        true
    }

    /// Dispatches `event` to the handlers of `segment`. Runs inside the
    /// batch's unit of work: a propagated error rolls back the batch along
    /// with its token advance.
    async fn handle(
        &self,
        event: &TrackedEventMessage,
        segment: &Segment,
    ) -> Result<(), Self::Error>;

    /// Whether the handlers tolerate a token reset (and the replay it
    /// causes).
    fn supports_reset(&self) -> bool {
        false
    }

    /// Hook invoked by [`TrackingProcessor::reset_tokens`] before the replay
    /// tokens are written.
    async fn perform_reset(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}
