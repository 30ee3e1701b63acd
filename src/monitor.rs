// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::{
    errors::{ProcessorError, ProcessorResult},
    segment::Segment,
    stream::TrackedEventMessage,
};

/// Decides what a failed handler invocation means for the running batch.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Invoked with the error a handler raised for `event`. Returning `Err`
    /// propagates: the unit of work rolls back and the worker retries the
    /// batch. Returning `Ok` swallows the error and the batch proceeds.
    async fn on_error(
        &self,
        error: ProcessorError,
        event: &TrackedEventMessage,
        segment: &Segment,
    ) -> ProcessorResult<()>;
}

/// Default error handler: every handler error aborts the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropagatingErrorHandler;

#[async_trait]
impl ErrorHandler for PropagatingErrorHandler {
    async fn on_error(
        &self,
        error: ProcessorError,
        _event: &TrackedEventMessage,
        _segment: &Segment,
    ) -> ProcessorResult<()> {
        Err(error)
    }
}

/// Logs handler errors and lets the batch proceed past the failed event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorHandler;

#[async_trait]
impl ErrorHandler for LoggingErrorHandler {
    async fn on_error(
        &self,
        error: ProcessorError,
        event: &TrackedEventMessage,
        _segment: &Segment,
    ) -> ProcessorResult<()> {
        tracing::error!(
            "error handling event {}: {error}, skipping",
            event.identifier
        );
        Ok(())
    }
}

/// Observation sink for the fate of every inspected event.
pub trait MessageMonitor: Send + Sync {
    /// The event was handled and its batch committed.
    fn report_success(&self, _event: &TrackedEventMessage) {}

    /// The event's batch failed.
    fn report_failure(&self, _event: &TrackedEventMessage, _error: &ProcessorError) {}

    /// The event was inspected but filtered out; its token still advanced
    /// the segment.
    fn report_ignored(&self, _event: &TrackedEventMessage) {}
}

/// Discards every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMessageMonitor;

impl MessageMonitor for NoopMessageMonitor {}
