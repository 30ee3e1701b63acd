// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tracing::debug;

use crate::{
    EventHandlerInvoker,
    errors::{ProcessorError, ProcessorResult},
    processor::RollbackPolicy,
    stream::{MessageStream, TrackedEventMessage},
    token::TrackingToken,
    worker::SegmentWorker,
};

/// Hard ceiling on raw events inspected per batch, as a multiple of the
/// batch size. Without it a segment whose events are mostly filtered out
/// would assemble batches unboundedly long.
const INSPECTION_CEILING_FACTOR: usize = 10;

/// Drains one batch from the stream and commits it as a unit of work.
///
/// The persisted token is the token of the last event *observed*, not the
/// last one handled: events filtered out by the segment predicate advance
/// the token all the same. Consecutive events sharing a tracking token (an
/// upcast group) are committed together even past the configured batch size.
pub(crate) async fn process_batch<I: EventHandlerInvoker>(
    worker: &SegmentWorker<I>,
    stream: &mut Box<dyn MessageStream>,
) -> ProcessorResult<()> {
    let context = worker.context();
    let segment_id = worker.segment().segment_id();

    if !stream
        .has_next_available(context.options.event_availability_timeout)
        .await
    {
        // Quiet stream: refresh the lease so the claim survives idle spells.
        return context.extend_claim(segment_id).await;
    }

    let mut batch: Vec<TrackedEventMessage> = Vec::new();
    let mut last_token: Option<TrackingToken> = None;
    let mut inspected = 0;
    let ceiling = context.options.batch_size * INSPECTION_CEILING_FACTOR;

    while batch.len() < context.options.batch_size && inspected < ceiling {
        if inspected > 0 && !stream.has_next_available(Duration::ZERO).await {
            break;
        }
        let event = stream.next_available().await?;
        inspected += 1;
        last_token = Some(event.token.clone());
        if worker.accepts(&event) {
            batch.push(event);
        } else {
            context.monitor.report_ignored(&event);
        }
    }

    let Some(last_token) = last_token else {
        return Ok(());
    };

    if batch.is_empty() {
        // Everything was filtered out; the token must advance regardless so
        // the segment does not re-inspect these events forever.
        context.store_token(&last_token, segment_id).await?;
        context.record_token_position(segment_id, &last_token);
        return Ok(());
    }

    // Events sharing the last token form an upcast group and must commit in
    // the same unit of work, batch size notwithstanding.
    let mut last_token = last_token;
    while let Some(peeked) = stream.peek().await {
        if !peeked.token.same_position(&last_token) {
            break;
        }
        let event = stream.next_available().await?;
        last_token = event.token.clone();
        if worker.accepts(&event) {
            batch.push(event);
        } else {
            context.monitor.report_ignored(&event);
        }
    }

    debug!(
        "processing batch of {} events on segment {segment_id} of `{}`",
        batch.len(),
        context.name
    );
    commit_unit_of_work(worker, batch, last_token).await
}

/// Runs the batch through the handlers and persists the token, all within
/// one transaction: the claim is extended with the first message, the token
/// stored once with the last observed one. With a batch size of one this
/// degenerates to extend-and-store around every message.
async fn commit_unit_of_work<I: EventHandlerInvoker>(
    worker: &SegmentWorker<I>,
    batch: Vec<TrackedEventMessage>,
    last_token: TrackingToken,
) -> ProcessorResult<()> {
    let context = worker.context();
    let segment_id = worker.segment().segment_id();
    let transaction = context.transactions.begin().await?;

    let result = dispatch_batch(worker, &batch, &last_token).await;
    match result {
        Ok(()) => {
            transaction.commit().await?;
            for event in &batch {
                context.monitor.report_success(event);
            }
            context.record_token_position(segment_id, &last_token);
            Ok(())
        }
        Err(err) => {
            for event in &batch {
                context.monitor.report_failure(event, &err);
            }
            match context.options.rollback_policy {
                RollbackPolicy::AnyError => {
                    let _ = transaction.rollback().await;
                }
                RollbackPolicy::Never => {
                    // Commit what succeeded, token advance included, so the
                    // failed event is not redelivered.
                    context
                        .token_store
                        .store_token(&last_token, &context.name, segment_id)
                        .await?;
                    transaction.commit().await?;
                    context.record_token_position(segment_id, &last_token);
                }
            }
            Err(err)
        }
    }
}

async fn dispatch_batch<I: EventHandlerInvoker>(
    worker: &SegmentWorker<I>,
    batch: &[TrackedEventMessage],
    last_token: &TrackingToken,
) -> ProcessorResult<()> {
    let context = worker.context();
    let segment = worker.segment();
    let segment_id = segment.segment_id();

    for (index, event) in batch.iter().enumerate() {
        if index == 0 {
            context
                .token_store
                .extend_claim(&context.name, segment_id)
                .await?;
        }
        let outcome = context
            .invoker
            .handle(event, segment)
            .await
            .map_err(|err| ProcessorError::EventHandling(err.to_string()));
        if let Err(err) = outcome {
            context.error_handler.on_error(err, event, segment).await?;
        }
    }
    context
        .token_store
        .store_token(last_token, &context.name, segment_id)
        .await?;
    Ok(())
}
