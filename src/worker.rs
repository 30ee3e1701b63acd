// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{sync::Arc, time::Duration};

use backoff::{ExponentialBackoff, backoff::Backoff};
use tracing::{error, info, warn};

use crate::{
    EventHandlerInvoker, batch,
    errors::ProcessorResult,
    processor::ProcessorContext,
    segment::Segment,
    stream::{MessageStream, ReplayingStream, TrackedEventMessage},
    token::TrackingToken,
};

/// How long a worker waits after losing its claim to another node.
const CLAIM_CONFLICT_WAIT: Duration = Duration::from_secs(5);

/// Backoff for transient failures: 1 s doubling up to 60 s, retrying
/// indefinitely until the processor stops.
fn error_backoff() -> ExponentialBackoff {
    let mut backoff = ExponentialBackoff::default();
    backoff.initial_interval = Duration::from_secs(1);
    backoff.current_interval = backoff.initial_interval;
    backoff.randomization_factor = 0.0;
    backoff.multiplier = 2.0;
    backoff.max_interval = Duration::from_secs(60);
    backoff.max_elapsed_time = None;
    backoff
}

/// Processes a single claimed segment until the processor stops or the
/// segment is lost.
pub(crate) struct SegmentWorker<I: EventHandlerInvoker> {
    context: Arc<ProcessorContext<I>>,
    segment: Segment,
}

impl<I: EventHandlerInvoker> SegmentWorker<I> {
    pub(crate) fn new(context: Arc<ProcessorContext<I>>, segment: Segment) -> Self {
        Self { context, segment }
    }

    pub(crate) fn context(&self) -> &ProcessorContext<I> {
        &self.context
    }

    pub(crate) fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Whether `event` is dispatched to handlers within this segment. An
    /// event that is not still advances the segment's token.
    pub(crate) fn accepts(&self, event: &TrackedEventMessage) -> bool {
        self.segment.matches(&event.aggregate_identifier)
            && self.context.invoker.can_handle(event, &self.segment)
    }

    pub(crate) async fn run(self) {
        let segment_id = self.segment.segment_id();
        let name = &self.context.name;
        info!("Starting segment worker {segment_id} for processor `{name}`");

        let result = self.process_loop().await;
        if let Err(err) = &result {
            error!("segment worker {segment_id} of `{name}` failed: {err}");
            if self.context.state.pause_on_error() {
                error!("tracking processor `{name}` paused after error");
            }
        }

        // The claim outlives the loop on every exit path; release failures
        // are logged and swallowed, the lease lapses on its own.
        if let Err(err) = self.context.release_claim(segment_id).await {
            warn!("unable to release claim on segment {segment_id} of `{name}`: {err}");
        }
        self.context.remove_active_segment(segment_id);
        info!("Segment worker {segment_id} for processor `{name}` stopped");
    }

    async fn process_loop(&self) -> ProcessorResult<()> {
        let segment_id = self.segment.segment_id();
        let mut stream: Option<Box<dyn MessageStream>> = None;
        let mut backoff = error_backoff();
        let mut conflict_logged = false;

        while self.context.state.is_running() {
            let result = match stream.as_mut() {
                Some(open) => batch::process_batch(self, open).await,
                None => self.open_stream().await.map(|opened| {
                    stream = Some(opened);
                }),
            };
            match result {
                Ok(()) => {
                    backoff.reset();
                    conflict_logged = false;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) if err.is_claim_conflict() => {
                    if !conflict_logged {
                        info!(
                            "segment {segment_id} of `{}` is processed elsewhere: {err}",
                            self.context.name
                        );
                        conflict_logged = true;
                    }
                    // The stream may still be valid; keep it and retry once
                    // the competing claim may have lapsed.
                    self.context.sleep_while_running(CLAIM_CONFLICT_WAIT).await;
                }
                Err(err) => {
                    let wait = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_secs(60));
                    warn!(
                        "transient error on segment {segment_id} of `{}`, retrying in {wait:?}: {err}",
                        self.context.name
                    );
                    if let Err(err) = self.context.release_claim(segment_id).await {
                        warn!(
                            "unable to release claim on segment {segment_id} of `{}`: {err}",
                            self.context.name
                        );
                    }
                    stream = None;
                    self.context.sleep_while_running(wait).await;
                }
            }
        }
        Ok(())
    }

    /// Claims the segment's token and opens the stream after it. A replay
    /// token resumes the replay: the stream opens at the replay's live
    /// position (the source start when it has none) and is decorated so
    /// outgoing events keep carrying the replay context.
    async fn open_stream(&self) -> ProcessorResult<Box<dyn MessageStream>> {
        let segment_id = self.segment.segment_id();
        let token = self.context.claim_token(segment_id).await?;
        match token {
            Some(TrackingToken::Replay(replay)) => {
                info!(
                    "segment {segment_id} of `{}` resumes replaying towards {:?}",
                    self.context.name,
                    replay.token_at_reset()
                );
                let stream = self
                    .context
                    .source
                    .open_stream(replay.current_token().cloned())
                    .await?;
                Ok(Box::new(ReplayingStream::new(stream, replay)))
            }
            token => self.context.source.open_stream(token).await,
        }
    }
}
