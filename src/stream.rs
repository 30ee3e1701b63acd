// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::{
    errors::ProcessorResult,
    token::{ReplayToken, TrackingToken},
};

/// An event pulled from the stream, carrying the token of its position.
///
/// The payload is opaque to the core; serialization is the concern of the
/// producing side and the registered handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEventMessage {
    /// Unique identifier of the message itself.
    pub identifier: String,
    /// Identifier of the aggregate that emitted the event. Segment routing
    /// hashes this value.
    pub aggregate_identifier: String,
    /// Position of this event in the stream.
    pub token: TrackingToken,
    pub payload: Bytes,
}

impl TrackedEventMessage {
    pub fn new(
        identifier: impl Into<String>,
        aggregate_identifier: impl Into<String>,
        token: TrackingToken,
        payload: Bytes,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            aggregate_identifier: aggregate_identifier.into(),
            token,
            payload,
        }
    }

    /// The same event repositioned under `token`.
    pub fn with_token(mut self, token: TrackingToken) -> Self {
        self.token = token;
        self
    }
}

/// An open, totally ordered stream of tracked events. Closing is dropping.
#[async_trait]
pub trait MessageStream: Send {
    /// A non-consuming look at the next event, if one is already available.
    async fn peek(&mut self) -> Option<TrackedEventMessage>;

    /// Waits up to `timeout` for an event to become available.
    async fn has_next_available(&mut self, timeout: Duration) -> bool;

    /// The next event, waiting for one to arrive. Returns
    /// [`ProcessorError::StreamClosed`](crate::ProcessorError::StreamClosed)
    /// when the source hung up.
    async fn next_available(&mut self) -> ProcessorResult<TrackedEventMessage>;
}

/// The port through which a processor taps an event stream.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Opens a stream positioned directly after `token`; `None` opens it at
    /// the beginning of the stream.
    async fn open_stream(
        &self,
        token: Option<TrackingToken>,
    ) -> ProcessorResult<Box<dyn MessageStream>>;
}

/// Stream decorator that rewrites the tokens of replayed events.
///
/// While the replay window is open every outgoing event carries a
/// [`ReplayToken`], so tokens persisted mid-replay keep the replay context
/// and a restarted processor continues replaying. Once an event reaches the
/// reset position the decorator becomes transparent.
pub struct ReplayingStream {
    delegate: Box<dyn MessageStream>,
    last_replay_token: Option<ReplayToken>,
}

impl ReplayingStream {
    pub fn new(delegate: Box<dyn MessageStream>, replay_token: ReplayToken) -> Self {
        Self {
            delegate,
            last_replay_token: Some(replay_token),
        }
    }
}

#[async_trait]
impl MessageStream for ReplayingStream {
    async fn peek(&mut self) -> Option<TrackedEventMessage> {
        self.delegate.peek().await
    }

    async fn has_next_available(&mut self, timeout: Duration) -> bool {
        self.delegate.has_next_available(timeout).await
    }

    async fn next_available(&mut self) -> ProcessorResult<TrackedEventMessage> {
        let event = self.delegate.next_available().await?;
        let Some(replay) = self.last_replay_token.take() else {
            return Ok(event);
        };
        let advanced = replay.advanced_to(event.token.clone());
        if let TrackingToken::Replay(next) = &advanced {
            self.last_replay_token = Some(next.clone());
        }
        Ok(event.with_token(advanced))
    }
}

/// Message source retaining its full history in memory.
///
/// Streams opened from it replay from any position, which makes it suitable
/// for embedding and for tests; production deployments put an event store
/// behind [`MessageSource`] instead. Handles are cheap to clone and share the
/// same history.
#[derive(Clone, Default)]
pub struct InMemoryMessageSource {
    inner: Arc<SourceInner>,
}

#[derive(Default)]
struct SourceInner {
    events: Mutex<Vec<TrackedEventMessage>>,
    event_appended: Notify,
}

impl InMemoryMessageSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event to the history and wakes every open stream.
    pub fn publish(&self, event: TrackedEventMessage) {
        self.inner
            .events
            .lock()
            .expect("event history lock poisoned")
            .push(event);
        self.inner.event_appended.notify_waiters();
    }

    /// Publishes `payload` as the next event of `aggregate_identifier`,
    /// minting a sequence token one past the current head.
    pub fn publish_next(&self, aggregate_identifier: &str, payload: Bytes) -> TrackingToken {
        let mut events = self
            .inner
            .events
            .lock()
            .expect("event history lock poisoned");
        let sequence = events
            .last()
            .and_then(|event| event.token.position())
            .map_or(1, |position| position + 1);
        let token = TrackingToken::Sequence(sequence);
        events.push(TrackedEventMessage::new(
            format!("event-{sequence}"),
            aggregate_identifier,
            token.clone(),
            payload,
        ));
        drop(events);
        self.inner.event_appended.notify_waiters();
        token
    }

    fn cursor_after(&self, token: Option<&TrackingToken>) -> usize {
        let Some(position) = token.and_then(|token| token.position()) else {
            return 0;
        };
        let events = self
            .inner
            .events
            .lock()
            .expect("event history lock poisoned");
        events.partition_point(|event| {
            event
                .token
                .position()
                .is_some_and(|event_position| event_position <= position)
        })
    }
}

#[async_trait]
impl MessageSource for InMemoryMessageSource {
    async fn open_stream(
        &self,
        token: Option<TrackingToken>,
    ) -> ProcessorResult<Box<dyn MessageStream>> {
        let cursor = self.cursor_after(token.as_ref());
        Ok(Box::new(InMemoryMessageStream {
            inner: self.inner.clone(),
            cursor,
        }))
    }
}

struct InMemoryMessageStream {
    inner: Arc<SourceInner>,
    cursor: usize,
}

impl InMemoryMessageStream {
    fn event_at_cursor(&self) -> Option<TrackedEventMessage> {
        self.inner
            .events
            .lock()
            .expect("event history lock poisoned")
            .get(self.cursor)
            .cloned()
    }

    async fn wait_for_event(&self) -> TrackedEventMessage {
        loop {
            // Register for the wakeup before re-checking, otherwise an append
            // between the check and the await is lost.
            let appended = self.inner.event_appended.notified();
            if let Some(event) = self.event_at_cursor() {
                return event;
            }
            appended.await;
        }
    }
}

#[async_trait]
impl MessageStream for InMemoryMessageStream {
    async fn peek(&mut self) -> Option<TrackedEventMessage> {
        self.event_at_cursor()
    }

    async fn has_next_available(&mut self, timeout: Duration) -> bool {
        if self.event_at_cursor().is_some() {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        tokio::time::timeout(timeout, self.wait_for_event())
            .await
            .is_ok()
    }

    async fn next_available(&mut self) -> ProcessorResult<TrackedEventMessage> {
        let event = self.wait_for_event().await;
        self.cursor += 1;
        Ok(event)
    }
}

impl std::fmt::Debug for InMemoryMessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events = self
            .inner
            .events
            .lock()
            .map(|events| events.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryMessageSource")
            .field("events", &events)
            .finish()
    }
}
