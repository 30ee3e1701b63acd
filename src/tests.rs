// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tempfile::NamedTempFile;

use crate::{
    EventHandlerInvoker, FileTokenStore, InMemoryMessageSource, InMemoryTokenStore, MessageMonitor,
    ProcessorError, ProcessorOptions, ReplayToken, Segment, TokenStore, TokenStoreBackend,
    TrackedEventMessage, TrackingProcessor, TrackingToken, WorkerPool,
    errors::TokenStoreError, state::ProcessorState, state::TrackingState,
};

const PROCESSOR_NAME: &str = "test";

fn tracked_event(sequence: u64, aggregate: &str) -> TrackedEventMessage {
    TrackedEventMessage::new(
        format!("event-{sequence}"),
        aggregate,
        TrackingToken::Sequence(sequence),
        Bytes::from_static(b"{}"),
    )
}

fn test_options() -> ProcessorOptions {
    ProcessorOptions {
        // fast claim sweeps keep the tests snappy
        token_claim_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[derive(Debug)]
struct HandledEvent {
    identifier: String,
    segment_id: u32,
    replaying: bool,
}

/// Records every handled event; can be told to fail once per event
/// identifier, to only accept one aggregate, and to support resets.
#[derive(Clone, Default)]
struct RecordingInvoker {
    state: Arc<RecorderState>,
}

#[derive(Default)]
struct RecorderState {
    handled: Mutex<Vec<HandledEvent>>,
    fail_once: Mutex<HashSet<String>>,
    only_aggregate: Mutex<Option<String>>,
    resettable: AtomicBool,
    resets: AtomicUsize,
}

impl RecordingInvoker {
    fn handled_identifiers(&self) -> Vec<String> {
        self.state
            .handled
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.identifier.clone())
            .collect()
    }

    fn handled_count(&self) -> usize {
        self.state.handled.lock().unwrap().len()
    }

    fn replay_flags(&self) -> Vec<bool> {
        self.state
            .handled
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.replaying)
            .collect()
    }

    fn handled_segments(&self) -> HashSet<u32> {
        self.state
            .handled
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.segment_id)
            .collect()
    }

    fn fail_once_on(&self, identifier: &str) {
        self.state
            .fail_once
            .lock()
            .unwrap()
            .insert(identifier.to_owned());
    }

    fn only_accept_aggregate(&self, aggregate: &str) {
        *self.state.only_aggregate.lock().unwrap() = Some(aggregate.to_owned());
    }

    fn set_resettable(&self) {
        self.state.resettable.store(true, Ordering::SeqCst);
    }

    fn resets(&self) -> usize {
        self.state.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandlerInvoker for RecordingInvoker {
    type Error = ProcessorError;

    fn can_handle(&self, event: &TrackedEventMessage, _segment: &Segment) -> bool {
        match self.state.only_aggregate.lock().unwrap().as_deref() {
            Some(aggregate) => event.aggregate_identifier == aggregate,
            None => true,
        }
    }

    async fn handle(
        &self,
        event: &TrackedEventMessage,
        segment: &Segment,
    ) -> Result<(), Self::Error> {
        if self.state.fail_once.lock().unwrap().remove(&event.identifier) {
            return Err(ProcessorError::EventHandling(format!(
                "induced failure on {}",
                event.identifier
            )));
        }
        self.state.handled.lock().unwrap().push(HandledEvent {
            identifier: event.identifier.clone(),
            segment_id: segment.segment_id(),
            replaying: event.token.is_replay(),
        });
        Ok(())
    }

    fn supports_reset(&self) -> bool {
        self.state.resettable.load(Ordering::SeqCst)
    }

    async fn perform_reset(&self) -> Result<(), Self::Error> {
        self.state.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Token store decorator recording every stored token in order.
struct RecordingTokenStore {
    inner: InMemoryTokenStore,
    stored: Arc<Mutex<Vec<(u32, TrackingToken)>>>,
}

impl RecordingTokenStore {
    fn new(inner: InMemoryTokenStore) -> Self {
        Self {
            inner,
            stored: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl TokenStore for RecordingTokenStore {
    async fn fetch_segments(&self, processor_name: &str) -> Result<Vec<u32>, TokenStoreError> {
        self.inner.fetch_segments(processor_name).await
    }

    async fn initialize_token_segments(
        &self,
        processor_name: &str,
        count: u32,
    ) -> Result<(), TokenStoreError> {
        self.inner
            .initialize_token_segments(processor_name, count)
            .await
    }

    async fn fetch_token(
        &self,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<Option<TrackingToken>, TokenStoreError> {
        self.inner.fetch_token(processor_name, segment_id).await
    }

    async fn store_token(
        &self,
        token: &TrackingToken,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<(), TokenStoreError> {
        self.inner
            .store_token(token, processor_name, segment_id)
            .await?;
        self.stored.lock().unwrap().push((segment_id, token.clone()));
        Ok(())
    }

    async fn extend_claim(
        &self,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<(), TokenStoreError> {
        self.inner.extend_claim(processor_name, segment_id).await
    }

    async fn release_claim(
        &self,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<(), TokenStoreError> {
        self.inner.release_claim(processor_name, segment_id).await
    }
}

#[derive(Default)]
struct RecordingMonitor {
    ignored: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

impl MessageMonitor for RecordingMonitor {
    fn report_failure(&self, event: &TrackedEventMessage, _error: &ProcessorError) {
        self.failures.lock().unwrap().push(event.identifier.clone());
    }

    fn report_ignored(&self, event: &TrackedEventMessage) {
        self.ignored.lock().unwrap().push(event.identifier.clone());
    }
}

struct ProcessorBundle {
    processor: TrackingProcessor<RecordingInvoker>,
    invoker: RecordingInvoker,
    source: InMemoryMessageSource,
    backend: Arc<TokenStoreBackend>,
    stored: Arc<Mutex<Vec<(u32, TrackingToken)>>>,
    monitor: Arc<RecordingMonitor>,
}

impl ProcessorBundle {
    fn stored_tokens(&self) -> Vec<TrackingToken> {
        self.stored
            .lock()
            .unwrap()
            .iter()
            .map(|(_, token)| token.clone())
            .collect()
    }
}

fn create_processor_bundle(
    owner: &str,
    backend: Arc<TokenStoreBackend>,
    source: InMemoryMessageSource,
    options: ProcessorOptions,
) -> ProcessorBundle {
    let invoker = RecordingInvoker::default();
    let store = RecordingTokenStore::new(InMemoryTokenStore::with_backend(backend.clone(), owner));
    let stored = store.stored.clone();
    let monitor = Arc::new(RecordingMonitor::default());
    let processor = TrackingProcessor::builder(
        PROCESSOR_NAME,
        invoker.clone(),
        Arc::new(source.clone()),
        Arc::new(store),
    )
    .options(options)
    .message_monitor(monitor.clone())
    .build();
    ProcessorBundle {
        processor,
        invoker,
        source,
        backend,
        stored,
        monitor,
    }
}

fn single_node_bundle(options: ProcessorOptions) -> ProcessorBundle {
    create_processor_bundle(
        "node-a",
        TokenStoreBackend::new(),
        InMemoryMessageSource::new(),
        options,
    )
}

#[test]
fn segment_split_and_compute_are_inverses() {
    let (lower, upper) = Segment::ROOT.split();
    assert_eq!(lower, Segment::new(0, 1));
    assert_eq!(upper, Segment::new(1, 1));
    let (lower_lower, lower_upper) = lower.split();
    assert_eq!(lower_lower, Segment::new(0, 3));
    assert_eq!(lower_upper, Segment::new(2, 3));

    assert_eq!(Segment::compute_segments(&[]), vec![]);
    assert_eq!(Segment::compute_segments(&[0]), vec![Segment::ROOT]);
    assert_eq!(
        Segment::compute_segments(&[0, 1, 2, 3]),
        vec![
            Segment::new(0, 3),
            Segment::new(1, 3),
            Segment::new(2, 3),
            Segment::new(3, 3),
        ]
    );
    // an uneven set resolves to segments of different depth
    assert_eq!(
        Segment::compute_segments(&[0, 1, 2]),
        vec![
            Segment::new(0, 3),
            Segment::new(1, 1),
            Segment::new(2, 3),
        ]
    );
}

#[test]
fn segments_partition_the_aggregate_space() {
    let aggregates: Vec<String> = (0..200).map(|n| format!("aggregate-{n}")).collect();
    let segments = Segment::compute_segments(&[0, 1, 2, 3]);
    for aggregate in &aggregates {
        assert!(Segment::ROOT.matches(aggregate));
        let matching = segments
            .iter()
            .filter(|segment| segment.matches(aggregate))
            .count();
        assert_eq!(matching, 1, "exactly one segment must own {aggregate}");
    }
}

#[test]
fn replay_token_window_opens_and_closes() {
    let replay = ReplayToken::wrap(TrackingToken::Sequence(5));
    let TrackingToken::Replay(replay) = replay else {
        panic!("wrap must produce a replay token");
    };
    assert_eq!(replay.token_at_reset(), &TrackingToken::Sequence(5));
    assert_eq!(replay.current_token(), None);
    assert_eq!(replay.position(), None);

    // inside the window events keep the replay marker
    let advanced = replay.advanced_to(TrackingToken::Sequence(1));
    let TrackingToken::Replay(inside) = &advanced else {
        panic!("position 1 is inside the window");
    };
    assert_eq!(inside.current_token(), Some(&TrackingToken::Sequence(1)));
    assert!(advanced.same_position(&TrackingToken::Sequence(1)));

    // reaching the reset position closes the window exactly there
    assert_eq!(
        inside.advanced_to(TrackingToken::Sequence(5)),
        TrackingToken::Sequence(5)
    );
    assert_eq!(
        inside.advanced_to(TrackingToken::Sequence(7)),
        TrackingToken::Sequence(7)
    );

    // re-wrapping a replay token keeps the original reset point
    let rewrapped = ReplayToken::wrap(TrackingToken::Replay(inside.clone()));
    let TrackingToken::Replay(rewrapped) = rewrapped else {
        panic!("wrap must produce a replay token");
    };
    assert_eq!(rewrapped.token_at_reset(), &TrackingToken::Sequence(5));
    assert_eq!(rewrapped.current_token(), None);
}

#[test]
fn state_transitions() {
    let state = ProcessorState::new();
    assert_eq!(state.load(), TrackingState::NotStarted);
    assert!(!state.is_running());

    state.set(TrackingState::Started);
    assert!(state.is_running());
    assert!(state.pause_on_error());
    assert_eq!(state.load(), TrackingState::PausedError);
    // only a running processor can be paused by an error
    assert!(!state.pause_on_error());

    assert_eq!(state.set(TrackingState::ShutDown), TrackingState::PausedError);
    assert!(!state.pause_on_error());
    assert_eq!(state.load(), TrackingState::ShutDown);
}

#[tokio::test]
async fn worker_pool_counts_live_tasks() {
    let pool = WorkerPool::new();
    assert_eq!(pool.live_count(), 0);

    let first = pool.spawn(async {
        tokio::time::sleep(Duration::from_millis(50)).await;
    });
    let second = pool.spawn(async {});
    assert_eq!(pool.live_count(), 2);

    pool.wait_idle().await;
    assert_eq!(pool.live_count(), 0);
    first.await.unwrap();
    second.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initializes_segments_and_caps_worker_count() {
    let bundle = single_node_bundle(ProcessorOptions {
        initial_segment_count: 4,
        max_worker_count: 2,
        ..test_options()
    });
    bundle.processor.start();
    assert!(bundle.processor.is_running());

    assert!(
        wait_until(
            || bundle.processor.active_segment_count() == 2,
            Duration::from_secs(5),
        )
        .await
    );
    // the launcher became the second worker, so two tasks carry two segments
    assert_eq!(bundle.processor.active_processor_tasks(), 2);

    let store = InMemoryTokenStore::with_backend(bundle.backend.clone(), "observer");
    assert_eq!(
        store.fetch_segments(PROCESSOR_NAME).await.unwrap(),
        vec![0, 1, 2, 3]
    );

    bundle.processor.shut_down().await;
    assert!(!bundle.processor.is_running());
    assert_eq!(bundle.processor.active_segment_count(), 0);
    assert_eq!(bundle.processor.active_processor_tasks(), 0);
    for segment_id in 0..2 {
        assert_eq!(bundle.backend.claim_owner(PROCESSOR_NAME, segment_id), None);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn segments_are_exclusive_across_nodes() {
    let backend = TokenStoreBackend::new();
    let source = InMemoryMessageSource::new();
    let node_a = create_processor_bundle("node-a", backend.clone(), source.clone(), test_options());
    let node_b = create_processor_bundle("node-b", backend.clone(), source.clone(), test_options());

    for sequence in 1..=3 {
        source.publish(tracked_event(sequence, "account-1"));
    }
    node_a.processor.start();
    node_b.processor.start();

    assert!(
        wait_until(
            || node_a.invoker.handled_count() + node_b.invoker.handled_count() == 3,
            Duration::from_secs(5),
        )
        .await
    );
    // the single segment is owned by exactly one node at a time
    assert_eq!(
        node_a.processor.active_segment_count() + node_b.processor.active_segment_count(),
        1
    );
    assert_eq!(
        node_a.invoker.handled_count().min(node_b.invoker.handled_count()),
        0
    );

    let (winner, loser) = if node_a.processor.active_segment_count() == 1 {
        (&node_a, &node_b)
    } else {
        (&node_b, &node_a)
    };
    // once the winner releases its claim, the loser takes the segment over
    // and resumes from the stored token
    winner.processor.shut_down().await;
    assert!(
        wait_until(
            || loser.processor.active_segment_count() == 1,
            Duration::from_secs(5),
        )
        .await
    );
    source.publish(tracked_event(4, "account-1"));
    assert!(
        wait_until(
            || loser.invoker.handled_identifiers().contains(&"event-4".to_owned()),
            Duration::from_secs(5),
        )
        .await
    );
    assert!(!loser.invoker.handled_identifiers().contains(&"event-3".to_owned()));

    winner.processor.shut_down().await;
    loser.processor.shut_down().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batches_commit_the_last_observed_token() {
    let bundle = single_node_bundle(ProcessorOptions {
        batch_size: 2,
        ..test_options()
    });
    for sequence in 1..=3 {
        bundle.source.publish(tracked_event(sequence, "account-1"));
    }
    bundle.processor.start();
    assert!(
        wait_until(
            || bundle.invoker.handled_count() == 3,
            Duration::from_secs(5),
        )
        .await
    );
    bundle.processor.shut_down().await;

    assert_eq!(
        bundle.invoker.handled_identifiers(),
        vec!["event-1", "event-2", "event-3"]
    );
    // one full batch, then the remainder
    assert_eq!(
        bundle.stored_tokens(),
        vec![TrackingToken::Sequence(2), TrackingToken::Sequence(3)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upcast_groups_commit_together() {
    let bundle = single_node_bundle(ProcessorOptions {
        batch_size: 1,
        ..test_options()
    });
    // two events sharing token 1 form an upcast group
    bundle.source.publish(tracked_event(1, "account-1"));
    bundle.source.publish(TrackedEventMessage::new(
        "event-1b",
        "account-1",
        TrackingToken::Sequence(1),
        Bytes::from_static(b"{}"),
    ));
    bundle.source.publish(tracked_event(2, "account-1"));

    bundle.processor.start();
    assert!(
        wait_until(
            || bundle.invoker.handled_count() == 3,
            Duration::from_secs(5),
        )
        .await
    );
    bundle.processor.shut_down().await;

    assert_eq!(
        bundle.invoker.handled_identifiers(),
        vec!["event-1", "event-1b", "event-2"]
    );
    // the group exceeded the batch size but committed under a single token
    assert_eq!(
        bundle.stored_tokens(),
        vec![TrackingToken::Sequence(1), TrackingToken::Sequence(2)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_batch_rolls_back_and_is_redelivered() {
    let bundle = single_node_bundle(ProcessorOptions {
        batch_size: 2,
        ..test_options()
    });
    bundle.invoker.fail_once_on("event-2");
    bundle.source.publish(tracked_event(1, "account-1"));
    bundle.source.publish(tracked_event(2, "account-1"));

    bundle.processor.start();
    assert!(
        wait_until(
            || bundle.stored_tokens().last() == Some(&TrackingToken::Sequence(2)),
            Duration::from_secs(10),
        )
        .await
    );
    bundle.processor.shut_down().await;

    // the first delivery of the batch failed on event-2 and left no token
    // behind; the second delivery saw both events again
    assert_eq!(
        bundle.invoker.handled_identifiers(),
        vec!["event-1", "event-1", "event-2"]
    );
    assert_eq!(bundle.stored_tokens(), vec![TrackingToken::Sequence(2)]);
    assert!(
        bundle
            .monitor
            .failures
            .lock()
            .unwrap()
            .contains(&"event-1".to_owned())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn filtered_events_still_advance_the_token() {
    let bundle = single_node_bundle(ProcessorOptions {
        batch_size: 2,
        ..test_options()
    });
    bundle.invoker.only_accept_aggregate("wanted");
    for sequence in 1..=3 {
        bundle.source.publish(tracked_event(sequence, "unwanted"));
    }
    bundle.processor.start();
    assert!(
        wait_until(
            || bundle.stored_tokens().last() == Some(&TrackingToken::Sequence(3)),
            Duration::from_secs(5),
        )
        .await
    );
    bundle.processor.shut_down().await;

    assert_eq!(bundle.invoker.handled_count(), 0);
    assert_eq!(bundle.monitor.ignored.lock().unwrap().len(), 3);
    // no event was handled, yet the token moved past the inspected ones
    assert_eq!(
        bundle.stored_tokens().last(),
        Some(&TrackingToken::Sequence(3))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn events_spread_over_segments_and_each_is_handled_once() {
    let bundle = single_node_bundle(ProcessorOptions {
        initial_segment_count: 4,
        max_worker_count: 4,
        batch_size: 5,
        ..test_options()
    });
    let mut rng = StdRng::seed_from_u64(17);
    for _ in 0..40 {
        let aggregate = format!("account-{}", rng.gen_range(0..10));
        bundle
            .source
            .publish_next(&aggregate, Bytes::from_static(b"{}"));
    }
    bundle.processor.start();
    // every segment must observe the full stream, matching events or not
    let caught_up = |stored: &[(u32, TrackingToken)]| {
        (0..4).all(|segment_id| {
            stored
                .iter()
                .filter(|(id, _)| *id == segment_id)
                .next_back()
                .is_some_and(|(_, token)| token == &TrackingToken::Sequence(40))
        })
    };
    assert!(
        wait_until(
            || caught_up(&bundle.stored.lock().unwrap()),
            Duration::from_secs(10),
        )
        .await
    );
    bundle.processor.shut_down().await;

    // each event is handled exactly once, by the segment owning its aggregate
    assert_eq!(bundle.invoker.handled_count(), 40);
    let mut identifiers = bundle.invoker.handled_identifiers();
    identifiers.sort();
    identifiers.dedup();
    assert_eq!(identifiers.len(), 40);
    assert!(bundle.invoker.handled_segments().len() > 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reset_rewinds_tokens_and_marks_the_replay() {
    let bundle = single_node_bundle(test_options());
    bundle.invoker.set_resettable();
    for sequence in 1..=5 {
        bundle.source.publish(tracked_event(sequence, "account-1"));
    }
    bundle.processor.start();
    assert!(
        wait_until(
            || bundle.invoker.handled_count() == 5,
            Duration::from_secs(5),
        )
        .await
    );
    // a running processor refuses the reset
    assert!(matches!(
        bundle.processor.reset_tokens().await,
        Err(ProcessorError::ResetRejected)
    ));
    bundle.processor.shut_down().await;

    bundle.processor.reset_tokens().await.unwrap();
    assert_eq!(bundle.invoker.resets(), 1);
    let reset_token = bundle.stored_tokens().last().cloned().unwrap();
    let TrackingToken::Replay(replay) = reset_token else {
        panic!("reset must store a replay token");
    };
    assert_eq!(replay.token_at_reset(), &TrackingToken::Sequence(5));
    assert_eq!(replay.current_token(), None);
    assert_eq!(bundle.backend.claim_owner(PROCESSOR_NAME, 0), None);

    // restarting replays the stream; the marker drops exactly at the reset
    // position
    bundle.processor.start();
    assert!(
        wait_until(
            || bundle.invoker.handled_count() == 10,
            Duration::from_secs(5),
        )
        .await
    );
    let replay_flags = bundle.invoker.replay_flags();
    assert_eq!(
        &replay_flags[5..],
        &[true, true, true, true, false],
        "events before the reset position carry the replay marker"
    );

    // live tailing continues past the replay with plain tokens
    bundle.source.publish(tracked_event(6, "account-1"));
    assert!(
        wait_until(
            || bundle.invoker.handled_count() == 11,
            Duration::from_secs(5),
        )
        .await
    );
    bundle.processor.shut_down().await;
    assert_eq!(
        bundle.stored_tokens().last(),
        Some(&TrackingToken::Sequence(6))
    );
}

#[tokio::test]
async fn reset_requires_invoker_support() {
    let bundle = single_node_bundle(test_options());
    assert!(matches!(
        bundle.processor.reset_tokens().await,
        Err(ProcessorError::ResetNotSupported)
    ));
    assert!(bundle.stored_tokens().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crash_mid_replay_resumes_replaying() {
    let bundle = single_node_bundle(test_options());
    bundle.invoker.set_resettable();
    for sequence in 1..=4 {
        bundle.source.publish(tracked_event(sequence, "account-1"));
    }
    // simulate an earlier crash: the stored token is a replay token halfway
    // through the window
    let store = InMemoryTokenStore::with_backend(bundle.backend.clone(), "node-a");
    store
        .initialize_token_segments(PROCESSOR_NAME, 1)
        .await
        .unwrap();
    store.fetch_token(PROCESSOR_NAME, 0).await.unwrap();
    let TrackingToken::Replay(replay) = ReplayToken::wrap(TrackingToken::Sequence(4)) else {
        panic!("wrap must produce a replay token");
    };
    store
        .store_token(
            &replay.advanced_to(TrackingToken::Sequence(2)),
            PROCESSOR_NAME,
            0,
        )
        .await
        .unwrap();
    store.release_claim(PROCESSOR_NAME, 0).await.unwrap();

    bundle.processor.start();
    assert!(
        wait_until(
            || bundle.invoker.handled_count() == 2,
            Duration::from_secs(5),
        )
        .await
    );
    bundle.processor.shut_down().await;

    // events 3 and 4 are delivered: 3 still replaying, 4 closes the window
    assert_eq!(bundle.invoker.handled_identifiers(), vec!["event-3", "event-4"]);
    assert_eq!(bundle.invoker.replay_flags(), vec![true, false]);
}

#[tokio::test]
async fn file_token_store_round_trips_tokens() {
    let file = NamedTempFile::new().unwrap();
    let store = FileTokenStore::new(file.path()).await.unwrap();

    store
        .initialize_token_segments(PROCESSOR_NAME, 2)
        .await
        .unwrap();
    assert!(matches!(
        store.initialize_token_segments(PROCESSOR_NAME, 2).await,
        Err(TokenStoreError::Transient(_))
    ));
    assert_eq!(store.fetch_segments(PROCESSOR_NAME).await.unwrap(), vec![0, 1]);
    assert_eq!(store.fetch_token(PROCESSOR_NAME, 0).await.unwrap(), None);

    store
        .store_token(&TrackingToken::Sequence(7), PROCESSOR_NAME, 0)
        .await
        .unwrap();
    let replayed = ReplayToken::wrap(TrackingToken::Sequence(7));
    store.store_token(&replayed, PROCESSOR_NAME, 1).await.unwrap();

    // a new handle over the same file sees the persisted tokens
    let reopened = FileTokenStore::new(file.path()).await.unwrap();
    assert_eq!(
        reopened.fetch_token(PROCESSOR_NAME, 0).await.unwrap(),
        Some(TrackingToken::Sequence(7))
    );
    assert_eq!(
        reopened.fetch_token(PROCESSOR_NAME, 1).await.unwrap(),
        Some(replayed)
    );
    assert!(matches!(
        reopened.fetch_token(PROCESSOR_NAME, 9).await,
        Err(TokenStoreError::UnableToClaim { segment: 9, .. })
    ));

    // a corrupted file is tolerated and read as an empty store
    std::fs::write(file.path(), b"not json").unwrap();
    let corrupted = FileTokenStore::new(file.path()).await.unwrap();
    assert_eq!(
        corrupted.fetch_segments(PROCESSOR_NAME).await.unwrap(),
        Vec::<u32>::new()
    );
}

#[tokio::test]
async fn expired_claims_can_be_taken_over() {
    let backend = TokenStoreBackend::new();
    let node_a = InMemoryTokenStore::with_backend(backend.clone(), "node-a")
        .with_claim_timeout(Duration::from_millis(50));
    let node_b = InMemoryTokenStore::with_backend(backend.clone(), "node-b")
        .with_claim_timeout(Duration::from_millis(50));

    node_a
        .initialize_token_segments(PROCESSOR_NAME, 1)
        .await
        .unwrap();
    node_a.fetch_token(PROCESSOR_NAME, 0).await.unwrap();
    assert!(matches!(
        node_b.fetch_token(PROCESSOR_NAME, 0).await,
        Err(TokenStoreError::UnableToClaim { .. })
    ));
    // extending keeps the lease alive
    node_a.extend_claim(PROCESSOR_NAME, 0).await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    // the lease lapsed without an extension, so the claim moves over
    node_b.fetch_token(PROCESSOR_NAME, 0).await.unwrap();
    assert_eq!(
        backend.claim_owner(PROCESSOR_NAME, 0),
        Some("node-b".to_owned())
    );
    // the previous owner may no longer store
    assert!(matches!(
        node_a
            .store_token(&TrackingToken::Sequence(1), PROCESSOR_NAME, 0)
            .await,
        Err(TokenStoreError::UnableToClaim { .. })
    ));
}
