// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a tracking processor.
///
/// Only `Started` permits processing. `ShutDown` is terminal within one
/// lifecycle; a later [`start`](crate::processor::TrackingProcessor::start)
/// begins a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackingState {
    NotStarted = 0,
    Started = 1,
    Paused = 2,
    PausedError = 3,
    ShutDown = 4,
}

impl TrackingState {
    pub fn is_running(self) -> bool {
        matches!(self, TrackingState::Started)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => TrackingState::Started,
            2 => TrackingState::Paused,
            3 => TrackingState::PausedError,
            4 => TrackingState::ShutDown,
            _ => TrackingState::NotStarted,
        }
    }
}

/// The single atomic lifecycle field every processing loop polls at its head
/// and at each sleep slice. There is no other cancellation signal.
#[derive(Debug, Default)]
pub struct ProcessorState(AtomicU8);

impl ProcessorState {
    pub fn new() -> Self {
        Self(AtomicU8::new(TrackingState::NotStarted as u8))
    }

    pub fn load(&self) -> TrackingState {
        TrackingState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.load().is_running()
    }

    /// Unconditionally moves to `state`, returning the previous state.
    pub fn set(&self, state: TrackingState) -> TrackingState {
        TrackingState::from_u8(self.0.swap(state as u8, Ordering::SeqCst))
    }

    /// Marks the processor as paused by a failure. Returns `false` when a
    /// concurrent shutdown (or another failure) won the race; shutdown always
    /// takes precedence over an error pause.
    pub fn pause_on_error(&self) -> bool {
        self.0
            .compare_exchange(
                TrackingState::Started as u8,
                TrackingState::PausedError as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}
