// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Position of an event in a totally ordered stream.
///
/// Tokens are opaque to everything but the message source that mints them:
/// the core only compares positions and hands tokens back to the
/// [`TokenStore`](crate::token_store::TokenStore) for persistence. The
/// `Replay` variant marks positions inside a replay window, so a processor
/// that crashes mid-replay resumes replaying instead of silently treating
/// redeliveries as live events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingToken {
    /// Plain position decided by the message source.
    Sequence(u64),
    /// Position inside a replay window, see [`ReplayToken`].
    Replay(ReplayToken),
}

impl TrackingToken {
    /// The underlying stream position, if the token has advanced anywhere
    /// yet. A freshly created replay token has no position until the first
    /// event passes through it.
    pub fn position(&self) -> Option<u64> {
        match self {
            TrackingToken::Sequence(sequence) => Some(*sequence),
            TrackingToken::Replay(replay) => replay.position(),
        }
    }

    /// Whether two tokens denote the same stream position, looking through
    /// replay wrappers. Events of one upcast group share a position even when
    /// one side carries a replay marker and the other does not.
    pub fn same_position(&self, other: &TrackingToken) -> bool {
        match (self.position(), other.position()) {
            (Some(own), Some(theirs)) => own == theirs,
            _ => false,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, TrackingToken::Replay(_))
    }
}

/// Marker wrapped around a token by [`reset_tokens`] to flag the replay
/// window: events at positions before `token_at_reset` are redeliveries.
///
/// `current_token` is the live position advancing through the window. Once it
/// reaches or passes `token_at_reset` the window is closed and
/// [`advanced_to`](ReplayToken::advanced_to) yields plain tokens again.
///
/// [`reset_tokens`]: crate::processor::TrackingProcessor::reset_tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayToken {
    token_at_reset: Box<TrackingToken>,
    current_token: Option<Box<TrackingToken>>,
}

impl ReplayToken {
    /// Wraps `token` to start a replay ending where `token` currently points.
    /// Wrapping a token that is already replaying keeps the original reset
    /// point; restarting a reset must not shrink the window.
    pub fn wrap(token: TrackingToken) -> TrackingToken {
        let token_at_reset = match token {
            TrackingToken::Replay(replay) => replay.token_at_reset,
            plain => Box::new(plain),
        };
        TrackingToken::Replay(ReplayToken {
            token_at_reset,
            current_token: None,
        })
    }

    /// The position the processor had reached when the reset was issued, i.e.
    /// the end of the replay window.
    pub fn token_at_reset(&self) -> &TrackingToken {
        &self.token_at_reset
    }

    /// The live position inside the window, `None` before the first event.
    pub fn current_token(&self) -> Option<&TrackingToken> {
        self.current_token.as_deref()
    }

    pub fn position(&self) -> Option<u64> {
        self.current_token.as_ref().and_then(|token| token.position())
    }

    /// Advances the window to `new_token`. Yields `new_token` untouched once
    /// it reaches or passes the reset point (the window is closed), otherwise
    /// a replay token carrying the new position.
    pub fn advanced_to(&self, new_token: TrackingToken) -> TrackingToken {
        match (new_token.position(), self.token_at_reset.position()) {
            (Some(reached), Some(reset)) if reached >= reset => new_token,
            _ => TrackingToken::Replay(ReplayToken {
                token_at_reset: self.token_at_reset.clone(),
                current_token: Some(Box::new(new_token)),
            }),
        }
    }
}
