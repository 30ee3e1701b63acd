// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::{errors::TokenStoreError, token::TrackingToken};

mod file;
mod in_memory;

pub use file::FileTokenStore;
pub use in_memory::{InMemoryTokenStore, TokenStoreBackend};

/// Durable storage of tracking tokens, keyed by `(processor_name,
/// segment_id)`, and the cluster's coordination point.
///
/// A *claim* pairs a token row with an owner identity and a lease timestamp.
/// [`fetch_token`](TokenStore::fetch_token) claims atomically; the store must
/// guarantee that at most one owner holds the claim on a row at any instant,
/// across every process sharing the backend. Rows whose lease lapsed count as
/// unclaimed.
///
/// Tokens are opaque round-trippable values; their layout is entirely this
/// store's concern.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Identifiers of all segments known for `processor_name`, ascending.
    async fn fetch_segments(&self, processor_name: &str) -> Result<Vec<u32>, TokenStoreError>;

    /// Creates `count` fresh segment rows, none of them holding a token yet.
    /// Fails when rows for `processor_name` already exist.
    async fn initialize_token_segments(
        &self,
        processor_name: &str,
        count: u32,
    ) -> Result<(), TokenStoreError>;

    /// Fetches the stored token of a segment, atomically claiming the
    /// segment for this node. `None` means the segment has not progressed
    /// past the beginning of the stream.
    async fn fetch_token(
        &self,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<Option<TrackingToken>, TokenStoreError>;

    /// Persists `token` for a segment this node has claimed.
    async fn store_token(
        &self,
        token: &TrackingToken,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<(), TokenStoreError>;

    /// Refreshes the lease of an existing claim.
    async fn extend_claim(
        &self,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<(), TokenStoreError>;

    /// Clears this node's claim. Releasing a claim held by no one, or by
    /// another node, is a no-op.
    async fn release_claim(
        &self,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<(), TokenStoreError>;
}
