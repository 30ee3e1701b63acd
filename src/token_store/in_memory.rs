// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::{errors::TokenStoreError, token::TrackingToken, token_store::TokenStore};

const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(10);

/// Shareable backend of [`InMemoryTokenStore`] handles.
///
/// Every handle created over the same backend sees the same rows and
/// competes for the same claims, which models a cluster of nodes sharing one
/// store within a single process.
#[derive(Debug, Default)]
pub struct TokenStoreBackend {
    rows: Mutex<HashMap<(String, u32), TokenRow>>,
}

#[derive(Debug)]
struct TokenRow {
    /// Token serialized at rest; the store round-trips opaque values.
    token: Option<String>,
    owner: Option<String>,
    claimed_at: Instant,
}

impl TokenStoreBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The current claim owner of a segment, lease expiry ignored.
    pub fn claim_owner(&self, processor_name: &str, segment_id: u32) -> Option<String> {
        self.lock()
            .get(&(processor_name.to_owned(), segment_id))
            .and_then(|row| row.owner.clone())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, u32), TokenRow>> {
        self.rows.lock().expect("token row lock poisoned")
    }
}

/// Claim-enforcing token store held entirely in memory.
///
/// Each handle carries the owner identity of its node; claims are granted to
/// one owner at a time and lapse after `claim_timeout` without an extension.
/// Useful for tests and single-process deployments; durable setups implement
/// [`TokenStore`] over their database instead.
#[derive(Debug, Clone)]
pub struct InMemoryTokenStore {
    backend: Arc<TokenStoreBackend>,
    owner: String,
    claim_timeout: Duration,
}

impl InMemoryTokenStore {
    /// A store over a fresh, private backend.
    pub fn new(owner: impl Into<String>) -> Self {
        Self::with_backend(TokenStoreBackend::new(), owner)
    }

    /// A store handle joining an existing backend under its own owner
    /// identity.
    pub fn with_backend(backend: Arc<TokenStoreBackend>, owner: impl Into<String>) -> Self {
        Self {
            backend,
            owner: owner.into(),
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }

    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    pub fn backend(&self) -> Arc<TokenStoreBackend> {
        self.backend.clone()
    }

    fn may_claim(&self, row: &TokenRow) -> bool {
        match &row.owner {
            None => true,
            Some(owner) if *owner == self.owner => true,
            Some(_) => row.claimed_at.elapsed() >= self.claim_timeout,
        }
    }

    /// Runs `op` on the row, requiring an existing claim by this owner.
    fn with_claimed_row<T>(
        &self,
        processor_name: &str,
        segment_id: u32,
        op: impl FnOnce(&mut TokenRow) -> Result<T, TokenStoreError>,
    ) -> Result<T, TokenStoreError> {
        let mut rows = self.backend.lock();
        let row = rows
            .get_mut(&(processor_name.to_owned(), segment_id))
            .ok_or_else(|| TokenStoreError::UnableToClaim {
                segment: segment_id,
                reason: "segment is not initialized".into(),
            })?;
        if row.owner.as_deref() != Some(self.owner.as_str()) {
            return Err(TokenStoreError::UnableToClaim {
                segment: segment_id,
                reason: match &row.owner {
                    Some(owner) => format!("owned by `{owner}`"),
                    None => "claim was released".into(),
                },
            });
        }
        op(row)
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn fetch_segments(&self, processor_name: &str) -> Result<Vec<u32>, TokenStoreError> {
        let rows = self.backend.lock();
        let mut segments: Vec<u32> = rows
            .keys()
            .filter(|(name, _)| name == processor_name)
            .map(|(_, segment_id)| *segment_id)
            .collect();
        segments.sort_unstable();
        Ok(segments)
    }

    async fn initialize_token_segments(
        &self,
        processor_name: &str,
        count: u32,
    ) -> Result<(), TokenStoreError> {
        let mut rows = self.backend.lock();
        if rows.keys().any(|(name, _)| name == processor_name) {
            // Another node raced the initialization; the caller re-fetches.
            return Err(TokenStoreError::Transient(format!(
                "segments for `{processor_name}` already initialized"
            )));
        }
        for segment_id in 0..count {
            rows.insert(
                (processor_name.to_owned(), segment_id),
                TokenRow {
                    token: None,
                    owner: None,
                    claimed_at: Instant::now(),
                },
            );
        }
        Ok(())
    }

    async fn fetch_token(
        &self,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<Option<TrackingToken>, TokenStoreError> {
        let mut rows = self.backend.lock();
        let row = rows
            .get_mut(&(processor_name.to_owned(), segment_id))
            .ok_or_else(|| TokenStoreError::UnableToClaim {
                segment: segment_id,
                reason: "segment is not initialized".into(),
            })?;
        if !self.may_claim(row) {
            return Err(TokenStoreError::UnableToClaim {
                segment: segment_id,
                reason: format!(
                    "owned by `{}`",
                    row.owner.as_deref().unwrap_or_default()
                ),
            });
        }
        row.owner = Some(self.owner.clone());
        row.claimed_at = Instant::now();
        row.token
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|err| TokenStoreError::Fatal(format!("stored token is corrupt: {err}")))
    }

    async fn store_token(
        &self,
        token: &TrackingToken,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<(), TokenStoreError> {
        let serialized = serde_json::to_string(token)
            .map_err(|err| TokenStoreError::Fatal(format!("token is not serializable: {err}")))?;
        self.with_claimed_row(processor_name, segment_id, |row| {
            row.token = Some(serialized);
            row.claimed_at = Instant::now();
            Ok(())
        })
    }

    async fn extend_claim(
        &self,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<(), TokenStoreError> {
        self.with_claimed_row(processor_name, segment_id, |row| {
            row.claimed_at = Instant::now();
            Ok(())
        })
    }

    async fn release_claim(
        &self,
        processor_name: &str,
        segment_id: u32,
    ) -> Result<(), TokenStoreError> {
        let mut rows = self.backend.lock();
        if let Some(row) = rows.get_mut(&(processor_name.to_owned(), segment_id)) {
            if row.owner.as_deref() == Some(self.owner.as_str()) {
                row.owner = None;
            }
        }
        Ok(())
    }
}
