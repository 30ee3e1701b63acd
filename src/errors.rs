// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

pub type ProcessorResult<T, E = ProcessorError> = core::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProcessorError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokenStore(#[from] TokenStoreError),

    #[error("{component} shutdown error: `{msg}`")]
    Shutdown { component: String, msg: String },

    #[error("Event handling failed: `{0}`")]
    EventHandling(String),

    #[error("Transaction error: `{0}`")]
    Transaction(String),

    #[error("Event stream error: `{0}`")]
    Stream(String),

    #[error("Event stream closed by the source")]
    StreamClosed,

    #[error("Reset not supported by the registered event handler invoker")]
    ResetNotSupported,

    #[error("Reset rejected: processor is running or segments are still active")]
    ResetRejected,
}

/// Error taxonomy of [`TokenStore`](crate::TokenStore) operations.
///
/// `UnableToClaim` is not a failure of the store itself: another node owns
/// the segment and the caller is expected to back off and retry. `Transient`
/// errors are recoverable by releasing the claim and reopening; `Fatal`
/// errors pause the processor.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TokenStoreError {
    #[error("Unable to claim token for segment {segment}: {reason}")]
    UnableToClaim { segment: u32, reason: String },

    #[error("Transient token store error: `{0}`")]
    Transient(String),

    #[error("Fatal token store error: `{0}`")]
    Fatal(String),
}

impl TokenStoreError {
    pub fn is_claim_conflict(&self) -> bool {
        matches!(self, TokenStoreError::UnableToClaim { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TokenStoreError::Fatal(_))
    }
}

impl ProcessorError {
    /// Whether the error is unrecoverable for the worker that observed it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessorError::TokenStore(err) if err.is_fatal())
    }

    pub fn is_claim_conflict(&self) -> bool {
        matches!(self, ProcessorError::TokenStore(err) if err.is_claim_conflict())
    }
}
