// Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;

use async_trait::async_trait;

use crate::errors::ProcessorResult;

/// An open transaction around token operations and event handling.
///
/// Handler side effects and the token advance of one batch go through the
/// same transaction, so either both commit or both roll back.
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> ProcessorResult<()>;

    async fn rollback(self: Box<Self>) -> ProcessorResult<()>;
}

/// The port to the infrastructure's transaction machinery.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> ProcessorResult<Box<dyn Transaction>>;
}

/// Runs `op` inside a fresh transaction, committing on success and rolling
/// back on error. Rollback failures are not surfaced over the original error.
pub(crate) async fn in_transaction<T, F>(
    manager: &dyn TransactionManager,
    op: F,
) -> ProcessorResult<T>
where
    F: Future<Output = ProcessorResult<T>> + Send,
{
    let transaction = manager.begin().await?;
    match op.await {
        Ok(value) => {
            transaction.commit().await?;
            Ok(value)
        }
        Err(err) => {
            let _ = transaction.rollback().await;
            Err(err)
        }
    }
}

/// Manager for infrastructure that is transactional per operation (or not at
/// all); begin, commit and rollback are no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransactionManager;

struct NoTransaction;

#[async_trait]
impl TransactionManager for NoTransactionManager {
    async fn begin(&self) -> ProcessorResult<Box<dyn Transaction>> {
        Ok(Box::new(NoTransaction))
    }
}

#[async_trait]
impl Transaction for NoTransaction {
    async fn commit(self: Box<Self>) -> ProcessorResult<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> ProcessorResult<()> {
        Ok(())
    }
}
