// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2024 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::{sync::Notify, task::JoinHandle};

/// Spawner of processor tasks that counts how many are live.
///
/// Shutdown blocks on [`wait_idle`](WorkerPool::wait_idle) until the count
/// reaches zero, so every launcher and segment worker must run through this
/// pool. A worker the launcher runs inline is covered by the launcher's own
/// counter entry. The counter guard is dropped even when a task panics,
/// keeping the count accurate on every exit path.
///
/// Handles are cheap to clone and share the same counter.
#[derive(Debug, Clone, Default)]
pub struct WorkerPool {
    live: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live tasks, the launcher included while it runs.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Spawns `future` as a counted task.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.track();
        tokio::spawn(async move {
            let _guard = guard;
            future.await
        })
    }

    /// Waits until no tracked task is live. Returns immediately when the
    /// pool is already idle.
    pub async fn wait_idle(&self) {
        loop {
            // Register before re-checking so a task exiting in between is
            // not missed.
            let notified = self.idle.notified();
            if self.live.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn track(&self) -> LiveGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        LiveGuard {
            live: self.live.clone(),
            idle: self.idle.clone(),
        }
    }
}

struct LiveGuard {
    live: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}
