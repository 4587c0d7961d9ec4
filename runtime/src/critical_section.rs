// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

struct Inner {
    held: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

///
/// A lock whose acquisition is a future, usable across await points and from multiple threads.
///
/// Waiters are granted the lock in strict FIFO order of their `acquire` calls. The guard
/// releases on drop, handing the lock directly to the next waiter.
///
#[derive(Clone)]
pub struct CriticalSection {
    inner: Arc<Mutex<Inner>>,
}

impl CriticalSection {
    pub fn new() -> CriticalSection {
        CriticalSection {
            inner: Arc::new(Mutex::new(Inner {
                held: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    ///
    /// Request the eventual acquisition of the lock. When the returned future completes, the
    /// caller holds the lock until the guard is dropped.
    ///
    pub async fn acquire(&self) -> CriticalSectionGuard {
        let waiting = {
            let mut inner = self.inner.lock();
            if inner.held {
                let (sender, receiver) = oneshot::channel();
                inner.waiters.push_back(sender);
                Some(receiver)
            } else {
                inner.held = true;
                None
            }
        };

        if let Some(receiver) = waiting {
            // The sender is either fired to hand over the lock, or dropped only after its
            // receiver has gone away: a live waiter always receives.
            receiver
                .await
                .expect("CriticalSection handoff sender was dropped");
        }

        CriticalSectionGuard {
            inner: self.inner.clone(),
        }
    }

    ///
    /// Runs the given Future-creating function (and the Future it returns) while holding the
    /// lock.
    ///
    pub async fn with_acquired<F, B, T>(&self, f: F) -> T
    where
        F: FnOnce() -> B + Send,
        B: Future<Output = T> + Send,
    {
        let guard = self.acquire().await;
        let t = f().await;
        drop(guard);
        t
    }
}

pub struct CriticalSectionGuard {
    inner: Arc<Mutex<Inner>>,
}

impl Drop for CriticalSectionGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        loop {
            if let Some(waiter) = inner.waiters.pop_front() {
                // Hand the lock over without clearing `held`. A waiter whose acquire future was
                // dropped is skipped in favor of the next.
                if waiter.send(()).is_ok() {
                    return;
                }
            } else {
                inner.held = false;
                return;
            }
        }
    }
}
