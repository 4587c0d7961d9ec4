// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_value::{Promise, PromiseReceiver};
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};

///
/// The scheduling domain for rule evaluation: a pool of worker threads that launched work is
/// handed off to.
///
/// Every submission completes through a `Promise`: `launch` and `blocking` return the promise's
/// receiver rather than a join handle. Launched work runs to completion whether or not anyone
/// is still waiting, and a worker that dies mid-task (a panic, or pool shutdown) leaves its
/// promise unsatisfied, which waiters observe as `None` at a well-defined point instead of a
/// panic propagating into an unrelated task.
///
/// Executors come in two flavors:
/// * "borrowed"
///     * Created with `Self::new()` inside an existing runtime (generally the one provided by
///       tokio's test macros). Dropping all clones leaves that runtime alone, and `shutdown`
///       has no effect.
/// * "owned"
///     * Created with `Self::new_owned()`. The Executor owns its worker threads, and `shutdown`
///       (or dropping every clone) tears them down.
///
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    ///
    /// A borrowed Executor over the ambient runtime. The caller must keep that runtime alive
    /// for as long as any clone of the Executor is used.
    ///
    pub fn new() -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    ///
    /// An owned Executor with its own worker threads. The worker count defaults to the detected
    /// core count.
    ///
    pub fn new_owned(worker_threads: Option<usize>) -> Result<Executor, String> {
        let worker_threads = worker_threads.unwrap_or_else(num_cpus::get);
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to start the worker pool: {e}"))?;

        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    ///
    /// Launch a future onto the pool, and return a receiver for the promise of its output.
    ///
    /// The work is independent of the returned receiver: dropping the receiver does not cancel
    /// it. If the task dies before satisfying the promise, receivers observe `None`.
    ///
    pub fn launch<F>(&self, future: F) -> PromiseReceiver<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Clone + Send + Sync + 'static,
    {
        let promise = Promise::new();
        let receiver = promise.receiver();
        self.handle.spawn(async move {
            promise.satisfy(future.await);
        });
        receiver
    }

    ///
    /// Launch a blocking function (file hashing, draining a child process) on the threads
    /// reserved for long-running IO, keeping it off the cooperative workers. Completion is
    /// reported exactly as for `launch`.
    ///
    pub fn blocking<R, F>(&self, f: F) -> PromiseReceiver<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Clone + Send + Sync + 'static,
    {
        let promise = Promise::new();
        let receiver = promise.receiver();
        self.handle.spawn_blocking(move || {
            promise.satisfy(f());
        });
        receiver
    }

    ///
    /// Run a future to completion from outside the pool, blocking the calling thread.
    ///
    /// This is the outermost wait only: it should never be called from within launched work,
    /// and only ever from something that resembles a main method.
    ///
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    ///
    /// A blocking call to shut down the worker threads of an "owned" Executor. If tasks do not
    /// shut down within the given timeout, they are leaked. Calls after the first (and calls on
    /// a borrowed Executor) have no effect.
    ///
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        let start = Instant::now();
        runtime.shutdown_timeout(timeout + Duration::from_millis(250));
        if start.elapsed() > timeout {
            log::warn!("Executor shutdown took unexpectedly long: tasks were likely leaked!");
        }
    }
}
