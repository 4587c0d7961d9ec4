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

use tokio::sync::watch;

///
/// A single-assignment value satisfied by one producer and broadcast to any number of receivers.
///
/// Once satisfied, every receiver (including those subscribed afterwards) observes the same
/// value: satisfaction is terminal. If the Promise is dropped unsatisfied, receivers observe
/// `None`.
///
/// NB: This is a `tokio::sync::watch` channel: the Sender side holds the slot, and receivers are
/// subscribed on demand so that a Promise can be stored in long-lived data structures (such as
/// the memo trie's in-progress nodes) without holding receiver state.
///
#[derive(Debug)]
pub struct Promise<T: Clone + Send + Sync + 'static> {
    sender: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    pub fn new() -> Promise<T> {
        let (sender, _receiver) = watch::channel(None);
        Promise { sender }
    }

    ///
    /// Satisfy the Promise, waking all receivers. Satisfaction is single-assignment: calls after
    /// the first do not change the observed value.
    ///
    pub fn satisfy(&self, value: T) {
        self.sender.send_modify(|slot| {
            if slot.is_none() {
                *slot = Some(value);
            }
        });
    }

    pub fn is_satisfied(&self) -> bool {
        self.sender.borrow().is_some()
    }

    pub fn receiver(&self) -> PromiseReceiver<T> {
        PromiseReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct PromiseReceiver<T: Clone + Send + Sync + 'static> {
    receiver: watch::Receiver<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> PromiseReceiver<T> {
    ///
    /// Wait for the Promise to be satisfied, or return None if it was dropped unsatisfied.
    ///
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(ref value) = *self.receiver.borrow() {
                return Some(value.clone());
            }

            if self.receiver.changed().await.is_err() {
                // The Promise was dropped: if it was satisfied first, the slot still holds the
                // value.
                return self.receiver.borrow().clone();
            }
        }
    }
}
