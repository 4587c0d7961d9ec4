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

mod critical_section;
pub use crate::critical_section::{CriticalSection, CriticalSectionGuard};

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use futures::future::{self, BoxFuture, FutureExt};
use hashing::Value;
use serde::{Deserialize, Serialize};

///
/// The final state of a computation: a Success carrying values, or a Failure.
///
/// Terminality is a structural guarantee: outcomes are broadcast by value (via `async_value` or
/// `futures::future::Shared`), so observing an outcome twice always yields identical values and
/// a success can never be re-observed as a failure.
///
pub type Outcome = Result<Success, Failure>;

pub type OutcomeFuture = BoxFuture<'static, Outcome>;

pub type ValueFuture = BoxFuture<'static, Result<Value, Failure>>;

///
/// A successful result: a positional value list plus a keyword value map.
///
/// The common case of a single value is a positional list of length one.
///
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Success {
    pub values: Vec<Value>,
    pub keys: BTreeMap<String, Value>,
}

impl Success {
    pub fn empty() -> Success {
        Success::default()
    }

    pub fn of(value: Value) -> Success {
        Success {
            values: vec![value],
            keys: BTreeMap::new(),
        }
    }

    pub fn new(values: Vec<Value>, keys: BTreeMap<String, Value>) -> Success {
        Success { values, keys }
    }

    ///
    /// Collapse to the single interesting value: the first positional value, or None when the
    /// Success is empty.
    ///
    pub fn value(&self) -> Value {
        self.values.first().cloned().unwrap_or(Value::None)
    }
}

///
/// The closed space of failures that propagate through the engine.
///
/// `Invariant` and `Cancelled` are aborting: they are never handed to user-level recovery and
/// take down the run at the outermost entry point.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Failure {
    /// A user-facing failure with a title and body, retained by the error log for the shutdown
    /// summary. Constructing one (via the error log) marks the process as aborting.
    Logged { title: String, message: String },
    /// The resolver could not find a rule definition.
    NoDefinition { name: String, hint: Option<String> },
    /// A child rule-file changed an inherited rule's `path_arg` or `cli` annotation.
    ConfigContradiction {
        rule: String,
        annotation: String,
        dir: String,
    },
    /// Two keyed value sets merged with differing values for the same key.
    Conflict {
        key: String,
        left: String,
        right: String,
    },
    /// An internal bug: identical traces with diverging digests, a satisfied invariant broken.
    Invariant(String),
    /// An external interrupt.
    Cancelled,
    /// Any other failure captured by the future machinery.
    Wrapped(String),
}

impl Failure {
    pub fn wrapped(err: impl fmt::Display) -> Failure {
        Failure::Wrapped(err.to_string())
    }

    ///
    /// True for failure kinds which must abort the run rather than be caught.
    ///
    pub fn aborts(&self) -> bool {
        matches!(self, Failure::Invariant(_) | Failure::Cancelled)
    }

    ///
    /// Hand the failure to user-level recovery, unless it is an aborting kind, in which case it
    /// is re-propagated. Intended for use with `?` at catch points:
    ///
    /// ```ignore
    /// let failure = result.err().unwrap().recoverable()?;
    /// // ... handle `failure` ...
    /// ```
    ///
    pub fn recoverable(self) -> Result<Failure, Failure> {
        if self.aborts() {
            Err(self)
        } else {
            Ok(self)
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Logged { title, message } => {
                if message.is_empty() {
                    write!(f, "{title}")
                } else {
                    write!(f, "{title}: {message}")
                }
            }
            Failure::NoDefinition { name, hint } => {
                write!(f, "No definition for '{name}'")?;
                if let Some(hint) = hint {
                    write!(f, ". {hint}")?;
                }
                Ok(())
            }
            Failure::ConfigContradiction {
                rule,
                annotation,
                dir,
            } => write!(
                f,
                "Child definition '{dir}:{rule}' may not change '{annotation}' annotation."
            ),
            Failure::Conflict { key, left, right } => {
                write!(f, "Conflicting values for key '{key}': {left} vs {right}")
            }
            Failure::Invariant(message) => write!(f, "Invariant violation: {message}"),
            Failure::Cancelled => write!(f, "Cancelled"),
            Failure::Wrapped(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for Failure {}

///
/// Join the given futures: the Success concatenates all positional values and merges all keyed
/// values in argument order; a failure short-circuits to the first failure in argument order.
/// Keyed values merging with differing values for the same key are a `Conflict`.
///
pub async fn all(inputs: Vec<OutcomeFuture>) -> Outcome {
    let results = future::join_all(inputs).await;
    let mut values = Vec::new();
    let mut keys: BTreeMap<String, Value> = BTreeMap::new();
    for result in results {
        let success = result?;
        values.extend(success.values);
        for (key, value) in success.keys {
            match keys.get(&key) {
                Some(existing) if *existing != value => {
                    return Err(Failure::Conflict {
                        key,
                        left: existing.to_string(),
                        right: value.to_string(),
                    });
                }
                _ => {
                    keys.insert(key, value);
                }
            }
        }
    }
    Ok(Success::new(values, keys))
}

///
/// A zero-valued Success once all inputs are done, regardless of their results.
///
pub async fn when_done(inputs: Vec<OutcomeFuture>) -> Outcome {
    let _results = future::join_all(inputs).await;
    Ok(Success::empty())
}

///
/// A zero-valued Success if all inputs succeeded; otherwise the first failure in argument order.
///
pub async fn when_succeeded(inputs: Vec<OutcomeFuture>) -> Outcome {
    let results = future::join_all(inputs).await;
    for result in results {
        result?;
    }
    Ok(Success::empty())
}

///
/// Wait for `arg`, then invoke `f` with the unwrapped Success; a failure short-circuits without
/// invoking `f`.
///
pub fn bind<F, Fut>(arg: OutcomeFuture, f: F) -> OutcomeFuture
where
    F: FnOnce(Success) -> Fut + Send + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async move {
        let success = arg.await?;
        f(success).await
    }
    .boxed()
}

///
/// Wait for `arg`, then invoke `f` with the Outcome itself, letting user code observe and
/// convert failures. Aborting failures are never handed to `f`.
///
pub fn bind_result<F, Fut>(arg: OutcomeFuture, f: F) -> OutcomeFuture
where
    F: FnOnce(Outcome) -> Fut + Send + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async move {
        match arg.await {
            Err(failure) if failure.aborts() => Err(failure),
            outcome => f(outcome).await,
        }
    }
    .boxed()
}
