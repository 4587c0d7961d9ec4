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

//! An incremental build and task-orchestration engine.
//!
//! Projects are described as a tree of rule files; rules resolve through directory-directed
//! inheritance (`ruletree`), evaluate concurrently on the async runtime (`task_executor`,
//! `runtime`), and heavyweight rules persist their results in a content-addressed memoization
//! database (`memodb`) so unchanged inputs reuse outputs across process lifetimes.

mod tool;


pub use errorlog::ErrorLog;
pub use hashing::{
    fingerprint_of, fingerprint_subtract, fingerprint_sum, Fingerprint, Value, ValueHasher,
};
pub use memodb::{MemoDb, TracedExecution};
pub use ruletree::{
    CliHook, MemoContext, MemoizedRule, PathArg, RuleContext, RuleFileScope, RuleOptions,
    RuleTree, RuleTreeBuilder,
};
pub use runtime::{
    all, bind, bind_result, when_done, when_succeeded, CriticalSection, Failure, Outcome,
    OutcomeFuture, Success, ValueFuture,
};
pub use subexec::{launch, LaunchOptions};
pub use task_executor::Executor;

pub use crate::tool::{parse_arg, project_root, render_result, tool_main};
