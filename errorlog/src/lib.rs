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

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;

use colored::Colorize;
use console::Term;
use parking_lot::Mutex;
use runtime::Failure;

const FALLBACK_ROWS: usize = 25;
const FALLBACK_COLS: usize = 50;

struct Inner {
    fatal: Option<Failure>,
    entries: Vec<(String, String)>,
    banner_shown: bool,
}

///
/// A sink for user-facing errors, surfaced in aggregate at shutdown.
///
/// An explicit handle rather than a process-global: the entry point constructs one and threads
/// it through the engine. Cloning shares the underlying state.
///
#[derive(Clone)]
pub struct ErrorLog {
    inner: Arc<Mutex<Inner>>,
}

impl ErrorLog {
    pub fn new() -> ErrorLog {
        ErrorLog {
            inner: Arc::new(Mutex::new(Inner {
                fatal: None,
                entries: Vec::new(),
                banner_shown: false,
            })),
        }
    }

    ///
    /// Record a fatal, user-facing failure. The entry is retained for the shutdown summary and
    /// the process is marked as aborting; the returned Failure is the value to propagate.
    ///
    pub fn logged_error(
        &self,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Failure {
        let title = title.into();
        let message = message.into();
        let failure = Failure::Logged {
            title: title.clone(),
            message: message.clone(),
        };

        let fresh = {
            let mut inner = self.inner.lock();
            inner.fatal = Some(failure.clone());
            let pair = (title.clone(), message.clone());
            if inner.entries.contains(&pair) {
                false
            } else {
                inner.entries.push(pair);
                true
            }
        };

        if fresh {
            let term = Term::stderr();
            if term.is_term() {
                // On a terminal the full entry is shown in the shutdown summary; announce the
                // failure once so the ongoing output isn't interleaved with error bodies.
                let mut inner = self.inner.lock();
                if !inner.banner_shown {
                    inner.banner_shown = true;
                    drop(inner);
                    eprintln!("{}", "*** Something FAILED! ***".red());
                }
            } else {
                eprint!("{}", render_entry(&title, &message, FALLBACK_COLS));
            }
        }

        failure
    }

    pub fn warning(&self, message: &str) {
        self.show(&format!("WARNING: {message}"), "");
    }

    ///
    /// Print an error message to stderr immediately, and retain it for the shutdown summary if
    /// an aborting error occurs elsewhere.
    ///
    pub fn show(&self, title: &str, message: &str) {
        let fresh = {
            let mut inner = self.inner.lock();
            let pair = (title.to_owned(), message.to_owned());
            if inner.entries.contains(&pair) {
                false
            } else {
                inner.entries.push(pair);
                true
            }
        };

        if fresh {
            eprint!("{}", render_entry(title, message, terminal_cols()));
        }
    }

    ///
    /// If a logged error has been previously constructed, return it as an Err here. Otherwise
    /// no-op. Checked at cooperative points, e.g. before spawning a child process.
    ///
    pub fn raise_if_aborting(&self) -> Result<(), Failure> {
        match &self.inner.lock().fatal {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }

    pub fn is_aborting(&self) -> bool {
        self.inner.lock().fatal.is_some()
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.inner.lock().entries.clone()
    }

    ///
    /// Called from the top-level entry point when an uncaught failure is about to abort
    /// execution: displays the accumulated error log and returns the process exit status.
    ///
    pub fn aborted(&self, failure: Option<&Failure>) -> i32 {
        if let Some(Failure::Cancelled) = failure {
            return 1;
        }

        let uncaught = match failure {
            Some(f @ Failure::Logged { .. }) => {
                // Already retained when it was constructed.
                log::debug!("Aborting with logged error: {f}");
                None
            }
            Some(f) => Some(("Uncaught exception".to_owned(), f.to_string())),
            None => None,
        };

        let term = Term::stderr();
        if !term.is_term() {
            if let Some((title, message)) = uncaught {
                eprint!("{}", render_entry(&title, &message, FALLBACK_COLS));
            }
            return 1;
        }

        let entries = {
            let mut inner = self.inner.lock();
            if let Some(pair) = uncaught {
                inner.entries.push(pair);
            }
            inner.entries.clone()
        };

        let (rows, cols) = terminal_size();
        let text = entries
            .iter()
            .map(|(title, message)| render_entry(title, message, cols))
            .collect::<Vec<_>>()
            .join("\n");

        // Estimate rendered height with ANSI escapes stripped and long lines wrapped.
        let text_rows: usize = console::strip_ansi_codes(&text)
            .split('\n')
            .map(|line| std::cmp::max(1, line.chars().count().div_ceil(cols)))
            .sum();

        if text_rows >= rows.saturating_sub(3) {
            page_or_print(&text);
        } else {
            eprint!("{text}");
        }
        1
    }
}

fn terminal_size() -> (usize, usize) {
    let term = Term::stderr();
    if term.is_term() {
        let (rows, cols) = term.size();
        if rows > 0 && cols > 0 {
            return (rows as usize, cols as usize);
        }
    }
    (FALLBACK_ROWS, FALLBACK_COLS)
}

fn terminal_cols() -> usize {
    terminal_size().1
}

fn render_entry(title: &str, message: &str, cols: usize) -> String {
    let mut out = String::new();
    out.push_str(&"~".repeat(cols));
    out.push('\n');
    out.push_str(&format!("{}", title.red()));
    out.push('\n');
    if !message.is_empty() {
        out.push('\n');
        out.push_str(message);
        if !message.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

fn page_or_print(text: &str) {
    let pager = std::env::var("PAGER").unwrap_or_else(|_| "less -R".to_owned());
    let mut argv = pager.split_whitespace();
    let Some(program) = argv.next() else {
        eprint!("{text}");
        return;
    };

    let child = Command::new(program)
        .args(argv)
        .stdin(Stdio::piped())
        .spawn();
    match child {
        Ok(mut child) => {
            if let Some(stdin) = child.stdin.as_mut() {
                let _ = stdin.write_all(text.as_bytes());
            }
            let _ = child.wait();
        }
        Err(_) => eprint!("{text}"),
    }
}
