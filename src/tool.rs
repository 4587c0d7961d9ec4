// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::io::Write;
use std::path::PathBuf;

use hashing::Value;
use ruletree::RuleTree;
use runtime::Failure;

///
/// The project root for the tool: `NOBS_ROOT` when set, the working directory otherwise.
///
pub fn project_root() -> PathBuf {
    std::env::var_os("NOBS_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

///
/// Best-effort argument parsing: integer, then float, then string.
///
pub fn parse_arg(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return Value::Float(f);
    }
    Value::str(s)
}

///
/// Render a rule result for the command line: `None` is suppressed, scalars print bare,
/// sequences and sets print one entry per line, and anything else stringifies via its natural
/// representation.
///
pub fn render_result(value: &Value) -> Option<String> {
    match value {
        Value::None => None,
        Value::Str(s) => Some(s.clone()),
        Value::Bool(_) | Value::Int(_) | Value::Float(_) => Some(value.to_string()),
        Value::Seq(elements) => Some(
            elements
                .iter()
                .map(|e| format!("{e}\n"))
                .collect::<Vec<_>>()
                .concat(),
        ),
        Value::Set(members) => Some(
            members
                .iter()
                .map(|m| format!("{m}\n"))
                .collect::<Vec<_>>()
                .concat(),
        ),
        Value::Map(_) => Some(value.to_string()),
    }
}

///
/// The command-line semantics of the tool entry point: `tool <command> [arg...]`, plus
/// `tool help <command>`. Returns the process exit status.
///
pub fn tool_main(tree: &RuleTree, argv: &[String]) -> i32 {
    let executor = tree.executor().clone();
    executor.block_on(run(tree, argv))
}

async fn run(tree: &RuleTree, argv: &[String]) -> i32 {
    let hooks = match tree.cli_hooks() {
        Ok(hooks) => hooks,
        Err(failure) => return tree.errorlog().aborted(Some(&failure)),
    };

    let Some(command) = argv.first() else {
        eprintln!("Usage: tool <command> [arg...]");
        return 1;
    };

    if command == "help" {
        let Some(target) = argv.get(1) else {
            eprintln!("Usage: tool help <command>");
            return 1;
        };
        let Some(hook) = hooks.get(target) else {
            println!("Unknown command \"{target}\".");
            return 1;
        };
        match &hook.doc {
            Some(doc) => println!("{doc}"),
            None => println!("No help for '{}'.", hook.rule),
        }
        return 0;
    }

    let Some(hook) = hooks.get(command) else {
        println!("Unknown command \"{command}\".");
        return 1;
    };

    log::debug!("Dispatching command '{command}'");
    let args = argv[1..].iter().map(|arg| parse_arg(arg)).collect();
    // Dispatch as a launched task, waiting on its promise from here.
    let mut invocation = tree.executor().launch(hook.invoke(args));
    let outcome = invocation.recv().await.unwrap_or_else(|| {
        Err(Failure::Invariant(
            "The command task died without reporting.".to_owned(),
        ))
    });
    match outcome {
        Ok(value) => {
            if let Some(text) = render_result(&value) {
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
            match tree.db().save().await {
                Ok(()) => 0,
                Err(failure) => tree.errorlog().aborted(Some(&failure)),
            }
        }
        Err(failure) => tree.errorlog().aborted(Some(&failure)),
    }
}
