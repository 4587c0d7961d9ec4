// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use errorlog::ErrorLog;
use futures::future::FutureExt;
use hashing::Value;
use memodb::MemoDb;
use runtime::{Failure, OutcomeFuture, Success, ValueFuture};
use task_executor::Executor;
use tempfile::TempDir;

use crate::{
    MemoContext, MemoizedRule, PathArg, RuleContext, RuleOptions, RuleTree, RuleTreeBuilder,
};

fn flags(values: &[&str]) -> Value {
    Value::seq(values.iter().map(|v| Value::str(*v)).collect::<Vec<_>>())
}

///
/// The compilation-flags project from the rule-file documentation: a root definition with a
/// `path_arg`, overridden under `kernel/` with a deferring fallback.
///
fn fixture_tree(site: &Path) -> RuleTree {
    let _ = env_logger::builder().is_test(true).try_init();
    let root = site.to_owned();
    let kernel = root.join("kernel");
    let db = MemoDb::open(site, Executor::new()).unwrap();

    RuleTreeBuilder::new(&root)
        .rule_file(&root, |scope| {
            scope.rule(
                "optimization_flags",
                RuleOptions {
                    path_arg: Some(PathArg::Named("src".to_owned())),
                    params: vec!["src".to_owned()],
                    ..RuleOptions::default()
                },
                |_cxt, _args| async { Ok(flags(&["-O2"])) }.boxed(),
            );
            scope.rule(
                "compiler",
                RuleOptions {
                    cli: Some("compiler".to_owned()),
                    path_arg: Some(PathArg::Index(0)),
                    doc: Some("Print the compiler command line for a source file.".to_owned()),
                    ..RuleOptions::default()
                },
                |cxt, args| {
                    async move {
                        let opt = cxt.call("optimization_flags", args.clone()).await?;
                        let Value::Seq(opt) = opt else {
                            return Err(Failure::Wrapped("expected a flag list".to_owned()));
                        };
                        let mut command = vec![Value::str("gcc"), Value::str("-Wall")];
                        command.extend(opt);
                        command.push(Value::str("-c"));
                        command.push(args[0].clone());
                        Ok(Value::Seq(command))
                    }
                    .boxed()
                },
            );
        })
        .rule_file(&kernel, |scope| {
            let crunch = scope.here("crunch.c");
            scope.rule(
                "optimization_flags",
                RuleOptions::default(),
                move |cxt, args| {
                    let crunch = crunch.clone();
                    async move {
                        let src = args[0].as_str().unwrap_or_default().to_owned();
                        if Path::new(&src) == crunch {
                            Ok(flags(&["-O3", "-ffast-math"]))
                        } else {
                            // Same rule, same arguments: defers to the parent definition.
                            cxt.call("optimization_flags", args).await
                        }
                    }
                    .boxed()
                },
            );
        })
        .build(db, Executor::new(), ErrorLog::new())
}

fn call(tree: &RuleTree, name: &str, args: Vec<Value>) -> ValueFuture {
    let context = tree.root_context().unwrap();
    context.call(name, args)
}

#[tokio::test]
async fn path_dispatch_prefers_the_closest_rule_file() {
    let site = TempDir::new().unwrap();
    let tree = fixture_tree(site.path());

    let main_c = site.path().join("main.c").display().to_string();
    let crunch_c = site.path().join("kernel/crunch.c").display().to_string();

    assert_eq!(
        call(&tree, "optimization_flags", vec![Value::str(&main_c)])
            .await
            .unwrap(),
        flags(&["-O2"])
    );
    assert_eq!(
        call(&tree, "optimization_flags", vec![Value::str(&crunch_c)])
            .await
            .unwrap(),
        flags(&["-O3", "-ffast-math"])
    );
}

#[tokio::test]
async fn deferral_dispatches_to_the_parent_definition() {
    let site = TempDir::new().unwrap();
    let tree = fixture_tree(site.path());

    // The kernel definition receives the call, then defers to the root definition by invoking
    // itself with identical arguments.
    let other_c = site.path().join("kernel/other.c").display().to_string();
    assert_eq!(
        call(&tree, "optimization_flags", vec![Value::str(&other_c)])
            .await
            .unwrap(),
        flags(&["-O2"])
    );
}

#[tokio::test]
async fn rules_compose_through_the_context() {
    let site = TempDir::new().unwrap();
    let tree = fixture_tree(site.path());

    let crunch_c = site.path().join("kernel/crunch.c").display().to_string();
    assert_eq!(
        call(&tree, "compiler", vec![Value::str(&crunch_c)])
            .await
            .unwrap(),
        Value::seq(vec![
            Value::str("gcc"),
            Value::str("-Wall"),
            Value::str("-O3"),
            Value::str("-ffast-math"),
            Value::str("-c"),
            Value::str(&crunch_c),
        ])
    );
}

#[tokio::test]
async fn missing_definitions_are_an_error() {
    let site = TempDir::new().unwrap();
    let tree = fixture_tree(site.path());

    let outcome = call(&tree, "no_such_rule", vec![]).await;
    match outcome {
        Err(Failure::NoDefinition { name, .. }) => assert_eq!(name, "no_such_rule"),
        other => panic!("Expected NoDefinition, got: {other:?}"),
    }
}

#[tokio::test]
async fn children_may_not_contradict_inherited_annotations() {
    let site = TempDir::new().unwrap();
    let root = site.path().to_owned();
    let child = root.join("sub");
    let db = MemoDb::open(site.path(), Executor::new()).unwrap();

    let tree = RuleTreeBuilder::new(&root)
        .rule_file(&root, |scope| {
            scope.rule(
                "flags",
                RuleOptions {
                    path_arg: Some(PathArg::Index(0)),
                    ..RuleOptions::default()
                },
                |_cxt, _args| async { Ok(Value::None) }.boxed(),
            );
        })
        .rule_file(&child, |scope| {
            scope.rule(
                "flags",
                RuleOptions {
                    path_arg: Some(PathArg::Index(1)),
                    ..RuleOptions::default()
                },
                |_cxt, _args| async { Ok(Value::None) }.boxed(),
            );
        })
        .build(db, Executor::new(), ErrorLog::new());

    let inside = child.join("x.c").display().to_string();
    let outcome = call(&tree, "flags", vec![Value::str(&inside)]).await;
    match outcome {
        Err(Failure::ConfigContradiction {
            rule, annotation, ..
        }) => {
            assert_eq!(rule, "flags");
            assert_eq!(annotation, "path_arg");
        }
        other => panic!("Expected ConfigContradiction, got: {other:?}"),
    }
}

#[tokio::test]
async fn cli_hooks_expose_registered_rules() {
    let site = TempDir::new().unwrap();
    let tree = fixture_tree(site.path());

    let hooks = tree.cli_hooks().unwrap();
    let hook = hooks.get("compiler").expect("compiler hook");
    assert_eq!(hook.rule, "compiler");
    assert!(hook.doc.as_deref().unwrap().contains("compiler command"));

    let main_c = site.path().join("main.c").display().to_string();
    let result = hook.invoke(vec![Value::str(&main_c)]).await.unwrap();
    assert_eq!(
        result,
        Value::seq(vec![
            Value::str("gcc"),
            Value::str("-Wall"),
            Value::str("-O2"),
            Value::str("-c"),
            Value::str(&main_c),
        ])
    );
}

///
/// A memoised compile rule: one traced method resolving flags through the rule tree and
/// depending on the source file, and an execute which is counted.
///
struct CompiledRule {
    executions: Arc<AtomicUsize>,
}

impl MemoizedRule for CompiledRule {
    fn module(&self) -> &str {
        "tests"
    }

    fn name(&self) -> &str {
        "compiled"
    }

    fn traced_methods(&self) -> Vec<&'static str> {
        vec!["get_command"]
    }

    fn call_traced(
        &self,
        method: &str,
        me: memodb::TraceContext,
        cxt: RuleContext,
        rule_args: Vec<Value>,
        _call_args: Vec<Value>,
    ) -> ValueFuture {
        assert_eq!(method, "get_command");
        async move {
            let src = rule_args[0].as_str().unwrap_or_default().to_owned();
            me.depend_files([PathBuf::from(&src)]);
            cxt.call("compiler", rule_args).await
        }
        .boxed()
    }

    fn execute(&self, me: MemoContext) -> OutcomeFuture {
        self.executions.fetch_add(1, Ordering::SeqCst);
        async move {
            let command = me.call("get_command", vec![]).await?;
            Ok(Success::of(Value::Str(format!("ran: {command}"))))
        }
        .boxed()
    }
}

fn memoized_tree(site: &Path, executions: Arc<AtomicUsize>) -> RuleTree {
    let root = site.to_owned();
    let db = MemoDb::open(site, Executor::new()).unwrap();

    RuleTreeBuilder::new(&root)
        .rule_file(&root, move |scope| {
            scope.rule(
                "compiler",
                RuleOptions {
                    path_arg: Some(PathArg::Index(0)),
                    ..RuleOptions::default()
                },
                |_cxt, args| {
                    async move {
                        Ok(Value::seq(vec![
                            Value::str("gcc"),
                            Value::str("-c"),
                            args[0].clone(),
                        ]))
                    }
                    .boxed()
                },
            );
            let executions = executions.clone();
            scope.rule_memoized(
                "compiled",
                RuleOptions {
                    path_arg: Some(PathArg::Index(0)),
                    ..RuleOptions::default()
                },
                Arc::new(CompiledRule {
                    executions: executions.clone(),
                }),
            );
        })
        .build(db, Executor::new(), ErrorLog::new())
}

#[tokio::test]
async fn memoized_rules_are_cached_across_invocations() {
    let site = TempDir::new().unwrap();
    let src = site.path().join("main.c");
    std::fs::write(&src, "int main() {}").unwrap();
    let src_arg = Value::str(src.display().to_string());

    let executions = Arc::new(AtomicUsize::new(0));
    let tree = memoized_tree(site.path(), executions.clone());

    let first = call(&tree, "compiled", vec![src_arg.clone()]).await.unwrap();
    assert!(first.as_str().unwrap().starts_with("ran: "));
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    // A second invocation replays the trace and reuses the leaf.
    let second = call(&tree, "compiled", vec![src_arg.clone()]).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    // Changing the source file re-executes.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    std::fs::write(&src, "int main() { return 1; }").unwrap();
    call(&tree, "compiled", vec![src_arg]).await.unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn memoized_rules_distinguish_their_arguments_through_traces() {
    let site = TempDir::new().unwrap();
    let a = site.path().join("a.c");
    let b = site.path().join("b.c");
    std::fs::write(&a, "aaa").unwrap();
    std::fs::write(&b, "bbb").unwrap();

    let executions = Arc::new(AtomicUsize::new(0));
    let tree = memoized_tree(site.path(), executions.clone());

    let result_a = call(&tree, "compiled", vec![Value::str(a.display().to_string())])
        .await
        .unwrap();
    let result_b = call(&tree, "compiled", vec![Value::str(b.display().to_string())])
        .await
        .unwrap();
    assert_ne!(result_a, result_b);
    assert_eq!(executions.load(Ordering::SeqCst), 2);

    // Both are independently cached.
    call(&tree, "compiled", vec![Value::str(a.display().to_string())])
        .await
        .unwrap();
    call(&tree, "compiled", vec![Value::str(b.display().to_string())])
        .await
        .unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cached_call_deduplicates_by_name_and_args() {
    let site = TempDir::new().unwrap();
    let tree = fixture_tree(site.path());
    let computed = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let computed = computed.clone();
        let value = tree
            .cached_call("expensive", vec![Value::Int(1)], move || {
                computed.fetch_add(1, Ordering::SeqCst);
                async { Ok(Value::str("result")) }.boxed()
            })
            .await
            .unwrap();
        assert_eq!(value, Value::str("result"));
    }
    assert_eq!(computed.load(Ordering::SeqCst), 1);

    let computed2 = computed.clone();
    tree.cached_call("expensive", vec![Value::Int(2)], move || {
        computed2.fetch_add(1, Ordering::SeqCst);
        async { Ok(Value::str("other")) }.boxed()
    })
    .await
    .unwrap();
    assert_eq!(computed.load(Ordering::SeqCst), 2);
}
