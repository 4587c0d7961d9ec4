// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use hashing::{Fingerprint, Value};
use parking_lot::Mutex;
use runtime::{Failure, Outcome, Success};
use task_executor::Executor;
use tempfile::TempDir;
use tokio::time::sleep;

use crate::{
    read_frame, rule_identity, ExecuteContext, MemoDb, Record, TraceContext, TracedExecution,
};

fn open_db(site: &Path) -> MemoDb {
    let _ = env_logger::builder().is_test(true).try_init();
    MemoDb::open(site, Executor::new()).unwrap()
}

fn decode_records(site: &Path) -> Vec<Record> {
    let bytes = std::fs::read(site.join(".nobs").join("db")).unwrap();
    let mut offset = 0;
    // Skip the header snapshot.
    read_frame(&bytes, &mut offset).unwrap();
    let mut records = Vec::new();
    while let Some(payload) = read_frame(&bytes, &mut offset) {
        records.push(bincode::deserialize::<Record>(payload).unwrap());
    }
    records
}

fn tree_record_count(site: &Path) -> usize {
    decode_records(site)
        .iter()
        .filter(|record| matches!(record, Record::Tree { .. }))
        .count()
}

///
/// A memoised execution with no traced calls which returns a constant.
///
struct IdentityRule {
    executions: Arc<AtomicUsize>,
}

impl TracedExecution for IdentityRule {
    fn identity(&self) -> Fingerprint {
        rule_identity("tests", "identity", &["execute"], None)
    }

    fn run_traced(
        &self,
        _context: TraceContext,
        method: &str,
        _call_args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, Failure>> {
        let method = method.to_owned();
        async move { Err(Failure::Invariant(format!("No traced method '{method}'"))) }.boxed()
    }

    fn run_execute(&self, _context: ExecuteContext) -> BoxFuture<'static, Outcome> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        async { Ok(Success::of(Value::Int(42))) }.boxed()
    }
}

///
/// A memoised execution whose single traced call reads (and depends on) a file.
///
struct FileRule {
    path: PathBuf,
    executions: Arc<AtomicUsize>,
}

impl TracedExecution for FileRule {
    fn identity(&self) -> Fingerprint {
        rule_identity("tests", "file_rule", &["contents", "execute"], None)
    }

    fn run_traced(
        &self,
        context: TraceContext,
        method: &str,
        _call_args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, Failure>> {
        assert_eq!(method, "contents");
        let path = self.path.clone();
        async move {
            context.depend_files([path.clone()]);
            let contents = std::fs::read_to_string(&path).unwrap_or_default();
            Ok(Value::Str(contents))
        }
        .boxed()
    }

    fn run_execute(&self, context: ExecuteContext) -> BoxFuture<'static, Outcome> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        async move {
            let contents = context.call("contents", vec![]).await?;
            Ok(Success::of(Value::Str(format!("compiled:{contents}"))))
        }
        .boxed()
    }
}

///
/// A memoised execution which records a fact observed from mutable test state.
///
struct FactRule {
    fact: Arc<Mutex<Value>>,
    executions: Arc<AtomicUsize>,
}

impl TracedExecution for FactRule {
    fn identity(&self) -> Fingerprint {
        rule_identity("tests", "fact_rule", &["observe", "execute"], None)
    }

    fn run_traced(
        &self,
        context: TraceContext,
        method: &str,
        _call_args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, Failure>> {
        assert_eq!(method, "observe");
        let fact = self.fact.lock().clone();
        async move {
            context.depend_fact(Value::str("observed"), fact)?;
            Ok(Value::None)
        }
        .boxed()
    }

    fn run_execute(&self, context: ExecuteContext) -> BoxFuture<'static, Outcome> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        async move {
            context.call("observe", vec![]).await?;
            Ok(Success::of(Value::str("done")))
        }
        .boxed()
    }
}

///
/// A memoised execution which always fails, after declaring a file dependency.
///
struct FailRule {
    path: PathBuf,
    executions: Arc<AtomicUsize>,
}

impl TracedExecution for FailRule {
    fn identity(&self) -> Fingerprint {
        rule_identity("tests", "fail_rule", &["execute"], None)
    }

    fn run_traced(
        &self,
        _context: TraceContext,
        _method: &str,
        _call_args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, Failure>> {
        async { Err(Failure::Invariant("No traced methods".to_owned())) }.boxed()
    }

    fn run_execute(&self, context: ExecuteContext) -> BoxFuture<'static, Outcome> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let path = self.path.clone();
        async move {
            context.depend_files([path]).await?;
            Err(Failure::Wrapped("boom".to_owned()))
        }
        .boxed()
    }
}

///
/// A memoised execution which produces an artifact, depending on a file.
///
struct ArtifactRule {
    path: PathBuf,
    fail: bool,
    executions: Arc<AtomicUsize>,
}

impl TracedExecution for ArtifactRule {
    fn identity(&self) -> Fingerprint {
        rule_identity("tests", "artifact_rule", &["execute"], None)
    }

    fn run_traced(
        &self,
        _context: TraceContext,
        _method: &str,
        _call_args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, Failure>> {
        async { Err(Failure::Invariant("No traced methods".to_owned())) }.boxed()
    }

    fn run_execute(&self, context: ExecuteContext) -> BoxFuture<'static, Outcome> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let path = self.path.clone();
        let fail = self.fail;
        async move {
            context.depend_files([path]).await?;
            let out = context.mkpath(&Value::None, "out", "o", false)?;
            std::fs::write(&out, b"object code").map_err(Failure::wrapped)?;
            if fail {
                Err(Failure::Wrapped("link error".to_owned()))
            } else {
                Ok(Success::of(Value::path(&out)))
            }
        }
        .boxed()
    }
}

///
/// A memoised execution whose traced call executes a nested memoised rule.
///
struct OuterRule {
    inner: Arc<FileRule>,
    executions: Arc<AtomicUsize>,
}

impl TracedExecution for OuterRule {
    fn identity(&self) -> Fingerprint {
        rule_identity("tests", "outer_rule", &["inner_value", "execute"], None)
    }

    fn run_traced(
        &self,
        context: TraceContext,
        method: &str,
        _call_args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, Failure>> {
        assert_eq!(method, "inner_value");
        let inner = self.inner.clone();
        async move {
            let success = context.execute(inner).await?;
            Ok(success.value())
        }
        .boxed()
    }

    fn run_execute(&self, context: ExecuteContext) -> BoxFuture<'static, Outcome> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        async move {
            let value = context.call("inner_value", vec![]).await?;
            Ok(Success::of(Value::Str(format!("outer:{value}"))))
        }
        .boxed()
    }
}

///
/// A memoised execution which sleeps before completing, to exercise concurrent duplicates.
///
struct SlowRule {
    executions: Arc<AtomicUsize>,
}

impl TracedExecution for SlowRule {
    fn identity(&self) -> Fingerprint {
        rule_identity("tests", "slow_rule", &["execute"], None)
    }

    fn run_traced(
        &self,
        _context: TraceContext,
        _method: &str,
        _call_args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, Failure>> {
        async { Err(Failure::Invariant("No traced methods".to_owned())) }.boxed()
    }

    fn run_execute(&self, _context: ExecuteContext) -> BoxFuture<'static, Outcome> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        async {
            sleep(Duration::from_millis(50)).await;
            Ok(Success::of(Value::Int(7)))
        }
        .boxed()
    }
}

#[tokio::test]
async fn identity_memo() {
    let site = TempDir::new().unwrap();
    let db = open_db(site.path());
    let executions = Arc::new(AtomicUsize::new(0));
    let rule = Arc::new(IdentityRule {
        executions: executions.clone(),
    });

    let first = db.execute(rule.clone()).await.unwrap();
    assert_eq!(first.value(), Value::Int(42));
    let second = db.execute(rule.clone()).await.unwrap();
    assert_eq!(second.value(), Value::Int(42));

    // The second invocation reused the leaf: one execution, one journalled record.
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(tree_record_count(site.path()), 1);
}

#[tokio::test]
async fn journal_round_trip() {
    let site = TempDir::new().unwrap();
    let executions = Arc::new(AtomicUsize::new(0));
    {
        let db = open_db(site.path());
        let rule = Arc::new(IdentityRule {
            executions: executions.clone(),
        });
        assert_eq!(db.execute(rule).await.unwrap().value(), Value::Int(42));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    // A fresh process sees the persisted leaf and does not re-execute.
    let db = open_db(site.path());
    let rule = Arc::new(IdentityRule {
        executions: executions.clone(),
    });
    assert_eq!(db.execute(rule).await.unwrap().value(), Value::Int(42));
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn file_dependent_invalidation() {
    let site = TempDir::new().unwrap();
    let source = site.path().join("foo.txt");
    std::fs::write(&source, "a").unwrap();

    let executions = Arc::new(AtomicUsize::new(0));
    let db = open_db(site.path());
    let rule = Arc::new(FileRule {
        path: source.clone(),
        executions: executions.clone(),
    });

    let first = db.execute(rule.clone()).await.unwrap();
    assert_eq!(first.value(), Value::str("compiled:a"));
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    // Unchanged contents: reused.
    assert_eq!(
        db.execute(rule.clone()).await.unwrap().value(),
        Value::str("compiled:a")
    );
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    // Changed contents: re-executed. The mtime must move for the digest cache to rehash.
    sleep(Duration::from_millis(20)).await;
    std::fs::write(&source, "b").unwrap();
    assert_eq!(
        db.execute(rule.clone()).await.unwrap().value(),
        Value::str("compiled:b")
    );
    assert_eq!(executions.load(Ordering::SeqCst), 2);

    // No further change: reused again.
    assert_eq!(
        db.execute(rule.clone()).await.unwrap().value(),
        Value::str("compiled:b")
    );
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fact_dependent_invalidation() {
    let site = TempDir::new().unwrap();
    let db = open_db(site.path());
    let fact = Arc::new(Mutex::new(Value::str("v1")));
    let executions = Arc::new(AtomicUsize::new(0));
    let rule = Arc::new(FactRule {
        fact: fact.clone(),
        executions: executions.clone(),
    });

    db.execute(rule.clone()).await.unwrap();
    db.execute(rule.clone()).await.unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    *fact.lock() = Value::str("v2");
    db.execute(rule.clone()).await.unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failure_is_served_from_memory_but_not_journalled() {
    let site = TempDir::new().unwrap();
    let source = site.path().join("dep.txt");
    std::fs::write(&source, "x").unwrap();

    let executions = Arc::new(AtomicUsize::new(0));
    {
        let db = open_db(site.path());
        let rule = Arc::new(FailRule {
            path: source.clone(),
            executions: executions.clone(),
        });

        let first = db.execute(rule.clone()).await;
        assert_eq!(first, Err(Failure::Wrapped("boom".to_owned())));
        // Same process: the failure leaf is reused without re-running.
        let second = db.execute(rule.clone()).await;
        assert_eq!(second, Err(Failure::Wrapped("boom".to_owned())));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(tree_record_count(site.path()), 0);
    }

    // Failures are not persisted: a fresh process re-executes.
    let db = open_db(site.path());
    let rule = Arc::new(FailRule {
        path: source,
        executions: executions.clone(),
    });
    let third = db.execute(rule).await;
    assert_eq!(third, Err(Failure::Wrapped("boom".to_owned())));
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn compaction_prunes_failures_and_rewrites_the_snapshot() {
    let site = TempDir::new().unwrap();
    let source = site.path().join("dep.txt");
    std::fs::write(&source, "x").unwrap();

    let db = open_db(site.path());
    let id_executions = Arc::new(AtomicUsize::new(0));
    let id_rule = Arc::new(IdentityRule {
        executions: id_executions.clone(),
    });
    let fail_executions = Arc::new(AtomicUsize::new(0));
    let fail_rule = Arc::new(FailRule {
        path: source.clone(),
        executions: fail_executions.clone(),
    });

    db.execute(id_rule.clone()).await.unwrap();
    let _ = db.execute(fail_rule.clone()).await;

    let (head_before, tail_before) = db.journal_sizes();
    assert!(tail_before > head_before);
    db.save().await.unwrap();
    let (head, tail) = db.journal_sizes();
    assert_eq!(head, tail);

    // After compaction the reopened database holds exactly the live trie: the success leaf is
    // reused, the failure path was stripped and re-executes.
    drop(db);
    let db = open_db(site.path());
    assert_eq!(tree_record_count(site.path()), 0);
    db.execute(id_rule).await.unwrap();
    assert_eq!(id_executions.load(Ordering::SeqCst), 1);
    let _ = db.execute(fail_rule).await;
    assert_eq!(fail_executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_duplicate_executes_once() {
    let site = TempDir::new().unwrap();
    let db = open_db(site.path());
    let executions = Arc::new(AtomicUsize::new(0));
    let rule = Arc::new(SlowRule {
        executions: executions.clone(),
    });

    let (a, b) = tokio::join!(db.execute(rule.clone()), db.execute(rule.clone()));
    assert_eq!(a.unwrap().value(), Value::Int(7));
    assert_eq!(b.unwrap().value(), Value::Int(7));
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(tree_record_count(site.path()), 1);
}

#[tokio::test]
async fn artifacts_are_owned_and_pruned() {
    let site = TempDir::new().unwrap();
    let source = site.path().join("src.c");
    std::fs::write(&source, "int main;").unwrap();

    let db = open_db(site.path());
    let executions = Arc::new(AtomicUsize::new(0));
    let rule = Arc::new(ArtifactRule {
        path: source.clone(),
        fail: false,
        executions: executions.clone(),
    });

    let first = db.execute(rule.clone()).await.unwrap();
    let artifact_path = PathBuf::from(first.value().as_str().unwrap().to_owned());
    assert!(artifact_path.exists());
    assert!(artifact_path.starts_with(db.artifact_dir()));

    // Invalidate the dependency: the old artifact is deleted during subtree pruning, and the
    // re-execution produces a fresh one.
    sleep(Duration::from_millis(20)).await;
    std::fs::write(&source, "int main(void);").unwrap();
    let second = db.execute(rule.clone()).await.unwrap();
    let new_artifact = PathBuf::from(second.value().as_str().unwrap().to_owned());
    assert_eq!(executions.load(Ordering::SeqCst), 2);
    assert!(!artifact_path.exists());
    assert!(new_artifact.exists());
    assert_ne!(artifact_path, new_artifact);
}

#[tokio::test]
async fn failed_executions_delete_their_artifacts() {
    let site = TempDir::new().unwrap();
    let source = site.path().join("src.c");
    std::fs::write(&source, "int main;").unwrap();

    let db = open_db(site.path());
    let executions = Arc::new(AtomicUsize::new(0));
    let rule = Arc::new(ArtifactRule {
        path: source,
        fail: true,
        executions: executions.clone(),
    });

    let outcome = db.execute(rule).await;
    assert_eq!(outcome, Err(Failure::Wrapped("link error".to_owned())));

    // Nothing is left in the artifact directory.
    let remaining = std::fs::read_dir(db.artifact_dir())
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert!(remaining.is_empty(), "unexpected artifacts: {remaining:?}");
}

#[tokio::test]
async fn nested_executions_propagate_file_dependencies() {
    let site = TempDir::new().unwrap();
    let source = site.path().join("inner.txt");
    std::fs::write(&source, "one").unwrap();

    let db = open_db(site.path());
    let inner_executions = Arc::new(AtomicUsize::new(0));
    let inner = Arc::new(FileRule {
        path: source.clone(),
        executions: inner_executions.clone(),
    });
    let outer_executions = Arc::new(AtomicUsize::new(0));
    let outer = Arc::new(OuterRule {
        inner,
        executions: outer_executions.clone(),
    });

    let first = db.execute(outer.clone()).await.unwrap();
    assert_eq!(first.value(), Value::str("outer:compiled:one"));
    assert_eq!(outer_executions.load(Ordering::SeqCst), 1);
    assert_eq!(inner_executions.load(Ordering::SeqCst), 1);

    // Both reuse while the file is unchanged.
    db.execute(outer.clone()).await.unwrap();
    assert_eq!(outer_executions.load(Ordering::SeqCst), 1);
    assert_eq!(inner_executions.load(Ordering::SeqCst), 1);

    // Changing the inner dependency re-executes both: the outer trace observed the inner
    // rule's file dependencies.
    sleep(Duration::from_millis(20)).await;
    std::fs::write(&source, "two").unwrap();
    let second = db.execute(outer.clone()).await.unwrap();
    assert_eq!(second.value(), Value::str("outer:compiled:two"));
    assert_eq!(outer_executions.load(Ordering::SeqCst), 2);
    assert_eq!(inner_executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn nonexistent_files_digest_to_the_sentinel() {
    let site = TempDir::new().unwrap();
    let db = open_db(site.path());
    let missing = site.path().join("not-there.txt");

    let digest = db.file_digest(&missing).await.unwrap();
    assert_eq!(digest, hashing::NONEXISTENT_FINGERPRINT);

    // Creating the file changes the digest.
    std::fs::write(&missing, "now present").unwrap();
    let digest = db.file_digest(&missing).await.unwrap();
    assert_ne!(digest, hashing::NONEXISTENT_FINGERPRINT);
}

#[tokio::test]
async fn file_digest_cache_avoids_rehashing() {
    let site = TempDir::new().unwrap();
    let db = open_db(site.path());
    let file = site.path().join("cached.txt");
    std::fs::write(&file, "contents").unwrap();

    let first = db.file_digest(&file).await.unwrap();
    let records_after_first = decode_records(site.path()).len();
    let second = db.file_digest(&file).await.unwrap();
    assert_eq!(first, second);
    // The cache hit appended no fresh record.
    assert_eq!(decode_records(site.path()).len(), records_after_first);
}
