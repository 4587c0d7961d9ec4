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

mod trie;
pub use crate::trie::{Artifact, TracedCall};
use crate::trie::{NodeId, PersistedNode, Tip, TraceStep, Trie, TrieEntry};

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_value::Promise;
use byteorder::{ByteOrder, LittleEndian};
use fnv::FnvHashMap as HashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use hashing::{Fingerprint, Value, ValueHasher, NONEXISTENT_FINGERPRINT};
use parking_lot::Mutex;
use runtime::{CriticalSection, Failure, Outcome, OutcomeFuture, Success};
use task_executor::Executor;

///
/// The reserved traced-method names backing `depend_files` and `depend_facts` from an execute
/// context: declared dependencies become ordinary trace steps in the trie.
///
const DEPEND_FILES_METHOD: &str = "_depend_paths";
const DEPEND_FACTS_METHOD: &str = "_depend_facts";

// Rewrite a full snapshot once the journal has grown by more than a third of the compacted size.
const COMPACTION_SLACK: f64 = 0.33;

///
/// A memoised execution, as the database sees it: an identity digest rooting its subtrie, a set
/// of traced methods which the engine re-runs to walk the trie, and a single heavyweight
/// `execute`.
///
/// Rule-level concerns (dispatch contexts, argument binding) live above this trait; the rule
/// layer adapts its memoized rules onto it.
///
pub trait TracedExecution: Send + Sync + 'static {
    ///
    /// A digest of the execution's identity. Changing it orphans all previously recorded traces.
    ///
    fn identity(&self) -> Fingerprint;

    ///
    /// Run the named traced method, recording file and fact dependencies on the given context.
    ///
    fn run_traced(
        &self,
        context: TraceContext,
        method: &str,
        call_args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, Failure>>;

    ///
    /// Run the heavyweight execution, performing traced subcalls through the given context.
    ///
    fn run_execute(&self, context: ExecuteContext) -> BoxFuture<'static, Outcome>;
}

///
/// Computes the identity digest for a memoized rule from its qualified name, its method names,
/// and an optional explicit version bump.
///
pub fn rule_identity(
    module: &str,
    name: &str,
    methods: &[&str],
    version_bump: Option<&Value>,
) -> Fingerprint {
    let mut sorted = methods.iter().map(|m| Value::str(*m)).collect::<Vec<_>>();
    sorted.sort();
    let mut hasher = ValueHasher::new();
    hasher.feed(&Value::str(module));
    hasher.feed(&Value::str(name));
    hasher.feed(&Value::Seq(sorted));
    hasher.feed(version_bump.unwrap_or(&Value::None));
    hasher.finish()
}

type FileStamp = (i64, Fingerprint);

#[derive(serde::Serialize, serde::Deserialize)]
struct Snapshot {
    tree: BTreeMap<Fingerprint, PersistedNode>,
    files: BTreeMap<PathBuf, FileStamp>,
}

#[derive(serde::Serialize, serde::Deserialize)]
enum Record {
    Tree {
        trace: Vec<TraceStep>,
        values: Vec<Value>,
        keys: BTreeMap<String, Value>,
        artifacts: Vec<Artifact>,
    },
    Prune {
        names: Vec<Fingerprint>,
    },
    File {
        path: PathBuf,
        mtime: i64,
        digest: Fingerprint,
    },
}

struct DbState {
    trie: Trie,
    files: HashMap<PathBuf, FileStamp>,
    journal: File,
    size_head: u64,
    size_tail: u64,
    failed_name_seqs: Vec<Vec<Fingerprint>>,
}

struct Inner {
    path_db: PathBuf,
    path_art: PathBuf,
    executor: Executor,
    lock: CriticalSection,
    state: Mutex<DbState>,
    keep_temps: bool,
}

///
/// The persistent memoization database for a site: a disk-backed trie of traced executions at
/// `<site>/.nobs/db`, plus the artifact directory at `<site>/.nobs/art/`.
///
/// All trie walks, trie mutations and journal appends happen while holding a single
/// coroutine-level lock; the lock is released while traced methods run and while waiting for a
/// concurrent executor's completion.
///
#[derive(Clone)]
pub struct MemoDb {
    inner: Arc<Inner>,
}

impl MemoDb {
    pub fn open(site: &Path, executor: Executor) -> Result<MemoDb, String> {
        let nobs_dir = site.join(".nobs");
        let path_db = nobs_dir.join("db");
        let path_art = nobs_dir.join("art");
        std::fs::create_dir_all(&path_art)
            .map_err(|e| format!("Could not create {}: {e}", path_art.display()))?;

        let (trie, files, size_head, size_tail) = if path_db.exists() {
            Self::recover(&path_db)?
        } else {
            let snapshot = Snapshot {
                tree: BTreeMap::new(),
                files: BTreeMap::new(),
            };
            let frame = encode_frame(&snapshot)
                .map_err(|e| format!("Could not encode the initial database header: {e}"))?;
            std::fs::write(&path_db, &frame)
                .map_err(|e| format!("Could not create {}: {e}", path_db.display()))?;
            let len = frame.len() as u64;
            (Trie::new(), HashMap::default(), len, len)
        };

        let journal = OpenOptions::new()
            .append(true)
            .open(&path_db)
            .map_err(|e| format!("Could not open {} for appending: {e}", path_db.display()))?;

        Ok(MemoDb {
            inner: Arc::new(Inner {
                path_db,
                path_art,
                executor,
                lock: CriticalSection::new(),
                state: Mutex::new(DbState {
                    trie,
                    files,
                    journal,
                    size_head,
                    size_tail,
                    failed_name_seqs: Vec::new(),
                }),
                keep_temps: std::env::var_os("NOBS_DEBUG").is_some(),
            }),
        })
    }

    ///
    /// Read the header snapshot, then apply journalled records until the first one that is
    /// short, undecodable or inapplicable: that offset is the logical end of the journal.
    ///
    fn recover(path_db: &Path) -> Result<(Trie, HashMap<PathBuf, FileStamp>, u64, u64), String> {
        let bytes = std::fs::read(path_db)
            .map_err(|e| format!("Could not read {}: {e}", path_db.display()))?;

        let mut offset = 0_usize;
        let header = read_frame(&bytes, &mut offset)
            .ok_or_else(|| format!("{} is missing its header record.", path_db.display()))?;
        let snapshot: Snapshot = bincode::deserialize(header)
            .map_err(|e| format!("{} has a corrupt header record: {e}", path_db.display()))?;

        let mut trie = Trie::from_persisted(snapshot.tree);
        let mut files: HashMap<PathBuf, FileStamp> = snapshot.files.into_iter().collect();
        let size_head = offset as u64;
        let mut size_tail = size_head;

        while let Some(payload) = read_frame(&bytes, &mut offset) {
            let applied = match bincode::deserialize::<Record>(payload) {
                Ok(Record::Tree {
                    trace,
                    values,
                    keys,
                    artifacts,
                }) => trie.apply_tree_record(&trace, values, keys, artifacts).is_ok(),
                Ok(Record::Prune { names }) => trie.apply_prune_record(&names).is_ok(),
                Ok(Record::File {
                    path,
                    mtime,
                    digest,
                }) => {
                    files.insert(path, (mtime, digest));
                    true
                }
                Err(_) => false,
            };
            if !applied {
                log::debug!(
                    "Truncating journal replay of {} at offset {}.",
                    path_db.display(),
                    size_tail
                );
                break;
            }
            size_tail = offset as u64;
        }

        Ok((trie, files, size_head, size_tail))
    }

    ///
    /// Execute the given memoised rule, reusing a recorded result when the full trace walks to an
    /// existing leaf.
    ///
    pub fn execute(&self, rule: Arc<dyn TracedExecution>) -> OutcomeFuture {
        self.memo_execute(rule, None)
    }

    ///
    /// Digest the contents of the given file, consulting the mtime-guarded cache first. Files
    /// which do not exist digest to the distinguished nonexistence sentinel.
    ///
    pub async fn file_digest(&self, path: &Path) -> Result<Fingerprint, Failure> {
        let guard = self.inner.lock.acquire().await;
        let mtime = mtime_of(path);
        {
            let state = self.inner.state.lock();
            match state.files.get(path) {
                Some(&(cached_mtime, digest)) if cached_mtime == mtime => return Ok(digest),
                // A missing file with no cache entry needs no record.
                None if mtime == -1 => return Ok(NONEXISTENT_FINGERPRINT),
                _ => {}
            }
        }

        let digest = if mtime == -1 {
            NONEXISTENT_FINGERPRINT
        } else {
            let path2 = path.to_owned();
            let mut hashed = self
                .inner
                .executor
                .blocking(move || hash_file(&path2).map_err(|e| e.to_string()));
            match hashed.recv().await {
                None => {
                    return Err(Failure::Invariant(
                        "The file hashing worker died without reporting.".to_owned(),
                    ));
                }
                Some(result) => result.map_err(Failure::Wrapped)?,
            }
        };

        {
            let mut state = self.inner.state.lock();
            state.files.insert(path.to_owned(), (mtime, digest));
            append_record(
                &mut state,
                &Record::File {
                    path: path.to_owned(),
                    mtime,
                    digest,
                },
            )?;
        }
        drop(guard);
        Ok(digest)
    }

    ///
    /// Compact the journal if it has outgrown its snapshot: prune the failure paths observed
    /// during this process, then atomically rewrite the snapshot header.
    ///
    pub async fn save(&self) -> Result<(), Failure> {
        let _guard = self.inner.lock.acquire().await;
        let mut state = self.inner.state.lock();

        let appended = state.size_tail.saturating_sub(state.size_head);
        if (appended as f64) <= COMPACTION_SLACK * state.size_head as f64 {
            return Ok(());
        }
        log::debug!(
            "Compacting memo journal ({} bytes appended over a {} byte snapshot).",
            appended,
            state.size_head
        );

        let failed = std::mem::take(&mut state.failed_name_seqs);
        for names in &failed {
            state.trie.prune_failure_path(names)?;
        }

        let snapshot = Snapshot {
            tree: state.trie.to_persisted()?,
            files: state
                .files
                .iter()
                .map(|(path, stamp)| (path.clone(), *stamp))
                .collect(),
        };
        let frame = encode_frame(&snapshot)?;

        let db_dir = self
            .inner
            .path_db
            .parent()
            .expect("The database path always has a parent directory.");
        let mut tmp = tempfile::NamedTempFile::new_in(db_dir).map_err(Failure::wrapped)?;
        tmp.write_all(&frame).map_err(Failure::wrapped)?;
        tmp.persist(&self.inner.path_db)
            .map_err(|e| Failure::wrapped(e.error))?;

        state.journal = OpenOptions::new()
            .append(true)
            .open(&self.inner.path_db)
            .map_err(Failure::wrapped)?;
        state.size_head = frame.len() as u64;
        state.size_tail = frame.len() as u64;
        Ok(())
    }

    pub fn journal_sizes(&self) -> (u64, u64) {
        let state = self.inner.state.lock();
        (state.size_head, state.size_tail)
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.inner.path_art
    }

    pub fn artifact_path(&self, artifact: &Artifact) -> PathBuf {
        let mut prefix = artifact.prefix.clone();
        if !prefix.is_empty() && !prefix.ends_with('.') {
            prefix.push('.');
        }
        let mut suffix = artifact.suffix.clone();
        if !suffix.is_empty() && !suffix.starts_with('.') {
            suffix.insert(0, '.');
        }
        self.inner
            .path_art
            .join(format!("{prefix}{}{suffix}", artifact.digest.to_hex()))
    }

    fn remove_artifact(&self, artifact: &Artifact) -> Result<(), Failure> {
        remove_tree(&self.artifact_path(artifact))
    }

    ///
    /// The two-phase execution model: walk the trie along re-evaluated traced calls, and either
    /// reuse the leaf the walk ends at, or take responsibility for the remainder of the subtree
    /// and run `execute`.
    ///
    /// When `out_paths` is given, every file path observed by traced calls during this execution
    /// is added to it: nested executions propagate their dependencies into the enclosing trace.
    ///
    fn memo_execute(
        &self,
        rule: Arc<dyn TracedExecution>,
        out_paths: Option<Arc<Mutex<BTreeSet<PathBuf>>>>,
    ) -> OutcomeFuture {
        let db = self.clone();
        async move {
            let tracer = Tracer::new(db.clone(), rule.clone());
            let uid = rule.identity();

            let mut guard = db.inner.lock.acquire().await;
            let mut tip: Tip = None;
            let mut name = uid;
            let mut full = uid;
            let mut trace = vec![TraceStep {
                call: None,
                name,
                full,
            }];

            enum Step {
                Execute,
                Wait(async_value::PromiseReceiver<()>),
                Done(Outcome),
                Descend(NodeId, TracedCall),
            }

            loop {
                let step = {
                    let mut state = db.inner.state.lock();
                    let child = state.trie.child(tip, &name);
                    let mismatch = match child {
                        None => true,
                        Some(id) => state.trie.entry(id).full() != full,
                    };

                    if mismatch {
                        let mut doomed = Vec::new();
                        if let Some(id) = child {
                            if matches!(state.trie.entry(id), TrieEntry::InProgress { .. }) {
                                return Err(Failure::Invariant(
                                    "Same trace and instance generated different full hashes."
                                        .to_owned(),
                                ));
                            }
                            append_record(
                                &mut state,
                                &Record::Prune {
                                    names: trace.iter().map(|step| step.name).collect(),
                                },
                            )?;
                            state.trie.collect_artifacts(id, &mut doomed)?;
                            state.trie.replace(
                                id,
                                TrieEntry::InProgress {
                                    full,
                                    done: Promise::new(),
                                },
                            );
                        } else {
                            let id = state.trie.alloc(TrieEntry::InProgress {
                                full,
                                done: Promise::new(),
                            });
                            state.trie.children_insert(tip, name, id);
                        }
                        drop(state);
                        for artifact in &doomed {
                            db.remove_artifact(artifact)?;
                        }
                        Step::Execute
                    } else {
                        let id = child.expect("A matching child was just observed.");
                        match state.trie.entry(id) {
                            TrieEntry::InProgress { done, .. } => Step::Wait(done.receiver()),
                            TrieEntry::Success { values, keys, .. } => Step::Done(Ok(
                                Success::new(values.clone(), keys.clone()),
                            )),
                            TrieEntry::Failure { failure, .. } => Step::Done(Err(failure.clone())),
                            TrieEntry::Interior { call, .. } => Step::Descend(id, call.clone()),
                        }
                    }
                };

                match step {
                    Step::Execute => break,
                    Step::Wait(mut receiver) => {
                        // Another executor holds this subtree: wait for it with the lock
                        // released, then retry the same position.
                        drop(guard);
                        if receiver.recv().await.is_none() {
                            return Err(Failure::Invariant(
                                "A concurrent execution was dropped without completing."
                                    .to_owned(),
                            ));
                        }
                        guard = db.inner.lock.acquire().await;
                    }
                    Step::Done(outcome) => {
                        drop(guard);
                        if let Some(out) = &out_paths {
                            out.lock().extend(tracer.collected.lock().iter().cloned());
                        }
                        return outcome;
                    }
                    Step::Descend(id, call) => {
                        drop(guard);
                        let eval = tracer.evaluate(&call).await?;
                        guard = db.inner.lock.acquire().await;
                        tip = Some(id);
                        name = eval.name;
                        full = eval.full;
                        trace.push(TraceStep {
                            call: Some(call),
                            name,
                            full,
                        });
                    }
                }
            }
            drop(guard);

            // Execute phase: the in-progress leaf at the end of `trace` is ours.
            let name_map = trace.iter().map(|step| (step.name, step.full)).collect();
            let context = ExecuteContext {
                db: db.clone(),
                tracer: tracer.clone(),
                exec: Arc::new(Mutex::new(ExecState {
                    trace,
                    name_map,
                    tip,
                })),
                artifacts: Arc::new(Mutex::new(Vec::new())),
                temps: Arc::new(Mutex::new(Vec::new())),
            };

            let result = rule.run_execute(context.clone()).await;

            if let Some(out) = &out_paths {
                out.lock().extend(tracer.collected.lock().iter().cloned());
            }

            // Aborting failures are never recorded: the run is coming down.
            if let Err(failure) = &result {
                if failure.aborts() {
                    return Err(failure.clone());
                }
            }

            let guard = db.inner.lock.acquire().await;

            if !db.inner.keep_temps {
                for tmp in context.temps.lock().drain(..) {
                    let _ = remove_tree(&tmp);
                }
            }

            let artifacts = context.artifacts.lock().clone();
            let (final_tip, final_trace) = {
                let exec = context.exec.lock();
                (exec.tip, exec.trace.clone())
            };
            let last = final_trace
                .last()
                .expect("The trace always contains the identity step.");

            let old = {
                let mut state = db.inner.state.lock();
                let leaf_id = state
                    .trie
                    .child(final_tip, &last.name)
                    .expect("The in-progress leaf of a running execution cannot be unlinked.");
                match &result {
                    Ok(success) => {
                        let old = state.trie.replace(
                            leaf_id,
                            TrieEntry::Success {
                                full: last.full,
                                values: success.values.clone(),
                                keys: success.keys.clone(),
                                artifacts: artifacts.clone(),
                            },
                        );
                        append_record(
                            &mut state,
                            &Record::Tree {
                                trace: final_trace.clone(),
                                values: success.values.clone(),
                                keys: success.keys.clone(),
                                artifacts: artifacts.clone(),
                            },
                        )?;
                        old
                    }
                    Err(failure) => {
                        let old = state.trie.replace(
                            leaf_id,
                            TrieEntry::Failure {
                                full: last.full,
                                failure: failure.clone(),
                            },
                        );
                        state
                            .failed_name_seqs
                            .push(final_trace.iter().map(|step| step.name).collect());
                        old
                    }
                }
            };

            if result.is_err() {
                for artifact in &artifacts {
                    db.remove_artifact(artifact)?;
                }
            }

            drop(guard);
            if let TrieEntry::InProgress { done, .. } = old {
                done.satisfy(());
            }
            result
        }
        .boxed()
    }
}

struct ExecState {
    trace: Vec<TraceStep>,
    name_map: HashMap<Fingerprint, Fingerprint>,
    tip: Tip,
}

#[derive(Clone)]
struct TraceOutcome {
    result: Result<Value, Failure>,
    name: Fingerprint,
    full: Fingerprint,
}

type TraceEval = Result<TraceOutcome, Failure>;

type SharedTraceEval = Shared<BoxFuture<'static, TraceEval>>;

///
/// Evaluates traced calls against fresh trace contexts, capturing their results along with the
/// file paths and facts they observed, and deriving the name/full digest pair for each.
///
/// Evaluations are memoised per execution by the digest of `(method, call_args)`, and shared
/// between the walk and execute phases.
///
struct Tracer {
    db: MemoDb,
    rule: Arc<dyn TracedExecution>,
    memo: Mutex<HashMap<Fingerprint, SharedTraceEval>>,
    collected: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl Tracer {
    fn new(db: MemoDb, rule: Arc<dyn TracedExecution>) -> Arc<Tracer> {
        Arc::new(Tracer {
            db,
            rule,
            memo: Mutex::new(HashMap::default()),
            collected: Arc::new(Mutex::new(BTreeSet::new())),
        })
    }

    fn evaluate(self: &Arc<Self>, call: &TracedCall) -> SharedTraceEval {
        let call_fingerprint = {
            let mut hasher = ValueHasher::new();
            feed_call(&mut hasher, call);
            hasher.finish()
        };

        let mut memo = self.memo.lock();
        if let Some(shared) = memo.get(&call_fingerprint) {
            return shared.clone();
        }

        let tracer = self.clone();
        let call = call.clone();
        let shared = async move {
            let context = TraceContext {
                db: tracer.db.clone(),
                paths: Arc::new(Mutex::new(BTreeSet::new())),
                facts: Arc::new(Mutex::new(BTreeMap::new())),
            };

            let result: Result<Value, Failure> = match call.method.as_str() {
                DEPEND_FILES_METHOD => builtin_depend_files(&context, &call.args),
                DEPEND_FACTS_METHOD => builtin_depend_facts(&context, &call.args),
                _ => {
                    tracer
                        .rule
                        .run_traced(context.clone(), &call.method, call.args.clone())
                        .await
                }
            };

            let mut hasher = ValueHasher::new();
            feed_call(&mut hasher, &call);
            match &result {
                Ok(value) => {
                    hasher.feed_bytes(b"fures.");
                    hasher.feed(value);
                }
                Err(failure) => {
                    hasher.feed_bytes(b"fufail.");
                    hasher.feed(&Value::Str(failure.to_string()));
                }
            }
            {
                let facts = context.facts.lock();
                hasher.feed_bytes(format!("d.{:x}.", facts.len()).as_bytes());
                for key in facts.keys() {
                    hasher.feed(key);
                }
                for value in facts.values() {
                    hasher.feed(value);
                }
            }

            let paths: Vec<PathBuf> = context.paths.lock().iter().cloned().collect();
            let (name, full) = if paths.is_empty() {
                let fingerprint = hasher.finish();
                (fingerprint, fingerprint)
            } else {
                for path in &paths {
                    let s = path.to_string_lossy();
                    hasher.feed_bytes(format!("{:x}:{s}", s.len()).as_bytes());
                }
                hasher.feed_bytes(b";");
                let name = hasher.fingerprint();
                for path in &paths {
                    let digest = tracer.db.file_digest(path).await?;
                    hasher.feed_bytes(digest.as_bytes());
                }
                (name, hasher.finish())
            };

            tracer.collected.lock().extend(paths);
            Ok(TraceOutcome { result, name, full })
        }
        .boxed()
        .shared();

        memo.insert(call_fingerprint, shared.clone());
        shared
    }
}

fn feed_call(hasher: &mut ValueHasher, call: &TracedCall) {
    hasher.feed(&Value::Str(call.method.clone()));
    hasher.feed(&Value::Seq(call.args.clone()));
}

fn builtin_depend_files(context: &TraceContext, args: &[Value]) -> Result<Value, Failure> {
    let [Value::Seq(paths)] = args else {
        return Err(Failure::Invariant(
            "Malformed arguments to the file-dependency trace step.".to_owned(),
        ));
    };
    let mut out = context.paths.lock();
    for path in paths {
        let Some(path) = path.as_str() else {
            return Err(Failure::Invariant(
                "File-dependency paths must be strings.".to_owned(),
            ));
        };
        out.insert(PathBuf::from(path));
    }
    Ok(Value::None)
}

fn builtin_depend_facts(context: &TraceContext, args: &[Value]) -> Result<Value, Failure> {
    let [Value::Seq(pairs)] = args else {
        return Err(Failure::Invariant(
            "Malformed arguments to the fact-dependency trace step.".to_owned(),
        ));
    };
    for pair in pairs {
        let Value::Seq(kv) = pair else {
            return Err(Failure::Invariant(
                "Fact dependencies must be key/value pairs.".to_owned(),
            ));
        };
        let [key, value] = kv.as_slice() else {
            return Err(Failure::Invariant(
                "Fact dependencies must be key/value pairs.".to_owned(),
            ));
        };
        context.depend_fact(key.clone(), value.clone())?;
    }
    Ok(Value::None)
}

///
/// The context a traced method runs against: it accumulates the file paths and facts the method
/// depends on, which become part of the trace step's digests.
///
#[derive(Clone)]
pub struct TraceContext {
    db: MemoDb,
    paths: Arc<Mutex<BTreeSet<PathBuf>>>,
    facts: Arc<Mutex<BTreeMap<Value, Value>>>,
}

impl TraceContext {
    ///
    /// Register the given file paths as dependencies: changes in their contents re-execute the
    /// rule.
    ///
    pub fn depend_files(&self, paths: impl IntoIterator<Item = PathBuf>) {
        let mut out = self.paths.lock();
        for path in paths {
            out.insert(abspath(&path));
        }
    }

    ///
    /// Register a key/value fact as a dependency. Re-registering a key with a different value is
    /// an internal consistency error.
    ///
    pub fn depend_fact(&self, key: Value, value: Value) -> Result<(), Failure> {
        let mut facts = self.facts.lock();
        match facts.get(&key) {
            Some(existing) if *existing != value => Err(Failure::Invariant(format!(
                "Fact '{key}' registered twice with differing values: {existing} vs {value}"
            ))),
            _ => {
                facts.insert(key, value);
                Ok(())
            }
        }
    }

    pub fn depend_facts(
        &self,
        facts: impl IntoIterator<Item = (Value, Value)>,
    ) -> Result<(), Failure> {
        for (key, value) in facts {
            self.depend_fact(key, value)?;
        }
        Ok(())
    }

    ///
    /// Execute a nested memoised rule, propagating its file dependencies into this trace.
    ///
    pub fn execute(&self, rule: Arc<dyn TracedExecution>) -> OutcomeFuture {
        self.db.memo_execute(rule, Some(self.paths.clone()))
    }

    pub fn db(&self) -> &MemoDb {
        &self.db
    }
}

///
/// The context the `execute` method of a memoised rule runs against: traced subcalls extend the
/// trace (and the trie), and artifact factories allocate content-addressed output paths owned by
/// the eventual leaf.
///
#[derive(Clone)]
pub struct ExecuteContext {
    db: MemoDb,
    tracer: Arc<Tracer>,
    exec: Arc<Mutex<ExecState>>,
    artifacts: Arc<Mutex<Vec<Artifact>>>,
    temps: Arc<Mutex<Vec<PathBuf>>>,
}

impl ExecuteContext {
    ///
    /// Perform a traced subcall, recording it as the next step of the trace. Repeating a call
    /// already present in the trace does not extend it, but its digests must agree.
    ///
    pub fn call(
        &self,
        method: &str,
        call_args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, Failure>> {
        let context = self.clone();
        let call = TracedCall {
            method: method.to_owned(),
            args: call_args,
        };
        async move {
            let eval = context.tracer.evaluate(&call).await?;

            let guard = context.db.inner.lock.acquire().await;
            let extend = {
                let exec = context.exec.lock();
                match exec.name_map.get(&eval.name) {
                    Some(known_full) if *known_full != eval.full => {
                        return Err(Failure::Invariant(
                            "Same trace and instance generated different full hashes."
                                .to_owned(),
                        ));
                    }
                    Some(_) => false,
                    None => true,
                }
            };

            if extend {
                let satisfied = {
                    let mut exec = context.exec.lock();
                    let mut state = context.db.inner.state.lock();
                    let last = exec
                        .trace
                        .last()
                        .expect("The trace always contains the identity step.");
                    let (name0, full0) = (last.name, last.full);

                    let leaf_id = state
                        .trie
                        .child(exec.tip, &name0)
                        .expect("The in-progress leaf of a running execution cannot be unlinked.");
                    let new_leaf = state.trie.alloc(TrieEntry::InProgress {
                        full: eval.full,
                        done: Promise::new(),
                    });
                    let mut children = HashMap::default();
                    children.insert(eval.name, new_leaf);
                    let old = state.trie.replace(
                        leaf_id,
                        TrieEntry::Interior {
                            full: full0,
                            call: call.clone(),
                            children,
                        },
                    );

                    exec.trace.push(TraceStep {
                        call: Some(call.clone()),
                        name: eval.name,
                        full: eval.full,
                    });
                    exec.name_map.insert(eval.name, eval.full);
                    exec.tip = Some(leaf_id);
                    old
                };
                // Wake walkers parked on the shallower in-progress node so they can descend.
                if let TrieEntry::InProgress { done, .. } = satisfied {
                    done.satisfy(());
                }
            }
            drop(guard);

            eval.result
        }
        .boxed()
    }

    ///
    /// Register file paths as dependencies of this execution. Recorded as a trace step, so the
    /// dependency outlives the process.
    ///
    pub async fn depend_files(
        &self,
        paths: impl IntoIterator<Item = PathBuf>,
    ) -> Result<(), Failure> {
        let fresh: Vec<Value> = {
            let collected = self.tracer.collected.lock();
            paths
                .into_iter()
                .map(|path| abspath(&path))
                .filter(|path| !collected.contains(path))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|path| Value::path(&path))
                .collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }
        self.call(DEPEND_FILES_METHOD, vec![Value::Seq(fresh)])
            .await
            .map(|_| ())
    }

    ///
    /// Register key/value facts as dependencies of this execution, as a trace step.
    ///
    pub async fn depend_facts(
        &self,
        facts: impl IntoIterator<Item = (Value, Value)>,
    ) -> Result<(), Failure> {
        let pairs: Vec<Value> = facts
            .into_iter()
            .map(|(key, value)| Value::Seq(vec![key, value]))
            .collect();
        if pairs.is_empty() {
            return Ok(());
        }
        self.call(DEPEND_FACTS_METHOD, vec![Value::Seq(pairs)])
            .await
            .map(|_| ())
    }

    pub async fn depend_fact(&self, key: Value, value: Value) -> Result<(), Failure> {
        self.depend_facts([(key, value)]).await
    }

    ///
    /// Allocate a content-addressed output path for this execution. `key` distinguishes multiple
    /// artifacts of the same execution; the digest mixes it with the sorted full-digest set of
    /// the trace so far.
    ///
    pub fn mkpath(
        &self,
        key: &Value,
        prefix: &str,
        suffix: &str,
        isdir: bool,
    ) -> Result<PathBuf, Failure> {
        if prefix.contains(std::path::MAIN_SEPARATOR) || suffix.contains(std::path::MAIN_SEPARATOR)
        {
            return Err(Failure::Invariant(
                "Artifact prefixes and suffixes may not contain path separators.".to_owned(),
            ));
        }

        let mut fulls: Vec<Fingerprint> =
            self.exec.lock().trace.iter().map(|step| step.full).collect();
        fulls.sort();

        let mut hasher = ValueHasher::new();
        hasher.feed_bytes(format!("ls.{:x}.", fulls.len()).as_bytes());
        for full in &fulls {
            hasher.feed_bytes(full.as_bytes());
        }
        hasher.feed(key);
        hasher.feed(&Value::str(prefix));
        hasher.feed(&Value::str(suffix));
        hasher.feed(&Value::Bool(isdir));
        let digest = hasher.finish();

        let artifact = Artifact {
            prefix: prefix.to_owned(),
            digest,
            suffix: suffix.to_owned(),
        };
        self.artifacts.lock().push(artifact.clone());
        let path = self.db.artifact_path(&artifact);
        remove_tree(&path)?;
        Ok(path)
    }

    ///
    /// Materialise a directory tree described by a `Value::Map`: string values become symlinks
    /// (or hard links/copies when `symlinks` is false) to the named paths, nested maps become
    /// nested directories.
    ///
    pub fn mktree(&self, entries: &Value, symlinks: bool) -> Result<PathBuf, Failure> {
        let path = self.mkpath(entries, "", "", true)?;
        materialize_tree(&path, entries, symlinks)?;
        Ok(path)
    }

    ///
    /// Reserve a temporary file name for the lifetime of this execution. The file is removed
    /// when `execute` completes (kept under `NOBS_DEBUG`).
    ///
    pub fn mktemp(&self) -> Result<PathBuf, Failure> {
        let file = tempfile::NamedTempFile::new().map_err(Failure::wrapped)?;
        let path = file.into_temp_path().keep().map_err(Failure::wrapped)?;
        std::fs::remove_file(&path).map_err(Failure::wrapped)?;
        self.temps.lock().push(path.clone());
        Ok(path)
    }

    pub fn mkstemp(&self) -> Result<(File, PathBuf), Failure> {
        let file = tempfile::NamedTempFile::new().map_err(Failure::wrapped)?;
        let (file, temp_path) = file.into_parts();
        let path = temp_path.keep().map_err(Failure::wrapped)?;
        self.temps.lock().push(path.clone());
        Ok((file, path))
    }

    pub fn mkdtemp(&self) -> Result<PathBuf, Failure> {
        let dir = tempfile::TempDir::new().map_err(Failure::wrapped)?;
        let path = dir.keep();
        self.temps.lock().push(path.clone());
        Ok(path)
    }

    ///
    /// Execute a nested memoised rule, declaring its file dependencies as dependencies of this
    /// execution.
    ///
    pub fn execute(&self, rule: Arc<dyn TracedExecution>) -> OutcomeFuture {
        let context = self.clone();
        async move {
            let nested: Arc<Mutex<BTreeSet<PathBuf>>> = Arc::new(Mutex::new(BTreeSet::new()));
            let outcome = context.db.memo_execute(rule, Some(nested.clone())).await;
            let paths: Vec<PathBuf> = nested.lock().iter().cloned().collect();
            context.depend_files(paths).await?;
            outcome
        }
        .boxed()
    }

    pub fn db(&self) -> &MemoDb {
        &self.db
    }
}

fn encode_frame<T: serde::Serialize>(record: &T) -> Result<Vec<u8>, Failure> {
    let payload = bincode::serialize(record).map_err(Failure::wrapped)?;
    let mut frame = vec![0_u8; 4];
    LittleEndian::write_u32(&mut frame, payload.len() as u32);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn read_frame<'a>(bytes: &'a [u8], offset: &mut usize) -> Option<&'a [u8]> {
    if bytes.len() - *offset < 4 {
        return None;
    }
    let len = LittleEndian::read_u32(&bytes[*offset..*offset + 4]) as usize;
    if bytes.len() - *offset - 4 < len {
        return None;
    }
    let payload = &bytes[*offset + 4..*offset + 4 + len];
    *offset += 4 + len;
    Some(payload)
}

fn append_record(state: &mut DbState, record: &Record) -> Result<(), Failure> {
    let frame = encode_frame(record)?;
    state.journal.write_all(&frame).map_err(Failure::wrapped)?;
    state.journal.flush().map_err(Failure::wrapped)?;
    state.size_tail += frame.len() as u64;
    Ok(())
}

fn abspath(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_owned())
}

fn mtime_of(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .and_then(|duration| i64::try_from(duration.as_nanos()).ok())
        .unwrap_or(-1)
}

fn hash_file(path: &Path) -> io::Result<Fingerprint> {
    let mut hasher = ValueHasher::new();
    let s = path.to_string_lossy();
    hasher.feed_bytes(format!("{:x}:{s}", s.len()).as_bytes());
    let mut file = File::open(path)?;
    hasher.feed_reader(&mut file)?;
    Ok(hasher.finish())
}

///
/// Remove a file, symlink or directory tree, tolerating its absence.
///
fn remove_tree(path: &Path) -> Result<(), Failure> {
    match std::fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Failure::wrapped(e)),
        Ok(metadata) => {
            let result = if metadata.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
            result.map_err(Failure::wrapped)
        }
    }
}

fn materialize_tree(path: &Path, entries: &Value, symlinks: bool) -> Result<(), Failure> {
    let Value::Map(entries) = entries else {
        return Err(Failure::Invariant(
            "Directory tree entries must be a map.".to_owned(),
        ));
    };
    std::fs::create_dir_all(path).map_err(Failure::wrapped)?;
    for (name, value) in entries {
        let child = path.join(name);
        match value {
            Value::Map(_) => materialize_tree(&child, value, symlinks)?,
            Value::Str(target) => {
                let target = abspath(Path::new(target));
                if symlinks {
                    // A target which doesn't exist yields a broken symlink, deliberately.
                    std::os::unix::fs::symlink(&target, &child).map_err(Failure::wrapped)?;
                } else {
                    link_or_copy(&target, &child)?;
                }
            }
            _ => {
                return Err(Failure::Invariant(
                    "Directory tree entries must be paths or nested maps.".to_owned(),
                ));
            }
        }
    }
    Ok(())
}

fn link_or_copy(target: &Path, dest: &Path) -> Result<(), Failure> {
    let metadata = std::fs::metadata(target).map_err(Failure::wrapped)?;
    if metadata.is_dir() {
        std::fs::create_dir_all(dest).map_err(Failure::wrapped)?;
        for entry in std::fs::read_dir(target).map_err(Failure::wrapped)? {
            let entry = entry.map_err(Failure::wrapped)?;
            link_or_copy(&entry.path(), &dest.join(entry.file_name()))?;
        }
        Ok(())
    } else if std::fs::hard_link(target, dest).is_ok() {
        Ok(())
    } else {
        std::fs::copy(target, dest)
            .map(|_| ())
            .map_err(Failure::wrapped)
    }
}

#[cfg(test)]
mod tests;
