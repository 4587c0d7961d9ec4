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

mod node_map;
use crate::node_map::{CallKey, NodeMap};

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use errorlog::ErrorLog;
use fnv::FnvHashMap as HashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use hashing::{Fingerprint, Value};
use memodb::MemoDb;
use parking_lot::Mutex;
use runtime::{Failure, OutcomeFuture, ValueFuture};
use task_executor::Executor;

pub(crate) type RuleNodeId = u32;

// Node 0 is the empty node above the project root: no parent, no definitions.
const EMPTY_NODE: RuleNodeId = 0;

pub type RuleFn = Arc<dyn Fn(RuleContext, Vec<Value>) -> ValueFuture + Send + Sync>;

type RuleFileFn = Arc<dyn Fn(&mut RuleFileScope) + Send + Sync>;

type SharedValueFuture = Shared<ValueFuture>;

///
/// Identifies which rule-invocation argument names the filesystem path that directs dispatch:
/// either a positional index, or the name of a parameter declared in `RuleOptions::params`.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PathArg {
    Index(usize),
    Named(String),
}

#[derive(Clone, Debug, Default)]
pub struct RuleOptions {
    /// When set, the rule is invocable from the command line under this name.
    pub cli: Option<String>,
    /// When set, dispatch prefers definitions in rule files closest to the named argument.
    pub path_arg: Option<PathArg>,
    /// Declared parameter names (excluding the context), used to resolve `PathArg::Named`.
    pub params: Vec<String>,
    /// Shown by `tool help <cli>`.
    pub doc: Option<String>,
}

enum RuleKind {
    Plain(RuleFn),
    Memoized(Arc<dyn MemoizedRule>),
}

struct RuleDef {
    #[allow(dead_code)]
    name: String,
    kind: RuleKind,
    cli: Option<String>,
    path_arg: Option<usize>,
    doc: Option<String>,
}

///
/// A heavyweight rule whose executions are memoised across process lifetimes.
///
/// Implementations declare one or more traced methods and a single `execute`. Traced methods
/// see the rule-invocation arguments and may call other rules through the given context; the
/// engine intercepts them to record dependencies. `execute` sees only the memo context: its
/// inputs reach it exclusively through traced calls, which is what makes the recorded trace a
/// complete description of the execution.
///
pub trait MemoizedRule: Send + Sync + 'static {
    fn module(&self) -> &str;

    fn name(&self) -> &str;

    ///
    /// Bump to orphan all previously recorded traces of this rule.
    ///
    fn version_bump(&self) -> Option<Value> {
        None
    }

    fn traced_methods(&self) -> Vec<&'static str>;

    fn call_traced(
        &self,
        method: &str,
        me: memodb::TraceContext,
        cxt: RuleContext,
        rule_args: Vec<Value>,
        call_args: Vec<Value>,
    ) -> ValueFuture;

    fn execute(&self, me: MemoContext) -> OutcomeFuture;
}

struct PendingDef {
    name: String,
    options: RuleOptions,
    kind: RuleKind,
}

///
/// The namespace a rule file populates: registration of plain and memoised rules, plus `here`
/// for paths relative to the rule file's directory.
///
pub struct RuleFileScope {
    dir: PathBuf,
    defs: Vec<PendingDef>,
}

impl RuleFileScope {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    ///
    /// Join the given path under this rule file's directory.
    ///
    pub fn here(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.dir.join(rel)
    }

    pub fn rule(
        &mut self,
        name: &str,
        options: RuleOptions,
        f: impl Fn(RuleContext, Vec<Value>) -> ValueFuture + Send + Sync + 'static,
    ) {
        self.defs.push(PendingDef {
            name: name.to_owned(),
            options,
            kind: RuleKind::Plain(Arc::new(f)),
        });
    }

    pub fn rule_memoized(
        &mut self,
        name: &str,
        options: RuleOptions,
        rule: Arc<dyn MemoizedRule>,
    ) {
        self.defs.push(PendingDef {
            name: name.to_owned(),
            options,
            kind: RuleKind::Memoized(rule),
        });
    }
}

struct RuleNodeData {
    parent: Option<RuleNodeId>,
    dir: PathBuf,
    defs: HashMap<String, (Arc<RuleDef>, RuleNodeId)>,
    clis: BTreeMap<String, String>,
}

struct NodeCache {
    arena: Vec<RuleNodeData>,
    by_path: HashMap<PathBuf, RuleNodeId>,
}

pub struct RuleTreeBuilder {
    root: PathBuf,
    files: Vec<(PathBuf, RuleFileFn)>,
}

impl RuleTreeBuilder {
    pub fn new(root: impl Into<PathBuf>) -> RuleTreeBuilder {
        RuleTreeBuilder {
            root: root.into(),
            files: Vec::new(),
        }
    }

    ///
    /// Register the rule file for a directory. The function is invoked once per process to
    /// populate the directory's namespace, and must be free of side effects beyond defining
    /// rules.
    ///
    pub fn rule_file(
        mut self,
        dir: impl Into<PathBuf>,
        build: impl Fn(&mut RuleFileScope) + Send + Sync + 'static,
    ) -> RuleTreeBuilder {
        self.files.push((dir.into(), Arc::new(build)));
        self
    }

    pub fn build(self, db: MemoDb, executor: Executor, errorlog: ErrorLog) -> RuleTree {
        let root = normalize(&abspath(&self.root));
        let files = self
            .files
            .into_iter()
            .map(|(dir, f)| (normalize(&abspath(&dir)), f))
            .collect();
        RuleTree {
            inner: Arc::new(TreeInner {
                root,
                files,
                db,
                executor,
                errorlog,
                nodes: Mutex::new(NodeCache {
                    arena: vec![RuleNodeData {
                        parent: None,
                        dir: PathBuf::new(),
                        defs: HashMap::default(),
                        clis: BTreeMap::new(),
                    }],
                    by_path: HashMap::default(),
                }),
                call_cache: Mutex::new(BTreeMap::new()),
            }),
        }
    }
}

struct TreeInner {
    root: PathBuf,
    files: HashMap<PathBuf, RuleFileFn>,
    db: MemoDb,
    executor: Executor,
    errorlog: ErrorLog,
    nodes: Mutex<NodeCache>,
    call_cache: Mutex<BTreeMap<CallKey, SharedValueFuture>>,
}

///
/// The directory-indexed inheritance graph of rule definitions for a project root.
///
/// Nodes are built lazily per directory by merging the directory's rule file (if registered)
/// over its parent's merged view; definitions in child directories override those in parents
/// while inheriting their `cli` and `path_arg` annotations.
///
#[derive(Clone)]
pub struct RuleTree {
    inner: Arc<TreeInner>,
}

impl RuleTree {
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn db(&self) -> &MemoDb {
        &self.inner.db
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    pub fn errorlog(&self) -> &ErrorLog {
        &self.inner.errorlog
    }

    ///
    /// A context dispatching from the project root, the entry point for rule evaluation.
    ///
    pub fn root_context(&self) -> Result<RuleContext, Failure> {
        let root = self.node_at(&self.inner.root.clone())?;
        Ok(RuleContext {
            tree: self.clone(),
            root,
            node_map: NodeMap::empty(),
            deps: Deps::Root,
        })
    }

    ///
    /// The command-line surface: a map from cli name to an invocable hook which absolutises the
    /// rule's path argument before dispatching.
    ///
    pub fn cli_hooks(&self) -> Result<BTreeMap<String, CliHook>, Failure> {
        let root = self.node_at(&self.inner.root.clone())?;
        let clis = {
            let nodes = self.inner.nodes.lock();
            nodes.arena[root as usize].clis.clone()
        };

        let mut hooks = BTreeMap::new();
        for (cli, rule_name) in clis {
            let Some((def, _owner)) = self.def_at(root, &rule_name) else {
                continue;
            };
            hooks.insert(
                cli,
                CliHook {
                    rule: rule_name,
                    doc: def.doc.clone(),
                    path_arg: def.path_arg,
                    tree: self.clone(),
                },
            );
        }
        Ok(hooks)
    }

    ///
    /// A process-lifetime cache over rule-level computations, deduplicating in-flight
    /// evaluations by `(name, args)`.
    ///
    pub fn cached_call(
        &self,
        name: &str,
        args: Vec<Value>,
        compute: impl FnOnce() -> ValueFuture,
    ) -> ValueFuture {
        let key = (name.to_owned(), args);
        let shared = {
            let mut cache = self.inner.call_cache.lock();
            cache
                .entry(key)
                .or_insert_with(|| compute().shared())
                .clone()
        };
        shared.boxed()
    }

    ///
    /// Compute the rule node for a directory: the merged-definitions view of its rule file over
    /// its parent's. Directories outside the project root resolve to the root's node.
    ///
    fn node_at(&self, path: &Path) -> Result<RuleNodeId, Failure> {
        let path = normalize(&abspath(path));
        if !path.starts_with(&self.inner.root) {
            return self.node_at(&self.inner.root.clone());
        }

        if let Some(&id) = self.inner.nodes.lock().by_path.get(&path) {
            return Ok(id);
        }

        let parent = if path == self.inner.root {
            EMPTY_NODE
        } else {
            let parent_dir = path
                .parent()
                .expect("A path under the root always has a parent.")
                .to_owned();
            self.node_at(&parent_dir)?
        };

        let id = match self.inner.files.get(&path) {
            None => parent,
            Some(build) => {
                log::debug!("Evaluating rule file at {}", path.display());
                let mut scope = RuleFileScope {
                    dir: path.clone(),
                    defs: Vec::new(),
                };
                build(&mut scope);
                self.merge_node(parent, scope.defs, &path)?
            }
        };

        self.inner.nodes.lock().by_path.insert(path, id);
        Ok(id)
    }

    fn merge_node(
        &self,
        parent: RuleNodeId,
        pending: Vec<PendingDef>,
        dir: &Path,
    ) -> Result<RuleNodeId, Failure> {
        let mut nodes = self.inner.nodes.lock();
        let mut defs = nodes.arena[parent as usize].defs.clone();
        let mut clis = nodes.arena[parent as usize].clis.clone();
        let new_id = nodes.arena.len() as RuleNodeId;

        for def in pending {
            let inherited = defs.get(&def.name).map(|(d, _)| d.clone());

            let own_path_arg = match &def.options.path_arg {
                None => None,
                Some(PathArg::Index(i)) => Some(*i),
                Some(PathArg::Named(param)) => {
                    let i = def
                        .options
                        .params
                        .iter()
                        .position(|p| p == param)
                        .ok_or_else(|| {
                            Failure::Wrapped(format!(
                                "Rule '{}' names path_arg '{param}', which is not among its \
                                 declared params.",
                                def.name
                            ))
                        })?;
                    Some(i)
                }
            };

            let (path_arg, cli) = match &inherited {
                None => (own_path_arg, def.options.cli.clone()),
                Some(parent_def) => {
                    if own_path_arg.is_some() && own_path_arg != parent_def.path_arg {
                        return Err(Failure::ConfigContradiction {
                            rule: def.name,
                            annotation: "path_arg".to_owned(),
                            dir: dir.display().to_string(),
                        });
                    }
                    if def.options.cli.is_some() && def.options.cli != parent_def.cli {
                        return Err(Failure::ConfigContradiction {
                            rule: def.name,
                            annotation: "cli".to_owned(),
                            dir: dir.display().to_string(),
                        });
                    }
                    (
                        own_path_arg.or(parent_def.path_arg),
                        def.options.cli.clone().or_else(|| parent_def.cli.clone()),
                    )
                }
            };

            if let Some(cli) = &cli {
                clis.entry(cli.clone()).or_insert_with(|| def.name.clone());
            }
            let rule_def = Arc::new(RuleDef {
                name: def.name.clone(),
                kind: def.kind,
                cli,
                path_arg,
                doc: def.options.doc,
            });
            defs.insert(def.name, (rule_def, new_id));
        }

        nodes.arena.push(RuleNodeData {
            parent: Some(parent),
            dir: dir.to_owned(),
            defs,
            clis,
        });
        Ok(new_id)
    }

    fn def_at(&self, node: RuleNodeId, name: &str) -> Option<(Arc<RuleDef>, RuleNodeId)> {
        let nodes = self.inner.nodes.lock();
        nodes.arena[node as usize].defs.get(name).cloned()
    }

    fn parent_of(&self, node: RuleNodeId) -> RuleNodeId {
        let nodes = self.inner.nodes.lock();
        nodes.arena[node as usize].parent.unwrap_or(EMPTY_NODE)
    }

    fn dir_of(&self, node: RuleNodeId) -> PathBuf {
        let nodes = self.inner.nodes.lock();
        nodes.arena[node as usize].dir.clone()
    }
}

///
/// How a rule invocation's dependencies are being recorded: not at all (a plain entry-point
/// call), into a trace context (called from a traced method), or into an execute context
/// (called during a memoised execution).
///
#[derive(Clone)]
#[allow(dead_code)]
enum Deps {
    Root,
    Trace(memodb::TraceContext),
    Exec(memodb::ExecuteContext),
}

///
/// The dispatch context handed to every rule invocation.
///
/// Attribute access from the original surface becomes `call(name, args)`; the node-map records
/// a `(name, args) -> parent-node` binding per dispatched frame, so a rule calling itself with
/// identical arguments resolves one rule file up: deferral to the parent definition rather than
/// infinite recursion.
///
#[derive(Clone)]
pub struct RuleContext {
    tree: RuleTree,
    root: RuleNodeId,
    node_map: NodeMap,
    deps: Deps,
}

impl RuleContext {
    pub fn tree(&self) -> &RuleTree {
        &self.tree
    }

    fn with_deps(&self, deps: Deps) -> RuleContext {
        RuleContext {
            tree: self.tree.clone(),
            root: self.root,
            node_map: self.node_map.clone(),
            deps,
        }
    }

    ///
    /// Invoke the named rule with the given arguments.
    ///
    pub fn call(&self, name: &str, args: Vec<Value>) -> ValueFuture {
        let this = self.clone();
        let name = name.to_owned();
        async move {
            let key: CallKey = (name.clone(), args.clone());
            let root_def = this.tree.def_at(this.root, &name);

            let node = if let Some(mapped) = this.node_map.get(&key) {
                mapped
            } else if let Some((def, _)) = &root_def {
                match def.path_arg {
                    Some(i) => {
                        let path = path_arg_value(&name, &args, i)?;
                        this.tree.node_at(&path)?
                    }
                    None => this.root,
                }
            } else {
                return Err(Failure::NoDefinition { name, hint: None });
            };

            let Some((def, owner)) = this.tree.def_at(node, &name) else {
                let hint = root_def
                    .as_ref()
                    .and_then(|(def, _)| def.path_arg)
                    .and_then(|i| path_arg_value(&name, &args, i).ok())
                    .map(|path| {
                        format!(
                            "Make sure a rule definition exists in the rule file at '{}' or in \
                             one along the path to '{}'.",
                            this.tree.root().display(),
                            path.display()
                        )
                    });
                return Err(Failure::NoDefinition { name, hint });
            };

            let parent = this.tree.parent_of(owner);
            let next = RuleContext {
                tree: this.tree.clone(),
                root: owner,
                node_map: this.node_map.with_put(key, parent),
                deps: this.deps.clone(),
            };

            match &def.kind {
                RuleKind::Plain(f) => f(next, args).await,
                RuleKind::Memoized(rule) => {
                    let adapter = Arc::new(MemoRuleAdapter {
                        rule: rule.clone(),
                        owner_dir: this.tree.dir_of(owner),
                        base: next.with_deps(Deps::Root),
                        args,
                    });
                    let success = match &this.deps {
                        Deps::Root => this.tree.db().execute(adapter),
                        Deps::Trace(trace) => trace.execute(adapter),
                        Deps::Exec(exec) => exec.execute(adapter),
                    }
                    .await?;
                    Ok(success.value())
                }
            }
        }
        .boxed()
    }
}

fn path_arg_value(name: &str, args: &[Value], index: usize) -> Result<PathBuf, Failure> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(abspath(Path::new(s))),
        _ => Err(Failure::Wrapped(format!(
            "Rule '{name}' expects a path string as argument {index}."
        ))),
    }
}

///
/// Binds a memoised rule invocation onto the memo database's execution model. The invocation
/// arguments never reach the trie directly: they influence it only through the observed results
/// of traced calls.
///
struct MemoRuleAdapter {
    rule: Arc<dyn MemoizedRule>,
    owner_dir: PathBuf,
    base: RuleContext,
    args: Vec<Value>,
}

impl memodb::TracedExecution for MemoRuleAdapter {
    fn identity(&self) -> Fingerprint {
        // The defining directory qualifies the module, so identically-named rules in
        // different rule files are distinct definition sites.
        let module = format!("{}::{}", self.owner_dir.display(), self.rule.module());
        let methods = self.rule.traced_methods();
        memodb::rule_identity(
            &module,
            self.rule.name(),
            &methods,
            self.rule.version_bump().as_ref(),
        )
    }

    fn run_traced(
        &self,
        context: memodb::TraceContext,
        method: &str,
        call_args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value, Failure>> {
        let cxt = self.base.with_deps(Deps::Trace(context.clone()));
        self.rule
            .call_traced(method, context, cxt, self.args.clone(), call_args)
    }

    fn run_execute(&self, context: memodb::ExecuteContext) -> OutcomeFuture {
        let me = MemoContext {
            exec: context,
            tree: self.base.tree.clone(),
        };
        self.rule.execute(me)
    }
}

///
/// The memoisation context handed to a memoised rule's `execute`: traced subcalls, dependency
/// declarations, and artifact factories. Deliberately not a dispatch context: `execute` reaches
/// other rules only through traced methods.
///
#[derive(Clone)]
pub struct MemoContext {
    exec: memodb::ExecuteContext,
    tree: RuleTree,
}

impl MemoContext {
    pub fn tree(&self) -> &RuleTree {
        &self.tree
    }

    ///
    /// Perform a traced subcall on this rule.
    ///
    pub fn call(&self, method: &str, call_args: Vec<Value>) -> ValueFuture {
        self.exec.call(method, call_args)
    }

    pub async fn depend_files(
        &self,
        paths: impl IntoIterator<Item = PathBuf>,
    ) -> Result<(), Failure> {
        self.exec.depend_files(paths).await
    }

    pub async fn depend_fact(&self, key: Value, value: Value) -> Result<(), Failure> {
        self.exec.depend_fact(key, value).await
    }

    pub async fn depend_facts(
        &self,
        facts: impl IntoIterator<Item = (Value, Value)>,
    ) -> Result<(), Failure> {
        self.exec.depend_facts(facts).await
    }

    pub fn mkpath(
        &self,
        key: &Value,
        prefix: &str,
        suffix: &str,
        isdir: bool,
    ) -> Result<PathBuf, Failure> {
        self.exec.mkpath(key, prefix, suffix, isdir)
    }

    pub fn mktree(&self, entries: &Value, symlinks: bool) -> Result<PathBuf, Failure> {
        self.exec.mktree(entries, symlinks)
    }

    pub fn mktemp(&self) -> Result<PathBuf, Failure> {
        self.exec.mktemp()
    }

    pub fn mkstemp(&self) -> Result<(std::fs::File, PathBuf), Failure> {
        self.exec.mkstemp()
    }

    pub fn mkdtemp(&self) -> Result<PathBuf, Failure> {
        self.exec.mkdtemp()
    }
}

///
/// A command-line entry: dispatches its rule through the root context after absolutising the
/// path argument.
///
pub struct CliHook {
    pub rule: String,
    pub doc: Option<String>,
    path_arg: Option<usize>,
    tree: RuleTree,
}

impl CliHook {
    pub fn invoke(&self, mut args: Vec<Value>) -> ValueFuture {
        if let Some(i) = self.path_arg {
            if let Some(Value::Str(s)) = args.get(i) {
                args[i] = Value::path(&abspath(Path::new(s)));
            }
        }
        let tree = self.tree.clone();
        let rule = self.rule.clone();
        async move { tree.root_context()?.call(&rule, args).await }.boxed()
    }
}

fn abspath(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_owned())
}

///
/// Lexically normalize a path: resolve `.` and `..` components without touching the
/// filesystem, so that containment checks and node-cache keys are stable.
///
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests;
