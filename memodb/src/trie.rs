// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::BTreeMap;

use async_value::Promise;
use fnv::FnvHashMap as HashMap;
use hashing::{Fingerprint, Value};
use runtime::Failure;
use serde::{Deserialize, Serialize};

// 2^32 trie nodes ought to be more than enough for anyone!
pub(crate) type NodeId = u32;

///
/// A position whose children are being addressed: the trie root, or an interior node.
///
pub(crate) type Tip = Option<NodeId>;

///
/// One traced subcall: the method name plus the arguments of the trace invocation.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TracedCall {
    pub method: String,
    pub args: Vec<Value>,
}

///
/// A filesystem entry under the artifact directory, owned by the success leaf that produced it.
/// Named `<prefix>.<hex-of-digest>.<suffix>` on disk.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub prefix: String,
    pub digest: Fingerprint,
    pub suffix: String,
}

///
/// One step of a trace: the call that produced it (absent for the root step, which is the rule's
/// identity), the name digest over dependency path names, and the full digest which additionally
/// covers dependency file contents.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct TraceStep {
    pub call: Option<TracedCall>,
    pub name: Fingerprint,
    pub full: Fingerprint,
}

pub(crate) enum TrieEntry {
    Interior {
        full: Fingerprint,
        call: TracedCall,
        children: HashMap<Fingerprint, NodeId>,
    },
    InProgress {
        full: Fingerprint,
        done: Promise<()>,
    },
    Success {
        full: Fingerprint,
        values: Vec<Value>,
        keys: BTreeMap<String, Value>,
        artifacts: Vec<Artifact>,
    },
    Failure {
        full: Fingerprint,
        failure: Failure,
    },
}

impl TrieEntry {
    pub fn full(&self) -> Fingerprint {
        match self {
            TrieEntry::Interior { full, .. }
            | TrieEntry::InProgress { full, .. }
            | TrieEntry::Success { full, .. }
            | TrieEntry::Failure { full, .. } => *full,
        }
    }
}

///
/// The durable form of a trie node. In-progress nodes have no durable form: attempting to
/// snapshot one is an internal error.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) enum PersistedNode {
    Interior {
        full: Fingerprint,
        call: TracedCall,
        children: BTreeMap<Fingerprint, PersistedNode>,
    },
    Success {
        full: Fingerprint,
        values: Vec<Value>,
        keys: BTreeMap<String, Value>,
        artifacts: Vec<Artifact>,
    },
    Failure {
        full: Fingerprint,
        failure: Failure,
    },
}

///
/// A journal record failed to apply: recovery treats this (like a decode error) as the logical
/// end of the journal.
///
#[derive(Debug)]
pub(crate) struct ReplayHalt;

///
/// The in-memory trie of traced executions: an arena of nodes with a root child-map keyed, like
/// every interior child-map, by name digest.
///
/// Nodes unlinked by pruning simply leak their arena slots for the life of the process; the next
/// snapshot load starts from a fresh arena.
///
pub(crate) struct Trie {
    nodes: Vec<TrieEntry>,
    roots: HashMap<Fingerprint, NodeId>,
}

impl Trie {
    pub fn new() -> Trie {
        Trie {
            nodes: Vec::new(),
            roots: HashMap::default(),
        }
    }

    pub fn entry(&self, id: NodeId) -> &TrieEntry {
        &self.nodes[id as usize]
    }

    pub fn alloc(&mut self, entry: TrieEntry) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(entry);
        id
    }

    pub fn replace(&mut self, id: NodeId, entry: TrieEntry) -> TrieEntry {
        std::mem::replace(&mut self.nodes[id as usize], entry)
    }

    fn children(&self, tip: Tip) -> &HashMap<Fingerprint, NodeId> {
        match tip {
            None => &self.roots,
            Some(id) => match self.entry(id) {
                TrieEntry::Interior { children, .. } => children,
                _ => panic!("Trie tip {id} is not an interior node."),
            },
        }
    }

    fn children_mut(&mut self, tip: Tip) -> &mut HashMap<Fingerprint, NodeId> {
        match tip {
            None => &mut self.roots,
            Some(id) => match &mut self.nodes[id as usize] {
                TrieEntry::Interior { children, .. } => children,
                _ => panic!("Trie tip {id} is not an interior node."),
            },
        }
    }

    pub fn child(&self, tip: Tip, name: &Fingerprint) -> Option<NodeId> {
        self.children(tip).get(name).copied()
    }

    pub fn children_len(&self, tip: Tip) -> usize {
        self.children(tip).len()
    }

    pub fn children_insert(&mut self, tip: Tip, name: Fingerprint, id: NodeId) {
        self.children_mut(tip).insert(name, id);
    }

    fn children_remove(&mut self, tip: Tip, name: &Fingerprint) -> Option<NodeId> {
        self.children_mut(tip).remove(name)
    }

    ///
    /// Collect every artifact referenced below (and including) the given node. Encountering an
    /// in-progress node means a concurrent execution diverged on content digests.
    ///
    pub fn collect_artifacts(
        &self,
        id: NodeId,
        out: &mut Vec<Artifact>,
    ) -> Result<(), Failure> {
        match self.entry(id) {
            TrieEntry::Interior { children, .. } => {
                for &child in children.values() {
                    self.collect_artifacts(child, out)?;
                }
                Ok(())
            }
            TrieEntry::InProgress { .. } => Err(Failure::Invariant(
                "Same trace and instance generated different full hashes.".to_owned(),
            )),
            TrieEntry::Success { artifacts, .. } => {
                out.extend(artifacts.iter().cloned());
                Ok(())
            }
            TrieEntry::Failure { .. } => Ok(()),
        }
    }

    ///
    /// Merge a journalled successful execution into the trie.
    ///
    pub fn apply_tree_record(
        &mut self,
        trace: &[TraceStep],
        values: Vec<Value>,
        keys: BTreeMap<String, Value>,
        artifacts: Vec<Artifact>,
    ) -> Result<(), ReplayHalt> {
        let first = trace.first().ok_or(ReplayHalt)?;
        let mut tip: Tip = None;
        let mut name = first.name;
        let mut full = first.full;

        for next in &trace[1..] {
            let next_call = next.call.as_ref().ok_or(ReplayHalt)?;
            let existing = self.child(tip, &name).filter(|&id| self.entry(id).full() == full);
            let id = match existing {
                Some(id) => match self.entry(id) {
                    TrieEntry::Interior { call, .. } => {
                        if call != next_call {
                            return Err(ReplayHalt);
                        }
                        id
                    }
                    _ => return Err(ReplayHalt),
                },
                None => {
                    let id = self.alloc(TrieEntry::Interior {
                        full,
                        call: next_call.clone(),
                        children: HashMap::default(),
                    });
                    self.children_insert(tip, name, id);
                    id
                }
            };
            tip = Some(id);
            name = next.name;
            full = next.full;
        }

        let leaf = TrieEntry::Success {
            full,
            values,
            keys,
            artifacts,
        };
        match self.child(tip, &name) {
            Some(id) => {
                self.replace(id, leaf);
            }
            None => {
                let id = self.alloc(leaf);
                self.children_insert(tip, name, id);
            }
        }
        Ok(())
    }

    ///
    /// Unlink the subtree addressed by a journalled prune record. The deletion happens at the
    /// deepest "fan" ancestor (the last map along the path with more than one child), so that a
    /// chain of single-child interiors does not linger.
    ///
    pub fn apply_prune_record(&mut self, names: &[Fingerprint]) -> Result<(), ReplayHalt> {
        let (last, prefix) = names.split_last().ok_or(ReplayHalt)?;
        let mut tip: Tip = None;
        let mut fan_tip: Tip = None;
        let mut fan_name = names[0];

        for name in prefix {
            if self.children_len(tip) > 1 {
                fan_tip = tip;
                fan_name = *name;
            }
            let id = self.child(tip, name).ok_or(ReplayHalt)?;
            match self.entry(id) {
                TrieEntry::Interior { .. } => tip = Some(id),
                _ => return Err(ReplayHalt),
            }
        }

        if self.children_len(tip) > 1 {
            self.children_remove(tip, last).ok_or(ReplayHalt)?;
        } else {
            self.children_remove(fan_tip, &fan_name).ok_or(ReplayHalt)?;
        }
        Ok(())
    }

    ///
    /// Unlink a failure path observed during this process, as part of compaction. The path must
    /// end in a failure leaf.
    ///
    pub fn prune_failure_path(&mut self, names: &[Fingerprint]) -> Result<(), Failure> {
        if names.is_empty() {
            return Ok(());
        }
        let mut tip: Tip = None;
        let mut fan_tip: Tip = None;
        let mut fan_name = names[0];

        for (i, name) in names.iter().enumerate() {
            if self.children_len(tip) > 1 {
                fan_tip = tip;
                fan_name = *name;
            }
            let Some(id) = self.child(tip, name) else {
                // Already unlinked, e.g. by a prune that invalidated an enclosing subtree.
                return Ok(());
            };
            match self.entry(id) {
                TrieEntry::Interior { .. } => tip = Some(id),
                TrieEntry::Failure { .. } if i == names.len() - 1 => {}
                _ => {
                    return Err(Failure::Invariant(
                        "A failed path must end in a failure leaf.".to_owned(),
                    ));
                }
            }
        }

        self.children_remove(fan_tip, &fan_name);
        Ok(())
    }

    pub fn to_persisted(&self) -> Result<BTreeMap<Fingerprint, PersistedNode>, Failure> {
        self.roots
            .iter()
            .map(|(&name, &id)| Ok((name, self.node_to_persisted(id)?)))
            .collect()
    }

    fn node_to_persisted(&self, id: NodeId) -> Result<PersistedNode, Failure> {
        match self.entry(id) {
            TrieEntry::Interior {
                full,
                call,
                children,
            } => Ok(PersistedNode::Interior {
                full: *full,
                call: call.clone(),
                children: children
                    .iter()
                    .map(|(&name, &child)| Ok((name, self.node_to_persisted(child)?)))
                    .collect::<Result<_, Failure>>()?,
            }),
            TrieEntry::InProgress { .. } => Err(Failure::Invariant(
                "Cannot snapshot the memo trie while an execution is in progress.".to_owned(),
            )),
            TrieEntry::Success {
                full,
                values,
                keys,
                artifacts,
            } => Ok(PersistedNode::Success {
                full: *full,
                values: values.clone(),
                keys: keys.clone(),
                artifacts: artifacts.clone(),
            }),
            TrieEntry::Failure { full, failure } => Ok(PersistedNode::Failure {
                full: *full,
                failure: failure.clone(),
            }),
        }
    }

    pub fn from_persisted(tree: BTreeMap<Fingerprint, PersistedNode>) -> Trie {
        let mut trie = Trie::new();
        for (name, node) in tree {
            let id = trie.insert_persisted(node);
            trie.roots.insert(name, id);
        }
        trie
    }

    fn insert_persisted(&mut self, node: PersistedNode) -> NodeId {
        let entry = match node {
            PersistedNode::Interior {
                full,
                call,
                children,
            } => {
                let children = children
                    .into_iter()
                    .map(|(name, child)| (name, self.insert_persisted(child)))
                    .collect();
                TrieEntry::Interior {
                    full,
                    call,
                    children,
                }
            }
            PersistedNode::Success {
                full,
                values,
                keys,
                artifacts,
            } => TrieEntry::Success {
                full,
                values,
                keys,
                artifacts,
            },
            PersistedNode::Failure { full, failure } => TrieEntry::Failure { full, failure },
        };
        self.alloc(entry)
    }
}
