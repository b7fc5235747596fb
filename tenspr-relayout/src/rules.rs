//! Per-kind layout rules: encoding inversion and rematerialization cost.
//!
//! Operation kinds are an open set, so their layout behaviour lives in a
//! registry keyed by [`OpTag`] rather than in the kinds themselves. A table is
//! built once and only read afterwards; it can be shared by threads
//! transforming independent graphs.

use crate::config::RematConfig;
use crate::error::{Error, Result};
use crate::ir::*;
use auto_impl::auto_impl;
use std::collections::HashMap;
use std::sync::Arc;

/// Layout behaviour of one operation kind.
#[auto_impl(&, Box, Arc)]
pub trait LayoutRule {
    /// The encoding every tensor operand of `op` must carry so that `op`
    /// produces `target` without a conversion, or `None` when no such
    /// encoding exists.
    fn invert_encoding(&self, graph: &Graph, op: Op, target: &Encoding) -> Option<Encoding>;
    /// Memory access of `op` becomes slower under `target`.
    fn expensive_load_or_store(&self, _graph: &Graph, _op: Op, _target: &Encoding) -> bool { false }
    /// Duplicating `op` under `target` costs more than a conversion saves.
    fn expensive_to_remat(&self, _graph: &Graph, _op: Op, _target: &Encoding) -> bool { false }
}

/// Kinds without a rule: nothing can be inverted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

impl LayoutRule for Unsupported {
    fn invert_encoding(&self, _: &Graph, _: Op, _: &Encoding) -> Option<Encoding> { None }
}

/// Control flow and compute-heavy kinds that are never duplicated.
#[derive(Debug, Clone, Copy, Default)]
pub struct Barrier;

impl LayoutRule for Barrier {
    fn invert_encoding(&self, _: &Graph, _: Op, _: &Encoding) -> Option<Encoding> { None }
    fn expensive_to_remat(&self, _: &Graph, _: Op, _: &Encoding) -> bool { true }
}

/// Elementwise and shape-preserving kinds: operands take the result layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Elementwise;

impl LayoutRule for Elementwise {
    fn invert_encoding(&self, _: &Graph, _: Op, target: &Encoding) -> Option<Encoding> {
        Some(target.clone())
    }
}

/// `expand_dims(x, axis)` in `target` needs `x` in `slice(axis, target)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpandDimsRule;

impl LayoutRule for ExpandDimsRule {
    fn invert_encoding(&self, graph: &Graph, op: Op, target: &Encoding) -> Option<Encoding> {
        let OpKind::ExpandDims { axis } = graph.kind(op) else { return None };
        Some(Encoding::slice(*axis, target.clone()))
    }
}

/// `reduce(x, axis)` can only produce `slice(axis, parent)`, from `x` in `parent`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReduceRule {
    pub cheap: bool,
}

impl LayoutRule for ReduceRule {
    fn invert_encoding(&self, graph: &Graph, op: Op, target: &Encoding) -> Option<Encoding> {
        let OpKind::Reduce { axis, .. } = graph.kind(op) else { return None };
        match target {
            Encoding::Slice { dim, parent } if dim == axis => Some((**parent).clone()),
            _ => None,
        }
    }
    fn expensive_to_remat(&self, _: &Graph, _: Op, _: &Encoding) -> bool { !self.cheap }
}

/// Loads and stores; the accessed pointer tensor is the first operand.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRule {
    pub num_threads: usize,
}

impl LayoutRule for MemoryRule {
    fn invert_encoding(&self, graph: &Graph, op: Op, target: &Encoding) -> Option<Encoding> {
        matches!(graph.kind(op), OpKind::Load).then(|| target.clone())
    }
    fn expensive_load_or_store(&self, graph: &Graph, op: Op, target: &Encoding) -> bool {
        let Some(&ptr) = graph.operands(op).first() else { return false };
        // a scalar access is the same for every layout
        let Some(t) = graph.value_type(ptr).as_tensor() else { return false };
        // every thread reads the same single element
        if t.numel() == 1 { return false; }
        if &t.encoding == target { return false; }
        // fewer elements than threads: the hit-rate makes re-loading cheap
        if t.numel() < self.num_threads { return false; }
        true
    }
    fn expensive_to_remat(&self, graph: &Graph, op: Op, target: &Encoding) -> bool {
        self.expensive_load_or_store(graph, op, target)
    }
}

/// Concatenation cannot be inverted, and is costly when `target` cannot
/// spread the result over the CTA's threads.
#[derive(Debug, Clone, Copy)]
pub struct CatRule {
    pub num_threads: usize,
}

impl LayoutRule for CatRule {
    fn invert_encoding(&self, _: &Graph, _: Op, _: &Encoding) -> Option<Encoding> { None }
    fn expensive_to_remat(&self, graph: &Graph, op: Op, target: &Encoding) -> bool {
        let Some(t) = graph.value_type(graph.result(op)).as_tensor() else { return true };
        let per_thread: usize = match target {
            Encoding::Blocked { size_per_thread, .. } => size_per_thread.iter().map(|&n| n as usize).product(),
            _ => 1,
        };
        t.numel() > per_thread * self.num_threads
    }
}

type SharedRule = Arc<dyn LayoutRule + Send + Sync>;

/// Registry of layout rules keyed by operation kind.
#[derive(Clone)]
pub struct RuleTable {
    rules: HashMap<OpTag, SharedRule>,
    fallback: SharedRule,
}

impl std::fmt::Debug for RuleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags = self.rules.keys().copied().collect::<Vec<_>>();
        tags.sort();
        f.debug_struct("RuleTable").field("rules", &tags).finish()
    }
}

/// Accumulates rules before the table is frozen.
pub struct RuleTableBuilder {
    rules: HashMap<OpTag, SharedRule>,
    fallback: SharedRule,
}

impl RuleTableBuilder {
    pub fn rule(mut self, tag: OpTag, rule: impl LayoutRule + Send + Sync + 'static) -> Self {
        self.rules.insert(tag, Arc::new(rule));
        self
    }
    pub fn fallback(mut self, rule: impl LayoutRule + Send + Sync + 'static) -> Self {
        self.fallback = Arc::new(rule);
        self
    }
    pub fn build(self) -> RuleTable {
        RuleTable { rules: self.rules, fallback: self.fallback }
    }
}

impl RuleTable {
    /// An empty builder whose fallback is [`Unsupported`].
    pub fn builder() -> RuleTableBuilder {
        RuleTableBuilder { rules: HashMap::new(), fallback: Arc::new(Unsupported) }
    }

    /// Rules for every built-in kind.
    pub fn standard(config: &RematConfig) -> Self {
        let num_threads = config.num_threads();
        let mut builder = RuleTable::builder();
        for tag in OpTag::ALL {
            builder = match tag {
                OpTag::Constant | OpTag::MakeRange | OpTag::Splat | OpTag::Binary | OpTag::Unary
                | OpTag::Cast | OpTag::AddPtr | OpTag::Broadcast => builder.rule(tag, Elementwise),
                OpTag::ExpandDims => builder.rule(tag, ExpandDimsRule),
                OpTag::Reduce => builder.rule(tag, ReduceRule { cheap: config.remat_reductions }),
                OpTag::Load | OpTag::Store => builder.rule(tag, MemoryRule { num_threads }),
                OpTag::Cat => builder.rule(tag, CatRule { num_threads }),
                OpTag::Dot | OpTag::For | OpTag::Yield | OpTag::Return => builder.rule(tag, Barrier),
                OpTag::View | OpTag::Convert => builder.rule(tag, Unsupported),
            };
        }
        builder.build()
    }

    pub fn rule(&self, tag: OpTag) -> &dyn LayoutRule {
        match self.rules.get(&tag) {
            Some(rule) => rule.as_ref(),
            None => self.fallback.as_ref(),
        }
    }

    /// Operand encoding under which `op` yields `target`.
    pub fn invert_encoding(&self, graph: &Graph, target: &Encoding, op: Op) -> Result<Encoding> {
        let kind = graph.kind(op);
        self.rule(kind.tag()).invert_encoding(graph, op, target).ok_or_else(|| Error::InversionUnsupported {
            op,
            kind: kind.name(),
            target: target.clone(),
        })
    }

    pub fn expensive_load_or_store(&self, graph: &Graph, op: Op, target: &Encoding) -> bool {
        self.rule(graph.kind(op).tag()).expensive_load_or_store(graph, op, target)
    }

    pub fn expensive_to_remat(&self, graph: &Graph, op: Op, target: &Encoding) -> bool {
        self.rule(graph.kind(op).tag()).expensive_to_remat(graph, op, target)
    }
}

/// Operand encoding under which `op` yields `target`, per `rules`.
pub fn invert_encoding(rules: &RuleTable, graph: &Graph, target: &Encoding, op: Op) -> Result<Encoding> {
    rules.invert_encoding(graph, target, op)
}

pub fn expensive_load_or_store(rules: &RuleTable, graph: &Graph, op: Op, target: &Encoding) -> bool {
    rules.expensive_load_or_store(graph, op, target)
}

pub fn expensive_to_remat(rules: &RuleTable, graph: &Graph, op: Op, target: &Encoding) -> bool {
    rules.expensive_to_remat(graph, op, target)
}
