//! Applying a rematerialization plan.
//!
//! Application runs in two steps. Every replacement operation is first
//! created detached, so a plan that turns out not to type-check leaves the
//! live graph as it was. Only then are the new operations placed, the
//! conversion's uses rewired and the conversion erased.

use crate::clone::{clone_with_infer_type, ValueMapping};
use crate::config::RematConfig;
use crate::error::{Error, Result};
use crate::ir::*;
use crate::remat::{simulate_backward_rematerialization, RematContext};
use crate::rules::RuleTable;
use std::collections::HashSet;

/// What applying one plan did to the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainReport {
    /// operations recomputed in their new layout
    pub cloned: usize,
    /// existing conversions the new chain reads through
    pub folded: usize,
    /// conversions created for leaves of the chain
    pub inserted: usize,
    /// operations erased, the seed conversion included
    pub erased: usize,
}

#[derive(Debug, Clone, Copy)]
enum Anchor {
    After(Op),
    Start(Region),
}

pub(crate) fn conversion_target(graph: &Graph, op: Op) -> Result<Encoding> {
    match graph.kind(op) {
        OpKind::Convert { to } if graph.is_live(op) => Ok(to.clone()),
        _ => Err(Error::NotAConversion { op }),
    }
}

// the conversion defining `value` and its source
pub(crate) fn conversion_source(graph: &Graph, value: Value) -> Option<(Op, Value)> {
    let op = graph.defining_op(value)?;
    graph.kind(op).is_convert().then(|| (op, graph.operands(op)[0]))
}

fn is_recomputed(graph: &Graph, ctx: &RematContext, value: Value) -> bool {
    graph.defining_op(value).is_some_and(|op| ctx.processed.contains(&op))
}

// values the chain reads without recomputing them, and that are not already in place
fn leaves<'a>(graph: &'a Graph, ctx: &'a RematContext) -> impl Iterator<Item = (Value, &'a Encoding)> + 'a {
    ctx.to_convert.iter()
        .map(|(&v, enc)| (v, enc))
        .filter(move |&(v, enc)| !is_recomputed(graph, ctx, v) && graph.value_type(v).encoding() != Some(enc))
}

fn sorted(graph: &Graph, ops: impl IntoIterator<Item = Op>) -> Vec<Op> {
    let order = graph.program_order();
    let mut ops = ops.into_iter().collect::<Vec<_>>();
    ops.sort_by_key(|&op| order[op]);
    ops
}

/// Recompute the plan in `ctx` and make it replace the result of `seed`.
///
/// Planned operations are cloned in program order, so producers are
/// cloned before their consumers and every clone sees its operands already
/// rewired through `mapping`. Each clone is placed right after its
/// original. Leaves produced by a conversion are read from that
/// conversion's source, converted once more when the source is not in the
/// required layout either. Values `mapping` already covers are taken as is.
///
/// Originals keep their other uses; those left without any are erased.
pub fn rematerialize_conversion_chain(
    graph: &mut Graph,
    seed: Op,
    ctx: &RematContext,
    mapping: &mut ValueMapping,
) -> Result<ChainReport> {
    conversion_target(graph, seed)?;
    let mut report = ChainReport::default();
    let mut placements: Vec<(Anchor, Op)> = Vec::new();
    let mut folded = Vec::new();

    let leaves = leaves(graph, ctx).map(|(v, enc)| (v, enc.clone())).collect::<Vec<_>>();
    for (value, encoding) in leaves {
        if mapping.contains(value) { continue; }
        let (source, anchor) = match conversion_source(graph, value) {
            Some((cvt, src)) => {
                report.folded += 1;
                folded.push(cvt);
                (src, Anchor::After(cvt))
            }
            None => match graph.value_def(value) {
                ValueDef::Result(op, _) => (value, Anchor::After(op)),
                ValueDef::Arg(region, _) => (value, Anchor::Start(region)),
            },
        };
        if graph.value_type(source).encoding() == Some(&encoding) {
            mapping.map(value, source);
            continue;
        }
        let cvt = graph.create_op(OpKind::Convert { to: encoding }, &[source], None)?;
        placements.push((anchor, cvt));
        mapping.map(value, graph.result(cvt));
        report.inserted += 1;
    }

    let ops = sorted(graph, ctx.processed.iter().copied().filter(|&op| graph.is_live(op)));
    for &op in ops.iter() {
        let value = graph.result(op);
        let encoding = ctx.to_convert.get(&value);
        let clone = clone_with_infer_type(graph, op, mapping, encoding)?;
        let new_value = graph.result(clone);
        if encoding.is_some_and(|enc| graph.value_type(new_value).encoding() != Some(enc)) {
            return Err(Error::TypeInference {
                kind: graph.kind(op).name(),
                reason: format!("clone of {op} comes out as {}", graph.value_type(new_value)),
            });
        }
        mapping.map(value, new_value);
        placements.push((Anchor::After(op), clone));
        report.cloned += 1;
    }

    let old = graph.result(seed);
    let new = mapping.lookup(graph.operands(seed)[0]);
    if graph.value_type(new) != graph.value_type(old) {
        return Err(Error::TypeInference {
            kind: "convert_layout",
            reason: format!("{new} has type {} instead of {}", graph.value_type(new), graph.value_type(old)),
        });
    }

    // nothing below can fail on a consistent plan
    for (anchor, op) in placements {
        match anchor {
            Anchor::After(at) => graph.insert_op_after(at, op)?,
            Anchor::Start(region) => graph.insert_op_at_start(region, op),
        }
    }
    graph.replace_all_uses(old, new);
    graph.erase_op(seed)?;
    report.erased += 1;
    for &op in ops.iter().rev().chain(folded.iter()) {
        let dead = !graph.kind(op).has_side_effects() && !graph.results(op).iter().any(|&v| graph.has_uses(v));
        if graph.is_live(op) && dead {
            graph.erase_op(op)?;
            report.erased += 1;
        }
    }
    log::trace!("chain: {seed} replaced by {new}, {report:?}");
    Ok(report)
}

/// Where the result of a planned chain ends up.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Root {
    /// replaces the result of this conversion
    Conversion(Op),
    /// feeds one operand slot that a conversion would otherwise have to feed
    Operand(Op, usize),
}

// every use of `value` goes away with the rewrite
fn released(graph: &Graph, value: Value, dying: &HashSet<Op>, root: Root) -> bool {
    graph.users(value).into_iter().all(|user| {
        dying.contains(&user)
            || matches!(root, Root::Operand(op, slot) if op == user
                && graph.operands(user).iter().enumerate().all(|(i, &v)| v != value || i == slot))
    })
}

// the root conversion plus every planned op whose results feed nothing but dying ops
fn dying_ops(graph: &Graph, root: Root, ctx: &RematContext) -> HashSet<Op> {
    let mut dying = match root {
        Root::Conversion(op) => HashSet::from([op]),
        Root::Operand(..) => HashSet::new(),
    };
    for op in sorted(graph, ctx.processed.iter().copied()).into_iter().rev() {
        if graph.kind(op).has_side_effects() { continue; }
        if released(graph, graph.result(op), &dying, root) {
            dying.insert(op);
        }
    }
    dying
}

/// Conversions a plan adds and removes, and the planned ops left without users.
#[derive(Debug, Clone, Default)]
pub(crate) struct Balance {
    pub added: usize,
    pub removed: usize,
    pub dying: HashSet<Op>,
}

impl Balance {
    pub fn profitable(&self) -> bool { self.added < self.removed }
}

pub(crate) fn balance(graph: &Graph, root: Root, ctx: &RematContext) -> Balance {
    let dying = dying_ops(graph, root, ctx);
    let (mut added, mut removed) = (0, 1);
    for (value, encoding) in leaves(graph, ctx) {
        // region arguments only get here assumed, in their new layout
        if graph.defining_op(value).is_none() { continue; }
        let Some((_, src)) = conversion_source(graph, value) else {
            added += 1;
            continue;
        };
        if graph.value_type(src).encoding() != Some(encoding) { added += 1; }
        if released(graph, value, &dying, root) { removed += 1; }
    }
    Balance { added, removed, dying }
}

/// Try to eliminate the conversion `cvt` by recomputing its operand's cone.
///
/// The attempt is rejected when planning fails or when the rewrite would not
/// lower the number of conversions. Either way the graph is left unchanged.
pub fn try_rematerialize(graph: &mut Graph, rules: &RuleTable, config: &RematConfig, cvt: Op) -> Result<ChainReport> {
    let target = conversion_target(graph, cvt)?;
    let mut ctx = RematContext::new();
    let cost = simulate_backward_rematerialization(graph, rules, config, cvt, &mut ctx, &target, true)?;
    let Balance { added, removed, .. } = balance(graph, Root::Conversion(cvt), &ctx);
    if added >= removed {
        log::debug!("chain: {cvt} kept, {added} conversions for {removed}");
        return Err(Error::Unprofitable { removed, added });
    }
    let report = rematerialize_conversion_chain(graph, cvt, &ctx, &mut ValueMapping::new())?;
    debug_assert_eq!(report.cloned, cost);
    log::debug!("chain: {cvt} rematerialized in {target} with {cost} clones");
    Ok(report)
}

/// Sweep every conversion of `graph` until no more can be removed.
///
/// Returns the number of conversions rematerialized.
pub fn rematerialize_all(graph: &mut Graph, rules: &RuleTable, config: &RematConfig) -> usize {
    let mut applied = 0;
    loop {
        let before = applied;
        let cvts = graph.walk_ops().into_iter().filter(|&op| graph.kind(op).is_convert()).collect::<Vec<_>>();
        for cvt in cvts {
            if !graph.is_live(cvt) { continue; }
            match try_rematerialize(graph, rules, config, cvt) {
                Ok(_) => applied += 1,
                Err(err) => log::trace!("chain: {cvt} kept: {err}"),
            }
        }
        // every success strictly lowers the number of conversions
        if applied == before { return applied; }
    }
}
