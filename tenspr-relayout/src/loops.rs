//! Moving layout conversions of loop-carried values out of their loop.
//!
//! A loop that converts its accumulator on every iteration, after entering
//! it through the inverse conversion, can carry the accumulator in the
//! converted layout instead: the loop starts from the unconverted value and
//! only its result is converted, once, after the loop. [`fixup_loops`]
//! restores the agreement between a loop's carried types and the values
//! flowing into them once other rewrites are done.

use crate::chain::{balance, conversion_source, conversion_target, try_rematerialize, Root};
use crate::config::RematConfig;
use crate::error::{Error, Result};
use crate::ir::*;
use crate::remat::{simulate_backward_rematerialization, RematContext};
use crate::rules::RuleTable;
use std::collections::HashSet;

/// What hoisting one conversion did to the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HoistReport {
    /// conversions removed from the loop body
    pub hoisted: usize,
    /// conversions created, before, inside or after the loop
    pub inserted: usize,
    /// other operations erased because nothing read them anymore
    pub erased: usize,
}

// conversions that are cheaper to keep inside the loop
fn keeps_conversion(from: &Encoding, to: &Encoding) -> bool {
    match to {
        Encoding::DotOperand { .. } => from.is_shared(),
        Encoding::Shared { vec, .. } => *vec == 1,
        _ => false,
    }
}

/// Decide whether the conversion of the loop-carried `arg` can move above its loop.
///
/// On success `cvts` holds the conversions of `arg` to the hoisted layout.
/// It stays empty when `arg` is never converted, which leaves nothing to do.
/// Conversions are only hoisted when they all agree on their target, when
/// the initial value is itself a conversion from that target, and when the
/// value flowing back into `arg` comes out in the target without a
/// conversion of its own: it already has the layout, is converted from it,
/// or can be recomputed in it with fewer conversions than it removes. Any
/// other reader of `arg` must be recomputed along with the back-edge.
pub fn can_move_out_of_loop(
    graph: &Graph,
    rules: &RuleTable,
    config: &RematConfig,
    arg: Value,
    cvts: &mut Vec<Op>,
) -> Result<()> {
    let fail = |reason: &str| Error::LoopInvariant { value: arg, reason: reason.to_string() };
    let Some((for_op, slot)) = graph.iter_arg_owner(arg) else {
        return Err(fail("not carried by a loop"));
    };
    let Some(current) = graph.value_type(arg).encoding() else {
        return Err(fail("carries a scalar"));
    };
    let body = graph.loop_body(for_op);
    let yield_op = graph.loop_yield(for_op).ok_or_else(|| fail("the loop has no yield"))?;

    let mut target: Option<Encoding> = None;
    let mut others = Vec::new();
    for user in graph.users(arg) {
        match graph.kind(user) {
            OpKind::Convert { to } if keeps_conversion(current, to) => {}
            OpKind::Convert { to } => {
                match &target {
                    Some(t) if t != to => return Err(fail("converted to more than one layout")),
                    _ => target = Some(to.clone()),
                }
                cvts.push(user);
            }
            _ => others.push(user),
        }
    }
    let Some(target) = target else { return Ok(()) };

    if cvts.iter().chain(others.iter()).any(|&op| graph.parent_region(op) != Some(body)) {
        return Err(fail("read outside the loop body block"));
    }
    let new_ty = graph.value_type(arg).with_encoding(target.clone());
    let init = graph.loop_inits(for_op)[slot];
    if !conversion_source(graph, init).is_some_and(|(_, src)| graph.value_type(src) == &new_ty) {
        return Err(fail("the initial value is not converted from the new layout"));
    }
    if graph.operands(yield_op).iter().enumerate().any(|(i, &v)| v == arg && i != slot) {
        return Err(fail("yielded into another slot"));
    }
    let readers = others.into_iter().filter(|&op| op != yield_op).collect::<Vec<_>>();

    let back = graph.operands(yield_op)[slot];
    let folds = back == arg
        || graph.value_type(back) == &new_ty
        || conversion_source(graph, back).is_some_and(|(_, src)| graph.value_type(src) == &new_ty);
    let dying = if folds {
        HashSet::new()
    } else {
        let Some(def) = graph.defining_op(back) else {
            return Err(fail("the back-edge is a region argument"));
        };
        let mut ctx = RematContext::new();
        ctx.assume(arg, target.clone());
        if let Err(err) = simulate_backward_rematerialization(graph, rules, config, def, &mut ctx, &target, false) {
            log::debug!("loops: back-edge {back} of {arg} stays in its layout: {err}");
            return Err(fail("the back-edge cannot be recomputed in the new layout"));
        }
        // hoisted conversions are replaced by `arg`, which only comes in the target
        if cvts.iter().any(|&cvt| ctx.to_convert.get(&graph.result(cvt)).is_some_and(|enc| *enc != target)) {
            return Err(fail("the back-edge needs a hoisted conversion in another layout"));
        }
        let plan = balance(graph, Root::Operand(yield_op, slot), &ctx);
        if !plan.profitable() {
            log::debug!("loops: back-edge {back} of {arg} adds {} conversions for {}", plan.added, plan.removed);
            return Err(fail("the back-edge needs a conversion"));
        }
        plan.dying
    };
    if readers.iter().any(|op| !dying.contains(op)) {
        return Err(fail("a reader needs the old layout"));
    }
    Ok(())
}

/// Carry `arg` in the layout its in-loop conversions produce.
///
/// The loop starts from the source of the conversion on entry. The interior
/// conversions are removed, the back-edge is folded or rematerialized, and
/// users of the loop result see it through a single conversion placed after
/// the loop. Readers of `arg` get one conversion back to the old layout at
/// the top of the body, which goes away when the back-edge is recomputed.
pub fn hoist_conversion_out_of_loop(
    graph: &mut Graph,
    rules: &RuleTable,
    config: &RematConfig,
    arg: Value,
) -> Result<HoistReport> {
    let fail = |reason: &str| Error::LoopInvariant { value: arg, reason: reason.to_string() };
    let mut cvts = Vec::new();
    can_move_out_of_loop(graph, rules, config, arg, &mut cvts)?;
    let (Some(&first), Some((for_op, slot))) = (cvts.first(), graph.iter_arg_owner(arg)) else {
        return Err(fail("no conversion to hoist"));
    };
    let yield_op = graph.loop_yield(for_op).ok_or_else(|| fail("the loop has no yield"))?;
    let init = graph.loop_inits(for_op)[slot];
    let Some((entry_cvt, source)) = conversion_source(graph, init) else {
        return Err(fail("the initial value is not converted"));
    };
    let target = conversion_target(graph, first)?;
    let old_ty = graph.value_type(arg).clone();
    let new_ty = old_ty.with_encoding(target.clone());
    let old_enc = old_ty.encoding().cloned().unwrap_or_else(|| target.clone());
    let body = graph.loop_body(for_op);
    let mut report = HoistReport::default();

    let readers = graph.users(arg).into_iter()
        .filter(|&op| op != yield_op && !graph.kind(op).is_convert())
        .collect::<Vec<_>>();

    // entry
    graph.set_operand(for_op, 3 + slot, source);
    graph.set_value_type(arg, new_ty.clone());
    let result = graph.results(for_op)[slot];
    graph.set_value_type(result, new_ty.clone());

    // interior conversions now produce what the loop carries
    for cvt in cvts {
        let converted = graph.result(cvt);
        graph.replace_all_uses(converted, arg);
        graph.erase_op(cvt)?;
        report.hoisted += 1;
    }

    // readers that still expect the old layout
    if !readers.is_empty() {
        let cvt = graph.create_op(OpKind::Convert { to: old_enc.clone() }, &[arg], None)?;
        graph.insert_op_at_start(body, cvt);
        graph.replace_uses_if(arg, graph.result(cvt), |op| readers.contains(&op));
        report.inserted += 1;
    }

    // back-edge
    let back = graph.operands(yield_op)[slot];
    if graph.value_type(back) != &new_ty {
        match conversion_source(graph, back).filter(|&(_, src)| graph.value_type(src) == &new_ty) {
            Some((cvt, src)) => {
                graph.set_operand(yield_op, slot, src);
                if !graph.has_uses(back) {
                    graph.erase_op(cvt)?;
                    report.erased += 1;
                }
            }
            None => {
                let cvt = graph.create_op(OpKind::Convert { to: target.clone() }, &[back], None)?;
                graph.insert_op_before(yield_op, cvt)?;
                graph.set_operand(yield_op, slot, graph.result(cvt));
                report.inserted += 1;
                match try_rematerialize(graph, rules, config, cvt) {
                    Ok(chain) => {
                        report.inserted = report.inserted - 1 + chain.inserted;
                        report.erased += chain.erased - 1;
                    }
                    Err(err) => log::warn!("loops: back-edge of {arg} keeps {cvt}: {err}"),
                }
            }
        }
    }

    // exit
    if graph.has_uses(result) {
        let cvt = graph.create_op(OpKind::Convert { to: old_enc }, &[result], None)?;
        graph.insert_op_after(for_op, cvt)?;
        graph.replace_uses_if(result, graph.result(cvt), |op| op != cvt);
        report.inserted += 1;
    }

    if graph.is_live(entry_cvt) && !graph.has_uses(init) {
        graph.erase_op(entry_cvt)?;
        report.erased += 1;
    }
    log::debug!("loops: {arg} of {for_op} now carried in {target}, {report:?}");
    Ok(report)
}

/// Try [`hoist_conversion_out_of_loop`] on every loop-carried value.
///
/// Returns the number of conversions removed from loop bodies.
pub fn hoist_all(graph: &mut Graph, rules: &RuleTable, config: &RematConfig) -> usize {
    let mut hoisted = 0;
    for for_op in graph.loops() {
        if !graph.is_live(for_op) { continue; }
        for slot in 0..graph.iter_args(for_op).len() {
            let arg = graph.iter_args(for_op)[slot];
            match hoist_conversion_out_of_loop(graph, rules, config, arg) {
                Ok(report) => hoisted += report.hoisted,
                Err(err) => log::trace!("loops: {arg} stays: {err}"),
            }
        }
    }
    hoisted
}

fn residual(graph: &Graph, for_op: Op, slot: usize, incoming: Value) -> Error {
    Error::ResidualTypeMismatch {
        op: for_op,
        index: slot,
        arg: graph.value_type(graph.iter_args(for_op)[slot]).clone(),
        incoming: graph.value_type(incoming).clone(),
    }
}

// a detached conversion of `value` into the layout of `want`, if one is needed
fn conversion_to(graph: &mut Graph, for_op: Op, slot: usize, value: Value, want: &Type) -> Result<Option<Op>> {
    if graph.value_type(value) == want { return Ok(None); }
    let encoding = match want.encoding() {
        Some(enc) if graph.value_type(value).is_convertible_to(want) => enc.clone(),
        _ => return Err(residual(graph, for_op, slot, value)),
    };
    graph.create_op(OpKind::Convert { to: encoding }, &[value], None).map(Some)
}

// carry slot `slot` in the type of its initial value; readers inside and
// users after the loop keep the type they had through a conversion
fn carry_initial_type(graph: &mut Graph, for_op: Op, yield_op: Op, slot: usize) -> Result<usize> {
    let arg = graph.iter_args(for_op)[slot];
    let init = graph.loop_inits(for_op)[slot];
    let result = graph.results(for_op)[slot];
    let want = graph.value_type(init).clone();
    let mut fixed = 0;

    let old = graph.value_type(arg).clone();
    if old != want {
        if !want.is_convertible_to(&old) {
            return Err(residual(graph, for_op, slot, init));
        }
        let readers = graph.users(arg).into_iter().filter(|&op| op != yield_op).collect::<Vec<_>>();
        graph.set_value_type(arg, want.clone());
        if !readers.is_empty() {
            if let Some(cvt) = conversion_to(graph, for_op, slot, arg, &old)? {
                let body = graph.loop_body(for_op);
                graph.insert_op_at_start(body, cvt);
                graph.replace_uses_if(arg, graph.result(cvt), |op| readers.contains(&op));
                fixed += 1;
            }
        }
    }

    let old = graph.value_type(result).clone();
    if old != want {
        if !want.is_convertible_to(&old) {
            return Err(residual(graph, for_op, slot, result));
        }
        graph.set_value_type(result, want);
        if graph.has_uses(result) {
            if let Some(cvt) = conversion_to(graph, for_op, slot, result, &old)? {
                graph.insert_op_after(for_op, cvt)?;
                graph.replace_uses_if(result, graph.result(cvt), |op| op != cvt);
                fixed += 1;
            }
        }
    }
    Ok(fixed)
}

/// Make every loop's carried types agree with the values flowing into them.
///
/// A loop carries each slot in the type of its initial value, so its result
/// takes that type too; readers that relied on the old type read it through
/// a conversion. A back-edge in the wrong layout is converted right before
/// the `yield`; nothing is inserted between the initial value and the loop.
/// A value that differs in more than its layout cannot be fixed and is
/// reported as [`Error::ResidualTypeMismatch`]. Returns the number of
/// conversions inserted; a second run on the output inserts none.
pub fn fixup_loops(graph: &mut Graph) -> Result<usize> {
    let mut fixed = 0;
    for for_op in graph.loops() {
        let Some(yield_op) = graph.loop_yield(for_op) else { continue };
        for slot in 0..graph.iter_args(for_op).len() {
            fixed += carry_initial_type(graph, for_op, yield_op, slot)?;
            let want = graph.value_type(graph.iter_args(for_op)[slot]).clone();
            let back = graph.operands(yield_op)[slot];
            if let Some(cvt) = conversion_to(graph, for_op, slot, back, &want)? {
                graph.insert_op_before(yield_op, cvt)?;
                graph.set_operand(yield_op, slot, graph.result(cvt));
                fixed += 1;
            }
        }
    }
    if fixed > 0 {
        log::debug!("loops: {fixed} conversions restore loop types");
    }
    Ok(fixed)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::interp::{Interpreter, Val};

    fn a() -> Encoding { Encoding::blocked(&[1, 1], &[4, 8], &[4, 1], &[1, 0]) }
    fn b() -> Encoding { Encoding::blocked(&[1, 4], &[8, 4], &[4, 1], &[1, 0]) }
    fn c() -> Encoding { Encoding::blocked(&[2, 2], &[4, 8], &[4, 1], &[1, 0]) }
    fn ty(enc: Encoding) -> Type { Type::tensor(&[16, 16], DType::F32, enc) }

    fn setup() -> (RuleTable, RematConfig) {
        let config = RematConfig::default();
        (RuleTable::standard(&config), config)
    }

    fn bounds(g: &mut Graph) -> (Value, Value, Value) {
        let i32 = Type::Scalar(DType::I32);
        (g.arg(i32.clone()), g.arg(i32.clone()), g.arg(i32))
    }

    fn args(g: &Graph) -> Vec<Val> {
        let mut out = vec![Val::Scalar(0.0), Val::Scalar(4.0), Val::Scalar(1.0)];
        for _ in 3..g.args().len() {
            out.push(Val::tensor(&[16, 16], (0..256).map(|_| rand::random::<f64>()).collect()));
        }
        out
    }

    fn conversions_in(g: &Graph, region: Region) -> usize {
        g.region(region).ops.iter().filter(|&&op| g.kind(op).is_convert()).count()
    }

    // acc = cvt(x0 -> a); for { s = cvt(acc -> b) + inc; yield cvt(s -> a) }
    fn accumulator() -> (Graph, Op) {
        let mut g = Graph::new();
        let (lb, ub, st) = bounds(&mut g);
        let x0 = g.arg(ty(b()));
        let inc = g.arg(ty(b()));
        let init = g.convert(x0, a()).unwrap();
        let l = g.for_loop(lb, ub, st, &[init]).unwrap();
        let acc = g.iter_args(l)[0];
        let cb = g.convert(acc, b()).unwrap();
        let s = g.binary(BinOp::Add, cb, inc).unwrap();
        let back = g.convert(s, a()).unwrap();
        g.finish_loop(l, &[back]).unwrap();
        g.ret(&[g.results(l)[0]]).unwrap();
        (g, l)
    }

    #[test]
    fn accumulator_conversion_leaves_the_loop() {
        let (rules, config) = setup();
        let (mut g, l) = accumulator();
        let acc = g.iter_args(l)[0];
        let mut cvts = Vec::new();
        assert_eq!(can_move_out_of_loop(&g, &rules, &config, acc, &mut cvts), Ok(()));
        assert_eq!(cvts.len(), 1);

        let args = args(&g);
        let mut it = Interpreter::default();
        let expected = it.run(&g, &args).unwrap();
        let steps = it.steps;

        let report = hoist_conversion_out_of_loop(&mut g, &rules, &config, acc).unwrap();
        assert_eq!(report, HoistReport { hoisted: 1, inserted: 1, erased: 2 });
        assert_eq!(conversions_in(&g, g.loop_body(l)), 0);
        assert_eq!(g.value_type(acc), &ty(b()));
        assert_eq!(g.loop_inits(l), &[g.args()[3]]);
        let mut it = Interpreter::default();
        assert_eq!(it.run(&g, &args).unwrap(), expected);
        assert!(it.steps < steps);
        assert_eq!(fixup_loops(&mut g), Ok(0));
    }

    #[test]
    fn readers_are_recomputed_with_the_back_edge() {
        let (rules, config) = setup();
        let mut g = Graph::new();
        let (lb, ub, st) = bounds(&mut g);
        let x0 = g.arg(ty(b()));
        let inc = g.arg(ty(b()));
        let init = g.convert(x0, a()).unwrap();
        let l = g.for_loop(lb, ub, st, &[init]).unwrap();
        let acc = g.iter_args(l)[0];
        let cb = g.convert(acc, b()).unwrap();
        let n = g.unary(UnOp::Neg, acc).unwrap();
        let s = g.binary(BinOp::Max, cb, inc).unwrap();
        let t = g.convert(s, a()).unwrap();
        let u = g.binary(BinOp::Add, t, n).unwrap();
        g.finish_loop(l, &[u]).unwrap();
        g.ret(&[g.results(l)[0]]).unwrap();

        let args = args(&g);
        let expected = Interpreter::default().run(&g, &args).unwrap();
        let report = hoist_conversion_out_of_loop(&mut g, &rules, &config, acc).unwrap();
        // the conversion for `n` is folded away with the back-edge
        assert_eq!(report, HoistReport { hoisted: 1, inserted: 2, erased: 5 });
        assert_eq!(conversions_in(&g, g.loop_body(l)), 0);
        // only the exit conversion remains
        assert_eq!(conversions_in(&g, g.body()), 1);
        assert_eq!(Interpreter::default().run(&g, &args).unwrap(), expected);
        assert_eq!(fixup_loops(&mut g), Ok(0));
    }

    #[test]
    fn back_edge_needing_a_conversion_stays() {
        let (rules, config) = setup();
        let mut g = Graph::new();
        let (lb, ub, st) = bounds(&mut g);
        let x0 = g.arg(ty(b()));
        let inc = g.arg(ty(b()));
        let t0 = g.arg(ty(a()));
        let p = g.arg(ty(c()));
        let init = g.convert(x0, a()).unwrap();
        let l = g.for_loop(lb, ub, st, &[init, t0, t0]).unwrap();
        let acc = g.iter_args(l)[0];
        let cb = g.convert(acc, b()).unwrap();
        let s = g.binary(BinOp::Add, cb, inc).unwrap();
        let t = g.convert(s, a()).unwrap();
        let pa = g.convert(p, a()).unwrap();
        let u = g.binary(BinOp::Add, t, pa).unwrap();
        // `t` and `pa` are carried as well, so their conversions stay
        g.finish_loop(l, &[u, t, pa]).unwrap();
        g.ret(&[g.results(l)[0]]).unwrap();
        let before = g.fingerprint();

        let mut cvts = Vec::new();
        let res = can_move_out_of_loop(&g, &rules, &config, acc, &mut cvts);
        assert!(matches!(&res, Err(Error::LoopInvariant { value, reason }) if *value == acc && reason == "the back-edge needs a conversion"), "{res:?}");
        assert!(hoist_conversion_out_of_loop(&mut g, &rules, &config, acc).is_err());
        assert_eq!(hoist_all(&mut g, &rules, &config), 0);
        assert_eq!(before, g.fingerprint());
    }

    #[test]
    fn rejected_candidates() {
        let (rules, config) = setup();
        let mut g = Graph::new();
        let (lb, ub, st) = bounds(&mut g);
        let x0 = g.arg(ty(a()));
        let xb = g.arg(ty(b()));
        let xa = g.convert(xb, a()).unwrap();
        let l = g.for_loop(lb, ub, st, &[x0, x0, x0, xa, xa]).unwrap();
        let acc = g.iter_args(l);
        let (acc0, acc1, acc2, acc3, acc4) = (acc[0], acc[1], acc[2], acc[3], acc[4]);
        // two targets for one value
        g.convert(acc0, b()).unwrap();
        g.convert(acc0, c()).unwrap();
        // entered without a conversion
        g.convert(acc1, b()).unwrap();
        // never converted
        let e = g.unary(UnOp::Exp, acc2).unwrap();
        // read in the old layout by a reader the back-edge does not recompute
        g.convert(acc3, b()).unwrap();
        let m = g.unary(UnOp::Abs, acc3).unwrap();
        // flows into another slot
        g.convert(acc4, b()).unwrap();
        g.finish_loop(l, &[acc0, acc4, e, acc3, acc4]).unwrap();
        g.ret(&[m]).unwrap();
        let before = g.fingerprint();

        let mut cvts = Vec::new();
        for value in [g.induction_var(l), x0, acc0, acc1, acc3, acc4] {
            cvts.clear();
            let res = can_move_out_of_loop(&g, &rules, &config, value, &mut cvts);
            assert!(matches!(res, Err(Error::LoopInvariant { value: v, .. }) if v == value), "{value}");
        }
        cvts.clear();
        assert_eq!(can_move_out_of_loop(&g, &rules, &config, acc2, &mut cvts), Ok(()));
        assert!(cvts.is_empty());
        assert!(hoist_conversion_out_of_loop(&mut g, &rules, &config, acc2).is_err());
        assert_eq!(hoist_all(&mut g, &rules, &config), 0);
        assert_eq!(before, g.fingerprint());
    }

    #[test]
    fn fixup_carries_the_initial_type() {
        let mut g = Graph::new();
        let (lb, ub, st) = bounds(&mut g);
        let x = g.arg(ty(a()));
        let y = g.arg(ty(b()));
        let l = g.for_loop(lb, ub, st, &[x, y]).unwrap();
        let (acc0, acc1) = (g.iter_args(l)[0], g.iter_args(l)[1]);
        let n = g.unary(UnOp::Neg, acc0).unwrap();
        let c1 = g.convert(acc1, a()).unwrap();
        let m = g.unary(UnOp::Abs, c1).unwrap();
        g.finish_loop(l, &[n, m]).unwrap();
        let (r0, r1) = (g.results(l)[0], g.results(l)[1]);
        g.ret(&[r0, r1]).unwrap();

        let args = args(&g);
        let expected = Interpreter::default().run(&g, &args).unwrap();
        // slot 0 now disagrees with its initial value
        for v in [acc0, n, r0] {
            g.set_value_type(v, ty(b()));
        }
        let init_before = g.loop_inits(l).to_vec();
        // slot 0: readers, result and back-edge; slot 1: back-edge
        assert_eq!(fixup_loops(&mut g), Ok(4));
        assert_eq!(g.loop_inits(l), init_before.as_slice());
        assert_eq!(conversions_in(&g, g.loop_body(l)), 4);
        assert_eq!(conversions_in(&g, g.body()), 1);
        let yield_op = g.loop_yield(l).unwrap();
        for slot in 0..2 {
            let carried = g.value_type(g.iter_args(l)[slot]);
            assert_eq!(carried, g.value_type(g.loop_inits(l)[slot]));
            assert_eq!(carried, g.value_type(g.operands(yield_op)[slot]));
            assert_eq!(carried, g.value_type(g.results(l)[slot]));
        }
        assert_eq!(g.value_type(acc0), &ty(a()));
        assert_eq!(Interpreter::default().run(&g, &args).unwrap(), expected);

        let fixed = g.fingerprint();
        assert_eq!(fixup_loops(&mut g), Ok(0));
        assert_eq!(fixed, g.fingerprint());
    }

    #[test]
    fn fixup_refuses_shape_changes() {
        let mut g = Graph::new();
        let (lb, ub, st) = bounds(&mut g);
        let x = g.arg(ty(a()));
        let l = g.for_loop(lb, ub, st, &[x]).unwrap();
        let acc = g.iter_args(l)[0];
        g.finish_loop(l, &[acc]).unwrap();
        g.ret(&[]).unwrap();
        g.set_value_type(acc, Type::tensor(&[8, 32], DType::F32, a()));
        let err = fixup_loops(&mut g).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err, Error::ResidualTypeMismatch {
            op: l,
            index: 0,
            arg: Type::tensor(&[8, 32], DType::F32, a()),
            incoming: ty(a()),
        });
    }
}
