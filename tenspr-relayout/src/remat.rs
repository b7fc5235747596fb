//! Backward rematerialization planning.
//!
//! Starting from a point that needs a new layout, walk operand edges
//! backwards and decide which producers can be recomputed directly in the
//! layout their consumers need. Planning only reads the graph; the plan is
//! applied by [`crate::chain`].

use crate::config::RematConfig;
use crate::error::{Error, Result};
use crate::ir::*;
use crate::rules::RuleTable;
use indexmap::{IndexMap, IndexSet};

/// The plan of one rematerialization attempt.
///
/// All three collections keep insertion order, which is the order the
/// backward walk discovered them in.
#[derive(Debug, Clone, Default)]
pub struct RematContext {
    // operations to clone
    pub processed: IndexSet<Op>,
    // distinct encodings required from cloned operations
    pub layout: IndexSet<Encoding>,
    // every value the new chain reads, with the encoding it must be read in
    pub to_convert: IndexMap<Value, Encoding>,
}

impl RematContext {
    pub fn new() -> Self { Self::default() }

    /// Declare `value` available in `encoding` before the walk starts.
    pub fn assume(&mut self, value: Value, encoding: Encoding) {
        self.to_convert.insert(value, encoding);
    }
}

struct Walk<'a> {
    graph: &'a Graph,
    rules: &'a RuleTable,
    config: &'a RematConfig,
    queue: Vec<(Value, Encoding)>,
}

impl<'a> Walk<'a> {
    // plan to recompute `op` so that its result `value` comes out in `encoding`
    fn expand(&mut self, ctx: &mut RematContext, op: Op, value: Value, encoding: Encoding) -> Result<()> {
        let kind = self.graph.kind(op);
        if self.rules.expensive_to_remat(self.graph, op, &encoding) {
            log::debug!("remat: {op} ({}) is too expensive in {encoding}", kind.name());
            return Err(Error::CostRejected { op, kind: kind.name(), target: encoding });
        }
        let operand_encoding = self.rules.invert_encoding(self.graph, &encoding, op)?;
        ctx.processed.insert(op);
        ctx.to_convert.insert(value, encoding.clone());
        ctx.layout.insert(encoding);
        if ctx.layout.len() > self.config.max_layouts {
            return Err(Error::TooManyLayouts { count: ctx.layout.len(), limit: self.config.max_layouts });
        }
        if ctx.processed.len() > self.config.max_remat_ops {
            return Err(Error::OverBudget { cost: ctx.processed.len(), limit: self.config.max_remat_ops });
        }
        for &operand in self.graph.operands(op) {
            self.queue.push((operand, operand_encoding.clone()));
        }
        Ok(())
    }

    // has `value` already been planned in `encoding`
    fn planned(&self, ctx: &RematContext, value: Value, encoding: &Encoding) -> Result<bool> {
        match ctx.to_convert.get(&value) {
            Some(prev) if prev == encoding => Ok(true),
            Some(prev) => {
                log::debug!("remat: {value} needed in both {prev} and {encoding}");
                Err(Error::ConflictingRequirement { value, first: prev.clone(), second: encoding.clone() })
            }
            None => Ok(false),
        }
    }

    fn visit(&mut self, ctx: &mut RematContext, value: Value, encoding: Encoding) -> Result<()> {
        // scalars have no layout
        let Some(current) = self.graph.value_type(value).encoding() else { return Ok(()) };
        // shared sub-expression
        if self.planned(ctx, value, &encoding)? { return Ok(()); }
        // already in place, the chain reads it as is
        if *current == encoding {
            ctx.to_convert.insert(value, encoding);
            return Ok(());
        }
        let Some(op) = self.graph.defining_op(value) else {
            log::debug!("remat: reached region argument {value}");
            return Err(Error::CrossRegion { value });
        };
        // an existing conversion folds into a conversion from its source
        if self.graph.kind(op).is_convert() {
            ctx.to_convert.insert(value, encoding);
            return Ok(());
        }
        self.expand(ctx, op, value, encoding)
    }
}

/// Plan the recomputation of the backward cone of `seed` in `target`.
///
/// With `skip_init` every operand of `seed` is required in `target` and
/// `seed` itself stays out of the plan (the usual case, `seed` being the
/// conversion to eliminate). Without it, `seed` is planned to produce its
/// first result in `target`.
///
/// Returns the number of operations the plan clones. On failure `ctx` holds
/// a partial plan that must be discarded; the graph is never touched.
pub fn simulate_backward_rematerialization(
    graph: &Graph,
    rules: &RuleTable,
    config: &RematConfig,
    seed: Op,
    ctx: &mut RematContext,
    target: &Encoding,
    skip_init: bool,
) -> Result<usize> {
    let mut walk = Walk { graph, rules, config, queue: Vec::new() };
    if skip_init {
        for &operand in graph.operands(seed) {
            walk.queue.push((operand, target.clone()));
        }
    } else {
        let value = graph.result(seed);
        if !walk.planned(ctx, value, target)? {
            walk.expand(ctx, seed, value, target.clone())?;
        }
    }
    while let Some((value, encoding)) = walk.queue.pop() {
        log::trace!("remat: visit {value} for {encoding}");
        walk.visit(ctx, value, encoding)?;
    }
    log::trace!("remat: cone of {seed} clones {} ops over {} layouts", ctx.processed.len(), ctx.layout.len());
    Ok(ctx.processed.len())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    fn a() -> Encoding { Encoding::blocked(&[1, 1], &[4, 8], &[4, 1], &[1, 0]) }
    fn b() -> Encoding { Encoding::blocked(&[1, 4], &[8, 4], &[4, 1], &[1, 0]) }
    fn ty(shape: &[usize], enc: Encoding) -> Type { Type::tensor(shape, DType::F32, enc) }

    fn setup() -> (RuleTable, RematConfig) {
        let config = RematConfig::default();
        (RuleTable::standard(&config), config)
    }

    fn plan(g: &Graph, cvt: Op) -> (Result<usize>, RematContext) {
        let (rules, config) = setup();
        let OpKind::Convert { to } = g.kind(cvt).clone() else { panic!("not a conversion") };
        let mut ctx = RematContext::new();
        let res = simulate_backward_rematerialization(g, &rules, &config, cvt, &mut ctx, &to, true);
        (res, ctx)
    }

    // values reachable backwards from `seed` without crossing an op that is expensive to duplicate
    fn cone(g: &Graph, seed: Op) -> HashSet<Value> {
        let (rules, _) = setup();
        let mut seen = HashSet::new();
        let mut stack = g.operands(seed).to_vec();
        while let Some(v) = stack.pop() {
            if !seen.insert(v) { continue; }
            if let Some(op) = g.defining_op(v) {
                let enc = g.value_type(v).encoding().cloned().unwrap_or_else(a);
                if !g.kind(op).is_convert() && !rules.expensive_to_remat(g, op, &enc) {
                    stack.extend_from_slice(g.operands(op));
                }
            }
        }
        seen
    }

    #[test]
    fn elementwise_chain_is_counted_once_per_op() {
        let mut g = Graph::new();
        let x = g.arg(ty(&[16, 16], b()));
        let xa = g.convert(x, a()).unwrap();
        let e = g.unary(UnOp::Exp, xa).unwrap();
        // `e` is shared by both operands of the add
        let s = g.binary(BinOp::Add, e, e).unwrap();
        let n = g.unary(UnOp::Neg, s).unwrap();
        let out = g.convert(n, b()).unwrap();
        let cvt = g.defining_op(out).unwrap();
        g.ret(&[out]).unwrap();

        let (res, ctx) = plan(&g, cvt);
        assert_eq!(res, Ok(3));
        let ops = ctx.processed.iter().map(|&op| g.kind(op).name()).collect::<Vec<_>>();
        assert_eq!(ops, vec!["neg", "add", "exp"]);
        assert!(!ctx.processed.contains(&cvt));
        assert_eq!(ctx.layout.iter().cloned().collect::<Vec<_>>(), vec![b()]);
        // the conversion feeding `exp` is a folded leaf
        assert_eq!(ctx.to_convert.get(&xa), Some(&b()));
        // every planned value lies in the cone
        let reach = cone(&g, cvt);
        assert!(ctx.to_convert.keys().all(|v| reach.contains(v)));
    }

    #[test]
    fn planning_leaves_graph_untouched() {
        let mut g = Graph::new();
        let x = g.arg(ty(&[16, 16], a()));
        let y = g.unary(UnOp::Exp, x).unwrap();
        let out = g.convert(y, b()).unwrap();
        g.ret(&[out]).unwrap();
        let before = g.fingerprint();
        let (res, _) = plan(&g, g.defining_op(out).unwrap());
        // `x` is a function argument in the wrong layout
        assert_eq!(res, Err(Error::CrossRegion { value: x }));
        assert_eq!(before, g.fingerprint());
    }

    #[test]
    fn conflicting_requirements_fail() {
        let (rules, config) = setup();
        let c = Encoding::blocked(&[2, 2], &[4, 8], &[4, 1], &[1, 0]);
        let mut g = Graph::new();
        let x = g.arg(ty(&[16, 16], a()));
        let y = g.unary(UnOp::Neg, x).unwrap();
        let out = g.convert(y, b()).unwrap();
        g.ret(&[out]).unwrap();
        let mut ctx = RematContext::new();
        ctx.assume(x, c.clone());
        let res = simulate_backward_rematerialization(&g, &rules, &config, g.defining_op(out).unwrap(), &mut ctx, &b(), true);
        assert_eq!(res, Err(Error::ConflictingRequirement { value: x, first: c, second: b() }));
    }

    #[test]
    fn sibling_consumers_with_different_layouts_conflict() {
        let mut g = Graph::new();
        let v0 = g.arg(Type::tensor(&[16], DType::F32, Encoding::slice(0, b())));
        let v = g.convert(v0, Encoding::slice(0, a())).unwrap();
        let e = g.unary(UnOp::Exp, v).unwrap();
        // row consumer
        let r = g.expand_dims(e, 0).unwrap();
        let r = g.broadcast(r, &[16, 16]).unwrap();
        // column consumer, behind its own conversion
        let ec = g.convert(e, Encoding::slice(1, a())).unwrap();
        let c = g.expand_dims(ec, 1).unwrap();
        let c = g.broadcast(c, &[16, 16]).unwrap();
        let s = g.binary(BinOp::Add, r, c).unwrap();
        g.ret(&[s]).unwrap();

        let (rules, config) = setup();
        let mut ctx = RematContext::new();
        // the row side wants `e` as slice(0, b)
        let r_op = g.defining_op(r).unwrap();
        assert_eq!(simulate_backward_rematerialization(&g, &rules, &config, r_op, &mut ctx, &b(), false), Ok(3));
        assert_eq!(ctx.to_convert.get(&e), Some(&Encoding::slice(0, b())));
        // the column side wants the same `e` as slice(1, b)
        let e_op = g.defining_op(e).unwrap();
        let err = simulate_backward_rematerialization(&g, &rules, &config, e_op, &mut ctx, &Encoding::slice(1, b()), false);
        assert_eq!(err, Err(Error::ConflictingRequirement {
            value: e,
            first: Encoding::slice(0, b()),
            second: Encoding::slice(1, b()),
        }));
    }

    #[test]
    fn expensive_load_stops_the_walk() {
        let mut g = Graph::new();
        let p = g.arg(Type::tensor(&[32, 32], DType::Ptr(Pointee::F32), a()));
        let x = g.load(p).unwrap();
        let out = g.convert(x, b()).unwrap();
        g.ret(&[out]).unwrap();
        let (res, ctx) = plan(&g, g.defining_op(out).unwrap());
        assert!(matches!(res, Err(Error::CostRejected { kind: "load", .. })));
        assert!(ctx.processed.is_empty());
    }

    #[test]
    fn small_load_is_duplicated() {
        let mut g = Graph::new();
        let p0 = g.arg(Type::tensor(&[4, 8], DType::Ptr(Pointee::F32), b()));
        let p = g.convert(p0, a()).unwrap();
        let x = g.load(p).unwrap();
        let out = g.convert(x, b()).unwrap();
        g.ret(&[out]).unwrap();
        let (res, ctx) = plan(&g, g.defining_op(out).unwrap());
        assert_eq!(res, Ok(1));
        assert_eq!(ctx.to_convert.get(&p), Some(&b()));
    }

    #[test]
    fn reduce_cone() {
        let config = RematConfig { remat_reductions: true, ..Default::default() };
        let rules = RuleTable::standard(&config);
        let mut g = Graph::new();
        let x = g.arg(ty(&[16, 16], b()));
        let xa = g.convert(x, a()).unwrap();
        let r = g.reduce(xa, 1, RedOp::Sum).unwrap();
        let out = g.convert(r, Encoding::slice(1, b())).unwrap();
        g.ret(&[out]).unwrap();
        let mut ctx = RematContext::new();
        let cvt = g.defining_op(out).unwrap();
        let res = simulate_backward_rematerialization(&g, &rules, &config, cvt, &mut ctx, &Encoding::slice(1, b()), true);
        assert_eq!(res, Ok(1));
        assert_eq!(ctx.to_convert.get(&xa), Some(&b()));

        // by default reductions are not duplicated
        let (res, _) = plan(&g, cvt);
        assert!(matches!(res, Err(Error::CostRejected { kind: "reduce", .. })));
    }

    #[test]
    fn limits() {
        let mut g = Graph::new();
        let x = g.arg(ty(&[16, 16], b()));
        let mut v = g.convert(x, a()).unwrap();
        for _ in 0..20 {
            v = g.unary(UnOp::Neg, v).unwrap();
        }
        let out = g.convert(v, b()).unwrap();
        g.ret(&[out]).unwrap();
        let (res, _) = plan(&g, g.defining_op(out).unwrap());
        assert_eq!(res, Err(Error::OverBudget { cost: 17, limit: 16 }));

        let config = RematConfig { max_layouts: 1, ..Default::default() };
        let rules = RuleTable::standard(&config);
        let mut g = Graph::new();
        let v = g.arg(Type::tensor(&[16], DType::F32, Encoding::slice(0, b())));
        let va = g.convert(v, Encoding::slice(0, a())).unwrap();
        let e = g.unary(UnOp::Exp, va).unwrap();
        let r = g.expand_dims(e, 0).unwrap();
        let out = g.convert(r, b()).unwrap();
        g.ret(&[out]).unwrap();
        let mut ctx = RematContext::new();
        let res = simulate_backward_rematerialization(&g, &rules, &config, g.defining_op(out).unwrap(), &mut ctx, &b(), true);
        assert_eq!(res, Err(Error::TooManyLayouts { count: 2, limit: 1 }));
    }

    #[test]
    fn assumed_values_are_accepted() {
        let (rules, config) = setup();
        let mut g = Graph::new();
        let x = g.arg(ty(&[16, 16], a()));
        let y = g.unary(UnOp::Neg, x).unwrap();
        let out = g.convert(y, b()).unwrap();
        g.ret(&[out]).unwrap();
        let mut ctx = RematContext::new();
        ctx.assume(x, b());
        let res = simulate_backward_rematerialization(&g, &rules, &config, g.defining_op(out).unwrap(), &mut ctx, &b(), true);
        assert_eq!(res, Ok(1));
    }
}
