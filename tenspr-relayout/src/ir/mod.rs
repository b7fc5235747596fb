//! Arena-backed operation graph.
//!
//! Operations, values and regions are `u32` entity references into tables
//! owned by [`Graph`]. Loop back-edges are ordinary operand edges of the
//! `yield` terminating a loop body, so the graph holds no ownership cycles.
//!
//! A region is a single ordered block. The graph's body region is the
//! function body and its arguments are the function arguments. A `for`
//! operation owns one region whose arguments are the induction variable
//! followed by the loop-carried values; the body ends with a `yield` whose
//! operands flow back into those arguments on every iteration.

mod display;
mod infer;
mod kind;
mod types;

pub use infer::*;
pub use kind::*;
pub use types::*;

use crate::error::{Error, Result};
use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};
use smallvec::{smallvec, SmallVec};

/// An opaque reference to an operation.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Op(u32);
entity_impl!(Op, "op");

/// An opaque reference to an SSA value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// An opaque reference to a region (a single block with arguments).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Region(u32);
entity_impl!(Region, "region");

/// Where a value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    // n-th result of an operation
    Result(Op, usize),
    // n-th argument of a region
    Arg(Region, usize),
}

#[derive(Debug, Clone)]
pub struct OpData {
    pub kind: OpKind,
    pub operands: SmallVec<[Value; 3]>,
    pub results: SmallVec<[Value; 1]>,
    pub regions: SmallVec<[Region; 1]>,
    // None until inserted, and again once erased
    pub parent: Option<Region>,
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub ty: Type,
    pub def: ValueDef,
}

#[derive(Debug, Clone, Default)]
pub struct RegionData {
    pub args: SmallVec<[Value; 4]>,
    pub ops: Vec<Op>,
    pub parent_op: Option<Op>,
}

/// A function body: the unit rewritten by one invocation of the passes.
#[derive(Debug, Clone)]
pub struct Graph {
    ops: PrimaryMap<Op, OpData>,
    values: PrimaryMap<Value, ValueData>,
    regions: PrimaryMap<Region, RegionData>,
    // consumers of each value, placed or pending; erased ops are dropped
    uses: SecondaryMap<Value, SmallVec<[Op; 2]>>,
    body: Region,
    // region the builder appends to
    cursor: Region,
}

impl Default for Graph {
    fn default() -> Self { Self::new() }
}

impl Graph {
    pub fn new() -> Self {
        let mut regions = PrimaryMap::new();
        let body = regions.push(RegionData::default());
        Graph { ops: PrimaryMap::new(), values: PrimaryMap::new(), regions, uses: SecondaryMap::new(), body, cursor: body }
    }

    // ---------------------------------------------------------------- queries

    pub fn body(&self) -> Region { self.body }
    pub fn op(&self, op: Op) -> &OpData { &self.ops[op] }
    pub fn kind(&self, op: Op) -> &OpKind { &self.ops[op].kind }
    pub fn operands(&self, op: Op) -> &[Value] { &self.ops[op].operands }
    pub fn results(&self, op: Op) -> &[Value] { &self.ops[op].results }
    pub fn region(&self, region: Region) -> &RegionData { &self.regions[region] }
    pub fn value_type(&self, value: Value) -> &Type { &self.values[value].ty }
    pub fn value_def(&self, value: Value) -> ValueDef { self.values[value].def }
    pub fn is_live(&self, op: Op) -> bool { self.ops[op].parent.is_some() }
    pub fn parent_region(&self, op: Op) -> Option<Region> { self.ops[op].parent }

    /// First result of `op`; every value-producing kind except `for` has exactly one.
    pub fn result(&self, op: Op) -> Value { self.ops[op].results[0] }

    pub fn defining_op(&self, value: Value) -> Option<Op> {
        match self.values[value].def {
            ValueDef::Result(op, _) => Some(op),
            ValueDef::Arg(..) => None,
        }
    }

    /// Function arguments
    pub fn args(&self) -> &[Value] { &self.regions[self.body].args }

    /// Live operations in program order: each op precedes the ops nested in its regions,
    /// which precede the op's successors.
    pub fn walk_ops(&self) -> Vec<Op> {
        let mut out = Vec::with_capacity(self.ops.len());
        self.walk_region(self.body, &mut out);
        out
    }

    fn walk_region(&self, region: Region, out: &mut Vec<Op>) {
        for &op in self.regions[region].ops.iter() {
            out.push(op);
            for &nested in self.ops[op].regions.iter() {
                self.walk_region(nested, out);
            }
        }
    }

    /// Position of every live op in [`Graph::walk_ops`] order.
    pub fn program_order(&self) -> SecondaryMap<Op, u32> {
        let mut order = SecondaryMap::with_default(u32::MAX);
        for (i, op) in self.walk_ops().into_iter().enumerate() {
            order[op] = i as u32;
        }
        order
    }

    /// Live operations that consume `value`, without duplicates, in the order they started to.
    pub fn users(&self, value: Value) -> Vec<Op> {
        self.uses[value].iter().copied().filter(|&op| self.is_live(op)).collect()
    }

    pub fn has_uses(&self, value: Value) -> bool {
        self.uses[value].iter().any(|&op| self.is_live(op))
    }

    /// Live `for` operations, outer loops before inner ones.
    pub fn loops(&self) -> Vec<Op> {
        self.walk_ops().into_iter().filter(|&op| matches!(self.ops[op].kind, OpKind::For)).collect()
    }

    // ------------------------------------------------------------------ loops

    pub fn loop_body(&self, for_op: Op) -> Region { self.ops[for_op].regions[0] }
    pub fn loop_inits(&self, for_op: Op) -> &[Value] { &self.ops[for_op].operands[3..] }
    pub fn iter_args(&self, for_op: Op) -> &[Value] { &self.regions[self.loop_body(for_op)].args[1..] }
    pub fn induction_var(&self, for_op: Op) -> Value { self.regions[self.loop_body(for_op)].args[0] }

    /// The terminator of the loop body, if the body has been finished.
    pub fn loop_yield(&self, for_op: Op) -> Option<Op> {
        let last = *self.regions[self.loop_body(for_op)].ops.last()?;
        matches!(self.ops[last].kind, OpKind::Yield).then_some(last)
    }

    /// The loop and slot of a loop-carried block argument.
    pub fn iter_arg_owner(&self, value: Value) -> Option<(Op, usize)> {
        let ValueDef::Arg(region, idx) = self.values[value].def else { return None };
        let for_op = self.regions[region].parent_op?;
        (matches!(self.ops[for_op].kind, OpKind::For) && idx > 0).then(|| (for_op, idx - 1))
    }

    // --------------------------------------------------------------- builder

    /// Add a function argument.
    pub fn arg(&mut self, ty: Type) -> Value {
        let idx = self.regions[self.body].args.len();
        let v = self.values.push(ValueData { ty, def: ValueDef::Arg(self.body, idx) });
        self.regions[self.body].args.push(v);
        v
    }

    /// Create an operation without placing it in any region.
    pub fn create_op(&mut self, kind: OpKind, operands: &[Value], declared: Option<&Type>) -> Result<Op> {
        let types = operands.iter().map(|&v| self.values[v].ty.clone()).collect::<SmallVec<[Type; 3]>>();
        let result_types = infer_result_types(&kind, &types, declared)?;
        let op = self.ops.push(OpData {
            kind,
            operands: operands.into(),
            results: smallvec![],
            regions: smallvec![],
            parent: None,
        });
        for (i, ty) in result_types.into_iter().enumerate() {
            let v = self.values.push(ValueData { ty, def: ValueDef::Result(op, i) });
            self.ops[op].results.push(v);
        }
        for &v in operands {
            self.add_use(v, op);
        }
        Ok(op)
    }

    // create and append at the builder cursor
    fn push(&mut self, kind: OpKind, operands: &[Value], declared: Option<&Type>) -> Result<Op> {
        let op = self.create_op(kind, operands, declared)?;
        let region = self.cursor;
        self.ops[op].parent = Some(region);
        self.regions[region].ops.push(op);
        Ok(op)
    }

    fn push_value(&mut self, kind: OpKind, operands: &[Value], declared: Option<&Type>) -> Result<Value> {
        let op = self.push(kind, operands, declared)?;
        Ok(self.result(op))
    }

    pub fn constant(&mut self, value: f64, ty: Type) -> Result<Value> {
        self.push_value(OpKind::Constant { value }, &[], Some(&ty))
    }
    pub fn make_range(&mut self, start: i64, end: i64, encoding: Encoding) -> Result<Value> {
        let len = (end - start).max(0) as usize;
        self.push_value(OpKind::MakeRange { start, end }, &[], Some(&Type::tensor(&[len], DType::I32, encoding)))
    }
    pub fn splat(&mut self, x: Value, shape: &[usize], encoding: Encoding) -> Result<Value> {
        let ty = Type::tensor(shape, self.value_type(x).dtype(), encoding);
        self.push_value(OpKind::Splat, &[x], Some(&ty))
    }
    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Result<Value> {
        self.push_value(OpKind::Binary(op), &[lhs, rhs], None)
    }
    pub fn unary(&mut self, op: UnOp, x: Value) -> Result<Value> {
        self.push_value(OpKind::Unary(op), &[x], None)
    }
    pub fn cast(&mut self, x: Value, dtype: DType) -> Result<Value> {
        self.push_value(OpKind::Cast(dtype), &[x], None)
    }
    pub fn add_ptr(&mut self, ptr: Value, offset: Value) -> Result<Value> {
        self.push_value(OpKind::AddPtr, &[ptr, offset], None)
    }
    pub fn expand_dims(&mut self, x: Value, axis: usize) -> Result<Value> {
        self.push_value(OpKind::ExpandDims { axis }, &[x], None)
    }
    pub fn broadcast(&mut self, x: Value, shape: &[usize]) -> Result<Value> {
        let ty = self.shaped_like(x, shape)?;
        self.push_value(OpKind::Broadcast, &[x], Some(&ty))
    }
    pub fn reduce(&mut self, x: Value, axis: usize, op: RedOp) -> Result<Value> {
        self.push_value(OpKind::Reduce { axis, op }, &[x], None)
    }
    pub fn view(&mut self, x: Value, shape: &[usize]) -> Result<Value> {
        let ty = self.shaped_like(x, shape)?;
        self.push_value(OpKind::View, &[x], Some(&ty))
    }
    pub fn cat(&mut self, a: Value, b: Value) -> Result<Value> {
        self.push_value(OpKind::Cat, &[a, b], None)
    }
    pub fn load(&mut self, ptr: Value) -> Result<Value> {
        self.push_value(OpKind::Load, &[ptr], None)
    }
    pub fn store(&mut self, ptr: Value, value: Value) -> Result<Op> {
        self.push(OpKind::Store, &[ptr, value], None)
    }
    pub fn dot(&mut self, a: Value, b: Value, acc: Value) -> Result<Value> {
        self.push_value(OpKind::Dot, &[a, b, acc], None)
    }
    pub fn convert(&mut self, x: Value, to: Encoding) -> Result<Value> {
        self.push_value(OpKind::Convert { to }, &[x], None)
    }
    pub fn ret(&mut self, values: &[Value]) -> Result<Op> {
        self.push(OpKind::Return, values, None)
    }

    fn shaped_like(&self, x: Value, shape: &[usize]) -> Result<Type> {
        let ty = self.value_type(x);
        match ty.encoding() {
            Some(enc) => Ok(Type::tensor(shape, ty.dtype(), enc.clone())),
            None => Err(Error::TypeInference { kind: "broadcast", reason: format!("{x} is not a tensor") }),
        }
    }

    /// Open a `for` loop; subsequent builder calls append to its body until
    /// [`Graph::finish_loop`]. The body's arguments are the induction variable
    /// followed by one argument per initial value, typed like it.
    pub fn for_loop(&mut self, lower: Value, upper: Value, step: Value, inits: &[Value]) -> Result<Op> {
        let mut operands: SmallVec<[Value; 6]> = smallvec![lower, upper, step];
        operands.extend_from_slice(inits);
        let op = self.push(OpKind::For, &operands, None)?;
        let body = self.regions.push(RegionData { parent_op: Some(op), ..Default::default() });
        self.ops[op].regions.push(body);
        let iv_ty = self.values[lower].ty.clone();
        let arg_tys = std::iter::once(iv_ty).chain(inits.iter().map(|&v| self.values[v].ty.clone())).collect::<Vec<_>>();
        for (idx, ty) in arg_tys.into_iter().enumerate() {
            let v = self.values.push(ValueData { ty, def: ValueDef::Arg(body, idx) });
            self.regions[body].args.push(v);
        }
        self.cursor = body;
        Ok(op)
    }

    /// Terminate the body of `for_op` with a yield of `values` and move the builder after the loop.
    pub fn finish_loop(&mut self, for_op: Op, values: &[Value]) -> Result<Op> {
        self.cursor = self.loop_body(for_op);
        let y = self.push(OpKind::Yield, values, None)?;
        self.cursor = self.ops[for_op].parent.unwrap_or(self.body);
        Ok(y)
    }

    // -------------------------------------------------------------- rewriter

    fn insert_at(&mut self, region: Region, index: usize, op: Op) {
        debug_assert!(self.ops[op].parent.is_none(), "{op} is already placed");
        self.ops[op].parent = Some(region);
        self.regions[region].ops.insert(index, op);
    }

    fn position(&self, op: Op) -> Option<(Region, usize)> {
        let region = self.ops[op].parent?;
        let idx = self.regions[region].ops.iter().position(|&o| o == op)?;
        Some((region, idx))
    }

    /// Place a detached `op` immediately after `anchor`, which must be placed itself.
    pub fn insert_op_after(&mut self, anchor: Op, op: Op) -> Result<()> {
        let (region, idx) = self.position(anchor).ok_or(Error::NotPlaced { op: anchor })?;
        self.insert_at(region, idx + 1, op);
        Ok(())
    }

    /// Place a detached `op` immediately before `anchor`, which must be placed itself.
    pub fn insert_op_before(&mut self, anchor: Op, op: Op) -> Result<()> {
        let (region, idx) = self.position(anchor).ok_or(Error::NotPlaced { op: anchor })?;
        self.insert_at(region, idx, op);
        Ok(())
    }

    /// Place a detached `op` first in `region`.
    pub fn insert_op_at_start(&mut self, region: Region, op: Op) {
        self.insert_at(region, 0, op);
    }

    fn add_use(&mut self, value: Value, op: Op) {
        if !self.uses[value].contains(&op) {
            self.uses[value].push(op);
        }
    }

    // forget `op` as a consumer of `value` once no operand slot holds it
    fn drop_use(&mut self, value: Value, op: Op) {
        if !self.ops[op].operands.contains(&value) {
            self.uses[value].retain(|user| *user != op);
        }
    }

    pub fn set_operand(&mut self, op: Op, idx: usize, value: Value) {
        let old = std::mem::replace(&mut self.ops[op].operands[idx], value);
        self.drop_use(old, op);
        self.add_use(value, op);
    }

    pub fn set_value_type(&mut self, value: Value, ty: Type) {
        self.values[value].ty = ty;
    }

    /// Make every live consumer of `from` consume `to` instead. Returns the number of rewired operands.
    pub fn replace_all_uses(&mut self, from: Value, to: Value) -> usize {
        self.replace_uses_if(from, to, |_| true)
    }

    /// Like [`Graph::replace_all_uses`], restricted to consumers accepted by `pred`.
    pub fn replace_uses_if(&mut self, from: Value, to: Value, pred: impl Fn(Op) -> bool) -> usize {
        let mut n = 0;
        for op in self.users(from) {
            if !pred(op) { continue; }
            for operand in self.ops[op].operands.iter_mut() {
                if *operand == from { *operand = to; n += 1; }
            }
            self.drop_use(from, op);
            self.add_use(to, op);
        }
        n
    }

    /// Remove `op` (and everything nested in it) from the graph.
    pub fn erase_op(&mut self, op: Op) -> Result<()> {
        if self.ops[op].results.iter().any(|&v| self.has_uses(v)) {
            return Err(Error::OpInUse { op });
        }
        if let Some((region, idx)) = self.position(op) {
            self.regions[region].ops.remove(idx);
        }
        self.detach(op);
        Ok(())
    }

    fn detach(&mut self, op: Op) {
        self.ops[op].parent = None;
        for v in self.ops[op].operands.clone() {
            self.uses[v].retain(|user| *user != op);
        }
        let nested = self.ops[op].regions.clone();
        for region in nested {
            for inner in std::mem::take(&mut self.regions[region].ops) {
                self.detach(inner);
            }
        }
    }
}
