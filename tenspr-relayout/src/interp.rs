//! Reference evaluator.
//!
//! Runs a [`Graph`] on concrete data. Encodings are ignored: a layout only
//! decides where elements live on the device, never what they are, so a
//! rewrite that changes nothing but encodings must leave every result of
//! this evaluator unchanged.
//!
//! Every element is an `f64`. Pointers are element offsets into one flat
//! memory buffer.

use crate::error::{Error, Result};
use crate::ir::*;
use std::collections::HashMap;

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Scalar(f64),
    // row-major
    Tensor { shape: Vec<usize>, data: Vec<f64> },
}

impl Val {
    pub fn tensor(shape: &[usize], data: Vec<f64>) -> Self {
        Val::Tensor { shape: shape.to_vec(), data }
    }

    pub fn as_scalar(&self) -> Result<f64> {
        match self {
            Val::Scalar(x) => Ok(*x),
            Val::Tensor { shape, .. } => Err(Error::Eval(format!("expected a scalar, found a tensor of shape {shape:?}"))),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Val::Scalar(_) => &[],
            Val::Tensor { shape, .. } => shape,
        }
    }

    pub fn data(&self) -> &[f64] {
        match self {
            Val::Scalar(x) => std::slice::from_ref(x),
            Val::Tensor { data, .. } => data,
        }
    }
}

// build a value of type `ty` from flat data
fn shaped(ty: &Type, data: Vec<f64>) -> Val {
    match ty {
        Type::Scalar(_) => Val::Scalar(data.first().copied().unwrap_or_default()),
        Type::Tensor(t) => Val::Tensor { shape: t.shape.to_vec(), data },
    }
}

fn numel(ty: &Type) -> usize {
    ty.as_tensor().map_or(1, TensorType::numel)
}

fn binary(op: BinOp, dtype: DType, a: f64, b: f64) -> f64 {
    match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div if dtype.is_int() => (a / b).trunc(),
        BinOp::Div => a / b,
        BinOp::Max => a.max(b),
        BinOp::Min => a.min(b),
        BinOp::CmpLt => (a < b) as u8 as f64,
    }
}

fn unary(op: UnOp, x: f64) -> f64 {
    match op {
        UnOp::Neg => -x,
        UnOp::Exp => x.exp(),
        UnOp::Sqrt => x.sqrt(),
        UnOp::Abs => x.abs(),
    }
}

fn cast(dtype: DType, x: f64) -> f64 {
    match dtype {
        DType::Bool => (x != 0.0) as u8 as f64,
        d if d.is_int() => x.trunc(),
        _ => x,
    }
}

fn zip(a: &Val, b: &Val, f: impl Fn(f64, f64) -> f64) -> Result<Vec<f64>> {
    if a.shape() != b.shape() {
        return Err(Error::Eval(format!("shape mismatch {:?} vs {:?}", a.shape(), b.shape())));
    }
    Ok(a.data().iter().zip(b.data()).map(|(&x, &y)| f(x, y)).collect())
}

fn broadcast(x: &Val, to: &[usize]) -> Result<Vec<f64>> {
    let from = x.shape();
    if from.len() != to.len() {
        return Err(Error::Eval(format!("cannot broadcast {from:?} to {to:?}")));
    }
    let n = to.iter().product::<usize>();
    let mut out = Vec::with_capacity(n);
    for flat in 0..n {
        // walk the output index from the innermost dimension outwards
        let (mut rest, mut src, mut stride) = (flat, 0, 1);
        for d in (0..to.len()).rev() {
            let i = rest % to[d];
            rest /= to[d];
            if from[d] != 1 { src += i * stride; }
            stride *= from[d];
        }
        out.push(x.data()[src]);
    }
    Ok(out)
}

fn reduce(x: &Val, axis: usize, op: RedOp) -> Result<Vec<f64>> {
    let shape = x.shape();
    if axis >= shape.len() {
        return Err(Error::Eval(format!("axis {axis} out of range for {shape:?}")));
    }
    let outer = shape[..axis].iter().product::<usize>();
    let inner = shape[axis + 1..].iter().product::<usize>();
    let n = shape[axis];
    let init = match op {
        RedOp::Sum => 0.0,
        RedOp::Max => f64::NEG_INFINITY,
        RedOp::Min => f64::INFINITY,
    };
    let mut out = vec![init; outer * inner];
    for o in 0..outer {
        for k in 0..n {
            for i in 0..inner {
                let acc = &mut out[o * inner + i];
                let v = x.data()[(o * n + k) * inner + i];
                *acc = match op {
                    RedOp::Sum => *acc + v,
                    RedOp::Max => acc.max(v),
                    RedOp::Min => acc.min(v),
                };
            }
        }
    }
    Ok(out)
}

fn dot(a: &Val, b: &Val, acc: &Val) -> Result<Vec<f64>> {
    let (&[m, k], &[k2, n]) = (a.shape(), b.shape()) else {
        return Err(Error::Eval(format!("dot of {:?} and {:?}", a.shape(), b.shape())));
    };
    if k != k2 || acc.shape() != [m, n].as_slice() {
        return Err(Error::Eval(format!("dot of {:?} and {:?} into {:?}", a.shape(), b.shape(), acc.shape())));
    }
    let mut out = acc.data().to_vec();
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] += (0..k).map(|l| a.data()[i * k + l] * b.data()[l * n + j]).sum::<f64>();
        }
    }
    Ok(out)
}

/// Executes graphs against a flat memory buffer.
#[derive(Debug, Clone, Default)]
pub struct Interpreter {
    pub memory: Vec<f64>,
    env: HashMap<Value, Val>,
    // executed operations, loop bodies counted once per iteration
    pub steps: usize,
}

impl Interpreter {
    pub fn new(memory: Vec<f64>) -> Self {
        Interpreter { memory, ..Default::default() }
    }

    /// Evaluate the function body on `args` and return the operands of its `return`.
    pub fn run(&mut self, graph: &Graph, args: &[Val]) -> Result<Vec<Val>> {
        if args.len() != graph.args().len() {
            return Err(Error::Eval(format!("expected {} arguments, got {}", graph.args().len(), args.len())));
        }
        self.env.clear();
        for (&param, arg) in graph.args().iter().zip(args) {
            self.env.insert(param, arg.clone());
        }
        Ok(self.exec(graph, graph.body())?.unwrap_or_default())
    }

    fn get(&self, value: Value) -> Result<Val> {
        self.env.get(&value).cloned().ok_or_else(|| Error::Eval(format!("{value} is read before it is defined")))
    }

    // run a region until its terminator, returning the terminator's operands
    fn exec(&mut self, graph: &Graph, region: Region) -> Result<Option<Vec<Val>>> {
        for &op in graph.region(region).ops.iter() {
            self.steps += 1;
            let args = graph.operands(op).iter().map(|&v| self.get(v)).collect::<Result<Vec<_>>>()?;
            match graph.kind(op) {
                kind if kind.is_terminator() => return Ok(Some(args)),
                OpKind::For => {
                    let out = self.run_loop(graph, op, &args)?;
                    for (&v, x) in graph.results(op).iter().zip(out) {
                        self.env.insert(v, x);
                    }
                }
                OpKind::Store => self.store(&args[0], &args[1])?,
                kind => {
                    let result = graph.result(op);
                    let x = self.eval(kind, &args, graph.value_type(result))?;
                    self.env.insert(result, x);
                }
            }
        }
        Ok(None)
    }

    fn run_loop(&mut self, graph: &Graph, op: Op, args: &[Val]) -> Result<Vec<Val>> {
        let (lower, upper, step) = (args[0].as_scalar()?, args[1].as_scalar()?, args[2].as_scalar()?);
        if step <= 0.0 {
            return Err(Error::Eval(format!("{op} steps by {step}")));
        }
        let body = graph.loop_body(op);
        let params = graph.region(body).args.clone();
        let mut carried = args[3..].to_vec();
        let mut iv = lower;
        while iv < upper {
            self.env.insert(params[0], Val::Scalar(iv));
            for (&param, x) in params[1..].iter().zip(carried.iter()) {
                self.env.insert(param, x.clone());
            }
            carried = self.exec(graph, body)?.ok_or_else(|| Error::Eval(format!("{op} has no yield")))?;
            iv += step;
        }
        Ok(carried)
    }

    fn address(&self, ptr: f64) -> Result<usize> {
        if ptr < 0.0 || ptr.fract() != 0.0 || ptr as usize >= self.memory.len() {
            return Err(Error::Eval(format!("address {ptr} is outside memory of {} elements", self.memory.len())));
        }
        Ok(ptr as usize)
    }

    fn store(&mut self, ptr: &Val, value: &Val) -> Result<()> {
        for (&p, &x) in ptr.data().iter().zip(value.data()) {
            let addr = self.address(p)?;
            self.memory[addr] = x;
        }
        Ok(())
    }

    fn eval(&self, kind: &OpKind, args: &[Val], ty: &Type) -> Result<Val> {
        let data = match kind {
            OpKind::Constant { value } => vec![*value; numel(ty)],
            OpKind::MakeRange { start, end } => (*start..*end).map(|i| i as f64).collect(),
            OpKind::Splat => vec![args[0].as_scalar()?; numel(ty)],
            OpKind::Binary(op) => zip(&args[0], &args[1], |a, b| binary(*op, ty.dtype(), a, b))?,
            OpKind::Unary(op) => args[0].data().iter().map(|&x| unary(*op, x)).collect(),
            OpKind::Cast(dtype) => args[0].data().iter().map(|&x| cast(*dtype, x)).collect(),
            OpKind::AddPtr => zip(&args[0], &args[1], |p, off| p + off)?,
            OpKind::ExpandDims { .. } | OpKind::View | OpKind::Convert { .. } => args[0].data().to_vec(),
            OpKind::Broadcast => broadcast(&args[0], ty.as_tensor().map_or(&[][..], |t| &t.shape[..]))?,
            OpKind::Reduce { axis, op } => reduce(&args[0], *axis, *op)?,
            OpKind::Cat => args[0].data().iter().chain(args[1].data()).copied().collect(),
            OpKind::Load => args[0].data().iter().map(|&p| self.address(p).map(|a| self.memory[a])).collect::<Result<_>>()?,
            OpKind::Dot => dot(&args[0], &args[1], &args[2])?,
            OpKind::Store | OpKind::For | OpKind::Yield | OpKind::Return => {
                return Err(Error::Eval(format!("{kind} produces no value")));
            }
        };
        Ok(shaped(ty, data))
    }
}
