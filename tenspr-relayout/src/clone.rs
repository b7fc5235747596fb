use crate::error::{Error, Result};
use crate::ir::*;
use smallvec::SmallVec;
use std::collections::HashMap;

/// Original value -> replacement value.
///
/// Lookups of unmapped values fall back to the value itself.
#[derive(Debug, Clone, Default)]
pub struct ValueMapping {
    map: HashMap<Value, Value>,
}

impl ValueMapping {
    pub fn new() -> Self { Self::default() }
    pub fn map(&mut self, from: Value, to: Value) {
        self.map.insert(from, to);
    }
    pub fn get(&self, value: Value) -> Option<Value> {
        self.map.get(&value).copied()
    }
    pub fn lookup(&self, value: Value) -> Value {
        self.get(value).unwrap_or(value)
    }
    pub fn contains(&self, value: Value) -> bool { self.map.contains_key(&value) }
    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
}

/// Duplicate `op` with its operands remapped through `mapping`.
///
/// Result types are re-inferred from the new operands with the same rule the
/// builder uses. For kinds whose layout no operand determines (constants,
/// ranges, splats) the result takes `hint` when given. The clone is created
/// detached; placing it is up to the caller.
pub fn clone_with_infer_type(graph: &mut Graph, op: Op, mapping: &ValueMapping, hint: Option<&Encoding>) -> Result<Op> {
    let data = graph.op(op).clone();
    if !data.regions.is_empty() {
        return Err(Error::TypeInference { kind: data.kind.name(), reason: format!("{op} owns regions") });
    }
    let operands = data.operands.iter().map(|&v| mapping.lookup(v)).collect::<SmallVec<[Value; 3]>>();
    let declared = data.results.first().map(|&v| {
        let ty = graph.value_type(v);
        match hint {
            Some(enc) => ty.with_encoding(enc.clone()),
            None => ty.clone(),
        }
    });
    let new = graph.create_op(data.kind, &operands, declared.as_ref())?;
    log::trace!("clone: {op} -> {new}");
    Ok(new)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clone_follows_new_operands() {
        let a = Encoding::blocked(&[1], &[32], &[4], &[0]);
        let b = Encoding::blocked(&[4], &[32], &[4], &[0]);
        let mut g = Graph::new();
        let x = g.arg(Type::tensor(&[128], DType::F32, a.clone()));
        let xb = g.arg(Type::tensor(&[128], DType::F32, b.clone()));
        let y = g.binary(BinOp::Mul, x, x).unwrap();
        let k = g.constant(2.0, Type::tensor(&[128], DType::F32, a.clone())).unwrap();

        let mut mapping = ValueMapping::new();
        mapping.map(x, xb);
        let y_op = g.defining_op(y).unwrap();
        let y2 = clone_with_infer_type(&mut g, y_op, &mapping, None).unwrap();
        assert_eq!(g.operands(y2), &[xb, xb]);
        assert_eq!(g.value_type(g.result(y2)).encoding(), Some(&b));
        // not placed yet
        assert!(!g.is_live(y2));

        let k_op = g.defining_op(k).unwrap();
        let k2 = clone_with_infer_type(&mut g, k_op, &mapping, Some(&b)).unwrap();
        assert_eq!(g.value_type(g.result(k2)), &Type::tensor(&[128], DType::F32, b));
        assert_eq!(g.kind(k2), &OpKind::Constant { value: 2.0 });
    }

    #[test]
    fn unmapped_operands_are_kept() {
        let a = Encoding::blocked(&[1], &[32], &[4], &[0]);
        let mut g = Graph::new();
        let x = g.arg(Type::tensor(&[128], DType::F32, a.clone()));
        let y = g.unary(UnOp::Abs, x).unwrap();
        let y_op = g.defining_op(y).unwrap();
        let y2 = clone_with_infer_type(&mut g, y_op, &ValueMapping::new(), None).unwrap();
        assert_eq!(g.operands(y2), &[x]);
        assert_eq!(g.value_type(g.result(y2)), g.value_type(y));
    }
}
