//! Result type inference shared by the builder and the cloner.

use super::*;
use crate::error::{Error, Result};
use smallvec::*;

macro_rules! bail {
    ($kind: expr, $($fmt: tt)*) => {
        return Err(Error::TypeInference { kind: $kind.name(), reason: format!($($fmt)*) })
    }
}

fn tensor<'t>(kind: &OpKind, ty: &'t Type) -> Result<&'t TensorType> {
    match ty {
        Type::Tensor(t) => Ok(t),
        Type::Scalar(_) => bail!(kind, "expected a tensor operand, found {ty}"),
    }
}

/// Infer the result types of an operation of `kind` applied to `operands`.
///
/// `declared` provides what operands cannot determine: shape and dtype of
/// source-like kinds (constants, ranges, splats) and the target shape of
/// broadcasts and views. Whenever a tensor operand exists, the result encoding
/// follows the operand and the declared encoding is ignored.
pub fn infer_result_types(kind: &OpKind, operands: &[Type], declared: Option<&Type>) -> Result<SmallVec<[Type; 1]>> {
    let arity = match kind {
        OpKind::Constant { .. } | OpKind::MakeRange { .. } => Some(0),
        OpKind::Splat | OpKind::Unary(_) | OpKind::Cast(_) | OpKind::ExpandDims { .. } | OpKind::Broadcast
        | OpKind::Reduce { .. } | OpKind::View | OpKind::Load | OpKind::Convert { .. } => Some(1),
        OpKind::Binary(_) | OpKind::AddPtr | OpKind::Cat | OpKind::Store => Some(2),
        OpKind::Dot => Some(3),
        OpKind::For | OpKind::Yield | OpKind::Return => None,
    };
    if let Some(n) = arity {
        if operands.len() != n { bail!(kind, "expected {n} operands, found {}", operands.len()) }
    }
    let declared_tensor = || match declared {
        Some(Type::Tensor(t)) => Ok(t),
        Some(ty) => bail!(kind, "declared result {ty} is not a tensor"),
        None => bail!(kind, "result type must be declared"),
    };
    let ty = match kind {
        OpKind::Constant { .. } => match declared {
            Some(ty) => ty.clone(),
            None => bail!(kind, "result type must be declared"),
        },
        OpKind::MakeRange { start, end } => {
            let d = declared_tensor()?;
            if d.dtype != DType::I32 || d.shape.len() != 1 || d.shape[0] as i64 != end - start {
                bail!(kind, "range [{start}, {end}) cannot produce {}", Type::Tensor(d.clone()))
            }
            Type::Tensor(d.clone())
        }
        OpKind::Splat => {
            let d = declared_tensor()?;
            if operands[0] != Type::Scalar(d.dtype) { bail!(kind, "cannot splat {} into {}", operands[0], d.dtype) }
            Type::Tensor(d.clone())
        }
        OpKind::Binary(op) => {
            let (lhs, rhs) = (&operands[0], &operands[1]);
            if lhs != rhs { bail!(kind, "operand types differ: {lhs} vs {rhs}") }
            if lhs.dtype().is_ptr() || lhs.dtype() == DType::Bool { bail!(kind, "non-arithmetic operand {lhs}") }
            match op {
                BinOp::CmpLt => match lhs {
                    Type::Tensor(t) => Type::Tensor(TensorType { dtype: DType::Bool, ..t.clone() }),
                    Type::Scalar(_) => Type::Scalar(DType::Bool),
                },
                _ => lhs.clone(),
            }
        }
        OpKind::Unary(op) => {
            let x = &operands[0];
            if matches!(op, UnOp::Exp | UnOp::Sqrt) && !x.dtype().is_float() { bail!(kind, "expected float operand, found {x}") }
            x.clone()
        }
        OpKind::Cast(dtype) => match &operands[0] {
            Type::Tensor(t) => Type::Tensor(TensorType { dtype: *dtype, ..t.clone() }),
            Type::Scalar(_) => Type::Scalar(*dtype),
        },
        OpKind::AddPtr => {
            let (ptr, off) = (&operands[0], &operands[1]);
            if !ptr.dtype().is_ptr() || !off.dtype().is_int() { bail!(kind, "expected pointer and offset, found {ptr}, {off}") }
            match (ptr, off) {
                (Type::Tensor(p), Type::Tensor(o)) if p.shape == o.shape && p.encoding == o.encoding => ptr.clone(),
                (Type::Scalar(_), Type::Scalar(_)) => ptr.clone(),
                _ => bail!(kind, "pointer {ptr} and offset {off} disagree"),
            }
        }
        OpKind::ExpandDims { axis } => {
            let x = tensor(kind, &operands[0])?;
            if *axis > x.shape.len() { bail!(kind, "axis {axis} out of range for {}", operands[0]) }
            let Encoding::Slice { dim, parent } = &x.encoding else {
                bail!(kind, "operand encoding {} is not a slice", x.encoding)
            };
            if dim != axis { bail!(kind, "slice dimension {dim} does not match axis {axis}") }
            let mut shape = x.shape.clone();
            shape.insert(*axis, 1);
            Type::Tensor(TensorType { shape, dtype: x.dtype, encoding: (**parent).clone() })
        }
        OpKind::Broadcast => {
            let x = tensor(kind, &operands[0])?;
            let d = declared_tensor()?;
            let ok = x.shape.len() == d.shape.len()
                && x.shape.iter().zip(d.shape.iter()).all(|(a, b)| a == b || *a == 1);
            if !ok || x.dtype != d.dtype { bail!(kind, "cannot broadcast {} to {}", operands[0], Type::Tensor(d.clone())) }
            Type::Tensor(TensorType { shape: d.shape.clone(), dtype: x.dtype, encoding: x.encoding.clone() })
        }
        OpKind::Reduce { axis, .. } => {
            let x = tensor(kind, &operands[0])?;
            if *axis >= x.shape.len() { bail!(kind, "axis {axis} out of range for {}", operands[0]) }
            if x.shape.len() == 1 {
                Type::Scalar(x.dtype)
            } else {
                let mut shape = x.shape.clone();
                shape.remove(*axis);
                Type::Tensor(TensorType { shape, dtype: x.dtype, encoding: Encoding::slice(*axis, x.encoding.clone()) })
            }
        }
        OpKind::View => {
            let x = tensor(kind, &operands[0])?;
            let d = declared_tensor()?;
            if x.numel() != d.numel() || x.dtype != d.dtype { bail!(kind, "cannot view {} as {}", operands[0], Type::Tensor(d.clone())) }
            Type::Tensor(TensorType { shape: d.shape.clone(), dtype: x.dtype, encoding: x.encoding.clone() })
        }
        OpKind::Cat => {
            let (a, b) = (tensor(kind, &operands[0])?, tensor(kind, &operands[1])?);
            if a.shape.is_empty() || a.dtype != b.dtype || a.encoding != b.encoding || a.shape.len() != b.shape.len() || a.shape[1..] != b.shape[1..] {
                bail!(kind, "cannot concatenate {} and {}", operands[0], operands[1])
            }
            let mut shape = a.shape.clone();
            shape[0] += b.shape[0];
            Type::Tensor(TensorType { shape, ..a.clone() })
        }
        OpKind::Load => match &operands[0] {
            Type::Tensor(TensorType { shape, dtype: DType::Ptr(p), encoding }) => {
                Type::Tensor(TensorType { shape: shape.clone(), dtype: p.dtype(), encoding: encoding.clone() })
            }
            Type::Scalar(DType::Ptr(p)) => Type::Scalar(p.dtype()),
            other => bail!(kind, "expected pointers, found {other}"),
        },
        OpKind::Store => {
            let (ptr, val) = (&operands[0], &operands[1]);
            let DType::Ptr(p) = ptr.dtype() else { bail!(kind, "expected pointers, found {ptr}") };
            if p.dtype() != val.dtype() || ptr.as_tensor().map(|t| &t.shape) != val.as_tensor().map(|t| &t.shape) {
                bail!(kind, "cannot store {val} through {ptr}")
            }
            return Ok(smallvec![]);
        }
        OpKind::Dot => {
            let (a, b, c) = (tensor(kind, &operands[0])?, tensor(kind, &operands[1])?, tensor(kind, &operands[2])?);
            let ok = a.shape.len() == 2 && b.shape.len() == 2 && c.shape.len() == 2
                && a.shape[1] == b.shape[0] && a.shape[0] == c.shape[0] && b.shape[1] == c.shape[1];
            if !ok { bail!(kind, "mismatched dot shapes {}, {}, {}", operands[0], operands[1], operands[2]) }
            operands[2].clone()
        }
        OpKind::Convert { to } => {
            let x = tensor(kind, &operands[0])?;
            Type::Tensor(TensorType { encoding: to.clone(), ..x.clone() })
        }
        OpKind::For => {
            if operands.len() < 3 || operands[..3].iter().any(|t| !matches!(t, Type::Scalar(d) if d.is_int())) {
                bail!(kind, "expected integer lower bound, upper bound and step")
            }
            return Ok(operands[3..].iter().cloned().collect());
        }
        OpKind::Yield | OpKind::Return => return Ok(smallvec![]),
    };
    Ok(smallvec![ty])
}
