use smallvec::*;
use std::fmt;

/// Scalar element pointed to by a pointer element type
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Pointee {
    I32,
    I64,
    F16,
    F32,
}

impl Pointee {
    pub fn dtype(self) -> DType {
        match self {
            Pointee::I32 => DType::I32,
            Pointee::I64 => DType::I64,
            Pointee::F16 => DType::F16,
            Pointee::F32 => DType::F32,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum DType {
    Bool,
    I32,
    I64,
    F16,
    F32,
    Ptr(Pointee),
}

impl DType {
    pub fn is_int(self) -> bool { matches!(self, DType::I32 | DType::I64) }
    pub fn is_float(self) -> bool { matches!(self, DType::F16 | DType::F32) }
    pub fn is_ptr(self) -> bool { matches!(self, DType::Ptr(_)) }
}

/// How the elements of a tensor are distributed over threads, warps and memory.
///
/// Encodings are plain values: two tensors share a layout iff their encodings
/// compare equal.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum Encoding {
    // distributed over registers of each thread
    Blocked {
        size_per_thread: SmallVec<[u32; 4]>,
        threads_per_warp: SmallVec<[u32; 4]>,
        warps_per_cta: SmallVec<[u32; 4]>,
        order: SmallVec<[u32; 4]>,
    },
    // the encoding of a tensor with dimension `dim` squeezed out of `parent`
    Slice { dim: usize, parent: Box<Encoding> },
    // matrix-core accumulator layout
    Mma { version: u8, warps_per_cta: SmallVec<[u32; 4]> },
    // operand `op_idx` of a dot whose result is laid out in `parent`
    DotOperand { op_idx: u8, parent: Box<Encoding> },
    // swizzled shared memory
    Shared { vec: u32, per_phase: u32, max_phase: u32, order: SmallVec<[u32; 4]> },
}

impl Encoding {
    pub fn blocked(spt: &[u32], tpw: &[u32], wpc: &[u32], order: &[u32]) -> Self {
        Encoding::Blocked {
            size_per_thread: spt.to_smallvec(),
            threads_per_warp: tpw.to_smallvec(),
            warps_per_cta: wpc.to_smallvec(),
            order: order.to_smallvec(),
        }
    }
    pub fn slice(dim: usize, parent: Encoding) -> Self {
        Encoding::Slice { dim, parent: Box::new(parent) }
    }
    pub fn is_shared(&self) -> bool { matches!(self, Encoding::Shared { .. }) }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Blocked { size_per_thread, threads_per_warp, warps_per_cta, order } => write!(
                f, "#blocked<{:?}, {:?}, {:?}, {:?}>",
                size_per_thread.as_slice(), threads_per_warp.as_slice(), warps_per_cta.as_slice(), order.as_slice()
            ),
            Encoding::Slice { dim, parent } => write!(f, "#slice<{dim}, {parent}>"),
            Encoding::Mma { version, warps_per_cta } => write!(f, "#mma<v{version}, {:?}>", warps_per_cta.as_slice()),
            Encoding::DotOperand { op_idx, parent } => write!(f, "#dot_op<{op_idx}, {parent}>"),
            Encoding::Shared { vec, per_phase, max_phase, order } => {
                write!(f, "#shared<{vec}, {per_phase}, {max_phase}, {:?}>", order.as_slice())
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct TensorType {
    pub shape: SmallVec<[usize; 4]>,
    pub dtype: DType,
    pub encoding: Encoding,
}

impl TensorType {
    pub fn numel(&self) -> usize { self.shape.iter().product() }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum Type {
    Scalar(DType),
    Tensor(TensorType),
}

impl Type {
    pub fn tensor(shape: &[usize], dtype: DType, encoding: Encoding) -> Self {
        Type::Tensor(TensorType { shape: shape.to_smallvec(), dtype, encoding })
    }
    pub fn encoding(&self) -> Option<&Encoding> {
        match self {
            Type::Tensor(t) => Some(&t.encoding),
            Type::Scalar(_) => None,
        }
    }
    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Type::Tensor(t) => Some(t),
            Type::Scalar(_) => None,
        }
    }
    pub fn dtype(&self) -> DType {
        match self {
            Type::Tensor(t) => t.dtype,
            Type::Scalar(d) => *d,
        }
    }
    // same tensor under another layout, scalars are unaffected
    pub fn with_encoding(&self, encoding: Encoding) -> Type {
        match self {
            Type::Tensor(t) => Type::Tensor(TensorType { encoding, ..t.clone() }),
            Type::Scalar(d) => Type::Scalar(*d),
        }
    }
    // a layout conversion can only change the encoding
    pub fn is_convertible_to(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Tensor(a), Type::Tensor(b)) => a.shape == b.shape && a.dtype == b.dtype,
            _ => false,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Bool => write!(f, "i1"),
            DType::I32 => write!(f, "i32"),
            DType::I64 => write!(f, "i64"),
            DType::F16 => write!(f, "f16"),
            DType::F32 => write!(f, "f32"),
            DType::Ptr(p) => write!(f, "ptr<{}>", p.dtype()),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(d) => write!(f, "{d}"),
            Type::Tensor(t) => {
                write!(f, "tensor<")?;
                for n in t.shape.iter() { write!(f, "{n}x")?; }
                write!(f, "{}, {}>", t.dtype, t.encoding)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retyping_keeps_shape() {
        let a = Encoding::blocked(&[1], &[32], &[4], &[0]);
        let b = Encoding::blocked(&[4], &[32], &[4], &[0]);
        let t = Type::tensor(&[128], DType::F32, a.clone());
        let u = t.with_encoding(b.clone());
        assert_eq!(u.encoding(), Some(&b));
        assert!(t.is_convertible_to(&u));
        assert!(!t.is_convertible_to(&Type::tensor(&[64], DType::F32, b)));
        assert!(!Type::Scalar(DType::I32).is_convertible_to(&Type::Scalar(DType::I32)));
    }

    #[test]
    fn printing() {
        let t = Type::tensor(&[16, 8], DType::Ptr(Pointee::F16), Encoding::slice(1, Encoding::Mma { version: 2, warps_per_cta: smallvec![2, 2] }));
        assert_eq!(t.to_string(), "tensor<16x8xptr<f16>, #slice<1, #mma<v2, [2, 2]>>>");
    }
}
