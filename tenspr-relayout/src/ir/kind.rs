use super::*;
use std::fmt;

/// Elementwise binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add, Sub, Mul, Div, Max, Min,
    // produces a Bool tensor
    CmpLt,
}

/// Elementwise unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg, Exp, Sqrt, Abs,
}

/// Reduce operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedOp {
    Sum, Max, Min,
}

/// Operation kind together with its kind-specific attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    // tensor filled with one value, shape and layout are declared
    Constant { value: f64 },
    // [start, end) along a 1-d tensor
    MakeRange { start: i64, end: i64 },
    // scalar to tensor
    Splat,
    Binary(BinOp),
    Unary(UnOp),
    Cast(DType),
    // pointer tensor + integer offset tensor
    AddPtr,
    // insert a unit dimension at `axis`
    ExpandDims { axis: usize },
    // repeat unit dimensions up to the declared shape
    Broadcast,
    Reduce { axis: usize, op: RedOp },
    // reshape, element order preserved
    View,
    // concatenation along the first dimension
    Cat,
    Load,
    Store,
    // a @ b + acc
    Dot,
    // reinterpret the operand under encoding `to`
    Convert { to: Encoding },
    // operands are lower, upper, step and the initial iteration values
    For,
    Yield,
    Return,
}

/// Field-less tag of an [`OpKind`], the key of the rule registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpTag {
    Constant, MakeRange, Splat, Binary, Unary, Cast, AddPtr,
    ExpandDims, Broadcast, Reduce, View, Cat, Load, Store, Dot,
    Convert, For, Yield, Return,
}

impl OpTag {
    pub const ALL: [OpTag; 19] = [
        OpTag::Constant, OpTag::MakeRange, OpTag::Splat, OpTag::Binary, OpTag::Unary, OpTag::Cast, OpTag::AddPtr,
        OpTag::ExpandDims, OpTag::Broadcast, OpTag::Reduce, OpTag::View, OpTag::Cat, OpTag::Load, OpTag::Store,
        OpTag::Dot, OpTag::Convert, OpTag::For, OpTag::Yield, OpTag::Return,
    ];
}

impl OpKind {
    pub fn tag(&self) -> OpTag {
        match self {
            OpKind::Constant { .. } => OpTag::Constant,
            OpKind::MakeRange { .. } => OpTag::MakeRange,
            OpKind::Splat => OpTag::Splat,
            OpKind::Binary(_) => OpTag::Binary,
            OpKind::Unary(_) => OpTag::Unary,
            OpKind::Cast(_) => OpTag::Cast,
            OpKind::AddPtr => OpTag::AddPtr,
            OpKind::ExpandDims { .. } => OpTag::ExpandDims,
            OpKind::Broadcast => OpTag::Broadcast,
            OpKind::Reduce { .. } => OpTag::Reduce,
            OpKind::View => OpTag::View,
            OpKind::Cat => OpTag::Cat,
            OpKind::Load => OpTag::Load,
            OpKind::Store => OpTag::Store,
            OpKind::Dot => OpTag::Dot,
            OpKind::Convert { .. } => OpTag::Convert,
            OpKind::For => OpTag::For,
            OpKind::Yield => OpTag::Yield,
            OpKind::Return => OpTag::Return,
        }
    }
    pub fn is_convert(&self) -> bool { matches!(self, OpKind::Convert { .. }) }
    pub fn is_terminator(&self) -> bool { matches!(self, OpKind::Yield | OpKind::Return) }
    // writes memory or transfers control
    pub fn has_side_effects(&self) -> bool {
        matches!(self, OpKind::Store | OpKind::For | OpKind::Yield | OpKind::Return)
    }
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Constant { .. } => "constant",
            OpKind::MakeRange { .. } => "make_range",
            OpKind::Splat => "splat",
            OpKind::Binary(BinOp::Add) => "add",
            OpKind::Binary(BinOp::Sub) => "sub",
            OpKind::Binary(BinOp::Mul) => "mul",
            OpKind::Binary(BinOp::Div) => "div",
            OpKind::Binary(BinOp::Max) => "max",
            OpKind::Binary(BinOp::Min) => "min",
            OpKind::Binary(BinOp::CmpLt) => "cmp_lt",
            OpKind::Unary(UnOp::Neg) => "neg",
            OpKind::Unary(UnOp::Exp) => "exp",
            OpKind::Unary(UnOp::Sqrt) => "sqrt",
            OpKind::Unary(UnOp::Abs) => "abs",
            OpKind::Cast(_) => "cast",
            OpKind::AddPtr => "addptr",
            OpKind::ExpandDims { .. } => "expand_dims",
            OpKind::Broadcast => "broadcast",
            OpKind::Reduce { .. } => "reduce",
            OpKind::View => "view",
            OpKind::Cat => "cat",
            OpKind::Load => "load",
            OpKind::Store => "store",
            OpKind::Dot => "dot",
            OpKind::Convert { .. } => "convert_layout",
            OpKind::For => "for",
            OpKind::Yield => "yield",
            OpKind::Return => "return",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        match self {
            OpKind::Constant { value } => write!(f, " {{value = {value:?}}}"),
            OpKind::MakeRange { start, end } => write!(f, " {{start = {start}, end = {end}}}"),
            OpKind::Cast(d) => write!(f, " {{to = {d}}}"),
            OpKind::ExpandDims { axis } => write!(f, " {{axis = {axis}}}"),
            OpKind::Reduce { axis, op } => write!(f, " {{axis = {axis}, op = {op:?}}}"),
            _ => Ok(()),
        }
    }
}
