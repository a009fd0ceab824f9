//! Portable kernel capability trait implemented by every numeric backend.
//!
//! The trait is deliberately small: dense matmuls, elementwise maps, last-axis reductions and
//! softmax, pure data movement (permute, slice, gather), and two broadcasting forms. Every
//! functional op in [`crate::ops::functional`] is a composition of these calls.
//!
//! Backends are free to schedule work however they like, but each output element must be
//! computed with the evaluation order documented on the method. That contract is what makes
//! model outputs bit-identical across backends.

use thiserror::Error;

use crate::tensor::Tensor;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("{op}: invalid operands: {detail}")]
    Shape { op: &'static str, detail: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn shape(op: &'static str, detail: impl Into<String>) -> Self {
        BackendError::Shape {
            op,
            detail: detail.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementwiseUnaryOp {
    Neg,
    Exp,
    Tanh,
    Sqrt,
}

impl ElementwiseUnaryOp {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ElementwiseUnaryOp::Neg => -x,
            ElementwiseUnaryOp::Exp => x.exp(),
            ElementwiseUnaryOp::Tanh => x.tanh(),
            ElementwiseUnaryOp::Sqrt => x.sqrt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ElementwiseBinaryOp {
    #[inline]
    pub fn apply(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            ElementwiseBinaryOp::Add => lhs + rhs,
            ElementwiseBinaryOp::Sub => lhs - rhs,
            ElementwiseBinaryOp::Mul => lhs * rhs,
            ElementwiseBinaryOp::Div => lhs / rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceKind {
    Sum,
    Max,
}

/// How the right-hand operand of [`PortableBackend::broadcast_rows`] lines up with the left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastMode {
    /// `rhs` dims equal the trailing dims of `lhs` (bias rows, masks).
    Trailing,
    /// `rhs` dims equal `lhs` dims with the last axis collapsed to 1 (per-row statistics).
    KeepDims,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MatmulSpec {
    /// Treat the right operand as stored `[n, k]` instead of `[k, n]`.
    pub transpose_rhs: bool,
}

impl MatmulSpec {
    pub fn transposed_rhs() -> Self {
        MatmulSpec {
            transpose_rhs: true,
        }
    }
}

/// Kernel capabilities a numeric backend must provide.
///
/// The trait is object safe so callers can hold `Arc<dyn PortableBackend>` obtained from the
/// registry as easily as a concrete backend type.
pub trait PortableBackend: Send + Sync {
    /// Returns the name the backend reports about itself.
    fn backend_name(&self) -> &str;

    /// `lhs: [m, k]`, `rhs: [k, n]` (or `[n, k]` when transposed) to `[m, n]`.
    ///
    /// Each output element accumulates `lhs[i, p] * rhs[p, j]` for `p = 0..k` in ascending
    /// order into an `f32` accumulator starting at `0.0`.
    fn matmul(&self, lhs: &Tensor, rhs: &Tensor, spec: MatmulSpec) -> BackendResult<Tensor>;

    /// Batched form of [`PortableBackend::matmul`] over a shared leading axis:
    /// `lhs: [batch, m, k]`, `rhs: [batch, k, n]` (or `[batch, n, k]`).
    fn batched_matmul(&self, lhs: &Tensor, rhs: &Tensor, spec: MatmulSpec)
        -> BackendResult<Tensor>;

    fn elementwise_unary(&self, op: ElementwiseUnaryOp, x: &Tensor) -> BackendResult<Tensor>;

    /// Applies `op` to operands of identical shape.
    fn elementwise_binary(
        &self,
        op: ElementwiseBinaryOp,
        lhs: &Tensor,
        rhs: &Tensor,
    ) -> BackendResult<Tensor>;

    /// Applies `x op scalar` to every element.
    fn scalar(&self, op: ElementwiseBinaryOp, x: &Tensor, scalar: f32) -> BackendResult<Tensor>;

    /// Applies `lhs op rhs`, repeating `rhs` according to `mode`.
    fn broadcast_rows(
        &self,
        op: ElementwiseBinaryOp,
        lhs: &Tensor,
        rhs: &Tensor,
        mode: BroadcastMode,
    ) -> BackendResult<Tensor>;

    /// Reduces the last axis, keeping it with extent 1. Rows are folded left to right.
    fn reduce_last_axis(&self, kind: ReduceKind, x: &Tensor) -> BackendResult<Tensor>;

    /// Numerically stable softmax over the last axis.
    ///
    /// Per row: take the maximum, exponentiate `x - max`, sum left to right, then divide.
    fn softmax_last_axis(&self, x: &Tensor) -> BackendResult<Tensor>;

    /// Reorders axes; `axes[i]` names the input axis that becomes output axis `i`.
    fn permute(&self, x: &Tensor, axes: &[usize]) -> BackendResult<Tensor>;

    /// Copies `len` entries of the last axis starting at `start`.
    fn slice_last_axis(&self, x: &Tensor, start: usize, len: usize) -> BackendResult<Tensor>;

    /// Gathers rows of a `[rows, cols]` table into `[indices.len(), cols]`.
    fn gather_rows(&self, table: &Tensor, indices: &[usize]) -> BackendResult<Tensor>;
}
