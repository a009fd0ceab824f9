//! Shared validation helpers and the [`DeviceTensorOps`] extension trait.

use anyhow::{ensure, Result};

use crate::backend::spec::{ElementwiseBinaryOp, ElementwiseUnaryOp, MatmulSpec, PortableBackend};
use crate::tensor::DeviceTensor;

/// Extension trait exposing ergonomic math helpers on device tensors.
///
/// Every method dispatches to the backend the receiver is bound to.
pub trait DeviceTensorOps<B: PortableBackend + ?Sized + 'static>: Sized {
    fn add(&self, rhs: &Self) -> Result<Self>;
    fn sub(&self, rhs: &Self) -> Result<Self>;
    fn mul(&self, rhs: &Self) -> Result<Self>;
    fn div(&self, rhs: &Self) -> Result<Self>;
    fn neg(&self) -> Result<Self>;
    /// `[m, k] x [k, n]` matrix product.
    fn matmul(&self, rhs: &Self) -> Result<Self>;
}

impl<B: PortableBackend + ?Sized + 'static> DeviceTensorOps<B> for DeviceTensor<B> {
    fn add(&self, rhs: &Self) -> Result<Self> {
        binary("add", ElementwiseBinaryOp::Add, self, rhs)
    }

    fn sub(&self, rhs: &Self) -> Result<Self> {
        binary("sub", ElementwiseBinaryOp::Sub, self, rhs)
    }

    fn mul(&self, rhs: &Self) -> Result<Self> {
        binary("mul", ElementwiseBinaryOp::Mul, self, rhs)
    }

    fn div(&self, rhs: &Self) -> Result<Self> {
        binary("div", ElementwiseBinaryOp::Div, self, rhs)
    }

    fn neg(&self) -> Result<Self> {
        let backend = self.backend();
        let out = backend.elementwise_unary(ElementwiseUnaryOp::Neg, self.host());
        DeviceTensor::from_kernel(backend, out)
    }

    fn matmul(&self, rhs: &Self) -> Result<Self> {
        let backend = self.backend();
        super::linalg::matmul(backend.as_ref(), self, rhs, MatmulSpec::default())
    }
}

fn binary<B: PortableBackend + ?Sized + 'static>(
    op_name: &str,
    op: ElementwiseBinaryOp,
    lhs: &DeviceTensor<B>,
    rhs: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    ensure_same_backend(op_name, lhs, rhs)?;
    ensure_shape_matches(op_name, lhs, rhs)?;
    let backend = lhs.backend();
    let out = backend.elementwise_binary(op, lhs.host(), rhs.host());
    DeviceTensor::from_kernel(backend, out)
}

pub(crate) fn ensure_same_backend<B: PortableBackend + ?Sized + 'static>(
    op: &str,
    lhs: &DeviceTensor<B>,
    rhs: &DeviceTensor<B>,
) -> Result<()> {
    lhs.ensure_same_backend(rhs)
        .map_err(|err| err.context(format!("{op} operands live on different backends")))
}

pub(crate) fn ensure_rank<B: PortableBackend + ?Sized + 'static>(
    what: &str,
    tensor: &DeviceTensor<B>,
    rank: usize,
) -> Result<()> {
    ensure!(
        tensor.shape().rank() == rank,
        "{what} must have rank {rank}, got shape {:?}",
        tensor.shape().dims()
    );
    Ok(())
}

pub(crate) fn ensure_rank_at_least<B: PortableBackend + ?Sized + 'static>(
    what: &str,
    tensor: &DeviceTensor<B>,
    rank: usize,
) -> Result<()> {
    ensure!(
        tensor.shape().rank() >= rank,
        "{what} must have rank >= {rank}, got shape {:?}",
        tensor.shape().dims()
    );
    Ok(())
}

pub(crate) fn ensure_shape_matches<B: PortableBackend + ?Sized + 'static>(
    what: &str,
    lhs: &DeviceTensor<B>,
    rhs: &DeviceTensor<B>,
) -> Result<()> {
    ensure!(
        lhs.shape() == rhs.shape(),
        "{what} operands must share a shape, got {:?} and {:?}",
        lhs.shape().dims(),
        rhs.shape().dims()
    );
    Ok(())
}
