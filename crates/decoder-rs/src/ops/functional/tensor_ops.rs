//! Broadcasting, scalar, and reduction helpers shared by layers.

use anyhow::{ensure, Result};

use crate::backend::spec::{BroadcastMode, ElementwiseBinaryOp, PortableBackend, ReduceKind};
use crate::ops::functional::common::{ensure_rank, ensure_rank_at_least, ensure_same_backend};
use crate::tensor::DeviceTensor;

fn validate_add_bias<B: PortableBackend + ?Sized + 'static>(
    x: &DeviceTensor<B>,
    bias: &DeviceTensor<B>,
) -> Result<()> {
    ensure_same_backend("add_bias", x, bias)?;
    ensure_rank("add_bias bias", bias, 1)?;
    ensure_rank_at_least("add_bias input", x, 1)?;
    ensure!(
        x.shape().last_dim() == bias.shape().dims()[0],
        "bias length {} must match the last dimension of {:?}",
        bias.shape().dims()[0],
        x.shape().dims()
    );
    Ok(())
}

/// Adds a `(features)` bias vector to every row of `x`.
pub fn add_bias<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    bias: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    validate_add_bias(x, bias)?;
    broadcast_trailing(backend, ElementwiseBinaryOp::Add, x, bias)
}

/// Applies `x op y` where `y`'s dims are a suffix of `x`'s dims.
pub fn broadcast_trailing<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    op: ElementwiseBinaryOp,
    x: &DeviceTensor<B>,
    y: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    ensure_same_backend("broadcast_trailing", x, y)?;
    ensure!(
        x.shape().ends_with(y.shape()),
        "cannot broadcast {:?} over the trailing axes of {:?}",
        y.shape().dims(),
        x.shape().dims()
    );
    let out = backend.broadcast_rows(op, x.host(), y.host(), BroadcastMode::Trailing);
    DeviceTensor::from_kernel(x.backend(), out)
}

/// Applies `x op stat` where `stat` is a keep-dims reduction of `x` (last axis of extent 1).
pub fn broadcast_keepdims<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    op: ElementwiseBinaryOp,
    x: &DeviceTensor<B>,
    stat: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    ensure_same_backend("broadcast_keepdims", x, stat)?;
    ensure!(
        stat.shape() == &x.shape().with_last_dim(1),
        "per-row operand {:?} does not match {:?}",
        stat.shape().dims(),
        x.shape().dims()
    );
    let out = backend.broadcast_rows(op, x.host(), stat.host(), BroadcastMode::KeepDims);
    DeviceTensor::from_kernel(x.backend(), out)
}

/// Applies `x op scalar` elementwise.
pub fn scalar<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    op: ElementwiseBinaryOp,
    x: &DeviceTensor<B>,
    value: f32,
) -> Result<DeviceTensor<B>> {
    DeviceTensor::from_kernel(x.backend(), backend.scalar(op, x.host(), value))
}

/// Reduces the last axis, keeping it with extent 1.
pub fn reduce_last_axis<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    kind: ReduceKind,
    x: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    ensure_rank_at_least("reduce input", x, 1)?;
    DeviceTensor::from_kernel(x.backend(), backend.reduce_last_axis(kind, x.host()))
}
