//! Layer normalization over the innermost axis.

use anyhow::{ensure, Result};

use crate::backend::spec::{ElementwiseBinaryOp, ElementwiseUnaryOp, PortableBackend, ReduceKind};
use crate::ops::functional::common::{ensure_rank, ensure_rank_at_least, ensure_same_backend};
use crate::ops::functional::tensor_ops::{
    broadcast_keepdims, broadcast_trailing, reduce_last_axis, scalar,
};
use crate::tensor::{DeviceTensor, DeviceTensorOps};

fn validate_layer_norm<B: PortableBackend + ?Sized + 'static>(
    x: &DeviceTensor<B>,
    gain: &DeviceTensor<B>,
    bias: &DeviceTensor<B>,
    eps: f32,
) -> Result<usize> {
    ensure_same_backend("layer_norm gain", x, gain)?;
    ensure_same_backend("layer_norm bias", x, bias)?;
    ensure_rank_at_least("layer_norm input", x, 1)?;
    ensure_rank("layer_norm gain", gain, 1)?;
    ensure_rank("layer_norm bias", bias, 1)?;
    let features = x.shape().last_dim();
    ensure!(
        gain.shape().dims()[0] == features && bias.shape().dims()[0] == features,
        "layer_norm affine parameters {:?}/{:?} must match feature dimension {features}",
        gain.shape().dims(),
        bias.shape().dims()
    );
    ensure!(features > 0, "layer_norm needs a non-empty feature axis");
    ensure!(eps >= 0.0, "layer_norm epsilon must be non-negative, got {eps}");
    Ok(features)
}

/// `gain * (x - mean) / sqrt(var + eps) + bias`, with the biased variance of the last axis.
pub fn layer_norm<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    gain: &DeviceTensor<B>,
    bias: &DeviceTensor<B>,
    eps: f32,
) -> Result<DeviceTensor<B>> {
    let features = validate_layer_norm(x, gain, bias, eps)? as f32;

    let sum = reduce_last_axis(backend, ReduceKind::Sum, x)?;
    let mean = scalar(backend, ElementwiseBinaryOp::Div, &sum, features)?;
    let centered = broadcast_keepdims(backend, ElementwiseBinaryOp::Sub, x, &mean)?;

    let squared = centered.mul(&centered)?;
    let squared_sum = reduce_last_axis(backend, ReduceKind::Sum, &squared)?;
    let variance = scalar(backend, ElementwiseBinaryOp::Div, &squared_sum, features)?;
    let shifted = scalar(backend, ElementwiseBinaryOp::Add, &variance, eps)?;
    let std = DeviceTensor::from_kernel(
        x.backend(),
        backend.elementwise_unary(ElementwiseUnaryOp::Sqrt, shifted.host()),
    )?;

    let normalized = broadcast_keepdims(backend, ElementwiseBinaryOp::Div, &centered, &std)?;
    let scaled = broadcast_trailing(backend, ElementwiseBinaryOp::Mul, &normalized, gain)?;
    broadcast_trailing(backend, ElementwiseBinaryOp::Add, &scaled, bias)
}
