//! Activation functions built from portable elementwise kernels.

use anyhow::Result;

use crate::backend::spec::{ElementwiseBinaryOp, ElementwiseUnaryOp, PortableBackend};
use crate::ops::functional::common::ensure_rank_at_least;
use crate::ops::functional::tensor_ops::scalar;
use crate::tensor::{DeviceTensor, DeviceTensorOps};

/// `sqrt(2 / pi)`.
const GELU_SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_CUBIC_COEFF: f32 = 0.044_715;

/// Tanh-approximated GELU:
/// `0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))`.
///
/// Non-finite inputs are not special-cased; whatever the arithmetic yields is returned.
pub fn gelu<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    let cube = x.mul(x)?.mul(x)?;
    let inner = x.add(&scalar(backend, ElementwiseBinaryOp::Mul, &cube, GELU_CUBIC_COEFF)?)?;
    let scaled = scalar(backend, ElementwiseBinaryOp::Mul, &inner, GELU_SQRT_2_OVER_PI)?;
    let tanh = DeviceTensor::from_kernel(
        x.backend(),
        backend.elementwise_unary(ElementwiseUnaryOp::Tanh, scaled.host()),
    )?;
    let gate = scalar(backend, ElementwiseBinaryOp::Add, &tanh, 1.0)?;
    let half_x = scalar(backend, ElementwiseBinaryOp::Mul, x, 0.5)?;
    half_x.mul(&gate)
}

/// Softmax over the innermost axis.
pub fn softmax_last_dim<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    ensure_rank_at_least("softmax input", x, 1)?;
    DeviceTensor::from_kernel(x.backend(), backend.softmax_last_axis(x.host()))
}
