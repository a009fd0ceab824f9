//! Multi-head scaled dot-product attention over a fused `qkv` projection.

use std::sync::Arc;

use anyhow::{ensure, Result};

use crate::backend::spec::{ElementwiseBinaryOp, MatmulSpec, PortableBackend};
use crate::ops::functional::activation::softmax_last_dim;
use crate::ops::functional::common::ensure_rank;
use crate::ops::functional::linalg::batched_matmul;
use crate::ops::functional::shape::{merge_heads, slice_last_axis, split_heads};
use crate::ops::functional::stochastic::{dropout, ForwardContext};
use crate::ops::functional::tensor_ops::{broadcast_trailing, scalar};
use crate::tensor::{DeviceTensor, Tensor};

/// Score assigned to masked-out key positions before the softmax.
pub const MASKED_SCORE: f32 = -1e9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionConfig {
    pub num_heads: usize,
    /// Skip the lower-triangular mask and let every query see every key.
    pub ignore_mask: bool,
    pub dropout: f32,
}

/// Lower-triangular mask `b` and its additive term `-1e9 * (1 - b)` for one sequence length.
pub struct CausalMask<B: PortableBackend + ?Sized + 'static> {
    keep: DeviceTensor<B>,
    penalty: DeviceTensor<B>,
}

impl<B: PortableBackend + ?Sized + 'static> CausalMask<B> {
    pub fn new(backend: Arc<B>, seq_len: usize) -> Result<Self> {
        let mut keep = Vec::with_capacity(seq_len * seq_len);
        let mut penalty = Vec::with_capacity(seq_len * seq_len);
        for query in 0..seq_len {
            for key in 0..seq_len {
                let b = if key <= query { 1.0f32 } else { 0.0 };
                keep.push(b);
                penalty.push(MASKED_SCORE * (1.0 - b));
            }
        }
        Ok(Self {
            keep: DeviceTensor::from_host(
                Arc::clone(&backend),
                Tensor::from_vec([seq_len, seq_len], keep)?,
            )?,
            penalty: DeviceTensor::from_host(backend, Tensor::from_vec([seq_len, seq_len], penalty)?)?,
        })
    }

    /// `w * b + (-1e9) * (1 - b)` over `(.., s, s)` scores.
    pub fn apply(&self, backend: &B, scores: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let kept = broadcast_trailing(backend, ElementwiseBinaryOp::Mul, scores, &self.keep)?;
        broadcast_trailing(backend, ElementwiseBinaryOp::Add, &kept, &self.penalty)
    }
}

/// Outputs of [`attention`].
pub struct AttentionComputation<B: PortableBackend + ?Sized + 'static> {
    /// `(b, s, d)` context vectors with heads merged back.
    pub output: DeviceTensor<B>,
    /// `(b, h, s, s)` attention probabilities after masking and softmax.
    pub weights: DeviceTensor<B>,
}

fn validate_attention<B: PortableBackend + ?Sized + 'static>(
    qkv: &DeviceTensor<B>,
    config: &AttentionConfig,
) -> Result<(usize, usize, usize)> {
    ensure_rank("attention qkv", qkv, 3)?;
    let dims = qkv.shape().dims();
    let (batch, seq, fused) = (dims[0], dims[1], dims[2]);
    ensure!(
        fused % 3 == 0,
        "fused qkv width {fused} must be divisible by 3"
    );
    let width = fused / 3;
    ensure!(
        config.num_heads > 0 && width % config.num_heads == 0,
        "embedding dim {width} must be divisible by num_heads {}",
        config.num_heads
    );
    Ok((batch, seq, width))
}

/// Runs attention on `qkv: (b, s, 3d)` laid out as `[q | k | v]` along the last axis.
pub fn attention<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    qkv: &DeviceTensor<B>,
    config: &AttentionConfig,
    ctx: &mut ForwardContext,
) -> Result<AttentionComputation<B>> {
    let (batch, seq, width) = validate_attention(qkv, config)?;
    let heads = config.num_heads;
    let head_dim = width / heads;

    let q = split_heads(backend, &slice_last_axis(backend, qkv, 0, width)?, heads)?;
    let k = split_heads(backend, &slice_last_axis(backend, qkv, width, width)?, heads)?;
    let v = split_heads(backend, &slice_last_axis(backend, qkv, 2 * width, width)?, heads)?;

    let q = q.reshape([batch * heads, seq, head_dim])?;
    let k = k.reshape([batch * heads, seq, head_dim])?;
    let v = v.reshape([batch * heads, seq, head_dim])?;

    let scores = batched_matmul(backend, &q, &k, MatmulSpec::transposed_rhs())?;
    let scores = scalar(
        backend,
        ElementwiseBinaryOp::Div,
        &scores,
        (head_dim as f32).sqrt(),
    )?
    .reshape([batch, heads, seq, seq])?;

    let scores = if config.ignore_mask {
        scores
    } else {
        CausalMask::new(qkv.backend(), seq)?.apply(backend, &scores)?
    };

    let weights = softmax_last_dim(backend, &scores)?;
    let dropped = dropout(backend, &weights, config.dropout, ctx)?;

    let context = batched_matmul(
        backend,
        &dropped.reshape([batch * heads, seq, seq])?,
        &v,
        MatmulSpec::default(),
    )?
    .reshape([batch, heads, seq, head_dim])?;
    let output = merge_heads(backend, &context)?;

    Ok(AttentionComputation { output, weights })
}
