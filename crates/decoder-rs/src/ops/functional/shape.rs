//! Layout helpers: axis permutation, last-axis slicing, and attention head splitting.

use anyhow::{ensure, Result};

use crate::backend::spec::PortableBackend;
use crate::ops::functional::common::ensure_rank;
use crate::tensor::DeviceTensor;

pub fn permute<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    axes: &[usize],
) -> Result<DeviceTensor<B>> {
    let rank = x.shape().rank();
    ensure!(
        axes.len() == rank,
        "permutation {:?} does not cover rank {rank}",
        axes
    );
    let mut seen = vec![false; rank];
    for &axis in axes {
        ensure!(
            axis < rank && !seen[axis],
            "invalid permutation {:?} for rank {rank}",
            axes
        );
        seen[axis] = true;
    }
    DeviceTensor::from_kernel(x.backend(), backend.permute(x.host(), axes))
}

pub fn slice_last_axis<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    start: usize,
    len: usize,
) -> Result<DeviceTensor<B>> {
    let last = x.shape().last_dim();
    ensure!(
        start + len <= last,
        "slice [{start}, {}) exceeds last dimension {last}",
        start + len
    );
    DeviceTensor::from_kernel(x.backend(), backend.slice_last_axis(x.host(), start, len))
}

/// `(b, s, h * hd)` to `(b, h, s, hd)`.
pub fn split_heads<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    num_heads: usize,
) -> Result<DeviceTensor<B>> {
    ensure_rank("split_heads input", x, 3)?;
    let dims = x.shape().dims();
    let (batch, seq, width) = (dims[0], dims[1], dims[2]);
    ensure!(
        num_heads > 0 && width % num_heads == 0,
        "width {width} is not divisible into {num_heads} heads"
    );
    let grouped = x.reshape([batch, seq, num_heads, width / num_heads])?;
    permute(backend, &grouped, &[0, 2, 1, 3])
}

/// `(b, h, s, hd)` to `(b, s, h * hd)`.
pub fn merge_heads<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    ensure_rank("merge_heads input", x, 4)?;
    let dims = x.shape().dims();
    let (batch, heads, seq, head_dim) = (dims[0], dims[1], dims[2], dims[3]);
    let interleaved = permute(backend, x, &[0, 2, 1, 3])?;
    interleaved.reshape([batch, seq, heads * head_dim])
}
