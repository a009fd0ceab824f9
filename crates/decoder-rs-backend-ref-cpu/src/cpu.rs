use std::sync::Arc;

use decoder_rs::backend::spec::{
    BackendError, BackendResult, BroadcastMode, ElementwiseBinaryOp, ElementwiseUnaryOp,
    MatmulSpec, PortableBackend, ReduceKind,
};
use decoder_rs::tensor::{Shape, Tensor};

/// Schedules the rows of an output buffer.
///
/// Kernels hand the executor a closure that fills one output row from read-only inputs, so the
/// per-element arithmetic is fixed by the kernel and only the row schedule varies.
pub trait RowExecutor: Send + Sync {
    fn executor_name(&self) -> &'static str;

    /// Calls `fill(row, out_row)` exactly once for every `row_len` chunk of `out`.
    fn run_rows(&self, out: &mut [f32], row_len: usize, fill: &(dyn Fn(usize, &mut [f32]) + Sync));
}

/// Runs rows one after another on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialRows;

impl RowExecutor for SequentialRows {
    fn executor_name(&self) -> &'static str {
        "cpu"
    }

    fn run_rows(&self, out: &mut [f32], row_len: usize, fill: &(dyn Fn(usize, &mut [f32]) + Sync)) {
        if row_len == 0 || out.is_empty() {
            return;
        }
        for (row, chunk) in out.chunks_mut(row_len).enumerate() {
            fill(row, chunk);
        }
    }
}

/// Reference kernels shared by every CPU backend; `E` only decides how rows are scheduled.
#[derive(Clone)]
pub struct GenericCpuBackend<E: RowExecutor> {
    executor: Arc<E>,
}

impl<E: RowExecutor> GenericCpuBackend<E> {
    pub fn with_executor(executor: E) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }

    fn fill(&self, dims: Vec<usize>, row_len: usize, fill: &(dyn Fn(usize, &mut [f32]) + Sync)) -> BackendResult<Tensor> {
        let shape = Shape::new(dims);
        let mut data = vec![0.0f32; shape.num_elements()];
        self.executor.run_rows(&mut data, row_len, fill);
        Tensor::from_vec(shape, data).map_err(|err| BackendError::execution(err.to_string()))
    }
}

impl GenericCpuBackend<SequentialRows> {
    pub fn new() -> Self {
        Self::with_executor(SequentialRows)
    }
}

impl Default for GenericCpuBackend<SequentialRows> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CpuPortableBackend = GenericCpuBackend<SequentialRows>;

impl<E: RowExecutor> PortableBackend for GenericCpuBackend<E> {
    fn backend_name(&self) -> &str {
        self.executor.executor_name()
    }

    fn matmul(&self, lhs: &Tensor, rhs: &Tensor, spec: MatmulSpec) -> BackendResult<Tensor> {
        let l = lhs.shape().dims();
        let r = rhs.shape().dims();
        if l.len() != 2 || r.len() != 2 {
            return Err(BackendError::shape(
                "matmul",
                format!("expected rank-2 operands, got {:?} and {:?}", l, r),
            ));
        }
        let dims = MatmulDims::resolve("matmul", l[0], l[1], r, spec)?;
        let (a, b) = (lhs.data(), rhs.data());
        self.fill(vec![dims.m, dims.n], dims.n, &|i, row| {
            dims.row(&a[i * dims.k..(i + 1) * dims.k], b, row);
        })
    }

    fn batched_matmul(
        &self,
        lhs: &Tensor,
        rhs: &Tensor,
        spec: MatmulSpec,
    ) -> BackendResult<Tensor> {
        let l = lhs.shape().dims();
        let r = rhs.shape().dims();
        if l.len() != 3 || r.len() != 3 || l[0] != r[0] {
            return Err(BackendError::shape(
                "batched_matmul",
                format!("expected [batch, m, k] and [batch, .., ..], got {:?} and {:?}", l, r),
            ));
        }
        let batch = l[0];
        let dims = MatmulDims::resolve("batched_matmul", l[1], l[2], &r[1..], spec)?;
        let (a, b) = (lhs.data(), rhs.data());
        let rhs_stride = dims.k * dims.n;
        self.fill(vec![batch, dims.m, dims.n], dims.n, &|row_idx, row| {
            let bi = row_idx / dims.m.max(1);
            let start = row_idx * dims.k;
            dims.row(
                &a[start..start + dims.k],
                &b[bi * rhs_stride..(bi + 1) * rhs_stride],
                row,
            );
        })
    }

    fn elementwise_unary(&self, op: ElementwiseUnaryOp, x: &Tensor) -> BackendResult<Tensor> {
        let values = x.data();
        let row_len = x.shape().last_dim();
        self.fill(x.shape().dims().to_vec(), row_len, &|r, row| {
            let src = &values[r * row_len..r * row_len + row.len()];
            for (slot, &v) in row.iter_mut().zip(src) {
                *slot = op.apply(v);
            }
        })
    }

    fn elementwise_binary(
        &self,
        op: ElementwiseBinaryOp,
        lhs: &Tensor,
        rhs: &Tensor,
    ) -> BackendResult<Tensor> {
        if lhs.shape() != rhs.shape() {
            return Err(BackendError::shape(
                "elementwise_binary",
                format!(
                    "operand shapes differ: {:?} vs {:?}",
                    lhs.shape().dims(),
                    rhs.shape().dims()
                ),
            ));
        }
        let (a, b) = (lhs.data(), rhs.data());
        let row_len = lhs.shape().last_dim();
        self.fill(lhs.shape().dims().to_vec(), row_len, &|r, row| {
            let base = r * row_len;
            for (c, slot) in row.iter_mut().enumerate() {
                *slot = op.apply(a[base + c], b[base + c]);
            }
        })
    }

    fn scalar(&self, op: ElementwiseBinaryOp, x: &Tensor, scalar: f32) -> BackendResult<Tensor> {
        let values = x.data();
        let row_len = x.shape().last_dim();
        self.fill(x.shape().dims().to_vec(), row_len, &|r, row| {
            let base = r * row_len;
            for (c, slot) in row.iter_mut().enumerate() {
                *slot = op.apply(values[base + c], scalar);
            }
        })
    }

    fn broadcast_rows(
        &self,
        op: ElementwiseBinaryOp,
        lhs: &Tensor,
        rhs: &Tensor,
        mode: BroadcastMode,
    ) -> BackendResult<Tensor> {
        let l = lhs.shape().dims();
        let r = rhs.shape().dims();
        let (a, b) = (lhs.data(), rhs.data());
        match mode {
            BroadcastMode::Trailing => {
                if r.len() > l.len() || !lhs.shape().ends_with(rhs.shape()) {
                    return Err(BackendError::shape(
                        "broadcast_rows",
                        format!("{:?} is not a trailing block of {:?}", r, l),
                    ));
                }
                let block = rhs.len();
                self.fill(l.to_vec(), block, &|row_idx, row| {
                    let base = row_idx * block;
                    for (c, slot) in row.iter_mut().enumerate() {
                        *slot = op.apply(a[base + c], b[c]);
                    }
                })
            }
            BroadcastMode::KeepDims => {
                let keeps = !l.is_empty()
                    && r.len() == l.len()
                    && r[r.len() - 1] == 1
                    && r[..r.len() - 1] == l[..l.len() - 1];
                if !keeps {
                    return Err(BackendError::shape(
                        "broadcast_rows",
                        format!("{:?} is not {:?} with the last axis kept as 1", r, l),
                    ));
                }
                let row_len = lhs.shape().last_dim();
                self.fill(l.to_vec(), row_len, &|row_idx, row| {
                    let base = row_idx * row_len;
                    let stat = b[row_idx];
                    for (c, slot) in row.iter_mut().enumerate() {
                        *slot = op.apply(a[base + c], stat);
                    }
                })
            }
        }
    }

    fn reduce_last_axis(&self, kind: ReduceKind, x: &Tensor) -> BackendResult<Tensor> {
        let dims = x.shape().dims();
        if dims.is_empty() {
            return Err(BackendError::shape(
                "reduce_last_axis",
                "cannot reduce a rank-0 tensor",
            ));
        }
        let n = dims[dims.len() - 1];
        let values = x.data();
        let mut out_dims = dims.to_vec();
        let last = out_dims.len() - 1;
        out_dims[last] = 1;
        self.fill(out_dims, 1, &|r, row| {
            let src = &values[r * n..(r + 1) * n];
            row[0] = match kind {
                ReduceKind::Sum => src.iter().fold(0.0f32, |acc, &v| acc + v),
                ReduceKind::Max => src.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v)),
            };
        })
    }

    fn softmax_last_axis(&self, x: &Tensor) -> BackendResult<Tensor> {
        if x.shape().rank() == 0 {
            return Err(BackendError::shape(
                "softmax_last_axis",
                "cannot take softmax of a rank-0 tensor",
            ));
        }
        let n = x.shape().last_dim();
        let values = x.data();
        self.fill(x.shape().dims().to_vec(), n, &|r, row| {
            let src = &values[r * n..(r + 1) * n];
            let max = src.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
            for (slot, &v) in row.iter_mut().zip(src) {
                *slot = (v - max).exp();
            }
            let sum = row.iter().fold(0.0f32, |acc, &v| acc + v);
            for slot in row.iter_mut() {
                *slot /= sum;
            }
        })
    }

    fn permute(&self, x: &Tensor, axes: &[usize]) -> BackendResult<Tensor> {
        let in_dims = x.shape().dims();
        let mut seen = vec![false; in_dims.len()];
        let valid = axes.len() == in_dims.len()
            && axes
                .iter()
                .all(|&ax| ax < seen.len() && !std::mem::replace(&mut seen[ax], true));
        if !valid {
            return Err(BackendError::shape(
                "permute",
                format!("{:?} is not a permutation of the axes of {:?}", axes, in_dims),
            ));
        }
        let out_dims: Vec<usize> = axes.iter().map(|&ax| in_dims[ax]).collect();
        let in_strides = compute_strides(in_dims);
        let strides: Vec<usize> = axes.iter().map(|&ax| in_strides[ax]).collect();
        let values = x.data();
        let row_len = out_dims.last().copied().unwrap_or(1);
        let lead_dims = out_dims[..out_dims.len().saturating_sub(1)].to_vec();
        let inner_stride = strides.last().copied().unwrap_or(0);
        self.fill(out_dims.clone(), row_len, &|r, row| {
            let coords = unravel_index(r, &lead_dims);
            let base: usize = coords.iter().zip(&strides).map(|(c, s)| c * s).sum();
            for (c, slot) in row.iter_mut().enumerate() {
                *slot = values[base + c * inner_stride];
            }
        })
    }

    fn slice_last_axis(&self, x: &Tensor, start: usize, len: usize) -> BackendResult<Tensor> {
        let dims = x.shape().dims();
        let n = x.shape().last_dim();
        if dims.is_empty() || start.checked_add(len).map_or(true, |end| end > n) {
            return Err(BackendError::shape(
                "slice_last_axis",
                format!("range {}..{} is outside the last axis of {:?}", start, start.saturating_add(len), dims),
            ));
        }
        let values = x.data();
        self.fill(x.shape().with_last_dim(len).dims().to_vec(), len, &|r, row| {
            let base = r * n + start;
            row.copy_from_slice(&values[base..base + len]);
        })
    }

    fn gather_rows(&self, table: &Tensor, indices: &[usize]) -> BackendResult<Tensor> {
        let dims = table.shape().dims();
        if dims.len() != 2 {
            return Err(BackendError::shape(
                "gather_rows",
                format!("expected a [rows, cols] table, got {:?}", dims),
            ));
        }
        let (rows, cols) = (dims[0], dims[1]);
        if let Some(&bad) = indices.iter().find(|&&idx| idx >= rows) {
            return Err(BackendError::shape(
                "gather_rows",
                format!("index {} out of range for {} rows", bad, rows),
            ));
        }
        let values = table.data();
        self.fill(vec![indices.len(), cols], cols, &|r, row| {
            let base = indices[r] * cols;
            row.copy_from_slice(&values[base..base + cols]);
        })
    }
}

/// Resolved `[m, k] x [k, n]` extents plus the rhs layout chosen by `MatmulSpec`.
#[derive(Clone, Copy)]
struct MatmulDims {
    m: usize,
    k: usize,
    n: usize,
    transpose_rhs: bool,
}

impl MatmulDims {
    fn resolve(
        op: &'static str,
        m: usize,
        k: usize,
        rhs: &[usize],
        spec: MatmulSpec,
    ) -> BackendResult<Self> {
        let (rhs_k, n) = if spec.transpose_rhs {
            (rhs[1], rhs[0])
        } else {
            (rhs[0], rhs[1])
        };
        if rhs_k != k {
            return Err(BackendError::shape(
                op,
                format!(
                    "contraction extents differ: lhs has {} but rhs has {} (transpose_rhs={})",
                    k, rhs_k, spec.transpose_rhs
                ),
            ));
        }
        Ok(Self {
            m,
            k,
            n,
            transpose_rhs: spec.transpose_rhs,
        })
    }

    /// Fills one output row from one lhs row; `p` ascends from `0.0` for every element.
    #[inline]
    fn row(&self, lhs_row: &[f32], rhs: &[f32], out: &mut [f32]) {
        for (j, slot) in out.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for (p, &a) in lhs_row.iter().enumerate() {
                let b = if self.transpose_rhs {
                    rhs[j * self.k + p]
                } else {
                    rhs[p * self.n + j]
                };
                sum += a * b;
            }
            *slot = sum;
        }
    }
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(dims: &[usize], data: &[f32]) -> Tensor {
        Tensor::from_vec(dims, data.to_vec()).unwrap()
    }

    #[test]
    fn transposed_matmul_matches_explicit_transpose() {
        let backend = CpuPortableBackend::new();
        let a = t(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = t(&[3, 2], &[1.0, 0.5, -1.0, 2.0, 0.0, 1.0]);
        let bt = backend.permute(&b, &[1, 0]).unwrap();
        let plain = backend.matmul(&a, &b, MatmulSpec::default()).unwrap();
        let transposed = backend
            .matmul(&a, &bt, MatmulSpec::transposed_rhs())
            .unwrap();
        assert_eq!(plain.data(), &[-1.0, 7.5, -1.0, 18.0]);
        assert!(plain.bitwise_eq(&transposed));
    }

    #[test]
    fn broadcast_modes_line_up_rows() {
        let backend = CpuPortableBackend::new();
        let x = t(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let bias = t(&[2], &[10.0, 20.0]);
        let stats = t(&[2, 1], &[1.0, 2.0]);
        let biased = backend
            .broadcast_rows(ElementwiseBinaryOp::Add, &x, &bias, BroadcastMode::Trailing)
            .unwrap();
        assert_eq!(biased.data(), &[11.0, 22.0, 13.0, 24.0]);
        let scaled = backend
            .broadcast_rows(ElementwiseBinaryOp::Div, &x, &stats, BroadcastMode::KeepDims)
            .unwrap();
        assert_eq!(scaled.data(), &[1.0, 2.0, 1.5, 2.0]);
        assert!(backend
            .broadcast_rows(ElementwiseBinaryOp::Add, &x, &stats, BroadcastMode::Trailing)
            .is_err());
    }

    #[test]
    fn permute_moves_heads_forward() {
        let backend = CpuPortableBackend::new();
        let x = t(&[1, 2, 2, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let y = backend.permute(&x, &[0, 2, 1, 3]).unwrap();
        assert_eq!(y.shape().dims(), &[1, 2, 2, 2]);
        assert_eq!(y.data(), &[0.0, 1.0, 4.0, 5.0, 2.0, 3.0, 6.0, 7.0]);
        assert!(backend.permute(&x, &[0, 0, 1, 2]).is_err());
    }

    #[test]
    fn softmax_rows_sum_to_one_and_mask_vanishes() {
        let backend = CpuPortableBackend::new();
        let x = t(&[2, 3], &[1.0, 2.0, 3.0, 0.5, -1e9, -1e9]);
        let y = backend.softmax_last_axis(&x).unwrap();
        let sums = backend.reduce_last_axis(ReduceKind::Sum, &y).unwrap();
        for &s in sums.data() {
            assert!((s - 1.0).abs() < 1e-6);
        }
        assert_eq!(&y.data()[3..], &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn gather_and_slice_copy_exact_values() {
        let backend = CpuPortableBackend::new();
        let table = t(&[3, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let rows = backend.gather_rows(&table, &[2, 0, 2]).unwrap();
        assert_eq!(rows.data(), &[4.0, 5.0, 0.0, 1.0, 4.0, 5.0]);
        assert!(backend.gather_rows(&table, &[3]).is_err());
        let right = backend.slice_last_axis(&table, 1, 1).unwrap();
        assert_eq!(right.shape().dims(), &[3, 1]);
        assert_eq!(right.data(), &[1.0, 3.0, 5.0]);
        assert!(backend.slice_last_axis(&table, 1, 2).is_err());
    }
}
