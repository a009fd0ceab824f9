//! Dense matrix products.

use anyhow::{ensure, Result};

use crate::backend::spec::{MatmulSpec, PortableBackend};
use crate::ops::functional::common::{ensure_rank, ensure_same_backend};
use crate::tensor::DeviceTensor;

/// Validates operand ranks and the shared contraction axis.
///
/// `rank` is 2 for plain matmuls and 3 for batched ones; batched operands must also agree on
/// the leading axis.
fn validate_matmul<B: PortableBackend + ?Sized + 'static>(
    op: &str,
    a: &DeviceTensor<B>,
    b: &DeviceTensor<B>,
    spec: MatmulSpec,
    rank: usize,
) -> Result<()> {
    ensure_same_backend(op, a, b)?;
    ensure_rank(&format!("{op} lhs"), a, rank)?;
    ensure_rank(&format!("{op} rhs"), b, rank)?;
    let a_dims = a.shape().dims();
    let b_dims = b.shape().dims();
    if rank == 3 {
        ensure!(
            a_dims[0] == b_dims[0],
            "{op} batch dimensions differ: {:?} vs {:?}",
            a_dims,
            b_dims
        );
    }
    let k_lhs = a_dims[rank - 1];
    let k_rhs = if spec.transpose_rhs {
        b_dims[rank - 1]
    } else {
        b_dims[rank - 2]
    };
    ensure!(
        k_lhs == k_rhs,
        "{op} contraction mismatch: lhs {:?}, rhs {:?} (transpose_rhs = {})",
        a_dims,
        b_dims,
        spec.transpose_rhs
    );
    Ok(())
}

/// `[m, k] x [k, n] -> [m, n]`, or `[m, k] x [n, k]^T` when `spec.transpose_rhs` is set.
pub fn matmul<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    a: &DeviceTensor<B>,
    b: &DeviceTensor<B>,
    spec: MatmulSpec,
) -> Result<DeviceTensor<B>> {
    validate_matmul("matmul", a, b, spec, 2)?;
    DeviceTensor::from_kernel(a.backend(), backend.matmul(a.host(), b.host(), spec))
}

/// `[batch, m, k] x [batch, k, n] -> [batch, m, n]`.
pub fn batched_matmul<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    a: &DeviceTensor<B>,
    b: &DeviceTensor<B>,
    spec: MatmulSpec,
) -> Result<DeviceTensor<B>> {
    validate_matmul("batched_matmul", a, b, spec, 3)?;
    DeviceTensor::from_kernel(a.backend(), backend.batched_matmul(a.host(), b.host(), spec))
}
