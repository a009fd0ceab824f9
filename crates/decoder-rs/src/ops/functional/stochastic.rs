//! Dropout and the forward-pass context that decides whether it is active.
//!
//! Masks are sampled on the host from the context RNG in row-major order and applied with a
//! backend multiply, so a fixed seed produces the same outputs on every backend.

use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::spec::{ElementwiseBinaryOp, PortableBackend};
use crate::tensor::{DeviceTensor, Tensor};

/// Learning phase of a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Inference,
    Training { seed: u64 },
}

/// State threaded through a forward pass.
pub struct ForwardContext {
    rng: Option<StdRng>,
}

impl ForwardContext {
    pub fn inference() -> Self {
        ForwardContext { rng: None }
    }

    pub fn training(seed: u64) -> Self {
        ForwardContext {
            rng: Some(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Inference => Self::inference(),
            Phase::Training { seed } => Self::training(seed),
        }
    }

    pub fn is_training(&self) -> bool {
        self.rng.is_some()
    }
}

enum DropoutPlan {
    NoOp,
    Apply { keep_prob: f32 },
}

fn validate_dropout(p: f32, training: bool) -> Result<DropoutPlan> {
    ensure!(
        (0.0..1.0).contains(&p),
        "dropout probability must be in [0, 1), got {p}"
    );
    if p == 0.0 || !training {
        return Ok(DropoutPlan::NoOp);
    }
    Ok(DropoutPlan::Apply { keep_prob: 1.0 - p })
}

/// Inverted dropout: zeroes each element with probability `p` and scales survivors by
/// `1 / (1 - p)`. Outside the training phase the input is returned untouched.
pub fn dropout<B: PortableBackend + ?Sized + 'static>(
    backend: &B,
    x: &DeviceTensor<B>,
    p: f32,
    ctx: &mut ForwardContext,
) -> Result<DeviceTensor<B>> {
    let keep_prob = match validate_dropout(p, ctx.is_training())? {
        DropoutPlan::NoOp => return Ok(x.clone()),
        DropoutPlan::Apply { keep_prob } => keep_prob,
    };
    let Some(rng) = ctx.rng.as_mut() else {
        return Ok(x.clone());
    };
    let scale = 1.0 / keep_prob;
    let mask: Vec<f32> = (0..x.shape().num_elements())
        .map(|_| {
            if rng.gen::<f32>() < keep_prob {
                scale
            } else {
                0.0
            }
        })
        .collect();
    let mask = Tensor::from_vec(x.shape().clone(), mask)?;
    DeviceTensor::from_kernel(
        x.backend(),
        backend.elementwise_binary(ElementwiseBinaryOp::Mul, x.host(), &mask),
    )
}
