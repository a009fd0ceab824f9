//! Dense projection layer (`Conv1D` in GPT checkpoints).
//!
//! Accepts inputs of any rank >= 2: leading axes are flattened into rows, projected with a
//! single matmul, and restored afterwards.

use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse_config, to_config, Layer, INIT_STD};
use crate::backend::spec::PortableBackend;
use crate::model::registry::LayerRegistry;
use crate::module::{Module, ParamVisitor, ParamVisitorMut, TensorRole};
use crate::ops::functional;
use crate::params::ParamFetch;
use crate::tensor::{DeviceTensor, DeviceTensorOps, IntoDeviceTensor, IntoDeviceTensorOption, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearConfig {
    pub in_features: usize,
    pub out_features: usize,
    #[serde(default = "default_use_bias")]
    pub use_bias: bool,
}

fn default_use_bias() -> bool {
    true
}

/// Fully connected layer `y = x W + b` with `W: (in, out)`.
pub struct Linear<B: PortableBackend + ?Sized + 'static> {
    backend: Arc<B>,
    pub weight: DeviceTensor<B>,
    pub bias: Option<DeviceTensor<B>>,
}

impl<B: PortableBackend + ?Sized + 'static> Linear<B> {
    /// Uploads the weight matrix and optional bias to the backend and returns a linear layer.
    pub fn new<W, Bi>(backend: Arc<B>, weight: W, bias: Bi) -> Result<Self>
    where
        W: IntoDeviceTensor<B>,
        Bi: IntoDeviceTensorOption<B>,
    {
        let weight = weight.into_device_tensor(&backend)?;
        let weight_dims = weight.shape().dims();
        ensure!(
            weight_dims.len() == 2,
            "linear weight must be 2D, got {:?}",
            weight_dims
        );
        let bias = bias.into_device_tensor_option(&backend)?;
        if let Some(bias) = &bias {
            ensure!(
                bias.shape().dims() == [weight_dims[1]],
                "linear bias {:?} must match output features {}",
                bias.shape().dims(),
                weight_dims[1]
            );
        }
        Ok(Self {
            backend,
            weight,
            bias,
        })
    }

    /// `N(0, 0.02)` weights and zero bias.
    pub fn random(backend: Arc<B>, config: LinearConfig, rng: &mut impl Rng) -> Result<Self> {
        let weight = Tensor::randn([config.in_features, config.out_features], INIT_STD, rng);
        let bias = config
            .use_bias
            .then(|| Tensor::zeros([config.out_features]));
        Self::new(backend, weight, bias)
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape().dims()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape().dims()[1]
    }

    /// Projects the last axis of `input` from `in_features` to `out_features`.
    pub fn forward(&self, input: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let dims = input.shape().dims();
        ensure!(
            dims.len() >= 2,
            "linear expects input of rank >= 2, got shape {:?}",
            dims
        );
        let features = dims[dims.len() - 1];
        ensure!(
            features == self.in_features(),
            "input features ({}) must match weight rows ({})",
            features,
            self.in_features()
        );
        let rows = input.shape().leading_rows();
        let mut output = input.reshape([rows, features])?.matmul(&self.weight)?;
        if let Some(bias) = &self.bias {
            output = functional::add_bias(self.backend.as_ref(), &output, bias)?;
        }
        output.reshape(input.shape().with_last_dim(self.out_features()))
    }

    /// Returns the backend that owns the layer parameters.
    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    fn linear_config(&self) -> LinearConfig {
        LinearConfig {
            in_features: self.in_features(),
            out_features: self.out_features(),
            use_bias: self.bias.is_some(),
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> Clone for Linear<B> {
    fn clone(&self) -> Self {
        Linear {
            backend: Arc::clone(&self.backend),
            weight: self.weight.clone(),
            bias: self.bias.clone(),
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> fmt::Debug for Linear<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linear")
            .field("weight", &self.weight)
            .field("bias", &self.bias)
            .finish()
    }
}

impl<B: PortableBackend + ?Sized + 'static> Module<B> for Linear<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.param("weight", TensorRole::Parameter, &self.weight)?;
        if let Some(bias) = &self.bias {
            v.param("bias", TensorRole::Parameter, bias)?;
        }
        Ok(())
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.param("weight", TensorRole::Parameter, &mut self.weight)?;
        if let Some(bias) = &mut self.bias {
            v.param("bias", TensorRole::Parameter, bias)?;
        }
        Ok(())
    }
}

impl<B: PortableBackend + ?Sized + 'static> Layer<B> for Linear<B> {
    const CLASS_NAME: &'static str = "Linear";

    fn config(&self) -> Result<Value> {
        to_config(&self.linear_config())
    }

    fn restore(
        _registry: &LayerRegistry<B>,
        backend: Arc<B>,
        config: &Value,
        params: &mut dyn ParamFetch,
    ) -> Result<Self> {
        let config: LinearConfig = parse_config(Self::CLASS_NAME, config)?;
        let weight = params.fetch_shaped("weight", &[config.in_features, config.out_features])?;
        let bias = if config.use_bias {
            Some(params.fetch_shaped("bias", &[config.out_features])?)
        } else {
            None
        };
        Self::new(backend, weight, bias)
    }
}
