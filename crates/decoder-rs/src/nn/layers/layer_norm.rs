//! Layer normalization wrapper backed by the functional portable implementation.

use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse_config, to_config, Layer};
use crate::backend::spec::PortableBackend;
use crate::model::registry::LayerRegistry;
use crate::module::{Module, ParamVisitor, ParamVisitorMut, TensorRole};
use crate::ops::functional;
use crate::params::ParamFetch;
use crate::tensor::{DeviceTensor, IntoDeviceTensor, Tensor};

pub const DEFAULT_LAYER_NORM_EPS: f32 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerNormConfig {
    pub features: usize,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
}

fn default_epsilon() -> f32 {
    DEFAULT_LAYER_NORM_EPS
}

/// Layer normalization with learnable `gain` and `bias` over the last axis.
pub struct LayerNormalization<B: PortableBackend + ?Sized + 'static> {
    backend: Arc<B>,
    pub gain: DeviceTensor<B>,
    pub bias: DeviceTensor<B>,
    pub eps: f32,
}

impl<B: PortableBackend + ?Sized + 'static> LayerNormalization<B> {
    /// Uploads the affine parameters to the backend and stores the epsilon value.
    pub fn new<G, T>(backend: Arc<B>, gain: G, bias: T, eps: f32) -> Result<Self>
    where
        G: IntoDeviceTensor<B>,
        T: IntoDeviceTensor<B>,
    {
        let gain = gain.into_device_tensor(&backend)?;
        let bias = bias.into_device_tensor(&backend)?;
        ensure!(
            gain.shape().rank() == 1 && gain.shape() == bias.shape(),
            "layer norm gain {:?} and bias {:?} must be matching vectors",
            gain.shape().dims(),
            bias.shape().dims()
        );
        Ok(Self {
            backend,
            gain,
            bias,
            eps,
        })
    }

    /// Gain of ones and bias of zeros.
    pub fn identity(backend: Arc<B>, config: LayerNormConfig) -> Result<Self> {
        Self::new(
            backend,
            Tensor::ones([config.features]),
            Tensor::zeros([config.features]),
            config.epsilon,
        )
    }

    pub fn features(&self) -> usize {
        self.gain.shape().dims()[0]
    }

    pub fn forward(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        functional::layer_norm(self.backend.as_ref(), x, &self.gain, &self.bias, self.eps)
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }
}

impl<B: PortableBackend + ?Sized + 'static> Clone for LayerNormalization<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            gain: self.gain.clone(),
            bias: self.bias.clone(),
            eps: self.eps,
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> fmt::Debug for LayerNormalization<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerNormalization")
            .field("gain", &self.gain)
            .field("bias", &self.bias)
            .field("eps", &self.eps)
            .finish()
    }
}

impl<B: PortableBackend + ?Sized + 'static> Module<B> for LayerNormalization<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.param("gain", TensorRole::Parameter, &self.gain)?;
        v.param("bias", TensorRole::Parameter, &self.bias)
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.param("gain", TensorRole::Parameter, &mut self.gain)?;
        v.param("bias", TensorRole::Parameter, &mut self.bias)
    }
}

impl<B: PortableBackend + ?Sized + 'static> Layer<B> for LayerNormalization<B> {
    const CLASS_NAME: &'static str = "LayerNormalization";

    fn config(&self) -> Result<Value> {
        to_config(&LayerNormConfig {
            features: self.features(),
            epsilon: self.eps,
        })
    }

    fn restore(
        _registry: &LayerRegistry<B>,
        backend: Arc<B>,
        config: &Value,
        params: &mut dyn ParamFetch,
    ) -> Result<Self> {
        let config: LayerNormConfig = parse_config(Self::CLASS_NAME, config)?;
        let gain = params.fetch_shaped("gain", &[config.features])?;
        let bias = params.fetch_shaped("bias", &[config.features])?;
        Self::new(backend, gain, bias, config.epsilon)
    }
}
