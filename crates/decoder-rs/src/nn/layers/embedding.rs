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
use crate::tensor::{DeviceTensor, IntoDeviceTensor, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub num_embeddings: usize,
    pub embedding_dim: usize,
}

/// Lookup table mapping integer ids to rows of `weight: (num_embeddings, embedding_dim)`.
pub struct Embedding<B: PortableBackend + ?Sized + 'static> {
    backend: Arc<B>,
    pub weight: DeviceTensor<B>,
}

impl<B: PortableBackend + ?Sized + 'static> Embedding<B> {
    pub fn new<W>(backend: Arc<B>, weight: W) -> Result<Self>
    where
        W: IntoDeviceTensor<B>,
    {
        let weight = weight.into_device_tensor(&backend)?;
        ensure!(
            weight.shape().rank() == 2,
            "embedding table must be 2D, got {:?}",
            weight.shape().dims()
        );
        Ok(Self { backend, weight })
    }

    pub fn random(backend: Arc<B>, config: EmbeddingConfig, rng: &mut impl Rng) -> Result<Self> {
        let weight = Tensor::randn([config.num_embeddings, config.embedding_dim], INIT_STD, rng);
        Self::new(backend, weight)
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.shape().dims()[0]
    }

    pub fn embedding_dim(&self) -> usize {
        self.weight.shape().dims()[1]
    }

    /// Gathers rows for row-major `ids` laid out as `leading`, returning `(*leading, dim)`.
    pub fn forward(&self, ids: &[usize], leading: &[usize]) -> Result<DeviceTensor<B>> {
        functional::embedding_lookup(self.backend.as_ref(), &self.weight, ids, leading)
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }
}

impl<B: PortableBackend + ?Sized + 'static> Clone for Embedding<B> {
    fn clone(&self) -> Self {
        Embedding {
            backend: Arc::clone(&self.backend),
            weight: self.weight.clone(),
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> fmt::Debug for Embedding<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedding")
            .field("weight", &self.weight)
            .finish()
    }
}

impl<B: PortableBackend + ?Sized + 'static> Module<B> for Embedding<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.param("weight", TensorRole::Parameter, &self.weight)
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.param("weight", TensorRole::Parameter, &mut self.weight)
    }
}

impl<B: PortableBackend + ?Sized + 'static> Layer<B> for Embedding<B> {
    const CLASS_NAME: &'static str = "Embedding";

    fn config(&self) -> Result<Value> {
        to_config(&EmbeddingConfig {
            num_embeddings: self.num_embeddings(),
            embedding_dim: self.embedding_dim(),
        })
    }

    fn restore(
        _registry: &LayerRegistry<B>,
        backend: Arc<B>,
        config: &Value,
        params: &mut dyn ParamFetch,
    ) -> Result<Self> {
        let config: EmbeddingConfig = parse_config(Self::CLASS_NAME, config)?;
        let weight =
            params.fetch_shaped("weight", &[config.num_embeddings, config.embedding_dim])?;
        Self::new(backend, weight)
    }
}
