//! Position-wise feed-forward block: `c_fc -> Gelu -> c_proj`.

use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse_config, to_config, Gelu, Layer, LayerRecord, Linear, LinearConfig};
use crate::backend::spec::PortableBackend;
use crate::error::ModelError;
use crate::model::registry::LayerRegistry;
use crate::module::{Module, ParamVisitor, ParamVisitorMut};
use crate::params::{scoped, ParamFetch};
use crate::tensor::DeviceTensor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedForwardConfig {
    pub embedding_dim: usize,
    pub d_hid: usize,
    /// Activation between the projections, rebuilt through the layer registry.
    pub activation: LayerRecord,
}

pub struct FeedForward<B: PortableBackend + ?Sized + 'static> {
    /// `(d, d_hid)` expansion.
    pub c_fc: Linear<B>,
    pub activation: Gelu<B>,
    /// `(d_hid, d)` contraction.
    pub c_proj: Linear<B>,
}

impl<B: PortableBackend + ?Sized + 'static> FeedForward<B> {
    pub fn new(c_fc: Linear<B>, activation: Gelu<B>, c_proj: Linear<B>) -> Result<Self> {
        ensure!(
            c_fc.out_features() == c_proj.in_features()
                && c_fc.in_features() == c_proj.out_features(),
            "feed-forward projections do not chain: {} -> {} then {} -> {}",
            c_fc.in_features(),
            c_fc.out_features(),
            c_proj.in_features(),
            c_proj.out_features()
        );
        Ok(Self {
            c_fc,
            activation,
            c_proj,
        })
    }

    pub fn random(
        backend: Arc<B>,
        embedding_dim: usize,
        d_hid: usize,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if embedding_dim == 0 || d_hid == 0 {
            return Err(ModelError::configuration(format!(
                "feed-forward sizes must be positive, got embedding_dim {embedding_dim} and d_hid {d_hid}"
            ))
            .into());
        }
        let c_fc = Linear::random(
            Arc::clone(&backend),
            LinearConfig {
                in_features: embedding_dim,
                out_features: d_hid,
                use_bias: true,
            },
            rng,
        )?;
        let c_proj = Linear::random(
            Arc::clone(&backend),
            LinearConfig {
                in_features: d_hid,
                out_features: embedding_dim,
                use_bias: true,
            },
            rng,
        )?;
        Self::new(c_fc, Gelu::new(backend), c_proj)
    }

    pub fn forward(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let hidden = self.c_fc.forward(x)?;
        let activated = self.activation.forward(&hidden)?;
        self.c_proj.forward(&activated)
    }

    pub fn embedding_dim(&self) -> usize {
        self.c_fc.in_features()
    }

    pub fn d_hid(&self) -> usize {
        self.c_fc.out_features()
    }
}

impl<B: PortableBackend + ?Sized + 'static> Clone for FeedForward<B> {
    fn clone(&self) -> Self {
        Self {
            c_fc: self.c_fc.clone(),
            activation: self.activation.clone(),
            c_proj: self.c_proj.clone(),
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> fmt::Debug for FeedForward<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedForward")
            .field("c_fc", &self.c_fc)
            .field("activation", &self.activation)
            .field("c_proj", &self.c_proj)
            .finish()
    }
}

impl<B: PortableBackend + ?Sized + 'static> Module<B> for FeedForward<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.scoped("c_fc", |v| self.c_fc.visit_params(v))?;
        v.scoped("c_proj", |v| self.c_proj.visit_params(v))
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.scoped("c_fc", |v| self.c_fc.visit_params_mut(v))?;
        v.scoped("c_proj", |v| self.c_proj.visit_params_mut(v))
    }
}

impl<B: PortableBackend + ?Sized + 'static> Layer<B> for FeedForward<B> {
    const CLASS_NAME: &'static str = "FeedForward";

    fn config(&self) -> Result<Value> {
        to_config(&FeedForwardConfig {
            embedding_dim: self.embedding_dim(),
            d_hid: self.d_hid(),
            activation: self.activation.record()?,
        })
    }

    fn restore(
        registry: &LayerRegistry<B>,
        backend: Arc<B>,
        config: &Value,
        params: &mut dyn ParamFetch,
    ) -> Result<Self> {
        let config: FeedForwardConfig = parse_config(Self::CLASS_NAME, config)?;
        let c_fc = Linear::restore(
            registry,
            Arc::clone(&backend),
            &to_config(&LinearConfig {
                in_features: config.embedding_dim,
                out_features: config.d_hid,
                use_bias: true,
            })?,
            &mut scoped(params, "c_fc"),
        )?;
        let activation: Gelu<B> =
            registry.build_as(&config.activation, Arc::clone(&backend), params)?;
        let c_proj = Linear::restore(
            registry,
            Arc::clone(&backend),
            &to_config(&LinearConfig {
                in_features: config.d_hid,
                out_features: config.embedding_dim,
                use_bias: true,
            })?,
            &mut scoped(params, "c_proj"),
        )?;
        Self::new(c_fc, activation, c_proj)
    }
}
