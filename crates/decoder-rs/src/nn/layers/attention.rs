//! Multi-head self-attention with a fused `c_attn` projection and an output `c_proj`.

use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{check_rate, parse_config, to_config, Layer, Linear, LinearConfig};
use crate::backend::spec::PortableBackend;
use crate::error::ModelError;
use crate::model::registry::LayerRegistry;
use crate::module::{Module, ParamVisitor, ParamVisitorMut};
use crate::ops::functional::{self, AttentionConfig, ForwardContext};
use crate::params::{scoped, ParamFetch};
use crate::tensor::DeviceTensor;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelfAttentionConfig {
    pub num_heads: usize,
    pub embedding_dim: usize,
    #[serde(default)]
    pub attention_dropout: f32,
    /// Let every query attend to every key instead of applying the causal mask.
    #[serde(default)]
    pub ignore_mask: bool,
    /// Carried for config round trips; embedding dropout itself lives in the model.
    #[serde(default)]
    pub use_one_embedding_dropout: bool,
}

impl SelfAttentionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.embedding_dim == 0 {
            return Err(ModelError::configuration(format!(
                "attention needs positive num_heads and embedding_dim, got {} and {}",
                self.num_heads, self.embedding_dim
            ))
            .into());
        }
        if self.embedding_dim % self.num_heads != 0 {
            return Err(ModelError::configuration(format!(
                "embedding_dim {} must be divisible by num_heads {}",
                self.embedding_dim, self.num_heads
            ))
            .into());
        }
        check_rate("attention_dropout", self.attention_dropout)
    }

    pub fn head_dim(&self) -> usize {
        self.embedding_dim / self.num_heads
    }
}

pub struct SelfAttention<B: PortableBackend + ?Sized + 'static> {
    backend: Arc<B>,
    pub config: SelfAttentionConfig,
    /// `(d, 3d)` projection producing `[q | k | v]`.
    pub c_attn: Linear<B>,
    /// `(d, d)` output projection.
    pub c_proj: Linear<B>,
}

impl<B: PortableBackend + ?Sized + 'static> SelfAttention<B> {
    pub fn new(
        backend: Arc<B>,
        config: SelfAttentionConfig,
        c_attn: Linear<B>,
        c_proj: Linear<B>,
    ) -> Result<Self> {
        config.validate()?;
        let d = config.embedding_dim;
        ensure!(
            c_attn.in_features() == d && c_attn.out_features() == 3 * d,
            "c_attn must map {d} -> {}, got {} -> {}",
            3 * d,
            c_attn.in_features(),
            c_attn.out_features()
        );
        ensure!(
            c_proj.in_features() == d && c_proj.out_features() == d,
            "c_proj must map {d} -> {d}, got {} -> {}",
            c_proj.in_features(),
            c_proj.out_features()
        );
        Ok(Self {
            backend,
            config,
            c_attn,
            c_proj,
        })
    }

    pub fn random(backend: Arc<B>, config: SelfAttentionConfig, rng: &mut impl Rng) -> Result<Self> {
        config.validate()?;
        let d = config.embedding_dim;
        let c_attn = Linear::random(
            Arc::clone(&backend),
            LinearConfig {
                in_features: d,
                out_features: 3 * d,
                use_bias: true,
            },
            rng,
        )?;
        let c_proj = Linear::random(
            Arc::clone(&backend),
            LinearConfig {
                in_features: d,
                out_features: d,
                use_bias: true,
            },
            rng,
        )?;
        Self::new(backend, config, c_attn, c_proj)
    }

    pub fn forward(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        self.forward_with_context(x, &mut ForwardContext::inference())
    }

    /// `x: (b, s, d)` to `(b, s, d)`.
    pub fn forward_with_context(
        &self,
        x: &DeviceTensor<B>,
        ctx: &mut ForwardContext,
    ) -> Result<DeviceTensor<B>> {
        let dims = x.shape().dims();
        ensure!(
            dims.len() == 3 && dims[2] == self.config.embedding_dim,
            "self-attention expects (batch, seq, {}), got {:?}",
            self.config.embedding_dim,
            dims
        );
        let qkv = self.c_attn.forward(x)?;
        let attn = functional::attention(
            self.backend.as_ref(),
            &qkv,
            &AttentionConfig {
                num_heads: self.config.num_heads,
                ignore_mask: self.config.ignore_mask,
                dropout: self.config.attention_dropout,
            },
            ctx,
        )?;
        self.c_proj.forward(&attn.output)
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }
}

impl<B: PortableBackend + ?Sized + 'static> Clone for SelfAttention<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config,
            c_attn: self.c_attn.clone(),
            c_proj: self.c_proj.clone(),
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> fmt::Debug for SelfAttention<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfAttention")
            .field("config", &self.config)
            .field("c_attn", &self.c_attn)
            .field("c_proj", &self.c_proj)
            .finish()
    }
}

impl<B: PortableBackend + ?Sized + 'static> Module<B> for SelfAttention<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.scoped("c_attn", |v| self.c_attn.visit_params(v))?;
        v.scoped("c_proj", |v| self.c_proj.visit_params(v))
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.scoped("c_attn", |v| self.c_attn.visit_params_mut(v))?;
        v.scoped("c_proj", |v| self.c_proj.visit_params_mut(v))
    }
}

impl<B: PortableBackend + ?Sized + 'static> Layer<B> for SelfAttention<B> {
    const CLASS_NAME: &'static str = "SelfAttention";

    fn config(&self) -> Result<Value> {
        to_config(&self.config)
    }

    fn restore(
        registry: &LayerRegistry<B>,
        backend: Arc<B>,
        config: &Value,
        params: &mut dyn ParamFetch,
    ) -> Result<Self> {
        let config: SelfAttentionConfig = parse_config(Self::CLASS_NAME, config)?;
        config.validate()?;
        let d = config.embedding_dim;
        let c_attn = Linear::restore(
            registry,
            Arc::clone(&backend),
            &to_config(&LinearConfig {
                in_features: d,
                out_features: 3 * d,
                use_bias: true,
            })?,
            &mut scoped(params, "c_attn"),
        )?;
        let c_proj = Linear::restore(
            registry,
            Arc::clone(&backend),
            &to_config(&LinearConfig {
                in_features: d,
                out_features: d,
                use_bias: true,
            })?,
            &mut scoped(params, "c_proj"),
        )?;
        Self::new(backend, config, c_attn, c_proj)
    }
}
