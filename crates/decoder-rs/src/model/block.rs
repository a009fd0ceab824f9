//! Post-norm decoder block.

use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::registry::LayerRegistry;
use crate::backend::spec::PortableBackend;
use crate::module::{Module, ParamVisitor, ParamVisitorMut};
use crate::nn::layers::{
    check_rate, parse_config, to_config, FeedForward, Layer, LayerNormConfig, LayerNormalization,
    LayerRecord, SelfAttention, SelfAttentionConfig,
};
use crate::ops::functional::{self, ForwardContext};
use crate::params::{scoped, ParamFetch};
use crate::tensor::{DeviceTensor, DeviceTensorOps};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderBlockConfig {
    pub attention: LayerRecord,
    pub ln_1: LayerRecord,
    pub feed_forward: LayerRecord,
    pub ln_2: LayerRecord,
    #[serde(default)]
    pub residual_dropout: f32,
}

/// `h1 = LN_1(x + drop(attn(x)))`, `h2 = LN_2(h1 + drop(ff(h1)))`.
pub struct DecoderBlock<B: PortableBackend + ?Sized + 'static> {
    backend: Arc<B>,
    pub attention: SelfAttention<B>,
    pub ln_1: LayerNormalization<B>,
    pub feed_forward: FeedForward<B>,
    pub ln_2: LayerNormalization<B>,
    pub residual_dropout: f32,
}

impl<B: PortableBackend + ?Sized + 'static> DecoderBlock<B> {
    pub fn new(
        backend: Arc<B>,
        attention: SelfAttention<B>,
        ln_1: LayerNormalization<B>,
        feed_forward: FeedForward<B>,
        ln_2: LayerNormalization<B>,
        residual_dropout: f32,
    ) -> Result<Self> {
        check_rate("residual_dropout", residual_dropout)?;
        let d = attention.config.embedding_dim;
        ensure!(
            ln_1.features() == d && ln_2.features() == d && feed_forward.embedding_dim() == d,
            "decoder block parts disagree on the embedding width {d}"
        );
        Ok(Self {
            backend,
            attention,
            ln_1,
            feed_forward,
            ln_2,
            residual_dropout,
        })
    }

    pub fn random(
        backend: Arc<B>,
        attention: SelfAttentionConfig,
        d_hid: usize,
        layer_norm_epsilon: f32,
        residual_dropout: f32,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        check_rate("residual_dropout", residual_dropout)?;
        let d = attention.embedding_dim;
        let ln = LayerNormConfig {
            features: d,
            epsilon: layer_norm_epsilon,
        };
        let attention = SelfAttention::random(Arc::clone(&backend), attention, rng)?;
        let ln_1 = LayerNormalization::identity(Arc::clone(&backend), ln)?;
        let feed_forward = FeedForward::random(Arc::clone(&backend), d, d_hid, rng)?;
        let ln_2 = LayerNormalization::identity(Arc::clone(&backend), ln)?;
        Self::new(backend, attention, ln_1, feed_forward, ln_2, residual_dropout)
    }

    pub fn forward(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        self.forward_with_context(x, &mut ForwardContext::inference())
    }

    pub fn forward_with_context(
        &self,
        x: &DeviceTensor<B>,
        ctx: &mut ForwardContext,
    ) -> Result<DeviceTensor<B>> {
        let backend = self.backend.as_ref();
        let attn = self.attention.forward_with_context(x, ctx)?;
        let attn = functional::dropout(backend, &attn, self.residual_dropout, ctx)?;
        let h1 = self.ln_1.forward(&x.add(&attn)?)?;

        let ff = self.feed_forward.forward(&h1)?;
        let ff = functional::dropout(backend, &ff, self.residual_dropout, ctx)?;
        self.ln_2.forward(&h1.add(&ff)?)
    }
}

impl<B: PortableBackend + ?Sized + 'static> Clone for DecoderBlock<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            attention: self.attention.clone(),
            ln_1: self.ln_1.clone(),
            feed_forward: self.feed_forward.clone(),
            ln_2: self.ln_2.clone(),
            residual_dropout: self.residual_dropout,
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> fmt::Debug for DecoderBlock<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderBlock")
            .field("attention", &self.attention)
            .field("ln_1", &self.ln_1)
            .field("feed_forward", &self.feed_forward)
            .field("ln_2", &self.ln_2)
            .field("residual_dropout", &self.residual_dropout)
            .finish()
    }
}

impl<B: PortableBackend + ?Sized + 'static> Module<B> for DecoderBlock<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.scoped("attention", |v| self.attention.visit_params(v))?;
        v.scoped("ln_1", |v| self.ln_1.visit_params(v))?;
        v.scoped("feed_forward", |v| self.feed_forward.visit_params(v))?;
        v.scoped("ln_2", |v| self.ln_2.visit_params(v))
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.scoped("attention", |v| self.attention.visit_params_mut(v))?;
        v.scoped("ln_1", |v| self.ln_1.visit_params_mut(v))?;
        v.scoped("feed_forward", |v| self.feed_forward.visit_params_mut(v))?;
        v.scoped("ln_2", |v| self.ln_2.visit_params_mut(v))
    }
}

impl<B: PortableBackend + ?Sized + 'static> Layer<B> for DecoderBlock<B> {
    const CLASS_NAME: &'static str = "DecoderBlock";

    fn config(&self) -> Result<Value> {
        to_config(&DecoderBlockConfig {
            attention: self.attention.record()?,
            ln_1: self.ln_1.record()?,
            feed_forward: self.feed_forward.record()?,
            ln_2: self.ln_2.record()?,
            residual_dropout: self.residual_dropout,
        })
    }

    fn restore(
        registry: &LayerRegistry<B>,
        backend: Arc<B>,
        config: &Value,
        params: &mut dyn ParamFetch,
    ) -> Result<Self> {
        let config: DecoderBlockConfig = parse_config(Self::CLASS_NAME, config)?;
        let attention = registry.build_as(
            &config.attention,
            Arc::clone(&backend),
            &mut scoped(params, "attention"),
        )?;
        let ln_1 = registry.build_as(&config.ln_1, Arc::clone(&backend), &mut scoped(params, "ln_1"))?;
        let feed_forward = registry.build_as(
            &config.feed_forward,
            Arc::clone(&backend),
            &mut scoped(params, "feed_forward"),
        )?;
        let ln_2 = registry.build_as(&config.ln_2, Arc::clone(&backend), &mut scoped(params, "ln_2"))?;
        Self::new(backend, attention, ln_1, feed_forward, ln_2, config.residual_dropout)
    }
}
