use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::nn::layers::layer_norm::DEFAULT_LAYER_NORM_EPS;
use crate::nn::layers::SelfAttentionConfig;

/// Seed used for every random draw when `debug` is set and no explicit seed is given.
pub const DEBUG_SEED: u64 = 0x5eed_0de6;

/// Hyperparameters of a decoder-only Transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub embedding_dim: usize,
    /// Width of the feed-forward hidden layer.
    pub d_hid: usize,
    /// Number of positions, i.e. rows of the position table.
    pub max_len: usize,
    /// Disable the causal mask so every position attends to every other one.
    pub ignore_mask: bool,
    /// Project hidden states with the transposed token table instead of a separate matrix.
    pub use_tied_decoder: bool,
    /// Seed every random draw deterministically.
    pub debug: bool,
    pub embedding_dropout: f32,
    pub attention_dropout: f32,
    pub residual_dropout: f32,
    /// Apply one dropout to the summed embeddings instead of one per table.
    pub use_one_embedding_dropout: bool,
    /// Learned `(vocab)` bias on the output head.
    pub use_decoder_bias: bool,
    pub layer_norm_epsilon: f32,
    /// Explicit initialization seed; when absent `debug` falls back to [`DEBUG_SEED`].
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 40_478 + 3,
            num_heads: 12,
            num_layers: 12,
            embedding_dim: 768,
            d_hid: 3072,
            max_len: 512,
            ignore_mask: false,
            use_tied_decoder: true,
            debug: false,
            embedding_dropout: 0.1,
            attention_dropout: 0.1,
            residual_dropout: 0.1,
            use_one_embedding_dropout: false,
            use_decoder_bias: false,
            layer_norm_epsilon: DEFAULT_LAYER_NORM_EPS,
            seed: None,
        }
    }
}

impl ModelConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ModelConfig = serde_json::from_str(json)
            .map_err(|err| ModelError::configuration(format!("model config is invalid: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read model config {}", path.display()))?;
        Self::from_json_str(&json)
    }

    /// Checks sizes, head divisibility, dropout ranges, and epsilon.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("num_heads", self.num_heads),
            ("num_layers", self.num_layers),
            ("embedding_dim", self.embedding_dim),
            ("d_hid", self.d_hid),
            ("max_len", self.max_len),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ModelError::configuration(format!("{name} must be positive")).into());
            }
        }
        for (name, rate) in [
            ("embedding_dropout", self.embedding_dropout),
            ("attention_dropout", self.attention_dropout),
            ("residual_dropout", self.residual_dropout),
        ] {
            crate::nn::layers::check_rate(name, rate)?;
        }
        if !(self.layer_norm_epsilon.is_finite() && self.layer_norm_epsilon >= 0.0) {
            return Err(ModelError::configuration(format!(
                "layer_norm_epsilon must be finite and non-negative, got {}",
                self.layer_norm_epsilon
            ))
            .into());
        }
        self.attention_config().validate()
    }

    pub fn attention_config(&self) -> SelfAttentionConfig {
        SelfAttentionConfig {
            num_heads: self.num_heads,
            embedding_dim: self.embedding_dim,
            attention_dropout: self.attention_dropout,
            ignore_mask: self.ignore_mask,
            use_one_embedding_dropout: self.use_one_embedding_dropout,
        }
    }

    /// Seed for parameter initialization, if the config pins one.
    pub fn init_seed(&self) -> Option<u64> {
        match (self.seed, self.debug) {
            (Some(seed), _) => Some(seed),
            (None, true) => Some(DEBUG_SEED),
            (None, false) => None,
        }
    }
}
