//! Importer for the published OpenAI GPT checkpoint.
//!
//! The checkpoint is consumed as a name-to-array mapping through [`PretrainedSource`]; reading
//! the on-disk shards is left to the caller. Arrays keep their published names
//! (`model/h{i}/attn/c_attn/w`, ...) and Conv1D weights keep their leading unit axis.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::block::DecoderBlock;
use super::config::{ModelConfig, DEBUG_SEED};
use super::transformer::{OutputHead, TransformerModel};
use crate::backend::spec::PortableBackend;
use crate::error::ModelError;
use crate::nn::layers::layer_norm::DEFAULT_LAYER_NORM_EPS;
use crate::nn::layers::{
    Embedding, FeedForward, Gelu, LayerNormalization, Linear, LinearConfig, SelfAttention,
    TableHandle, TiedEmbeddingsConfig, TiedEmbeddingsTransposed, INIT_STD,
};
use crate::tensor::Tensor;

/// Hyperparameters of the published checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub n_vocab: usize,
    /// Extra rows appended to the token table for task-specific tokens.
    pub n_special: usize,
    pub n_ctx: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub d_hid: usize,
    pub embd_pdrop: f32,
    pub attn_pdrop: f32,
    pub resid_pdrop: f32,
    pub use_tied_decoder: bool,
    pub use_decoder_bias: bool,
    pub layer_norm_epsilon: f32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            n_vocab: 40_478,
            n_special: 3,
            n_ctx: 512,
            n_embd: 768,
            n_head: 12,
            n_layer: 12,
            d_hid: 3072,
            embd_pdrop: 0.1,
            attn_pdrop: 0.1,
            resid_pdrop: 0.1,
            use_tied_decoder: true,
            use_decoder_bias: false,
            layer_norm_epsilon: DEFAULT_LAYER_NORM_EPS,
        }
    }
}

impl OpenAiConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| {
            ModelError::configuration(format!("openai config is invalid: {err}")).into()
        })
    }

    /// Model hyperparameters for this checkpoint under `options`.
    pub fn model_config(&self, options: &OpenAiLoadOptions) -> ModelConfig {
        ModelConfig {
            vocab_size: self.n_vocab + self.n_special,
            num_heads: self.n_head,
            num_layers: self.n_layer,
            embedding_dim: self.n_embd,
            d_hid: self.d_hid,
            max_len: self.n_ctx,
            ignore_mask: options.ignore_mask,
            use_tied_decoder: self.use_tied_decoder,
            debug: options.debug,
            embedding_dropout: self.embd_pdrop,
            attention_dropout: self.attn_pdrop,
            residual_dropout: self.resid_pdrop,
            use_one_embedding_dropout: options.use_one_embedding_dropout,
            use_decoder_bias: self.use_decoder_bias,
            layer_norm_epsilon: self.layer_norm_epsilon,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenAiLoadOptions {
    pub ignore_mask: bool,
    pub use_one_embedding_dropout: bool,
    /// Seed the special-token rows (and an untied head) deterministically.
    pub debug: bool,
}

impl Default for OpenAiLoadOptions {
    fn default() -> Self {
        Self {
            ignore_mask: false,
            use_one_embedding_dropout: true,
            debug: false,
        }
    }
}

/// Name-addressed arrays of a pretrained checkpoint.
pub trait PretrainedSource {
    fn fetch(&mut self, name: &str) -> Result<Tensor>;
    fn contains(&self, name: &str) -> bool;
}

/// In-memory checkpoint keyed by the published array names.
#[derive(Debug, Clone, Default)]
pub struct OpenAiCheckpoint {
    tensors: HashMap<String, Tensor>,
}

impl OpenAiCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    /// Names arrays by position, in the order the checkpoint publishes them.
    pub fn from_ordered(config: &OpenAiConfig, arrays: Vec<Tensor>) -> Result<Self> {
        let names = openai_tensor_names(config);
        if names.len() != arrays.len() {
            return Err(ModelError::invalid_input(format!(
                "checkpoint with {} layers has {} arrays, got {}",
                config.n_layer,
                names.len(),
                arrays.len()
            ))
            .into());
        }
        Ok(Self {
            tensors: names.into_iter().zip(arrays).collect(),
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tensors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl PretrainedSource for OpenAiCheckpoint {
    fn fetch(&mut self, name: &str) -> Result<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::MissingParameter(name.to_string()).into())
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }
}

fn layer_tensor_names(layer: usize) -> [String; 12] {
    let prefix = format!("model/h{layer}");
    [
        format!("{prefix}/attn/c_attn/w"),
        format!("{prefix}/attn/c_attn/b"),
        format!("{prefix}/attn/c_proj/w"),
        format!("{prefix}/attn/c_proj/b"),
        format!("{prefix}/ln_1/g"),
        format!("{prefix}/ln_1/b"),
        format!("{prefix}/mlp/c_fc/w"),
        format!("{prefix}/mlp/c_fc/b"),
        format!("{prefix}/mlp/c_proj/w"),
        format!("{prefix}/mlp/c_proj/b"),
        format!("{prefix}/ln_2/g"),
        format!("{prefix}/ln_2/b"),
    ]
}

/// Every array the importer reads, in published order.
pub fn openai_tensor_names(config: &OpenAiConfig) -> Vec<String> {
    let mut names = vec!["model/pos_emb".to_string(), "model/tok_emb".to_string()];
    for layer in 0..config.n_layer {
        names.extend(layer_tensor_names(layer));
    }
    names
}

/// Fetches `name` and checks it against the shape the checkpoint format promises.
fn fetch_checked(
    source: &mut dyn PretrainedSource,
    name: &str,
    expected: &[usize],
) -> Result<Tensor> {
    let tensor = source.fetch(name)?;
    if tensor.shape().dims() != expected {
        return Err(ModelError::shape_mismatch(name, expected, tensor.shape().dims()).into());
    }
    Ok(tensor)
}

/// Conv1D weight `(1, in, out)` plus bias `(out)` as a dense layer.
fn conv1d<B: PortableBackend + ?Sized + 'static>(
    backend: &Arc<B>,
    source: &mut dyn PretrainedSource,
    prefix: &str,
    in_features: usize,
    out_features: usize,
) -> Result<Linear<B>> {
    let weight = fetch_checked(
        source,
        &format!("{prefix}/w"),
        &[1, in_features, out_features],
    )?
    .squeeze_leading()?;
    let bias = fetch_checked(source, &format!("{prefix}/b"), &[out_features])?;
    Linear::new(Arc::clone(backend), weight, Some(bias))
}

fn layer_norm<B: PortableBackend + ?Sized + 'static>(
    backend: &Arc<B>,
    source: &mut dyn PretrainedSource,
    prefix: &str,
    features: usize,
    eps: f32,
) -> Result<LayerNormalization<B>> {
    let gain = fetch_checked(source, &format!("{prefix}/g"), &[features])?;
    let bias = fetch_checked(source, &format!("{prefix}/b"), &[features])?;
    LayerNormalization::new(Arc::clone(backend), gain, bias, eps)
}

/// Imports the published checkpoint with its default hyperparameters.
pub fn load_openai_model<B: PortableBackend + ?Sized + 'static>(
    backend: Arc<B>,
    source: &mut dyn PretrainedSource,
    options: OpenAiLoadOptions,
) -> Result<TransformerModel<B>> {
    load_openai_model_with_config(backend, source, &OpenAiConfig::default(), options)
}

/// Imports a checkpoint described by `config`.
///
/// Token rows `[0, n_vocab)` and every position come from the checkpoint. The `n_special`
/// rows appended to the token table are drawn from `N(0, 0.02)`, seeded when `options.debug`
/// is set.
pub fn load_openai_model_with_config<B: PortableBackend + ?Sized + 'static>(
    backend: Arc<B>,
    source: &mut dyn PretrainedSource,
    config: &OpenAiConfig,
    options: OpenAiLoadOptions,
) -> Result<TransformerModel<B>> {
    let model_config = config.model_config(&options);
    model_config.validate()?;
    let mut rng = if options.debug {
        StdRng::seed_from_u64(model_config.init_seed().unwrap_or(DEBUG_SEED))
    } else {
        StdRng::from_entropy()
    };
    let d = config.n_embd;
    let eps = config.layer_norm_epsilon;

    let positions = fetch_checked(source, "model/pos_emb", &[config.n_ctx, d])?;
    let tokens = fetch_checked(source, "model/tok_emb", &[config.n_vocab, d])?;
    let special = Tensor::randn([config.n_special, d], INIT_STD, &mut rng);
    let tok_embeddings = Embedding::new(Arc::clone(&backend), tokens.concat_rows(&special)?)?;
    let pos_embeddings = Embedding::new(Arc::clone(&backend), positions)?;

    let mut blocks = Vec::with_capacity(config.n_layer);
    for layer in 0..config.n_layer {
        let prefix = format!("model/h{layer}");
        let c_attn = conv1d(&backend, source, &format!("{prefix}/attn/c_attn"), d, 3 * d)?;
        let c_proj = conv1d(&backend, source, &format!("{prefix}/attn/c_proj"), d, d)?;
        let attention = SelfAttention::new(
            Arc::clone(&backend),
            model_config.attention_config(),
            c_attn,
            c_proj,
        )?;
        let ln_1 = layer_norm(&backend, source, &format!("{prefix}/ln_1"), d, eps)?;
        let c_fc = conv1d(&backend, source, &format!("{prefix}/mlp/c_fc"), d, config.d_hid)?;
        let c_proj = conv1d(&backend, source, &format!("{prefix}/mlp/c_proj"), config.d_hid, d)?;
        let feed_forward = FeedForward::new(c_fc, Gelu::new(Arc::clone(&backend)), c_proj)?;
        let ln_2 = layer_norm(&backend, source, &format!("{prefix}/ln_2"), d, eps)?;
        blocks.push(DecoderBlock::new(
            Arc::clone(&backend),
            attention,
            ln_1,
            feed_forward,
            ln_2,
            config.resid_pdrop,
        )?);
        log::debug!("imported decoder block {}/{}", layer + 1, config.n_layer);
    }

    let vocab = model_config.vocab_size;
    let head = if config.use_tied_decoder {
        OutputHead::Tied(TiedEmbeddingsTransposed::from_config(
            Arc::clone(&backend),
            TiedEmbeddingsConfig {
                tied_to: TableHandle::TokenEmbeddings,
                units: vocab,
                use_bias: config.use_decoder_bias,
            },
        )?)
    } else {
        OutputHead::Untied(Linear::random(
            Arc::clone(&backend),
            LinearConfig {
                in_features: d,
                out_features: vocab,
                use_bias: config.use_decoder_bias,
            },
            &mut rng,
        )?)
    };

    let model = TransformerModel::assemble(
        backend,
        model_config,
        tok_embeddings,
        pos_embeddings,
        blocks,
        head,
    )?;
    log::debug!(
        "imported openai checkpoint: {} layers, {} special tokens",
        config.n_layer,
        config.n_special
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> OpenAiConfig {
        OpenAiConfig {
            n_vocab: 34,
            n_special: 3,
            n_ctx: 24,
            n_embd: 12,
            n_head: 3,
            n_layer: 2,
            d_hid: 13,
            ..OpenAiConfig::default()
        }
    }

    #[test]
    fn tensor_names_follow_published_order() {
        let names = openai_tensor_names(&small());
        assert_eq!(names.len(), 2 + 2 * 12);
        assert_eq!(names[0], "model/pos_emb");
        assert_eq!(names[1], "model/tok_emb");
        assert_eq!(names[2], "model/h0/attn/c_attn/w");
        assert_eq!(names[13], "model/h0/ln_2/b");
        assert_eq!(names[14], "model/h1/attn/c_attn/w");
    }

    #[test]
    fn ordered_arrays_must_cover_every_name() {
        let err = OpenAiCheckpoint::from_ordered(&small(), vec![Tensor::zeros([1])]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::InvalidInput(_))
        ));
    }

    #[test]
    fn model_config_appends_special_tokens() {
        let options = OpenAiLoadOptions {
            ignore_mask: true,
            ..OpenAiLoadOptions::default()
        };
        let config = small().model_config(&options);
        assert_eq!(config.vocab_size, 37);
        assert_eq!(config.max_len, 24);
        assert!(config.ignore_mask);
        assert!(config.use_one_embedding_dropout);
        assert!(config.use_tied_decoder);
        config.validate().unwrap();
    }

    #[test]
    fn default_config_matches_published_checkpoint() {
        let config = OpenAiConfig::from_json_str("{}").unwrap();
        assert_eq!(config, OpenAiConfig::default());
        let model = config.model_config(&OpenAiLoadOptions::default());
        assert_eq!(model.vocab_size, ModelConfig::default().vocab_size);
    }
}
