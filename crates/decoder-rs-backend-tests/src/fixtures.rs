//! Small models and synthetic checkpoints shared by the backend suites.

use anyhow::Result;
use decoder_rs::model::{openai_tensor_names, OpenAiCheckpoint, OpenAiConfig};
use decoder_rs::{ModelConfig, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// 37-token vocabulary, 3 heads, 2 blocks, width 12, hidden 13, 24 positions.
pub fn small_config(ignore_mask: bool) -> ModelConfig {
    ModelConfig {
        vocab_size: 37,
        num_heads: 3,
        num_layers: 2,
        embedding_dim: 12,
        d_hid: 13,
        max_len: 24,
        ignore_mask,
        debug: true,
        ..ModelConfig::default()
    }
}

/// Same shape as [`small_config`] once the 3 special tokens are appended.
pub fn small_openai_config() -> OpenAiConfig {
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

/// Published shape of the array called `name`.
pub fn openai_array_shape(config: &OpenAiConfig, name: &str) -> Vec<usize> {
    let d = config.n_embd;
    let leaf = name.rsplit_once("/h").map_or(name, |(_, rest)| {
        rest.split_once('/').map_or(rest, |(_, leaf)| leaf)
    });
    match leaf {
        "model/pos_emb" => vec![config.n_ctx, d],
        "model/tok_emb" => vec![config.n_vocab, d],
        "attn/c_attn/w" => vec![1, d, 3 * d],
        "attn/c_attn/b" => vec![3 * d],
        "attn/c_proj/w" => vec![1, d, d],
        "mlp/c_fc/w" => vec![1, d, config.d_hid],
        "mlp/c_fc/b" => vec![config.d_hid],
        "mlp/c_proj/w" => vec![1, config.d_hid, d],
        _ => vec![d],
    }
}

/// Random arrays in published order. Layer-norm gains sit around 1 so activations stay sane.
pub fn synthetic_openai_checkpoint(config: &OpenAiConfig, seed: u64) -> Result<OpenAiCheckpoint> {
    let mut rng = StdRng::seed_from_u64(seed);
    let arrays = openai_tensor_names(config)
        .iter()
        .map(|name| {
            let mut tensor = Tensor::randn(openai_array_shape(config, name), 0.1, &mut rng);
            if name.ends_with("/g") {
                tensor.map_inplace(|v| v + 1.0);
            }
            tensor
        })
        .collect();
    OpenAiCheckpoint::from_ordered(config, arrays)
}
