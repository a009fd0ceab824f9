//! Neural network layers composed from the functional operators.
//!
//! Every layer implements [`Layer`]: it reports a class name plus a JSON config, and it can be
//! rebuilt from that config and a parameter source. The model's checkpoint manifest is a list of
//! these records, and [`crate::model::registry::LayerRegistry`] maps class names back to
//! constructors.

use std::sync::Arc;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::spec::PortableBackend;
use crate::error::ModelError;
use crate::model::registry::LayerRegistry;
use crate::module::Module;
use crate::params::ParamFetch;

pub mod attention;
pub mod embedding;
pub mod feed_forward;
pub mod gelu;
pub mod layer_norm;
pub mod linear;
pub mod tied;

pub use attention::{SelfAttention, SelfAttentionConfig};
pub use embedding::{Embedding, EmbeddingConfig};
pub use feed_forward::{FeedForward, FeedForwardConfig};
pub use gelu::Gelu;
pub use layer_norm::{LayerNormConfig, LayerNormalization};
pub use linear::{Linear, LinearConfig};
pub use tied::{TableHandle, TiedEmbeddingsConfig, TiedEmbeddingsTransposed};

/// Standard deviation of the normal distribution used for weight initialization.
pub const INIT_STD: f32 = 0.02;

/// Class name plus configuration; enough to rebuild a layer given its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub class_name: String,
    #[serde(default)]
    pub config: Value,
}

/// A layer that can describe and rebuild itself.
pub trait Layer<B: PortableBackend + ?Sized + 'static>: Module<B> + Sized + 'static {
    const CLASS_NAME: &'static str;

    fn config(&self) -> Result<Value>;

    /// Rebuilds the layer from `config`, reading parameters relative to the layer's own scope.
    fn restore(
        registry: &LayerRegistry<B>,
        backend: Arc<B>,
        config: &Value,
        params: &mut dyn ParamFetch,
    ) -> Result<Self>;

    fn record(&self) -> Result<LayerRecord> {
        Ok(LayerRecord {
            class_name: Self::CLASS_NAME.to_string(),
            config: self.config()?,
        })
    }
}

/// Deserializes a layer config, reporting failures as [`ModelError::Configuration`].
pub(crate) fn parse_config<T: DeserializeOwned>(class_name: &str, config: &Value) -> Result<T> {
    serde_json::from_value(config.clone()).map_err(|err| {
        ModelError::configuration(format!("{class_name} config is invalid: {err}")).into()
    })
}

/// Serializes a layer config into a JSON value.
pub(crate) fn to_config<T: Serialize>(config: &T) -> Result<Value> {
    Ok(serde_json::to_value(config)?)
}

/// Validates a dropout rate against `[0, 1)`.
pub(crate) fn check_rate(name: &str, rate: f32) -> Result<()> {
    if !(0.0..1.0).contains(&rate) {
        return Err(ModelError::configuration(format!(
            "{name} must be in [0, 1), got {rate}"
        ))
        .into());
    }
    Ok(())
}
