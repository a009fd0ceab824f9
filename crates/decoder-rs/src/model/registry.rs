use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;

use super::block::DecoderBlock;
use crate::backend::spec::PortableBackend;
use crate::error::ModelError;
use crate::nn::layers::{
    Embedding, FeedForward, Gelu, Layer, LayerNormalization, LayerRecord, Linear, SelfAttention,
    TiedEmbeddingsTransposed,
};
use crate::params::ParamFetch;

/// Signature for layer builders used when a checkpoint manifest is rebuilt.
pub type BuildFn<B> =
    fn(&LayerRegistry<B>, Arc<B>, &Value, &mut dyn ParamFetch) -> Result<Box<dyn Any>>;

#[derive(Clone, Copy)]
pub struct LayerFactory<B: PortableBackend + ?Sized + 'static> {
    pub class_name: &'static str,
    pub build: BuildFn<B>,
}

fn build_boxed<B, L>(
    registry: &LayerRegistry<B>,
    backend: Arc<B>,
    config: &Value,
    params: &mut dyn ParamFetch,
) -> Result<Box<dyn Any>>
where
    B: PortableBackend + ?Sized + 'static,
    L: Layer<B>,
{
    let layer = L::restore(registry, backend, config, params)?;
    Ok(Box::new(layer))
}

fn factory<B, L>() -> LayerFactory<B>
where
    B: PortableBackend + ?Sized + 'static,
    L: Layer<B>,
{
    LayerFactory {
        class_name: L::CLASS_NAME,
        build: build_boxed::<B, L>,
    }
}

/// Built-in layer factories.
///
/// Defined as a function so entries can name generic builders (`build_boxed::<B, L>`) without
/// a type-erased backend.
pub fn layer_factories<B: PortableBackend + ?Sized + 'static>() -> Vec<LayerFactory<B>> {
    vec![
        factory::<B, Embedding<B>>(),
        factory::<B, Linear<B>>(),
        factory::<B, LayerNormalization<B>>(),
        factory::<B, Gelu<B>>(),
        factory::<B, SelfAttention<B>>(),
        factory::<B, FeedForward<B>>(),
        factory::<B, DecoderBlock<B>>(),
        factory::<B, TiedEmbeddingsTransposed<B>>(),
    ]
}

/// Maps class names recorded in checkpoints back to layer constructors.
pub struct LayerRegistry<B: PortableBackend + ?Sized + 'static> {
    builders: HashMap<String, BuildFn<B>>,
}

impl<B: PortableBackend + ?Sized + 'static> LayerRegistry<B> {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registry holding every layer class the decoder uses.
    pub fn with_builtin_layers() -> Self {
        let mut registry = Self::empty();
        for entry in layer_factories::<B>() {
            registry.register(entry.class_name, entry.build);
        }
        registry
    }

    /// Adds or replaces the builder for `class_name`.
    pub fn register(&mut self, class_name: impl Into<String>, build: BuildFn<B>) {
        self.builders.insert(class_name.into(), build);
    }

    pub fn register_layer<L: Layer<B>>(&mut self) {
        self.register(L::CLASS_NAME, build_boxed::<B, L>);
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.builders.contains_key(class_name)
    }

    pub fn class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }

    /// Builds the layer described by `record` as an opaque value.
    pub fn build(
        &self,
        record: &LayerRecord,
        backend: Arc<B>,
        params: &mut dyn ParamFetch,
    ) -> Result<Box<dyn Any>> {
        let build = self
            .builders
            .get(&record.class_name)
            .ok_or_else(|| ModelError::UnknownLayer(record.class_name.clone()))?;
        build(self, backend, &record.config, params)
    }

    /// Builds `record` and checks that it produced an `L`.
    pub fn build_as<L: Layer<B>>(
        &self,
        record: &LayerRecord,
        backend: Arc<B>,
        params: &mut dyn ParamFetch,
    ) -> Result<L> {
        let layer = self.build(record, backend, params)?;
        layer.downcast::<L>().map(|layer| *layer).map_err(|_| {
            anyhow!(ModelError::configuration(format!(
                "layer class '{}' cannot be used where {} is expected",
                record.class_name,
                L::CLASS_NAME
            )))
        })
    }
}

impl<B: PortableBackend + ?Sized + 'static> Default for LayerRegistry<B> {
    fn default() -> Self {
        Self::with_builtin_layers()
    }
}
