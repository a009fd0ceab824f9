pub mod block;
pub mod config;
pub mod openai;
pub mod registry;
pub mod transformer;

pub use block::{DecoderBlock, DecoderBlockConfig};
pub use config::{ModelConfig, DEBUG_SEED};
pub use openai::{
    load_openai_model, load_openai_model_with_config, openai_tensor_names, OpenAiCheckpoint,
    OpenAiConfig, OpenAiLoadOptions, PretrainedSource,
};
pub use registry::{LayerFactory, LayerRegistry};
pub use transformer::{
    create_model, ManifestEntry, ModelOutputs, OutputHead, TokenBatch, TransformerModel,
};
