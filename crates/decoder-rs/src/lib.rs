//! GPT-style post-norm Transformer decoder with a backend-agnostic numeric core.
//!
//! Layers never touch raw buffers: they compose [`ops::functional`] helpers, which in turn only
//! call the [`backend::spec::PortableBackend`] capability trait. Any backend that implements the
//! trait with the same per-element evaluation order yields bit-identical model outputs.

pub mod backend;
pub mod checkpoint;
pub(crate) mod env;
pub mod error;
pub mod io;
pub mod model;
pub mod module;
pub mod nn;
pub mod ops;
pub mod params;
pub mod tensor;

pub use linkme;

pub use error::ModelError;
pub use model::{
    create_model, load_openai_model, load_openai_model_with_config, ModelConfig, ModelOutputs,
    TokenBatch, TransformerModel,
};
pub use tensor::{DeviceTensor, Shape, Tensor};
