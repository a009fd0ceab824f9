//! Backend-agnostic functional operators built on top of device tensors.
//!
//! Every helper validates its operands, then calls the [`PortableBackend`] kernels of the backend
//! passed as the first argument. Layers only ever talk to this module, never to a backend
//! directly.
//!
//! [`PortableBackend`]: crate::backend::spec::PortableBackend

pub mod activation;
pub mod attention;
pub(crate) mod common;
pub mod embedding;
pub mod linalg;
pub mod normalization;
pub mod shape;
pub mod stochastic;
pub mod tensor_ops;

pub use activation::*;
pub use attention::*;
pub use common::DeviceTensorOps;
pub use embedding::*;
pub use linalg::*;
pub use normalization::*;
pub use shape::*;
pub use stochastic::*;
pub use tensor_ops::*;
