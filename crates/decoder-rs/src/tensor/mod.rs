//! Core tensor abstractions shared across backends.
//!
//! Host tensors carry row-major `f32` payloads; device tensors bind a payload to the backend
//! that executes every operation on it. [`DeviceTensorOps`] is re-exported here so the method
//! syntax lives next to the types forward passes manipulate.

mod device_tensor;
mod host_tensor;
pub mod shape;

pub use crate::ops::functional::DeviceTensorOps;
pub use device_tensor::{DeviceTensor, IntoDeviceTensor, IntoDeviceTensorOption};
pub use host_tensor::Tensor;
pub use shape::Shape;
