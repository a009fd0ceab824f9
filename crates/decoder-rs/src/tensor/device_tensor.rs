//! Backend-bound tensor handles used throughout the functional layer.

use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Result};

use super::{Shape, Tensor};
use crate::backend::spec::{BackendResult, PortableBackend};
use crate::error::ModelError;

/// Tensor bound to the backend that executes every operation on it.
///
/// The payload is shared, so cloning a device tensor never copies its values. Writes go
/// through [`DeviceTensor::replace`], which swaps the payload after a shape check.
pub struct DeviceTensor<B: PortableBackend + ?Sized + 'static> {
    backend: Arc<B>,
    value: Arc<Tensor>,
}

impl<B: PortableBackend + ?Sized + 'static> DeviceTensor<B> {
    /// Binds a host tensor to `backend`.
    pub fn from_host(backend: Arc<B>, tensor: Tensor) -> Result<Self> {
        Ok(Self {
            backend,
            value: Arc::new(tensor),
        })
    }

    /// Wraps a kernel result produced by `backend`.
    pub(crate) fn from_kernel(backend: Arc<B>, output: BackendResult<Tensor>) -> Result<Self> {
        let tensor = output?;
        Self::from_host(backend, tensor)
    }

    pub fn shape(&self) -> &Shape {
        self.value.shape()
    }

    /// Returns the backend that executes operations on this tensor.
    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    /// Borrows the payload without copying it.
    pub fn host(&self) -> &Tensor {
        &self.value
    }

    /// Copies the payload out into an owned host tensor.
    pub fn to_host(&self) -> Result<Tensor> {
        Ok(self.value.as_ref().clone())
    }

    /// Copies the payload into a new tensor of equal element count with shape `shape`.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let reshaped = self.value.as_ref().clone().reshape(shape)?;
        Self::from_host(Arc::clone(&self.backend), reshaped)
    }

    /// Replaces the payload, rejecting any write that would change the tensor's shape.
    pub fn replace(&mut self, parameter: &str, tensor: Tensor) -> Result<()> {
        if tensor.shape() != self.shape() {
            return Err(
                ModelError::shape_mismatch(parameter, self.shape().dims(), tensor.shape().dims())
                    .into(),
            );
        }
        self.value = Arc::new(tensor);
        Ok(())
    }

    /// Reports whether both tensors execute on the same backend instance.
    pub fn same_backend(&self, other: &DeviceTensor<B>) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }

    pub(crate) fn ensure_same_backend(&self, other: &DeviceTensor<B>) -> Result<()> {
        ensure!(
            self.same_backend(other),
            "device tensor backend mismatch ({} vs {})",
            self.backend.backend_name(),
            other.backend.backend_name()
        );
        Ok(())
    }
}

impl<B: PortableBackend + ?Sized + 'static> Clone for DeviceTensor<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            value: Arc::clone(&self.value),
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> fmt::Debug for DeviceTensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("backend", &self.backend.backend_name())
            .field("shape", self.shape())
            .finish()
    }
}

/// Conversion into a device tensor bound to a specific backend.
pub trait IntoDeviceTensor<B: PortableBackend + ?Sized + 'static> {
    /// Converts the value into a device tensor bound to the provided backend.
    fn into_device_tensor(self, backend: &Arc<B>) -> Result<DeviceTensor<B>>;
}

/// Variant of [`IntoDeviceTensor`] that lifts optional values.
pub trait IntoDeviceTensorOption<B: PortableBackend + ?Sized + 'static> {
    fn into_device_tensor_option(self, backend: &Arc<B>) -> Result<Option<DeviceTensor<B>>>;
}

impl<B, T> IntoDeviceTensorOption<B> for Option<T>
where
    B: PortableBackend + ?Sized + 'static,
    T: IntoDeviceTensor<B>,
{
    fn into_device_tensor_option(self, backend: &Arc<B>) -> Result<Option<DeviceTensor<B>>> {
        match self {
            Some(value) => value.into_device_tensor(backend).map(Some),
            None => Ok(None),
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> IntoDeviceTensor<B> for Tensor {
    fn into_device_tensor(self, backend: &Arc<B>) -> Result<DeviceTensor<B>> {
        DeviceTensor::from_host(Arc::clone(backend), self)
    }
}

impl<B: PortableBackend + ?Sized + 'static> IntoDeviceTensor<B> for DeviceTensor<B> {
    fn into_device_tensor(self, backend: &Arc<B>) -> Result<DeviceTensor<B>> {
        ensure!(
            Arc::ptr_eq(&self.backend, backend),
            "device tensor backend mismatch"
        );
        Ok(self)
    }
}

impl<B: PortableBackend + ?Sized + 'static> IntoDeviceTensor<B> for &DeviceTensor<B> {
    fn into_device_tensor(self, backend: &Arc<B>) -> Result<DeviceTensor<B>> {
        self.clone().into_device_tensor(backend)
    }
}
