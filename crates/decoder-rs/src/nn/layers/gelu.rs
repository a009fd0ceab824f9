use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use super::Layer;
use crate::backend::spec::PortableBackend;
use crate::model::registry::LayerRegistry;
use crate::module::{Module, ParamVisitor, ParamVisitorMut};
use crate::ops::functional;
use crate::params::ParamFetch;
use crate::tensor::DeviceTensor;

/// Parameter-free tanh-approximated GELU activation.
pub struct Gelu<B: PortableBackend + ?Sized + 'static> {
    backend: Arc<B>,
}

impl<B: PortableBackend + ?Sized + 'static> Gelu<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn forward(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        functional::gelu(self.backend.as_ref(), x)
    }
}

impl<B: PortableBackend + ?Sized + 'static> Clone for Gelu<B> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.backend))
    }
}

impl<B: PortableBackend + ?Sized + 'static> fmt::Debug for Gelu<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Gelu")
    }
}

impl<B: PortableBackend + ?Sized + 'static> Module<B> for Gelu<B> {
    fn visit_params(&self, _v: &mut ParamVisitor<'_, B>) -> Result<()> {
        Ok(())
    }

    fn visit_params_mut(&mut self, _v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        Ok(())
    }
}

impl<B: PortableBackend + ?Sized + 'static> Layer<B> for Gelu<B> {
    const CLASS_NAME: &'static str = "Gelu";

    fn config(&self) -> Result<Value> {
        Ok(Value::Object(Default::default()))
    }

    fn restore(
        _registry: &LayerRegistry<B>,
        backend: Arc<B>,
        _config: &Value,
        _params: &mut dyn ParamFetch,
    ) -> Result<Self> {
        Ok(Self::new(backend))
    }
}
