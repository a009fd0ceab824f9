//! Output head that reuses the token embedding table: `logits = hidden @ E^T (+ bias)`.
//!
//! The layer owns no copy of `E`. It records which table it is tied to, and the owning model
//! passes that table in on every call, so edits to the embeddings reach the logits directly.

use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse_config, to_config, Layer};
use crate::backend::spec::{MatmulSpec, PortableBackend};
use crate::model::registry::LayerRegistry;
use crate::module::{Module, ParamVisitor, ParamVisitorMut, TensorRole};
use crate::ops::functional;
use crate::params::ParamFetch;
use crate::tensor::{DeviceTensor, IntoDeviceTensorOption, Tensor};

/// Embedding tables a tied head can refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableHandle {
    TokenEmbeddings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiedEmbeddingsConfig {
    pub tied_to: TableHandle,
    /// Vocabulary size; rows of the tied table.
    pub units: usize,
    #[serde(default)]
    pub use_bias: bool,
}

pub struct TiedEmbeddingsTransposed<B: PortableBackend + ?Sized + 'static> {
    backend: Arc<B>,
    tied_to: TableHandle,
    units: usize,
    pub bias: Option<DeviceTensor<B>>,
}

impl<B: PortableBackend + ?Sized + 'static> TiedEmbeddingsTransposed<B> {
    pub fn new<Bi>(backend: Arc<B>, tied_to: TableHandle, units: usize, bias: Bi) -> Result<Self>
    where
        Bi: IntoDeviceTensorOption<B>,
    {
        let bias = bias.into_device_tensor_option(&backend)?;
        if let Some(bias) = &bias {
            ensure!(
                bias.shape().dims() == [units],
                "tied head bias {:?} must have {units} entries",
                bias.shape().dims()
            );
        }
        Ok(Self {
            backend,
            tied_to,
            units,
            bias,
        })
    }

    /// Zero-initialized bias when `use_bias` is set.
    pub fn from_config(backend: Arc<B>, config: TiedEmbeddingsConfig) -> Result<Self> {
        let bias = config.use_bias.then(|| Tensor::zeros([config.units]));
        Self::new(backend, config.tied_to, config.units, bias)
    }

    pub fn tied_to(&self) -> TableHandle {
        self.tied_to
    }

    pub fn units(&self) -> usize {
        self.units
    }

    /// `hidden: (.., d)` against `table: (units, d)` to `(.., units)`.
    pub fn forward(&self, hidden: &DeviceTensor<B>, table: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let table_dims = table.shape().dims();
        ensure!(
            table_dims.len() == 2 && table_dims[0] == self.units,
            "tied table {:?} does not have {} rows",
            table_dims,
            self.units
        );
        let dims = hidden.shape().dims();
        ensure!(
            dims.len() >= 2 && dims[dims.len() - 1] == table_dims[1],
            "hidden states {:?} do not match tied table width {}",
            dims,
            table_dims[1]
        );
        let backend = self.backend.as_ref();
        let rows = hidden.shape().leading_rows();
        let flat = hidden.reshape([rows, table_dims[1]])?;
        let mut logits = functional::matmul(backend, &flat, table, MatmulSpec::transposed_rhs())?;
        if let Some(bias) = &self.bias {
            logits = functional::add_bias(backend, &logits, bias)?;
        }
        logits.reshape(hidden.shape().with_last_dim(self.units))
    }
}

impl<B: PortableBackend + ?Sized + 'static> Clone for TiedEmbeddingsTransposed<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            tied_to: self.tied_to,
            units: self.units,
            bias: self.bias.clone(),
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> fmt::Debug for TiedEmbeddingsTransposed<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TiedEmbeddingsTransposed")
            .field("tied_to", &self.tied_to)
            .field("units", &self.units)
            .field("bias", &self.bias)
            .finish()
    }
}

impl<B: PortableBackend + ?Sized + 'static> Module<B> for TiedEmbeddingsTransposed<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        match &self.bias {
            Some(bias) => v.param("bias", TensorRole::Parameter, bias),
            None => Ok(()),
        }
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        match &mut self.bias {
            Some(bias) => v.param("bias", TensorRole::Parameter, bias),
            None => Ok(()),
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> Layer<B> for TiedEmbeddingsTransposed<B> {
    const CLASS_NAME: &'static str = "TiedEmbeddingsTransposed";

    fn config(&self) -> Result<Value> {
        to_config(&TiedEmbeddingsConfig {
            tied_to: self.tied_to,
            units: self.units,
            use_bias: self.bias.is_some(),
        })
    }

    fn restore(
        _registry: &LayerRegistry<B>,
        backend: Arc<B>,
        config: &Value,
        params: &mut dyn ParamFetch,
    ) -> Result<Self> {
        let config: TiedEmbeddingsConfig = parse_config(Self::CLASS_NAME, config)?;
        let bias = if config.use_bias {
            Some(params.fetch_shaped("bias", &[config.units])?)
        } else {
            None
        };
        Self::new(backend, config.tied_to, config.units, bias)
    }
}
