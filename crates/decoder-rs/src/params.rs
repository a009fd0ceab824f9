//! Stable parameter identities and name-addressed parameter sources.

use std::collections::HashMap;

use anyhow::{ensure, Result};

use crate::error::ModelError;
use crate::tensor::Tensor;

/// 128-bit identity derived from a parameter's dotted name.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BaseParamId(pub u128);

pub fn base_param_id(name: &str) -> Result<BaseParamId> {
    ensure!(name.is_ascii(), "param name must be ASCII, got '{name}'");
    let hash = blake3::hash(name.as_bytes());
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&hash.as_bytes()[0..16]);
    Ok(BaseParamId(u128::from_le_bytes(raw)))
}

/// Supplies parameter tensors by dotted name while a layer is rebuilt.
pub trait ParamFetch {
    fn fetch(&mut self, name: &str) -> Result<Tensor>;

    /// Full dotted name `name` resolves to in the underlying source.
    fn qualified(&self, name: &str) -> String {
        name.to_string()
    }

    /// Fetches `name` and rejects it with [`ModelError::ShapeMismatch`] unless it has `expected`
    /// dims.
    fn fetch_shaped(&mut self, name: &str, expected: &[usize]) -> Result<Tensor> {
        let tensor = self.fetch(name)?;
        if tensor.shape().dims() != expected {
            return Err(ModelError::shape_mismatch(
                self.qualified(name),
                expected,
                tensor.shape().dims(),
            )
            .into());
        }
        Ok(tensor)
    }
}

/// View of another source under a dotted prefix: fetching `weight` through a `c_fc` scope
/// reads `c_fc.weight` from the parent.
pub struct ScopedFetch<'a> {
    prefix: String,
    inner: &'a mut dyn ParamFetch,
}

impl<'a> ScopedFetch<'a> {
    pub fn new(inner: &'a mut dyn ParamFetch, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl ScopedFetch<'_> {
    fn join(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }
}

impl ParamFetch for ScopedFetch<'_> {
    fn fetch(&mut self, name: &str) -> Result<Tensor> {
        let joined = self.join(name);
        self.inner.fetch(&joined)
    }

    fn qualified(&self, name: &str) -> String {
        self.inner.qualified(&self.join(name))
    }
}

/// Opens a child scope over `source`.
pub fn scoped<'a>(source: &'a mut dyn ParamFetch, segment: &str) -> ScopedFetch<'a> {
    ScopedFetch::new(source, segment)
}

/// Owned name-to-tensor map that hands out each tensor once and remembers what was taken.
#[derive(Debug, Default)]
pub struct TensorMap {
    tensors: HashMap<String, Tensor>,
}

impl TensorMap {
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Fails with [`ModelError::UnexpectedParameter`] if anything was never fetched.
    pub fn ensure_consumed(&self) -> Result<()> {
        let mut leftover: Vec<&String> = self.tensors.keys().collect();
        leftover.sort();
        match leftover.first() {
            Some(name) => Err(ModelError::UnexpectedParameter((*name).clone()).into()),
            None => Ok(()),
        }
    }
}

impl ParamFetch for TensorMap {
    fn fetch(&mut self, name: &str) -> Result<Tensor> {
        self.tensors
            .remove(name)
            .ok_or_else(|| ModelError::MissingParameter(name.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_ids_are_stable_and_distinct() {
        let a = base_param_id("blocks.0.ln_1.gain").unwrap();
        let b = base_param_id("blocks.0.ln_1.gain").unwrap();
        let c = base_param_id("blocks.0.ln_1.bias").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn scoped_fetch_prefixes_names() {
        let mut map = TensorMap::new(HashMap::from([(
            "blocks.0.ln_1.gain".to_string(),
            Tensor::ones([4]),
        )]));
        {
            let mut blocks = scoped(&mut map, "blocks");
            let mut block = scoped(&mut blocks, "0");
            let mut ln = scoped(&mut block, "ln_1");
            assert_eq!(ln.fetch("gain").unwrap().shape().dims(), &[4]);
            assert_eq!(ln.qualified("bias"), "blocks.0.ln_1.bias");
            let err = ln.fetch("bias").unwrap_err();
            assert_eq!(
                err.downcast_ref::<ModelError>(),
                Some(&ModelError::MissingParameter("blocks.0.ln_1.bias".into()))
            );
        }
        map.ensure_consumed().unwrap();
    }

    #[test]
    fn shaped_fetch_reports_full_name() {
        let mut map = TensorMap::new(HashMap::from([(
            "head.bias".to_string(),
            Tensor::zeros([5]),
        )]));
        let mut head = scoped(&mut map, "head");
        let err = head.fetch_shaped("bias", &[7]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ModelError>(),
            Some(&ModelError::ShapeMismatch {
                parameter: "head.bias".into(),
                expected: vec![7],
                actual: vec![5],
            })
        );
    }

    #[test]
    fn leftover_tensors_are_reported() {
        let map = TensorMap::new(HashMap::from([("stray".to_string(), Tensor::zeros([1]))]));
        let err = map.ensure_consumed().unwrap_err();
        assert_eq!(
            err.downcast_ref::<ModelError>(),
            Some(&ModelError::UnexpectedParameter("stray".into()))
        );
    }
}
