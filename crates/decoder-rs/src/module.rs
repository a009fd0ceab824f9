//! Parameter traversal shared by layers, persistence, and the checkpoint importer.
//!
//! Parameters are addressed by dotted paths (`blocks.0.attention.c_attn.weight`) built from
//! the `scoped` segments a module opens while visiting its children.

use anyhow::{ensure, Result};

use crate::backend::spec::PortableBackend;
use crate::tensor::{DeviceTensor, Tensor};

pub type VisitParamsFn<'a, B> = dyn FnMut(&str, TensorRole, &DeviceTensor<B>) -> Result<()> + 'a;
pub type VisitParamsMutFn<'a, B> =
    dyn FnMut(&str, TensorRole, &mut DeviceTensor<B>) -> Result<()> + 'a;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TensorRole {
    Parameter,
}

fn validate_segment(kind: &str, segment: &str) -> Result<()> {
    ensure!(!segment.is_empty(), "parameter {kind} must be non-empty");
    ensure!(
        !segment.contains('.'),
        "parameter {kind} must not contain '.', got '{segment}'"
    );
    ensure!(
        segment.is_ascii(),
        "parameter {kind} must be ASCII, got '{segment}'"
    );
    Ok(())
}

#[derive(Default)]
struct ParamPath {
    segments: Vec<String>,
    scratch: String,
}

impl ParamPath {
    fn push(&mut self, segment: &str) -> Result<()> {
        validate_segment("path segments", segment)?;
        self.segments.push(segment.to_string());
        Ok(())
    }

    fn pop(&mut self) {
        let _ = self.segments.pop();
    }

    fn join(&mut self, leaf: &str) -> Result<&str> {
        validate_segment("leaf names", leaf)?;
        self.scratch.clear();
        for seg in &self.segments {
            self.scratch.push_str(seg);
            self.scratch.push('.');
        }
        self.scratch.push_str(leaf);
        Ok(self.scratch.as_str())
    }
}

pub struct ParamVisitor<'a, B: PortableBackend + ?Sized + 'static> {
    path: ParamPath,
    f: &'a mut VisitParamsFn<'a, B>,
}

impl<'a, B: PortableBackend + ?Sized + 'static> ParamVisitor<'a, B> {
    pub fn new(f: &'a mut VisitParamsFn<'a, B>) -> Self {
        Self {
            path: ParamPath::default(),
            f,
        }
    }

    pub fn scoped(
        &mut self,
        segment: &str,
        inner: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.path.push(segment)?;
        let out = inner(self);
        self.path.pop();
        out
    }

    pub fn param(&mut self, leaf: &str, role: TensorRole, tensor: &DeviceTensor<B>) -> Result<()> {
        let name = self.path.join(leaf)?;
        (self.f)(name, role, tensor)
    }
}

pub struct ParamVisitorMut<'a, B: PortableBackend + ?Sized + 'static> {
    path: ParamPath,
    f: &'a mut VisitParamsMutFn<'a, B>,
}

impl<'a, B: PortableBackend + ?Sized + 'static> ParamVisitorMut<'a, B> {
    pub fn new(f: &'a mut VisitParamsMutFn<'a, B>) -> Self {
        Self {
            path: ParamPath::default(),
            f,
        }
    }

    pub fn scoped(
        &mut self,
        segment: &str,
        inner: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.path.push(segment)?;
        let out = inner(self);
        self.path.pop();
        out
    }

    pub fn param(
        &mut self,
        leaf: &str,
        role: TensorRole,
        tensor: &mut DeviceTensor<B>,
    ) -> Result<()> {
        let name = self.path.join(leaf)?;
        (self.f)(name, role, tensor)
    }
}

pub trait Module<B: PortableBackend + ?Sized + 'static> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()>;
    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()>;
}

/// Collects `(name, values)` for every parameter in visit order.
pub fn named_parameters<B, M>(module: &M) -> Result<Vec<(String, Tensor)>>
where
    B: PortableBackend + ?Sized + 'static,
    M: Module<B> + ?Sized,
{
    let mut out = Vec::new();
    let mut collect = |name: &str, _role: TensorRole, tensor: &DeviceTensor<B>| -> Result<()> {
        out.push((name.to_string(), tensor.to_host()?));
        Ok(())
    };
    let mut visitor = ParamVisitor::new(&mut collect);
    module.visit_params(&mut visitor)?;
    Ok(out)
}

/// Total number of scalar parameters.
pub fn parameter_count<B, M>(module: &M) -> Result<usize>
where
    B: PortableBackend + ?Sized + 'static,
    M: Module<B> + ?Sized,
{
    let mut total = 0usize;
    let mut count = |_name: &str, _role: TensorRole, tensor: &DeviceTensor<B>| -> Result<()> {
        total += tensor.shape().num_elements();
        Ok(())
    };
    let mut visitor = ParamVisitor::new(&mut count);
    module.visit_params(&mut visitor)?;
    Ok(total)
}
