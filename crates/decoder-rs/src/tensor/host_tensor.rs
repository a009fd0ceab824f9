//! Host-backed tensor used for parameters, literals, and interchange with backends.

use super::shape::Shape;
use anyhow::{bail, ensure, Result};
use rand::Rng;

/// Dense row-major `f32` tensor living in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
}

impl Tensor {
    /// Constructs a tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: impl Into<Shape>, data: Vec<f32>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor { shape, data })
    }

    /// Returns a zero-initialized tensor of the requested shape.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 0.0)
    }

    /// Returns a one-initialized tensor of the requested shape.
    pub fn ones(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 1.0)
    }

    /// Returns a tensor with every element set to `value`.
    pub fn full(shape: impl Into<Shape>, value: f32) -> Self {
        let shape = shape.into();
        let len = shape.num_elements();
        Tensor {
            shape,
            data: vec![value; len],
        }
    }

    /// Samples from a normal distribution (`N(0, std^2)`) using the Box-Muller transform.
    pub fn randn(shape: impl Into<Shape>, std: f32, rng: &mut impl Rng) -> Self {
        let shape = shape.into();
        let len = shape.num_elements();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        Tensor {
            shape,
            data: values,
        }
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Reports whether the tensor contains zero elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Provides access to the tensor shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Reinterprets the buffer with a new shape of equal element count.
    pub fn reshape(self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        ensure!(
            shape.num_elements() == self.data.len(),
            "cannot reshape tensor of shape {:?} into {:?}",
            self.shape,
            shape
        );
        Ok(Tensor {
            shape,
            data: self.data,
        })
    }

    /// Drops a leading axis of extent 1, turning `(1, a, b)` into `(a, b)`.
    pub fn squeeze_leading(self) -> Result<Self> {
        let dims = self.shape.dims();
        ensure!(
            dims.len() >= 2 && dims[0] == 1,
            "cannot squeeze leading axis of shape {:?}",
            dims
        );
        let squeezed = dims[1..].to_vec();
        self.reshape(squeezed)
    }

    /// Appends the rows of `other` below the rows of `self` along axis 0.
    pub fn concat_rows(&self, other: &Tensor) -> Result<Tensor> {
        let lhs = self.shape.dims();
        let rhs = other.shape.dims();
        ensure!(
            lhs.len() >= 1 && lhs.len() == rhs.len() && lhs[1..] == rhs[1..],
            "cannot concatenate rows of shapes {:?} and {:?}",
            lhs,
            rhs
        );
        let mut dims = lhs.to_vec();
        dims[0] += rhs[0];
        let mut data = Vec::with_capacity(self.data.len() + other.data.len());
        data.extend_from_slice(&self.data);
        data.extend_from_slice(&other.data);
        Tensor::from_vec(dims, data)
    }

    /// Applies a unary function in place over every scalar element.
    pub fn map_inplace<F>(&mut self, mut f: F)
    where
        F: FnMut(f32) -> f32,
    {
        for v in &mut self.data {
            *v = f(*v);
        }
    }

    /// Compares shapes and bit patterns, so `NaN` payloads and signed zeros must match too.
    pub fn bitwise_eq(&self, other: &Tensor) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}
