//! Lightweight wrapper for tensor shapes and dimension bookkeeping.

use std::fmt;

/// Stores the logical dimensions of a row-major tensor.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        Shape { dims: dims.into() }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Size of the innermost axis, or 1 for rank-0 shapes.
    pub fn last_dim(&self) -> usize {
        self.dims.last().copied().unwrap_or(1)
    }

    /// Number of rows when the tensor is viewed as `[leading, last_dim]`.
    pub fn leading_rows(&self) -> usize {
        match self.dims.split_last() {
            Some((_, leading)) => leading.iter().product(),
            None => 1,
        }
    }

    /// Same shape with the innermost axis replaced.
    pub fn with_last_dim(&self, last: usize) -> Shape {
        let mut dims = self.dims.clone();
        match dims.last_mut() {
            Some(slot) => *slot = last,
            None => dims.push(last),
        }
        Shape { dims }
    }

    /// Reports whether `suffix` matches the trailing axes of this shape.
    pub fn ends_with(&self, suffix: &Shape) -> bool {
        self.dims.ends_with(&suffix.dims)
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::Shape;

    #[test]
    fn row_view_of_rank3_shape() {
        let shape = Shape::new([2, 3, 4]);
        assert_eq!(shape.num_elements(), 24);
        assert_eq!(shape.leading_rows(), 6);
        assert_eq!(shape.last_dim(), 4);
        assert_eq!(shape.with_last_dim(1).dims(), &[2, 3, 1]);
    }

    #[test]
    fn suffix_matching() {
        let shape = Shape::new([2, 3, 5, 5]);
        assert!(shape.ends_with(&Shape::new([5, 5])));
        assert!(shape.ends_with(&Shape::new([5])));
        assert!(!shape.ends_with(&Shape::new([3, 4])));
    }
}
