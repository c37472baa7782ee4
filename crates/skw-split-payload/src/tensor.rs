use serde::{Deserialize, Serialize};

/// Ordered values plus shape. Activations and gradients both travel as a
/// `Tensor`; they are only ever cleartext inside a stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }

    pub fn vector(values: Vec<f32>) -> Self {
        Self { shape: vec![values.len()], values }
    }

    /// An overflowing shape yields no values and is not well formed.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = element_count(&shape).unwrap_or(0);
        Self { shape, values: vec![0.0; len] }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// shape and value count agree, and every value is finite
    pub fn is_well_formed(&self) -> bool {
        element_count(&self.shape) == Some(self.values.len())
            && self.values.iter().all(|v| v.is_finite())
    }

    pub fn l2_norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

/// `None` when the dimensions overflow `usize`
fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |count, dim| count.checked_mul(*dim))
}

#[cfg(test)]
mod test {
    use super::Tensor;

    #[test]
    fn well_formed() {
        assert!(Tensor::vector(vec![0.5, 0.2]).is_well_formed());
        assert!(Tensor::zeros(vec![3, 2]).is_well_formed());
        assert!(!Tensor::new(vec![3], vec![1.0]).is_well_formed());
        assert!(!Tensor::vector(vec![f32::NAN]).is_well_formed());
    }

    #[test]
    fn overflowing_shape_is_malformed() {
        assert!(!Tensor::new(vec![usize::MAX, 2], vec![1.0]).is_well_formed());
        assert!(!Tensor::new(vec![usize::MAX, 2, 0], vec![]).is_well_formed());

        let zeros = Tensor::zeros(vec![usize::MAX, 2]);
        assert!(zeros.is_empty());
        assert!(!zeros.is_well_formed());
    }

    #[test]
    fn norm() {
        assert_eq!(Tensor::vector(vec![3.0, 4.0]).l2_norm(), 5.0);
        assert_eq!(Tensor::zeros(vec![4]).l2_norm(), 0.0);
    }
}
