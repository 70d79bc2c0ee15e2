//! Weight tensor utilities for model merging

use crate::{MergeError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Sign of a value as -1, 0 or +1.
///
/// Unlike `f32::signum`, both zeros map to 0. NaN also maps to 0.
#[inline]
pub fn sign_of(x: f32) -> i8 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

/// Check that `actual` carries exactly the layer names of `expected`
pub(crate) fn check_layer_set<A, B>(
    model: &str,
    expected: &IndexMap<String, A>,
    actual: &IndexMap<String, B>,
) -> Result<()> {
    let missing: Vec<String> = expected
        .keys()
        .filter(|name| !actual.contains_key(*name))
        .cloned()
        .collect();
    let unexpected: Vec<String> = actual
        .keys()
        .filter(|name| !expected.contains_key(*name))
        .cloned()
        .collect();

    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(MergeError::LayerMismatch {
            model: model.to_string(),
            missing,
            unexpected,
        });
    }
    Ok(())
}

/// Weight tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightTensor {
    /// Tensor name
    pub name: String,
    /// Tensor shape
    pub shape: Vec<usize>,
    /// Flattened data (row-major)
    pub data: Vec<f32>,
}

impl WeightTensor {
    /// Create new weight tensor
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let name = name.into();
        let expected_size: usize = shape.iter().product();
        if data.len() != expected_size {
            return Err(MergeError::ShapeMismatch {
                layer: name,
                expected: vec![expected_size],
                got: vec![data.len()],
            });
        }

        Ok(Self { name, shape, data })
    }

    /// Create zero tensor
    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            data: vec![0.0; size],
        }
    }

    /// Same name and shape, new data
    pub(crate) fn with_data(&self, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), self.data.len());
        Self {
            name: self.name.clone(),
            shape: self.shape.clone(),
            data,
        }
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Element-wise add
    pub fn add(&self, other: &Self) -> Result<Self> {
        self.check_compatible(other)?;
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a + b).collect();
        Ok(self.with_data(data))
    }

    /// Element-wise subtract
    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.check_compatible(other)?;
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a - b).collect();
        Ok(self.with_data(data))
    }

    /// Scalar multiply
    pub fn scale(&self, factor: f32) -> Self {
        self.with_data(self.data.iter().map(|x| x * factor).collect())
    }

    /// Check compatibility for operations
    fn check_compatible(&self, other: &Self) -> Result<()> {
        if self.shape != other.shape {
            return Err(MergeError::ShapeMismatch {
                layer: self.name.clone(),
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        Ok(())
    }

    /// Per-element sign (-1, 0, +1)
    pub fn signs(&self) -> Vec<i8> {
        self.data.iter().map(|&x| sign_of(x)).collect()
    }

    /// Count non-zero elements
    pub fn nnz(&self) -> usize {
        self.data.iter().filter(|&&x| x != 0.0).count()
    }
}

/// Complete model weights, ordered by insertion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    /// Model name
    pub name: String,
    /// Weights by layer name
    pub layers: IndexMap<String, WeightTensor>,
}

impl ModelWeights {
    /// Create new model weights
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layers: IndexMap::new(),
        }
    }

    /// Add layer weights, replacing any layer of the same name in place
    pub fn add_layer(&mut self, tensor: WeightTensor) {
        self.layers.insert(tensor.name.clone(), tensor);
    }

    /// Get layer weights
    pub fn get_layer(&self, name: &str) -> Option<&WeightTensor> {
        self.layers.get(name)
    }

    /// Layer names in insertion order
    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.keys().map(|s| s.as_str()).collect()
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// True when the model has no layers
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Total parameters
    pub fn total_params(&self) -> usize {
        self.layers.values().map(|t| t.numel()).sum()
    }

    /// Check that `other` has exactly this model's layers and shapes
    pub fn check_compatible(&self, other: &Self) -> Result<()> {
        check_layer_set(&other.name, &self.layers, &other.layers)?;

        for (name, tensor) in &self.layers {
            let other_tensor = &other.layers[name];
            if tensor.shape != other_tensor.shape {
                return Err(MergeError::ShapeMismatch {
                    layer: name.clone(),
                    expected: tensor.shape.clone(),
                    got: other_tensor.shape.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Task vector: per-layer difference between a fine-tuned and a base model.
///
/// Trimmed vectors and the merged task vector use the same representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskVector {
    /// Source model name
    pub source: String,
    /// Deltas by layer name, in the base model's order
    pub layers: IndexMap<String, WeightTensor>,
}

impl TaskVector {
    /// Compute `finetuned - base` for every layer.
    ///
    /// Layer sets and shapes are checked before any subtraction.
    pub fn from_models(base: &ModelWeights, finetuned: &ModelWeights) -> Result<Self> {
        base.check_compatible(finetuned)?;

        let mut layers = IndexMap::with_capacity(base.len());
        for (name, base_tensor) in &base.layers {
            let delta = finetuned.layers[name].sub(base_tensor)?;
            layers.insert(name.clone(), delta);
        }

        Ok(Self {
            source: finetuned.name.clone(),
            layers,
        })
    }

    /// Get layer delta
    pub fn get_layer(&self, name: &str) -> Option<&WeightTensor> {
        self.layers.get(name)
    }

    /// Layer names in order
    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.keys().map(|s| s.as_str()).collect()
    }

    /// Non-zero entries across all layers
    pub fn nnz(&self) -> usize {
        self.layers.values().map(|t| t.nnz()).sum()
    }

    /// Apply to base model: `base + scale * self` for every base layer
    pub fn apply(&self, base: &ModelWeights, scale: f32) -> Result<ModelWeights> {
        let mut result = ModelWeights::new(format!("{}+{}", base.name, self.source));

        for (name, base_tensor) in &base.layers {
            let delta = self
                .layers
                .get(name)
                .ok_or_else(|| MergeError::LayerMismatch {
                    model: self.source.clone(),
                    missing: vec![name.clone()],
                    unexpected: Vec::new(),
                })?;
            result.add_layer(base_tensor.add(&delta.scale(scale))?);
        }

        Ok(result)
    }
}

/// Elected sign per element, per layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignMap {
    /// Signs by layer name (values in {-1, 0, +1})
    pub layers: IndexMap<String, Vec<i8>>,
}

impl SignMap {
    /// Elected signs for a layer
    pub fn get(&self, name: &str) -> Option<&[i8]> {
        self.layers.get(name).map(|s| s.as_slice())
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// True when no layer has been elected
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str, layers: &[(&str, Vec<usize>, Vec<f32>)]) -> ModelWeights {
        let mut model = ModelWeights::new(name);
        for (layer, shape, data) in layers {
            model.add_layer(WeightTensor::new(*layer, shape.clone(), data.clone()).unwrap());
        }
        model
    }

    #[test]
    fn test_weight_tensor() {
        let tensor = WeightTensor::new("test", vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();

        assert_eq!(tensor.numel(), 6);
        assert_eq!(tensor.shape, vec![2, 3]);
    }

    #[test]
    fn test_weight_tensor_bad_length() {
        let err = WeightTensor::new("test", vec![2, 3], vec![1.0; 5]).unwrap_err();
        assert!(matches!(err, MergeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_add_sub() {
        let a = WeightTensor::new("a", vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        let b = WeightTensor::new("b", vec![3], vec![4.0, 5.0, 6.0]).unwrap();

        let sum = a.add(&b).unwrap();
        assert_eq!(sum.data, vec![5.0, 7.0, 9.0]);

        let diff = b.sub(&a).unwrap();
        assert_eq!(diff.data, vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_sub_shape_mismatch() {
        let a = WeightTensor::new("a", vec![2, 2], vec![0.0; 4]).unwrap();
        let b = WeightTensor::new("a", vec![4], vec![0.0; 4]).unwrap();
        assert!(a.sub(&b).unwrap_err().is_mismatch());
    }

    #[test]
    fn test_scale() {
        let tensor = WeightTensor::new("test", vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        let scaled = tensor.scale(2.0);
        assert_eq!(scaled.data, vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_signs() {
        let tensor =
            WeightTensor::new("test", vec![5], vec![-1.0, 0.0, 2.0, -3.0, -0.0]).unwrap();
        assert_eq!(tensor.signs(), vec![-1, 0, 1, -1, 0]);
    }

    #[test]
    fn test_nnz() {
        let tensor = WeightTensor::new("test", vec![4], vec![0.0, 1.0, -0.0, 0.0]).unwrap();
        assert_eq!(tensor.nnz(), 1);
        assert_eq!(WeightTensor::zeros("empty", vec![0]).nnz(), 0);
    }

    #[test]
    fn test_model_weights_order() {
        let model = model(
            "m",
            &[
                ("z", vec![1], vec![0.0]),
                ("a", vec![1], vec![0.0]),
                ("m", vec![2], vec![0.0, 0.0]),
            ],
        );

        assert_eq!(model.layer_names(), vec!["z", "a", "m"]);
        assert_eq!(model.total_params(), 4);
        assert!(model.get_layer("a").is_some());
    }

    #[test]
    fn test_check_compatible_layers() {
        let base = model("base", &[("a", vec![1], vec![0.0]), ("b", vec![1], vec![0.0])]);
        let other = model("ft", &[("a", vec![1], vec![0.0]), ("c", vec![1], vec![0.0])]);

        match base.check_compatible(&other).unwrap_err() {
            MergeError::LayerMismatch {
                model,
                missing,
                unexpected,
            } => {
                assert_eq!(model, "ft");
                assert_eq!(missing, vec!["b".to_string()]);
                assert_eq!(unexpected, vec!["c".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_check_compatible_shapes() {
        let base = model("base", &[("a", vec![2, 2], vec![0.0; 4])]);
        let other = model("ft", &[("a", vec![4], vec![0.0; 4])]);

        assert!(matches!(
            base.check_compatible(&other).unwrap_err(),
            MergeError::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn test_task_vector_roundtrip() {
        let base = model("base", &[("layer", vec![3], vec![1.0, 2.0, 3.0])]);
        let finetuned = model("ft", &[("layer", vec![3], vec![1.5, 2.5, 3.5])]);

        let tv = TaskVector::from_models(&base, &finetuned).unwrap();
        assert_eq!(tv.source, "ft");
        assert_eq!(tv.get_layer("layer").unwrap().data, vec![0.5, 0.5, 0.5]);

        let result = tv.apply(&base, 1.0).unwrap();
        assert_eq!(result.get_layer("layer").unwrap().data, vec![1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_task_vector_follows_base_order() {
        let base = model("base", &[("a", vec![1], vec![0.0]), ("b", vec![1], vec![0.0])]);
        let finetuned = model("ft", &[("b", vec![1], vec![1.0]), ("a", vec![1], vec![2.0])]);

        let tv = TaskVector::from_models(&base, &finetuned).unwrap();
        assert_eq!(tv.layer_names(), vec!["a", "b"]);
        assert_eq!(tv.nnz(), 2);
    }
}
