//! Merge diagnostics

use crate::{MergeError, Result, WeightTensor};
use serde::{Deserialize, Serialize};

/// Per-layer merge statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    /// Layer name
    pub name: String,
    /// Elements per tensor
    pub numel: usize,
    /// Number of merged task vectors
    pub num_vectors: usize,
    /// Non-zero elements left after trimming, summed over vectors
    pub kept: usize,
    /// Elements where trimmed vectors disagree in sign
    pub sign_conflicts: usize,
    /// Elements whose elected sign is zero
    pub elected_zero: usize,
}

impl LayerStats {
    /// Collect statistics from the trimmed tensors of one layer and its elected signs
    pub fn collect(name: &str, trimmed: &[&WeightTensor], elected: &[i8]) -> Result<Self> {
        let numel = elected.len();
        for tensor in trimmed {
            if tensor.numel() != numel {
                return Err(MergeError::ShapeMismatch {
                    layer: name.to_string(),
                    expected: vec![numel],
                    got: tensor.shape.clone(),
                });
            }
        }

        let signs: Vec<Vec<i8>> = trimmed.iter().map(|t| t.signs()).collect();
        let sign_conflicts = (0..numel)
            .filter(|&i| {
                let pos = signs.iter().any(|s| s[i] > 0);
                let neg = signs.iter().any(|s| s[i] < 0);
                pos && neg
            })
            .count();

        Ok(Self {
            name: name.to_string(),
            numel,
            num_vectors: trimmed.len(),
            kept: trimmed.iter().map(|t| t.nnz()).sum(),
            sign_conflicts,
            elected_zero: elected.iter().filter(|&&s| s == 0).count(),
        })
    }

    /// Fraction of task-vector entries surviving the trim
    pub fn kept_ratio(&self) -> f32 {
        let total = self.numel * self.num_vectors;
        if total == 0 {
            return 0.0;
        }
        self.kept as f32 / total as f32
    }
}

/// Whole-model merge statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Statistics per layer, in model order
    pub layers: Vec<LayerStats>,
}

impl MergeStats {
    /// Parameters per model
    pub fn total_params(&self) -> usize {
        self.layers.iter().map(|l| l.numel).sum()
    }

    /// Total kept entries across layers and vectors
    pub fn total_kept(&self) -> usize {
        self.layers.iter().map(|l| l.kept).sum()
    }

    /// Fraction of all task-vector entries surviving the trim
    pub fn kept_ratio(&self) -> f32 {
        let total: usize = self.layers.iter().map(|l| l.numel * l.num_vectors).sum();
        if total == 0 {
            return 0.0;
        }
        self.total_kept() as f32 / total as f32
    }

    /// Fraction of parameters with conflicting signs
    pub fn conflict_ratio(&self) -> f32 {
        let total = self.total_params();
        if total == 0 {
            return 0.0;
        }
        let conflicts: usize = self.layers.iter().map(|l| l.sign_conflicts).sum();
        conflicts as f32 / total as f32
    }

    /// Look up a layer's statistics
    pub fn layer(&self, name: &str) -> Option<&LayerStats> {
        self.layers.iter().find(|l| l.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(data: Vec<f32>) -> WeightTensor {
        WeightTensor::new("layer", vec![data.len()], data).unwrap()
    }

    #[test]
    fn test_collect() {
        let a = tensor(vec![1.0, -1.0, 0.0, 0.0]);
        let b = tensor(vec![0.9, 0.8, 0.0, -0.2]);
        let elected: [i8; 4] = [1, 0, 0, -1];

        let stats = LayerStats::collect("layer", &[&a, &b], &elected).unwrap();

        assert_eq!(stats.numel, 4);
        assert_eq!(stats.num_vectors, 2);
        assert_eq!(stats.kept, 5);
        assert_eq!(stats.sign_conflicts, 1);
        assert_eq!(stats.elected_zero, 2);
        assert_eq!(stats.kept_ratio(), 5.0 / 8.0);
    }

    #[test]
    fn test_collect_rejects_short_tensor() {
        let a = tensor(vec![1.0, -1.0, 0.5]);
        let b = tensor(vec![1.0]);
        let elected: [i8; 3] = [1, -1, 1];

        match LayerStats::collect("layer", &[&a, &b], &elected).unwrap_err() {
            MergeError::ShapeMismatch {
                layer,
                expected,
                got,
            } => {
                assert_eq!(layer, "layer");
                assert_eq!(expected, vec![3]);
                assert_eq!(got, vec![1]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_merge_stats_aggregate() {
        let stats = MergeStats {
            layers: vec![
                LayerStats {
                    name: "a".into(),
                    numel: 4,
                    num_vectors: 2,
                    kept: 4,
                    sign_conflicts: 1,
                    elected_zero: 0,
                },
                LayerStats {
                    name: "b".into(),
                    numel: 6,
                    num_vectors: 2,
                    kept: 2,
                    sign_conflicts: 0,
                    elected_zero: 4,
                },
            ],
        };

        assert_eq!(stats.total_params(), 10);
        assert_eq!(stats.total_kept(), 6);
        assert_eq!(stats.kept_ratio(), 6.0 / 20.0);
        assert_eq!(stats.conflict_ratio(), 0.1);
        assert_eq!(stats.layer("b").unwrap().elected_zero, 4);
        assert!(stats.layer("c").is_none());
    }

    #[test]
    fn test_empty_ratios() {
        let stats = MergeStats::default();
        assert_eq!(stats.kept_ratio(), 0.0);
        assert_eq!(stats.conflict_ratio(), 0.0);
    }
}
