//! TIES (Trim, Elect, Merge) merging algorithm
//!
//! TIES is a task vector merging algorithm that:
//! 1. Trims low-magnitude parameters
//! 2. Elects the sign based on majority vote
//! 3. Merges by averaging parameters with the elected sign
//!
//! The merged task vector is scaled and added back to the initial model.

use crate::stats::{LayerStats, MergeStats};
use crate::weights::{check_layer_set, sign_of};
use crate::{MergeError, ModelWeights, Result, SignMap, TaskVector, WeightTensor};
use indexmap::IndexMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

/// TIES merge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TiesConfig {
    /// Percentage of elements retained by magnitude, in (0, 100]
    pub top_k: f32,
    /// Scaling factor for the merged task vector
    pub scale: f32,
    /// Per-layer `top_k` overrides
    pub layer_top_k: IndexMap<String, f32>,
    /// Process layers in parallel
    pub parallel: bool,
}

impl Default for TiesConfig {
    fn default() -> Self {
        Self {
            top_k: 20.0,
            scale: 1.0,
            layer_top_k: IndexMap::new(),
            parallel: false,
        }
    }
}

impl TiesConfig {
    /// Create config with a specific retention percentage
    pub fn with_top_k(top_k: f32) -> Self {
        Self {
            top_k,
            ..Default::default()
        }
    }

    /// Set the scaling factor
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Override the retention percentage for one layer
    pub fn with_layer_top_k(mut self, layer: impl Into<String>, top_k: f32) -> Self {
        self.layer_top_k.insert(layer.into(), top_k);
        self
    }

    /// Enable or disable parallel layer processing
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Get retention percentage for a layer
    pub fn top_k_for_layer(&self, layer: &str) -> f32 {
        *self.layer_top_k.get(layer).unwrap_or(&self.top_k)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !valid_top_k(self.top_k) {
            return Err(MergeError::ConfigError(format!(
                "top_k must be in (0, 100], got {}",
                self.top_k
            )));
        }

        for (layer, &top_k) in &self.layer_top_k {
            if !valid_top_k(top_k) {
                return Err(MergeError::ConfigError(format!(
                    "top_k for layer '{}' must be in (0, 100], got {}",
                    layer, top_k
                )));
            }
        }

        if !self.scale.is_finite() {
            return Err(MergeError::ConfigError(format!(
                "scale must be finite, got {}",
                self.scale
            )));
        }

        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn valid_top_k(top_k: f32) -> bool {
    top_k > 0.0 && top_k <= 100.0
}

/// Magnitude threshold keeping the top `top_k` percent of `data`.
///
/// This is the `1 - top_k/100` quantile of `|data|`, interpolated linearly
/// between order statistics. Returns `None` for an empty slice. The result is
/// NaN when any element is NaN, or when interpolation meets an infinite
/// magnitude (`inf - inf`, `0 * inf`).
pub fn magnitude_threshold(data: &[f32], top_k: f32) -> Option<f32> {
    if data.is_empty() {
        return None;
    }

    let mut magnitudes: Vec<f32> = data.iter().map(|x| x.abs()).collect();
    if magnitudes.iter().any(|m| m.is_nan()) {
        return Some(f32::NAN);
    }
    magnitudes.sort_unstable_by(f32::total_cmp);

    let q = (1.0 - f64::from(top_k) / 100.0).clamp(0.0, 1.0);
    let last = magnitudes.len() - 1;
    let pos = q * last as f64;
    let lo = pos.floor() as usize;
    let hi = (pos.ceil() as usize).min(last);
    let frac = (pos - lo as f64) as f32;

    let (a, b) = (magnitudes[lo], magnitudes[hi]);
    let threshold = a + (b - a) * frac;
    if threshold.is_nan() {
        return Some(f32::NAN);
    }
    // Clamped so the threshold never overshoots the upper order statistic
    Some(threshold.min(b))
}

/// Zero every element whose magnitude is below the `top_k` threshold.
///
/// Kept elements retain their full value; ties at the threshold are kept.
pub fn trim_tensor(tensor: &WeightTensor, top_k: f32) -> WeightTensor {
    let Some(threshold) = magnitude_threshold(&tensor.data, top_k) else {
        return tensor.clone();
    };
    trace!(layer = %tensor.name, top_k, threshold, "Trim threshold");

    let data = tensor
        .data
        .iter()
        .map(|&x| if x.abs() >= threshold { x } else { 0.0 })
        .collect();

    tensor.with_data(data)
}

/// TIES merger
#[derive(Debug, Clone)]
pub struct TiesMerger {
    /// Configuration
    config: TiesConfig,
}

impl TiesMerger {
    /// Create new TIES merger, rejecting invalid configurations
    pub fn new(config: TiesConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration in use
    pub fn config(&self) -> &TiesConfig {
        &self.config
    }

    /// Map over items in order, in parallel when configured
    fn map_ordered<'a, T, U, F>(&self, items: &'a [T], f: F) -> Vec<U>
    where
        T: Sync,
        U: Send,
        F: Fn(&'a T) -> U + Sync + Send,
    {
        if self.config.parallel {
            items.par_iter().map(f).collect()
        } else {
            items.iter().map(f).collect()
        }
    }

    /// Compute one task vector per fine-tuned model.
    ///
    /// Every model is validated against `base` before any subtraction runs.
    pub fn create_task_vectors(
        &self,
        base: &ModelWeights,
        finetuned: &[&ModelWeights],
    ) -> Result<Vec<TaskVector>> {
        if finetuned.is_empty() {
            return Err(MergeError::EmptyInput);
        }

        for model in finetuned {
            base.check_compatible(model)?;
        }

        finetuned
            .iter()
            .map(|model| TaskVector::from_models(base, model))
            .collect()
    }

    /// Trim one task vector layer by layer
    pub fn trim(&self, task_vector: &TaskVector) -> TaskVector {
        let layers: Vec<(&String, &WeightTensor)> = task_vector.layers.iter().collect();
        let trimmed = self.map_ordered(&layers, |(name, tensor)| {
            let tensor = trim_tensor(tensor, self.config.top_k_for_layer(name));
            ((*name).clone(), tensor)
        });

        TaskVector {
            source: task_vector.source.clone(),
            layers: trimmed.into_iter().collect(),
        }
    }

    /// Elect the per-element sign: sign of the summed signs across vectors
    pub fn elect_signs(&self, trimmed: &[TaskVector]) -> Result<SignMap> {
        let first = check_vectors(trimmed)?;
        let layers: Vec<(&String, &WeightTensor)> = first.layers.iter().collect();

        let elected = self.map_ordered(&layers, |(name, reference)| {
            let mut sums = vec![0i32; reference.numel()];
            for tv in trimmed {
                let tensor = matching_layer(tv, name, reference)?;
                for (sum, &x) in sums.iter_mut().zip(&tensor.data) {
                    *sum += i32::from(sign_of(x));
                }
            }
            let signs: Vec<i8> = sums.iter().map(|s| s.signum() as i8).collect();
            Ok::<_, MergeError>(((*name).clone(), signs))
        });

        Ok(SignMap {
            layers: elected.into_iter().collect::<Result<IndexMap<_, _>>>()?,
        })
    }

    /// Average the elements agreeing with the elected sign.
    ///
    /// The mean runs over every vector; disagreeing elements count as zero.
    pub fn disjoint_merge(&self, trimmed: &[TaskVector], signs: &SignMap) -> Result<TaskVector> {
        let first = check_vectors(trimmed)?;
        check_layer_set(ELECTED_SIGNS, &first.layers, &signs.layers)?;
        let layers: Vec<(&String, &WeightTensor)> = first.layers.iter().collect();
        let count = trimmed.len() as f32;

        let merged = self.map_ordered(&layers, |(name, reference)| {
            let elected = elected_signs(signs, name, reference)?;

            let mut sum = vec![0.0f32; reference.numel()];
            for tv in trimmed {
                let tensor = matching_layer(tv, name, reference)?;
                for ((acc, &x), &s) in sum.iter_mut().zip(&tensor.data).zip(elected) {
                    *acc += if sign_of(x) == s { x } else { 0.0 };
                }
            }

            let data = sum.into_iter().map(|v| v / count).collect();
            Ok::<_, MergeError>(((*name).clone(), reference.with_data(data)))
        });

        Ok(TaskVector {
            source: "merged".into(),
            layers: merged.into_iter().collect::<Result<IndexMap<_, _>>>()?,
        })
    }

    /// Per-layer diagnostics for trimmed vectors and their elected signs
    pub fn collect_stats(&self, trimmed: &[TaskVector], signs: &SignMap) -> Result<MergeStats> {
        let first = check_vectors(trimmed)?;
        check_layer_set(ELECTED_SIGNS, &first.layers, &signs.layers)?;
        let layers: Vec<(&String, &WeightTensor)> = first.layers.iter().collect();

        let stats = self.map_ordered(&layers, |(name, reference)| {
            let elected = elected_signs(signs, name, reference)?;
            let tensors = trimmed
                .iter()
                .map(|tv| matching_layer(tv, name, reference))
                .collect::<Result<Vec<_>>>()?;
            LayerStats::collect(name, &tensors, elected)
        });
        let stats = stats.into_iter().collect::<Result<Vec<_>>>()?;

        for layer in &stats {
            debug!(
                layer = %layer.name,
                numel = layer.numel,
                kept = layer.kept,
                sign_conflicts = layer.sign_conflicts,
                elected_zero = layer.elected_zero,
                "Merged layer"
            );
        }

        Ok(MergeStats { layers: stats })
    }

    /// Merge complete models using TIES, returning merge diagnostics
    pub fn merge_models_with_stats(
        &self,
        base: &ModelWeights,
        finetuned: &[&ModelWeights],
    ) -> Result<(ModelWeights, MergeStats)> {
        info!(
            models = finetuned.len(),
            layers = base.len(),
            top_k = self.config.top_k,
            scale = self.config.scale,
            "Starting TIES merge"
        );

        // Step 1: Task vectors
        let task_vectors = self.create_task_vectors(base, finetuned)?;

        // Step 2: Trim
        let trimmed: Vec<TaskVector> = task_vectors.iter().map(|tv| self.trim(tv)).collect();

        // Step 3: Elect sign
        let signs = self.elect_signs(&trimmed)?;

        // Step 4: Disjoint merge
        let merged_delta = self.disjoint_merge(&trimmed, &signs)?;
        let stats = self.collect_stats(&trimmed, &signs)?;

        // Step 5: Scale and add to base
        let mut merged = merged_delta.apply(base, self.config.scale)?;
        merged.name = "merged".into();

        info!(
            params = stats.total_params(),
            kept_ratio = stats.kept_ratio(),
            conflict_ratio = stats.conflict_ratio(),
            "TIES merge complete"
        );

        Ok((merged, stats))
    }

    /// Merge complete models using TIES
    pub fn merge_models(
        &self,
        base: &ModelWeights,
        finetuned: &[&ModelWeights],
    ) -> Result<ModelWeights> {
        self.merge_models_with_stats(base, finetuned)
            .map(|(merged, _)| merged)
    }
}

const ELECTED_SIGNS: &str = "elected signs";

/// First trimmed vector, after checking every vector carries its layer set
fn check_vectors(trimmed: &[TaskVector]) -> Result<&TaskVector> {
    let first = trimmed.first().ok_or(MergeError::EmptyInput)?;
    for tv in &trimmed[1..] {
        check_layer_set(&tv.source, &first.layers, &tv.layers)?;
    }
    Ok(first)
}

/// Elected signs for layer `name`, required to match the reference size
fn elected_signs<'a>(
    signs: &'a SignMap,
    name: &str,
    reference: &WeightTensor,
) -> Result<&'a [i8]> {
    let elected = signs.get(name).ok_or_else(|| MergeError::LayerMismatch {
        model: ELECTED_SIGNS.into(),
        missing: vec![name.to_string()],
        unexpected: Vec::new(),
    })?;

    if elected.len() != reference.numel() {
        return Err(MergeError::ShapeMismatch {
            layer: name.to_string(),
            expected: reference.shape.clone(),
            got: vec![elected.len()],
        });
    }

    Ok(elected)
}

/// Layer `name` of `tv`, required to match the reference shape
fn matching_layer<'a>(
    tv: &'a TaskVector,
    name: &str,
    reference: &WeightTensor,
) -> Result<&'a WeightTensor> {
    let tensor = tv.get_layer(name).ok_or_else(|| MergeError::LayerMismatch {
        model: tv.source.clone(),
        missing: vec![name.to_string()],
        unexpected: Vec::new(),
    })?;

    if tensor.shape != reference.shape {
        return Err(MergeError::ShapeMismatch {
            layer: name.to_string(),
            expected: reference.shape.clone(),
            got: tensor.shape.clone(),
        });
    }

    Ok(tensor)
}
