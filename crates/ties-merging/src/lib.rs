// Test modules have minor lints that don't affect production code
#![cfg_attr(test, allow(clippy::useless_vec))]

//! TIES model merging
//!
//! Combines several fine-tuned models that share an initial (pretrained)
//! model into one set of weights:
//! - Task vectors: fine-tuned weights minus initial weights
//! - Trim: keep the `top_k` percent largest-magnitude entries per layer
//! - Elect: majority sign per element across trimmed vectors
//! - Merge: mean of the entries agreeing with the elected sign
//!
//! The merged task vector is scaled and added back to the initial model.
//!
//! ```
//! use ties_merging::{ModelWeights, TiesConfig, TiesMerger, WeightTensor};
//!
//! let mut base = ModelWeights::new("base");
//! base.add_layer(WeightTensor::zeros("fc", vec![4]));
//!
//! let mut task_a = ModelWeights::new("task_a");
//! task_a.add_layer(WeightTensor::new("fc", vec![4], vec![1.0, -1.0, 0.1, -0.1])?);
//! let mut task_b = ModelWeights::new("task_b");
//! task_b.add_layer(WeightTensor::new("fc", vec![4], vec![0.9, -0.8, -0.1, 0.2])?);
//!
//! let merger = TiesMerger::new(TiesConfig::with_top_k(50.0))?;
//! let merged = merger.merge_models(&base, &[&task_a, &task_b])?;
//! assert_eq!(merged.get_layer("fc").unwrap().data[2], 0.0);
//! # Ok::<(), ties_merging::MergeError>(())
//! ```

mod error;
mod stats;
mod ties;
mod weights;

pub use error::{MergeError, Result};
pub use stats::{LayerStats, MergeStats};
pub use ties::{magnitude_threshold, trim_tensor, TiesConfig, TiesMerger};
pub use weights::{sign_of, ModelWeights, SignMap, TaskVector, WeightTensor};

/// Merge `finetuned` into `base` with the given retention percentage and scale
pub fn ties_merge(
    base: &ModelWeights,
    finetuned: &[&ModelWeights],
    top_k: f32,
    scale: f32,
) -> Result<ModelWeights> {
    TiesMerger::new(TiesConfig::with_top_k(top_k).with_scale(scale))?.merge_models(base, finetuned)
}
