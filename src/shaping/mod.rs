//! Static-shape variants of a decoder graph.
//!
//! The prefill variant is sized to the max prompt length, the generate variant to
//! one token against a fixed total cache window. Cache inputs are matched by the
//! `past_key_values` name pattern, cache outputs by `present`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::InferenceError;
use crate::graph::{ComputeGraph, Dim, Op, PartialShape, SLICE_TO_END};

pub const KV_INPUT_PATTERN: &str = "past_key_values";
pub const KV_OUTPUT_PATTERN: &str = "present";

/// Batch and sequence axes of the KV cache tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvAxesPosition {
    pub batch: usize,
    pub seq_len: usize,
}

impl Default for KvAxesPosition {
    fn default() -> Self {
        Self { batch: 0, seq_len: 2 }
    }
}

/// Where the sequence axis lives for each kind of cache tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KvCacheLayout {
    pub axes: KvAxesPosition,
    /// Values stored as `[batch, heads, head_dim, seq]`.
    pub values_transposed: bool,
}

impl KvCacheLayout {
    pub fn new(axes: KvAxesPosition, values_transposed: bool) -> Self {
        Self {
            axes,
            values_transposed,
        }
    }

    /// Sequence axis of the cache tensor called `name`.
    pub fn seq_axis(&self, name: &str) -> usize {
        if self.values_transposed && is_value_tensor(name) {
            3
        } else {
            self.axes.seq_len
        }
    }
}

/// Whether `name` is a value cache tensor (`past_key_values.0.value`,
/// `present.0.value`). Only the last dotted segment counts, since the
/// `past_key_values` prefix also names key inputs.
pub fn is_value_tensor(name: &str) -> bool {
    name.rsplit('.').next().is_some_and(|last| last.contains("value"))
}

fn is_kv_input(name: &str) -> bool {
    name.contains(KV_INPUT_PATTERN)
}

/// Cache axes from the concat consuming the first cache input.
pub fn kv_axes_position(graph: &ComputeGraph) -> KvAxesPosition {
    let first_cache = graph
        .parameters()
        .iter()
        .copied()
        .find(|&p| is_kv_input(&graph.node(p).name));
    let Some(param) = first_cache else {
        return KvAxesPosition::default();
    };
    for (consumer, _) in graph.consumers(param) {
        let node = graph.node(consumer);
        if let Op::Concat { axis } = node.op {
            let rank = graph.node(param).output.shape.rank() as i64;
            let seq_len = if axis < 0 { axis + rank } else { axis } as usize;
            let batch = if seq_len == 0 { 1 } else { 0 };
            debug!(batch, seq_len, "Detected KV cache axes");
            return KvAxesPosition { batch, seq_len };
        }
    }
    KvAxesPosition::default()
}

/// Fix every graph input to a static shape.
///
/// `input_ids` and `position_ids` become `[1, input_size]`, `attention_mask`
/// becomes `[1, kvcache_size]`, cache inputs get batch 1 and
/// `kvcache_size - input_size` positions along their sequence axis.
pub fn reshape_to_static(
    graph: &mut ComputeGraph,
    input_size: usize,
    kvcache_size: usize,
    layout: &KvCacheLayout,
) -> Result<(), InferenceError> {
    if kvcache_size < input_size {
        return Err(InferenceError::Config(format!(
            "KV cache size {} is smaller than input size {}",
            kvcache_size, input_size
        )));
    }

    let mut new_shapes = BTreeMap::new();
    for &p in graph.parameters() {
        let node = graph.node(p);
        let name = node.name.as_str();
        let new_shape = if name.contains("input_ids") || name.contains("position_ids") {
            PartialShape::from_static(&[1, input_size])
        } else if name.contains("attention_mask") {
            PartialShape::from_static(&[1, kvcache_size])
        } else {
            let mut shape = node.output.shape.clone();
            let seq_axis = layout.seq_axis(name);
            let batch_axis = layout.axes.batch;
            if seq_axis >= shape.rank() || batch_axis >= shape.rank() {
                return Err(InferenceError::Graph(format!(
                    "input '{}' of shape {} has no axis {} or {}",
                    name, shape, batch_axis, seq_axis
                )));
            }
            shape.set_dim(batch_axis, Dim::Static(1));
            shape.set_dim(seq_axis, Dim::Static(kvcache_size - input_size));
            if !shape.is_static() {
                return Err(InferenceError::Graph(format!(
                    "input '{}' cannot be made static: {}",
                    name, shape
                )));
            }
            shape
        };
        new_shapes.insert(name.to_string(), new_shape);
    }
    graph.reshape(&new_shapes)?;
    debug!(input_size, kvcache_size, "Reshaped graph to static");
    Ok(())
}

/// Make each `present*` output return only the new cache entries: the result
/// reads the second input of the concat that feeds it.
pub fn redirect_new_kv_to_output(graph: &mut ComputeGraph) -> Result<usize, InferenceError> {
    let mut redirected = 0;
    let results: Vec<usize> = graph.results().to_vec();
    for r in results {
        if !graph.node(r).name.contains(KV_OUTPUT_PATTERN) {
            continue;
        }
        let source = graph.node(r).inputs[0];
        let concat = graph.node(source);
        if !matches!(concat.op, Op::Concat { .. }) || concat.inputs.len() < 2 {
            continue;
        }
        let delta = concat.inputs[1];
        graph.set_input(r, 0, delta);
        redirected += 1;
    }
    graph.validate()?;
    debug!(redirected, "Redirected new KV entries to outputs");
    Ok(redirected)
}

/// Grow each cache input by one position and slice `[1, len)` off it before its
/// consumers, giving a sliding window over one fixed buffer.
pub fn add_slices_to_kvcache_inputs(graph: &mut ComputeGraph, layout: &KvCacheLayout) -> Result<usize, InferenceError> {
    let params: Vec<usize> = graph.parameters().to_vec();
    let mut sliced = 0;
    for p in params {
        let node = graph.node(p).clone();
        if !is_kv_input(&node.name) {
            continue;
        }
        let axis = layout.seq_axis(&node.name);
        if axis >= node.output.shape.rank() {
            return Err(InferenceError::Graph(format!(
                "cache input '{}' of shape {} has no axis {}",
                node.name, node.output.shape, axis
            )));
        }
        let mut desc = node.output.clone();
        let grown = desc.shape.dim(axis).add(Dim::Static(1));
        desc.shape.set_dim(axis, grown);

        let new_param = graph.add_detached_parameter(&node.name, desc);
        graph.replace_parameter(p, new_param)?;
        let slice = graph.add_op(
            &format!("{}_Slice", node.name),
            Op::Slice {
                axis: axis as i64,
                start: 1,
                stop: SLICE_TO_END,
            },
            &[new_param],
        )?;
        graph.replace_uses(new_param, slice);
        sliced += 1;
    }
    graph.validate()?;
    debug!(sliced, "Added slices to KV cache inputs");
    Ok(sliced)
}
