//! Graph-to-graph rewrite passes.
//!
//! Every pass takes the graph by `&mut`, leaves it validated, and reports what it
//! changed. Patterns that do not match are skipped; violated rank preconditions are
//! returned as [`InferenceError::Graph`](crate::error::InferenceError::Graph).

pub mod precision;
pub mod sdpa;
pub mod value_layout;

use tracing::debug;

use crate::error::InferenceError;
use crate::graph::ComputeGraph;

pub use precision::{align_u4_zp_constants, cvt_kvcache_to_fp16, cvt_value_tensors_layout};
pub use sdpa::decompose_attention;
pub use value_layout::{transpose_value_tensors, ValueLayoutChanges};

/// Outcome of [`optimize_value_tensors`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RewriteReport {
    pub attention_decomposed: usize,
    pub params_added: Vec<String>,
    pub params_removed: Vec<String>,
    pub values_transposed: bool,
}

/// Decompose attention, then invert the value-cache layout where it matches.
pub fn optimize_value_tensors(graph: &mut ComputeGraph) -> Result<RewriteReport, InferenceError> {
    let attention_decomposed = decompose_attention(graph)?;
    let changes = transpose_value_tensors(graph)?;
    graph.validate()?;

    let report = RewriteReport {
        attention_decomposed,
        values_transposed: changes.fired(),
        params_added: changes.params_added,
        params_removed: changes.params_removed,
    };
    debug!(
        attention = report.attention_decomposed,
        transposed = report.values_transposed,
        "Optimized value tensors"
    );
    Ok(report)
}
