//! Decomposition of fused scaled-dot-product attention into primitive ops.
//!
//! `softmax(q * scale @ k^T + bias) @ v` where `scale = 1/sqrt(head_dim)` unless an
//! explicit scale input is given, and `bias` comes from the mask:
//!
//! - causal attribute set: synthesized upper-triangular `-inf` (`col >= row + 1`),
//!   any supplied mask is ignored
//! - boolean mask: `true` keeps a position, `false` becomes `-inf`
//! - float mask: added as-is

use tracing::debug;

use crate::error::InferenceError;
use crate::graph::{ComputeGraph, NodeId, Op};
use crate::tensor::{ElementType, Tensor};

/// Replace every fused attention node. Returns how many were decomposed.
pub fn decompose_attention(graph: &mut ComputeGraph) -> Result<usize, InferenceError> {
    let targets = graph.find_nodes(|n| matches!(n.op, Op::ScaledDotProductAttention { .. }));
    for &id in &targets {
        decompose_one(graph, id)?;
    }
    if !targets.is_empty() {
        graph.prune();
        graph.validate()?;
    }
    debug!(count = targets.len(), "Decomposed attention nodes");
    Ok(targets.len())
}

fn float_scalar(graph: &mut ComputeGraph, name: &str, value: f32, et: ElementType) -> NodeId {
    graph.add_constant(name, Tensor::scalar_f32(value).convert(et))
}

fn decompose_one(graph: &mut ComputeGraph, id: NodeId) -> Result<(), InferenceError> {
    let node = graph.node(id).clone();
    let causal = match node.op {
        Op::ScaledDotProductAttention { causal } => causal,
        _ => return Ok(()),
    };
    let base = node.name.clone();
    let (q, k, v) = (node.inputs[0], node.inputs[1], node.inputs[2]);
    let mask = node.inputs.get(3).copied();
    let explicit_scale = node.inputs.get(4).copied();
    let et = graph.node(q).output.element_type;

    let scale = match explicit_scale {
        Some(s) => s,
        None => {
            let head_dim = graph.add_op(&format!("{base}/head_dim"), Op::DimOf { axis: -1 }, &[q])?;
            let head_dim = graph.add_op(&format!("{base}/head_dim_f"), Op::Convert { to: et }, &[head_dim])?;
            let root = graph.add_op(&format!("{base}/sqrt"), Op::Sqrt, &[head_dim])?;
            let one = float_scalar(graph, &format!("{base}/one"), 1.0, et);
            graph.add_op(&format!("{base}/scale"), Op::Divide, &[one, root])?
        }
    };

    let q_scaled = graph.add_op(&format!("{base}/q_scaled"), Op::Multiply, &[q, scale])?;
    let mut scores = graph.add_op(
        &format!("{base}/qk"),
        Op::MatMul {
            transpose_a: false,
            transpose_b: true,
        },
        &[q_scaled, k],
    )?;

    let bias = if causal {
        Some(causal_bias(graph, &base, q, k, et)?)
    } else if let Some(mask) = mask {
        let mask_et = graph.node(mask).output.element_type;
        if mask_et == ElementType::Bool {
            let masked_out = graph.add_op(&format!("{base}/mask_not"), Op::LogicalNot, &[mask])?;
            let minus_inf = float_scalar(graph, &format!("{base}/minus_inf"), f32::NEG_INFINITY, et);
            let zero = float_scalar(graph, &format!("{base}/zero"), 0.0, et);
            Some(graph.add_op(&format!("{base}/mask_bias"), Op::Select, &[masked_out, minus_inf, zero])?)
        } else if mask_et != et {
            Some(graph.add_op(&format!("{base}/mask_cvt"), Op::Convert { to: et }, &[mask])?)
        } else {
            Some(mask)
        }
    } else {
        None
    };
    if let Some(bias) = bias {
        scores = graph.add_op(&format!("{base}/qk_masked"), Op::Add, &[scores, bias])?;
    }

    let probs = graph.add_op(&format!("{base}/softmax"), Op::Softmax { axis: -1 }, &[scores])?;
    let out = graph.add_op(
        &base,
        Op::MatMul {
            transpose_a: false,
            transpose_b: false,
        },
        &[probs, v],
    )?;
    graph.node_mut(out).output.names = node.output.names.clone();
    graph.replace_uses(id, out);
    Ok(())
}

/// `[T, S]` bias: `-inf` where `col >= row + 1`, zero elsewhere.
fn causal_bias(
    graph: &mut ComputeGraph,
    base: &str,
    q: NodeId,
    k: NodeId,
    et: ElementType,
) -> Result<NodeId, InferenceError> {
    let target_len = graph.add_op(&format!("{base}/target_len"), Op::DimOf { axis: -2 }, &[q])?;
    let source_len = graph.add_op(&format!("{base}/source_len"), Op::DimOf { axis: -2 }, &[k])?;
    let zero = graph.add_constant(&format!("{base}/i_zero"), Tensor::scalar_i64(0));
    let one = graph.add_constant(&format!("{base}/i_one"), Tensor::scalar_i64(1));

    let row_stop = graph.add_op(&format!("{base}/row_stop"), Op::Add, &[target_len, one])?;
    let rows = graph.add_op(&format!("{base}/rows"), Op::Range, &[one, row_stop])?;
    let rows = graph.add_op(&format!("{base}/rows_col"), Op::Unsqueeze { axis: 1 }, &[rows])?;
    let cols = graph.add_op(&format!("{base}/cols"), Op::Range, &[zero, source_len])?;
    let cols = graph.add_op(&format!("{base}/cols_row"), Op::Unsqueeze { axis: 0 }, &[cols])?;
    let upper = graph.add_op(&format!("{base}/triu"), Op::GreaterEqual, &[cols, rows])?;

    let minus_inf = float_scalar(graph, &format!("{base}/minus_inf"), f32::NEG_INFINITY, et);
    let fzero = float_scalar(graph, &format!("{base}/zero"), 0.0, et);
    graph.add_op(&format!("{base}/causal_bias"), Op::Select, &[upper, minus_inf, fzero])
}
