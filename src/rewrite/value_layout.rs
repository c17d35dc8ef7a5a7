//! Value-cache layout inversion.
//!
//! Matches `MatMul(Softmax(..), Concat(Parameter, Transpose(x)))` and switches the
//! value path from `[batch, heads, seq, head_dim]` to `[batch, heads, head_dim,
//! seq]`: the cache parameter gets its last two dims swapped, the transpose order
//! becomes `(0, 2, 3, 1)`, the concat moves to axis 3 and the matmul reads the
//! value operand with `transpose_b`.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::InferenceError;
use crate::graph::{ComputeGraph, Dim, NodeId, Op, PartialShape, TensorDesc};

/// Parameters swapped by [`transpose_value_tensors`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueLayoutChanges {
    pub params_added: Vec<String>,
    pub params_removed: Vec<String>,
}

impl ValueLayoutChanges {
    pub fn fired(&self) -> bool {
        !self.params_added.is_empty()
    }
}

struct Match {
    matmul: NodeId,
    concat: NodeId,
    param: NodeId,
    transpose: NodeId,
}

fn match_value_path(graph: &ComputeGraph, matmul: NodeId) -> Option<Match> {
    let node = graph.node(matmul);
    match node.op {
        Op::MatMul {
            transpose_a: false,
            transpose_b: false,
        } => {}
        _ => return None,
    }
    let (probs, concat) = (node.inputs[0], node.inputs[1]);
    if !matches!(graph.node(probs).op, Op::Softmax { .. }) {
        return None;
    }
    let concat_node = graph.node(concat);
    if !matches!(concat_node.op, Op::Concat { .. }) || concat_node.inputs.len() != 2 {
        return None;
    }
    let (param, transpose) = (concat_node.inputs[0], concat_node.inputs[1]);
    if !matches!(graph.node(param).op, Op::Parameter) || !matches!(graph.node(transpose).op, Op::Transpose { .. }) {
        return None;
    }
    Some(Match {
        matmul,
        concat,
        param,
        transpose,
    })
}

/// Rewrite every matching value path. Returns the swapped parameters.
pub fn transpose_value_tensors(graph: &mut ComputeGraph) -> Result<ValueLayoutChanges, InferenceError> {
    let mut changes = ValueLayoutChanges::default();
    let mut seen_params = BTreeSet::new();

    let candidates = graph.find_nodes(|n| matches!(n.op, Op::MatMul { .. }));
    for id in candidates {
        let Some(m) = match_value_path(graph, id) else {
            continue;
        };

        if seen_params.insert(m.param) {
            let old = graph.node(m.param).clone();
            if old.output.shape.rank() != 4 {
                return Err(InferenceError::Graph(format!(
                    "value cache input '{}' must be rank 4, got {}",
                    old.name, old.output.shape
                )));
            }
            let mut dims: Vec<Dim> = old.output.shape.dims().to_vec();
            dims.swap(2, 3);
            let new_param = graph.add_detached_parameter(
                &old.name,
                TensorDesc {
                    element_type: old.output.element_type,
                    shape: PartialShape(dims),
                    names: old.output.names.clone(),
                },
            );
            graph.replace_parameter(m.param, new_param)?;
            seen_params.insert(new_param);
            changes.params_removed.push(old.name.clone());
            changes.params_added.push(old.name);
        }

        graph.node_mut(m.transpose).op = Op::Transpose {
            order: vec![0, 2, 3, 1],
        };
        graph.node_mut(m.concat).op = Op::Concat { axis: 3 };
        graph.node_mut(m.matmul).op = Op::MatMul {
            transpose_a: false,
            transpose_b: true,
        };
    }

    if changes.fired() {
        graph.validate()?;
    }
    debug!(
        swapped = changes.params_added.len(),
        "Transposed value tensors"
    );
    Ok(changes)
}
