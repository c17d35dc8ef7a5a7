//! Cache precision narrowing, value output layout, and u4 zero-point alignment.

use tracing::debug;

use crate::error::InferenceError;
use crate::graph::{ComputeGraph, Op};
use crate::shaping::is_value_tensor;
use crate::tensor::{ElementType, Tensor, TensorStorage};

fn any_name_contains(graph: &ComputeGraph, id: usize, pattern: &str) -> bool {
    let node = graph.node(id);
    node.name.contains(pattern) || node.output.names.iter().any(|n| n.contains(pattern))
}

/// Store the KV cache in f16: `past_key*` inputs become f16 and are converted back
/// to the compute type; `present*` outputs are converted to f16.
pub fn cvt_kvcache_to_fp16(graph: &mut ComputeGraph) -> Result<usize, InferenceError> {
    let mut converted = 0;

    let params: Vec<usize> = graph.parameters().to_vec();
    for p in params {
        if !any_name_contains(graph, p, "past_key") {
            continue;
        }
        let compute_type = graph.node(p).output.element_type;
        if compute_type == ElementType::F16 {
            continue;
        }
        graph.node_mut(p).output.element_type = ElementType::F16;
        let name = format!("{}/to_compute", graph.node(p).name);
        let back = graph.add_op(&name, Op::Convert { to: compute_type }, &[p])?;
        graph.replace_uses(p, back);
        converted += 1;
    }

    let results: Vec<usize> = graph.results().to_vec();
    for r in results {
        if !any_name_contains(graph, r, "present") {
            continue;
        }
        let source = graph.node(r).inputs[0];
        if graph.node(source).output.element_type == ElementType::F16 {
            continue;
        }
        let name = format!("{}/to_f16", graph.node(r).name);
        let narrowed = graph.add_op(&name, Op::Convert { to: ElementType::F16 }, &[source])?;
        graph.set_input(r, 0, narrowed);
        converted += 1;
    }

    graph.validate()?;
    debug!(converted, "Converted KV cache to f16");
    Ok(converted)
}

/// Transpose every value cache output from `[b, h, s, e]` to `[b, h, e, s]`.
pub fn cvt_value_tensors_layout(graph: &mut ComputeGraph) -> Result<usize, InferenceError> {
    let results: Vec<usize> = graph.results().to_vec();
    let mut transposed = 0;
    for r in results {
        let node = graph.node(r);
        if !is_value_tensor(&node.name) && !node.output.names.iter().any(|n| is_value_tensor(n)) {
            continue;
        }
        let source = graph.node(r).inputs[0];
        if graph.node(source).output.shape.rank() != 4 {
            return Err(InferenceError::Graph(format!(
                "value output '{}' must be rank 4, got {}",
                graph.node(r).name,
                graph.node(source).output.shape
            )));
        }
        let name = format!("{}/bhes", graph.node(r).name);
        let t = graph.add_op(&name, Op::Transpose { order: vec![0, 1, 3, 2] }, &[source])?;
        graph.set_input(r, 0, t);
        transposed += 1;
    }
    graph.validate()?;
    debug!(transposed, "Converted value outputs layout");
    Ok(transposed)
}

/// Mask every single-element u4 constant to its low nibble.
pub fn align_u4_zp_constants(graph: &mut ComputeGraph) -> Result<usize, InferenceError> {
    let targets = graph.find_nodes(|n| match &n.op {
        Op::Constant(t) => t.element_type() == ElementType::U4 && t.n_elements() == 1,
        _ => false,
    });
    for &id in &targets {
        let aligned = match &graph.node(id).op {
            Op::Constant(t) => {
                let masked = t.as_u4()[0] & 0x0F;
                Tensor::from_storage(t.shape().to_vec(), TensorStorage::U4(vec![masked]))?
            }
            _ => continue,
        };
        graph.node_mut(id).op = Op::Constant(aligned);
    }
    debug!(count = targets.len(), "Aligned u4 zero points");
    Ok(targets.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PartialShape;

    fn cache_graph() -> ComputeGraph {
        let mut g = ComputeGraph::new();
        let past = g.add_parameter("past_key_values.0.key", ElementType::F32, PartialShape::dynamic(4));
        let new = g.add_parameter("new_key", ElementType::F32, PartialShape::dynamic(4));
        let cat = g.add_op("cat", Op::Concat { axis: 2 }, &[past, new]).unwrap();
        g.add_result("present.0.key", cat).unwrap();
        g.add_result("present.0.value", new).unwrap();
        g
    }

    #[test]
    fn test_kvcache_to_fp16() {
        let mut g = cache_graph();
        assert_eq!(cvt_kvcache_to_fp16(&mut g).unwrap(), 3);

        let past = g.parameter_by_name("past_key_values.0.key").unwrap();
        assert_eq!(g.node(past).output.element_type, ElementType::F16);
        let new = g.parameter_by_name("new_key").unwrap();
        assert_eq!(g.node(new).output.element_type, ElementType::F32, "non-cache input untouched");

        let cat = g.find_nodes(|n| n.name == "cat")[0];
        assert_eq!(g.node(cat).output.element_type, ElementType::F32);
        for name in ["present.0.key", "present.0.value"] {
            let r = g.result_by_name(name).unwrap();
            assert_eq!(g.node(r).output.element_type, ElementType::F16, "{}", name);
        }
    }

    #[test]
    fn test_kvcache_to_fp16_idempotent() {
        let mut g = cache_graph();
        cvt_kvcache_to_fp16(&mut g).unwrap();
        assert_eq!(cvt_kvcache_to_fp16(&mut g).unwrap(), 0);
    }

    #[test]
    fn test_value_layout_only_value_outputs() {
        let mut g = ComputeGraph::new();
        let k = g.add_parameter("k", ElementType::F32, PartialShape::from_static(&[1, 2, 7, 4]));
        let v = g.add_parameter("v", ElementType::F32, PartialShape::from_static(&[1, 2, 7, 4]));
        g.add_result("present.0.key", k).unwrap();
        g.add_result("present.0.value", v).unwrap();

        assert_eq!(cvt_value_tensors_layout(&mut g).unwrap(), 1);
        let key = g.result_by_name("present.0.key").unwrap();
        let value = g.result_by_name("present.0.value").unwrap();
        assert_eq!(g.node(key).output.shape, PartialShape::from_static(&[1, 2, 7, 4]));
        assert_eq!(g.node(value).output.shape, PartialShape::from_static(&[1, 2, 4, 7]));
    }

    #[test]
    fn test_align_u4_zero_points() {
        let mut g = ComputeGraph::new();
        let zp = g.add_constant("zp", Tensor::from_u4(vec![1], vec![0xF8]));
        let weights = g.add_constant("w", Tensor::from_u4(vec![2], vec![0xF1, 0x22]));
        let x = g.add_op("zp_f", Op::Convert { to: ElementType::F32 }, &[zp]).unwrap();
        g.add_result("out", x).unwrap();
        g.add_result("w_out", weights).unwrap();

        assert_eq!(align_u4_zp_constants(&mut g).unwrap(), 1);
        match &g.node(zp).op {
            Op::Constant(t) => assert_eq!(t.as_u4(), &[0x08]),
            other => panic!("unexpected op {:?}", other),
        }
        match &g.node(weights).op {
            Op::Constant(t) => assert_eq!(t.as_u4(), &[0xF1, 0x22], "multi-element constants untouched"),
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_align_u4_scalar_zero_point_keeps_shape() {
        let mut g = ComputeGraph::new();
        let zp = g.add_constant("zp", Tensor::from_u4(Vec::new(), vec![0xFF]));
        g.add_result("out", zp).unwrap();
        assert_eq!(align_u4_zp_constants(&mut g).unwrap(), 1);
        match &g.node(zp).op {
            Op::Constant(t) => {
                assert!(t.shape().is_empty());
                assert_eq!(t.as_u4(), &[0x0F]);
            }
            other => panic!("unexpected op {:?}", other),
        }
    }
}
