//! Graph interpreter for the reference device.
//!
//! Evaluates nodes in topological order on host tensors. Float math runs in f32;
//! f16 inputs are widened and outputs narrowed back to the node's declared type.

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::InferenceError;
use crate::graph::op::resolve_slice;
use crate::graph::shape::broadcast_static;
use crate::graph::{ComputeGraph, Node, NodeId, Op};
use crate::tensor::{compute_strides, normalize_axis, ElementType, Tensor};

/// Run `graph` on named inputs and return every result by name.
pub fn evaluate(
    graph: &ComputeGraph,
    inputs: &BTreeMap<String, Tensor>,
) -> Result<BTreeMap<String, Tensor>, InferenceError> {
    let order = graph.topological_order()?;
    let mut values: Vec<Option<Tensor>> = vec![None; order.iter().max().map_or(0, |m| m + 1)];

    for id in order {
        let node = graph.node(id);
        let value = match &node.op {
            Op::Parameter => bind_parameter(node, inputs)?,
            Op::Constant(t) => t.clone(),
            _ => {
                let args = node
                    .inputs
                    .iter()
                    .map(|&i| {
                        values[i].as_ref().ok_or_else(|| {
                            InferenceError::Graph(format!("input {} of '{}' was not computed", i, node.name))
                        })
                    })
                    .collect::<Result<Vec<&Tensor>, InferenceError>>()?;
                let out = eval_op(&node.op, &args).map_err(|e| {
                    InferenceError::Backend(format!("evaluating '{}' ({}): {}", node.name, node.op.type_name(), e))
                })?;
                if out.element_type() != node.output.element_type {
                    out.convert(node.output.element_type)
                } else {
                    out
                }
            }
        };
        values[id] = Some(value);
    }

    let mut outputs = BTreeMap::new();
    for &r in graph.results() {
        let node = graph.node(r);
        let value = take_value(&values, r)?;
        for name in &node.output.names {
            outputs.insert(name.clone(), value.clone());
        }
        outputs.insert(node.name.clone(), value);
    }
    Ok(outputs)
}

fn take_value(values: &[Option<Tensor>], id: NodeId) -> Result<Tensor, InferenceError> {
    values
        .get(id)
        .and_then(|v| v.clone())
        .ok_or_else(|| InferenceError::Graph(format!("node {} was not computed", id)))
}

fn bind_parameter(node: &Node, inputs: &BTreeMap<String, Tensor>) -> Result<Tensor, InferenceError> {
    let tensor = inputs
        .get(&node.name)
        .or_else(|| node.output.names.iter().find_map(|n| inputs.get(n)))
        .ok_or_else(|| InferenceError::TensorNotFound(node.name.clone()))?;
    if tensor.element_type() != node.output.element_type {
        return Err(InferenceError::TypeMismatch {
            name: node.name.clone(),
            expected: node.output.element_type.to_string(),
            actual: tensor.element_type().to_string(),
        });
    }
    if !node.output.shape.accepts(tensor.shape()) {
        return Err(InferenceError::Backend(format!(
            "input '{}' of shape {:?} does not fit {}",
            node.name,
            tensor.shape(),
            node.output.shape
        )));
    }
    Ok(tensor.clone())
}

fn eval_op(op: &Op, args: &[&Tensor]) -> Result<Tensor, InferenceError> {
    match op {
        Op::Parameter | Op::Constant(_) => Err(InferenceError::Graph("not an operation".to_string())),
        Op::Result => Ok(args[0].clone()),
        Op::Convert { to } => Ok(args[0].convert(*to)),
        Op::MatMul {
            transpose_a,
            transpose_b,
        } => matmul(args[0], args[1], *transpose_a, *transpose_b),
        Op::Transpose { order } => Ok(transpose(args[0], order)),
        Op::Concat { axis } => {
            let axis = normalize_axis(*axis, args[0].rank())?;
            Tensor::concat(args, axis)
        }
        Op::Softmax { axis } => softmax(args[0], normalize_axis(*axis, args[0].rank())?),
        Op::Add => binary(args[0], args[1], |a, b| a + b, |a, b| a + b),
        Op::Subtract => binary(args[0], args[1], |a, b| a - b, |a, b| a - b),
        Op::Multiply => binary(args[0], args[1], |a, b| a * b, |a, b| a * b),
        Op::Divide => binary(args[0], args[1], |a, b| a / b, |a, b| if b == 0 { 0 } else { a / b }),
        Op::Sqrt => {
            let data: Vec<f32> = args[0].to_f32_vec().iter().map(|x| x.sqrt()).collect();
            Ok(Tensor::new(args[0].shape().to_vec(), data))
        }
        Op::Select => select(args[0], args[1], args[2]),
        Op::LogicalNot => {
            let data: Vec<bool> = args[0].convert(ElementType::Bool).as_bool().iter().map(|b| !b).collect();
            Ok(Tensor::from_bool(args[0].shape().to_vec(), data))
        }
        Op::GreaterEqual => greater_equal(args[0], args[1]),
        Op::DimOf { axis } => {
            let axis = normalize_axis(*axis, args[0].rank())?;
            Ok(Tensor::scalar_i64(args[0].shape()[axis] as i64))
        }
        Op::Range => {
            let start = first_i64(args[0])?;
            let stop = first_i64(args[1])?;
            let data: Vec<i64> = (start..stop.max(start)).collect();
            Ok(Tensor::from_i64(vec![data.len()], data))
        }
        Op::Unsqueeze { axis } => {
            let axis = normalize_axis(*axis, args[0].rank() + 1)?;
            let mut shape = args[0].shape().to_vec();
            shape.insert(axis, 1);
            Ok(args[0].reshape(&shape))
        }
        Op::Reshape { pattern } => reshape(args[0], pattern),
        Op::Gather { axis } => gather(args[0], args[1], normalize_axis(*axis, args[0].rank())?),
        Op::Slice { axis, start, stop } => {
            let axis = normalize_axis(*axis, args[0].rank())?;
            let (s, e) = resolve_slice(args[0].shape()[axis], *start, *stop);
            args[0].slice(axis, s, e)
        }
        Op::ScaledDotProductAttention { causal } => {
            attention(args[0], args[1], args[2], args.get(3).copied(), args.get(4).copied(), *causal)
        }
    }
}

fn first_i64(t: &Tensor) -> Result<i64, InferenceError> {
    t.to_i64_vec()
        .first()
        .copied()
        .ok_or_else(|| InferenceError::Graph("expected a scalar".to_string()))
}

/// Flat index into a tensor of `src` shape for every element of the broadcast
/// `out` shape.
fn broadcast_indices(src: &[usize], out: &[usize]) -> Vec<usize> {
    let n: usize = out.iter().product();
    let rank = out.len();
    let offset = rank - src.len();
    let src_strides = compute_strides(src);
    let out_strides = compute_strides(out);
    let mut indices = Vec::with_capacity(n);
    for flat in 0..n {
        let mut idx = 0;
        for d in 0..rank {
            if d < offset {
                continue;
            }
            let coord = (flat / out_strides[d]) % out[d];
            let sd = d - offset;
            if src[sd] != 1 {
                idx += coord * src_strides[sd];
            }
        }
        indices.push(idx);
    }
    indices
}

fn binary(
    a: &Tensor,
    b: &Tensor,
    ff: impl Fn(f32, f32) -> f32,
    fi: impl Fn(i64, i64) -> i64,
) -> Result<Tensor, InferenceError> {
    let shape = broadcast_static(a.shape(), b.shape())?;
    let ia = broadcast_indices(a.shape(), &shape);
    let ib = broadcast_indices(b.shape(), &shape);
    trace!(shape = ?shape, "Reference binary op");
    if a.element_type().is_integer() && b.element_type().is_integer() {
        let (da, db) = (a.to_i64_vec(), b.to_i64_vec());
        let data = ia.iter().zip(&ib).map(|(&x, &y)| fi(da[x], db[y])).collect();
        return Ok(Tensor::from_i64(shape, data));
    }
    let (da, db) = (a.to_f32_vec(), b.to_f32_vec());
    let data = ia.iter().zip(&ib).map(|(&x, &y)| ff(da[x], db[y])).collect();
    Ok(Tensor::new(shape, data))
}

fn greater_equal(a: &Tensor, b: &Tensor) -> Result<Tensor, InferenceError> {
    let shape = broadcast_static(a.shape(), b.shape())?;
    let ia = broadcast_indices(a.shape(), &shape);
    let ib = broadcast_indices(b.shape(), &shape);
    let data = if a.element_type().is_integer() {
        let (da, db) = (a.to_i64_vec(), b.to_i64_vec());
        ia.iter().zip(&ib).map(|(&x, &y)| da[x] >= db[y]).collect()
    } else {
        let (da, db) = (a.to_f32_vec(), b.to_f32_vec());
        ia.iter().zip(&ib).map(|(&x, &y)| da[x] >= db[y]).collect()
    };
    Ok(Tensor::from_bool(shape, data))
}

fn select(cond: &Tensor, then: &Tensor, other: &Tensor) -> Result<Tensor, InferenceError> {
    let shape = broadcast_static(&broadcast_static(cond.shape(), then.shape())?, other.shape())?;
    let ic = broadcast_indices(cond.shape(), &shape);
    let it = broadcast_indices(then.shape(), &shape);
    let io = broadcast_indices(other.shape(), &shape);
    let c = cond.convert(ElementType::Bool);
    let c = c.as_bool();
    if then.element_type().is_integer() {
        let (dt, de) = (then.to_i64_vec(), other.to_i64_vec());
        let data = (0..ic.len())
            .map(|i| if c[ic[i]] { dt[it[i]] } else { de[io[i]] })
            .collect();
        return Ok(Tensor::from_i64(shape, data));
    }
    let (dt, de) = (then.to_f32_vec(), other.to_f32_vec());
    let data = (0..ic.len())
        .map(|i| if c[ic[i]] { dt[it[i]] } else { de[io[i]] })
        .collect();
    Ok(Tensor::new(shape, data))
}

fn matmul(a: &Tensor, b: &Tensor, transpose_a: bool, transpose_b: bool) -> Result<Tensor, InferenceError> {
    let (sa, sb) = (a.shape(), b.shape());
    if sa.len() < 2 || sb.len() < 2 {
        return Err(InferenceError::ShapeMismatch {
            expected: vec![0, 0],
            actual: if sa.len() < 2 { sa.to_vec() } else { sb.to_vec() },
        });
    }
    let (ra0, ra1) = (sa[sa.len() - 2], sa[sa.len() - 1]);
    let (rb0, rb1) = (sb[sb.len() - 2], sb[sb.len() - 1]);
    let (m, k) = if transpose_a { (ra1, ra0) } else { (ra0, ra1) };
    let (kb, n) = if transpose_b { (rb1, rb0) } else { (rb0, rb1) };
    if k != kb {
        return Err(InferenceError::ShapeMismatch {
            expected: sa.to_vec(),
            actual: sb.to_vec(),
        });
    }

    let batch = broadcast_static(&sa[..sa.len() - 2], &sb[..sb.len() - 2])?;
    let ba = broadcast_indices(&sa[..sa.len() - 2], &batch);
    let bb = broadcast_indices(&sb[..sb.len() - 2], &batch);
    let n_batch = ba.len().max(1);

    trace!(batch = n_batch, m, k, n, transpose_a, transpose_b, "Reference matmul");

    let (da, db) = (a.to_f32_vec(), b.to_f32_vec());
    let mut result = vec![0.0f32; n_batch * m * n];
    for bi in 0..n_batch {
        let a_off = ba.get(bi).copied().unwrap_or(0) * ra0 * ra1;
        let b_off = bb.get(bi).copied().unwrap_or(0) * rb0 * rb1;
        let out_off = bi * m * n;
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0f32;
                for p in 0..k {
                    let av = if transpose_a { da[a_off + p * ra1 + i] } else { da[a_off + i * ra1 + p] };
                    let bv = if transpose_b { db[b_off + j * rb1 + p] } else { db[b_off + p * rb1 + j] };
                    sum += av * bv;
                }
                result[out_off + i * n + j] = sum;
            }
        }
    }
    let mut shape = batch;
    shape.push(m);
    shape.push(n);
    Ok(Tensor::new(shape, result))
}

fn transpose(t: &Tensor, order: &[usize]) -> Tensor {
    let in_shape = t.shape();
    let in_strides = t.strides();
    let out_shape: Vec<usize> = order.iter().map(|&o| in_shape[o]).collect();
    let out_strides = compute_strides(&out_shape);
    let n = t.n_elements();
    trace!(?order, shape = ?in_shape, "Reference transpose");
    let indices: Vec<usize> = (0..n)
        .map(|flat| {
            order
                .iter()
                .enumerate()
                .map(|(d, &o)| ((flat / out_strides[d]) % out_shape[d]) * in_strides[o])
                .sum::<usize>()
        })
        .collect();
    t.pick(out_shape, &indices)
}

/// Softmax along `axis`. Rows that are entirely `-inf` produce zeros.
fn softmax(t: &Tensor, axis: usize) -> Result<Tensor, InferenceError> {
    let shape = t.shape().to_vec();
    let data = t.to_f32_vec();
    let len = shape[axis];
    let inner: usize = shape[axis + 1..].iter().product();
    let outer: usize = shape[..axis].iter().product();
    trace!(outer, len, inner, "Reference softmax");

    let mut result = vec![0.0f32; data.len()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |j: usize| (o * len + j) * inner + i;
            let max_val = (0..len).map(|j| data[at(j)]).fold(f32::NEG_INFINITY, f32::max);
            if max_val == f32::NEG_INFINITY {
                continue;
            }
            let mut sum = 0.0f32;
            for j in 0..len {
                let e = (data[at(j)] - max_val).exp();
                result[at(j)] = e;
                sum += e;
            }
            if sum > 0.0 {
                for j in 0..len {
                    result[at(j)] /= sum;
                }
            }
        }
    }
    Ok(Tensor::new(shape, result))
}

fn reshape(t: &Tensor, pattern: &[i64]) -> Result<Tensor, InferenceError> {
    let mut shape = Vec::with_capacity(pattern.len());
    let mut infer_at = None;
    for (i, &p) in pattern.iter().enumerate() {
        match p {
            0 => shape.push(*t.shape().get(i).ok_or_else(|| {
                InferenceError::Graph(format!("reshape pattern {:?} copies missing dim {}", pattern, i))
            })?),
            -1 => {
                infer_at = Some(i);
                shape.push(1);
            }
            n if n > 0 => shape.push(n as usize),
            n => return Err(InferenceError::Graph(format!("invalid reshape entry {}", n))),
        }
    }
    if let Some(i) = infer_at {
        let known: usize = shape.iter().product();
        if known == 0 || t.n_elements() % known != 0 {
            return Err(InferenceError::ShapeMismatch {
                expected: shape,
                actual: t.shape().to_vec(),
            });
        }
        shape[i] = t.n_elements() / known;
    }
    if shape.iter().product::<usize>() != t.n_elements() {
        return Err(InferenceError::ShapeMismatch {
            expected: shape,
            actual: t.shape().to_vec(),
        });
    }
    Ok(t.reshape(&shape))
}

fn gather(data: &Tensor, indices: &Tensor, axis: usize) -> Result<Tensor, InferenceError> {
    let shape = data.shape();
    let extent = shape[axis];
    let outer: usize = shape[..axis].iter().product();
    let inner: usize = shape[axis + 1..].iter().product();
    let idx = indices.to_i64_vec();

    let mut resolved = Vec::with_capacity(idx.len());
    for &i in &idx {
        let r = if i < 0 { i + extent as i64 } else { i };
        if r < 0 || r as usize >= extent {
            return Err(InferenceError::Backend(format!(
                "gather index {} out of range for axis of {}",
                i, extent
            )));
        }
        resolved.push(r as usize);
    }

    let mut picks = Vec::with_capacity(outer * resolved.len() * inner);
    for o in 0..outer {
        for &r in &resolved {
            let base = (o * extent + r) * inner;
            picks.extend(base..base + inner);
        }
    }
    let mut out_shape = shape[..axis].to_vec();
    out_shape.extend_from_slice(indices.shape());
    out_shape.extend_from_slice(&shape[axis + 1..]);
    trace!(axis, n_indices = idx.len(), "Reference gather");
    Ok(data.pick(out_shape, &picks))
}

/// Fused attention reference: `softmax(q k^T * scale + bias) v`.
fn attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    scale: Option<&Tensor>,
    causal: bool,
) -> Result<Tensor, InferenceError> {
    let rank = q.rank();
    let (t_len, e) = (q.shape()[rank - 2], q.shape()[rank - 1]);
    let s_len = k.shape()[rank - 2];
    let ev = v.shape()[rank - 1];
    let scale = match scale {
        Some(s) => s.to_f32_vec().first().copied().unwrap_or(1.0),
        None => 1.0 / (e as f32).sqrt(),
    };

    let mut scores = matmul(q, k, false, true)?;
    let score_shape = scores.shape().to_vec();
    let bias: Option<Vec<f32>> = match (causal, mask) {
        (true, _) => None,
        (false, Some(m)) => {
            let idx = broadcast_indices(m.shape(), &score_shape);
            if m.element_type() == ElementType::Bool {
                let keep = m.as_bool();
                Some(idx.iter().map(|&i| if keep[i] { 0.0 } else { f32::NEG_INFINITY }).collect())
            } else {
                let add = m.to_f32_vec();
                Some(idx.iter().map(|&i| add[i]).collect())
            }
        }
        (false, None) => None,
    };

    trace!(t_len, s_len, e, ev, causal, "Reference fused attention");
    let sd = scores.as_f32_mut();
    for (flat, s) in sd.iter_mut().enumerate() {
        *s *= scale;
        if causal {
            let row = (flat / s_len) % t_len;
            let col = flat % s_len;
            if col >= row + 1 {
                *s = f32::NEG_INFINITY;
            }
        } else if let Some(bias) = &bias {
            *s += bias[flat];
        }
    }
    let probs = softmax(&scores, rank - 1)?;
    matmul(&probs, v, false, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PartialShape;

    fn assert_close(a: &[f32], b: &[f32], tol: f32, msg: &str) {
        assert_eq!(a.len(), b.len(), "{}: length mismatch {} vs {}", msg, a.len(), b.len());
        for (i, (&x, &y)) in a.iter().zip(b.iter()).enumerate() {
            assert!((x - y).abs() < tol, "{}: index {} differs: {} vs {}", msg, i, x, y);
        }
    }

    #[test]
    fn test_matmul_batched_broadcast() {
        // [2, 2, 3] x [3, 1]
        let a = Tensor::new(vec![2, 2, 3], (1..=12).map(|v| v as f32).collect());
        let b = Tensor::new(vec![3, 1], vec![1.0, 0.0, -1.0]);
        let c = matmul(&a, &b, false, false).unwrap();
        assert_eq!(c.shape(), &[2, 2, 1]);
        assert_close(c.as_f32(), &[-2.0, -2.0, -2.0, -2.0], 1e-6, "broadcast matmul");
    }

    #[test]
    fn test_matmul_transpose_flags_agree() {
        let a = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = Tensor::new(vec![3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let plain = matmul(&a, &b, false, false).unwrap();
        let bt = transpose(&b, &[1, 0]);
        let via_t = matmul(&a, &bt, false, true).unwrap();
        assert_close(plain.as_f32(), via_t.as_f32(), 1e-6, "transpose_b");
        let at = transpose(&a, &[1, 0]);
        let via_ta = matmul(&at, &b, true, false).unwrap();
        assert_close(plain.as_f32(), via_ta.as_f32(), 1e-6, "transpose_a");
    }

    #[test]
    fn test_transpose_4d() {
        let t = Tensor::new(vec![1, 2, 3, 1], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let out = transpose(&t, &[0, 2, 1, 3]);
        assert_eq!(out.shape(), &[1, 3, 2, 1]);
        assert_eq!(out.as_f32(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_softmax_all_masked_row_is_zero() {
        let t = Tensor::new(vec![2, 2], vec![f32::NEG_INFINITY, f32::NEG_INFINITY, 0.0, 0.0]);
        let s = softmax(&t, 1).unwrap();
        assert_close(s.as_f32(), &[0.0, 0.0, 0.5, 0.5], 1e-6, "masked softmax");
    }

    #[test]
    fn test_softmax_middle_axis() {
        let t = Tensor::new(vec![1, 2, 2], vec![0.0, 1.0, 0.0, 1.0]);
        let s = softmax(&t, 1).unwrap();
        assert_close(s.as_f32(), &[0.5, 0.5, 0.5, 0.5], 1e-6, "axis 1");
    }

    #[test]
    fn test_gather_rows() {
        let table = Tensor::new(vec![3, 2], vec![0.0, 1.0, 10.0, 11.0, 20.0, 21.0]);
        let ids = Tensor::from_i64(vec![1, 2], vec![2, 0]);
        let out = gather(&table, &ids, 0).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2]);
        assert_eq!(out.as_f32(), &[20.0, 21.0, 0.0, 1.0]);
        let bad = Tensor::from_i64(vec![1], vec![3]);
        assert!(gather(&table, &bad, 0).is_err());
    }

    #[test]
    fn test_reshape_pattern_runtime() {
        let t = Tensor::zeros(&[1, 5], ElementType::I64);
        let r = reshape(&t, &[0, 1, 1, -1]).unwrap();
        assert_eq!(r.shape(), &[1, 1, 1, 5]);
    }

    #[test]
    fn test_integer_arithmetic_stays_integer() {
        let a = Tensor::scalar_i64(4);
        let b = Tensor::scalar_i64(1);
        let c = binary(&a, &b, |x, y| x + y, |x, y| x + y).unwrap();
        assert_eq!(c.as_i64(), &[5]);
    }

    #[test]
    fn test_evaluate_checks_inputs() {
        let mut g = ComputeGraph::new();
        let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[2]));
        g.add_result("y", x).unwrap();

        let missing = evaluate(&g, &BTreeMap::new());
        assert!(matches!(missing, Err(InferenceError::TensorNotFound(_))));

        let wrong_type = BTreeMap::from([("x".to_string(), Tensor::from_i64(vec![2], vec![1, 2]))]);
        assert!(matches!(evaluate(&g, &wrong_type), Err(InferenceError::TypeMismatch { .. })));

        let wrong_shape = BTreeMap::from([("x".to_string(), Tensor::new(vec![3], vec![0.0; 3]))]);
        assert!(evaluate(&g, &wrong_shape).is_err());

        let ok = BTreeMap::from([("x".to_string(), Tensor::new(vec![2], vec![1.0, 2.0]))]);
        assert_eq!(evaluate(&g, &ok).unwrap()["y"].as_f32(), &[1.0, 2.0]);
    }

    #[test]
    fn test_f16_output_narrowed() {
        let mut g = ComputeGraph::new();
        let x = g.add_parameter("x", ElementType::F16, PartialShape::from_static(&[2]));
        let two = g.add_constant("two", Tensor::new(vec![], vec![2.0]).convert(ElementType::F16));
        let y = g.add_op("y", Op::Multiply, &[x, two]).unwrap();
        g.add_result("out", y).unwrap();
        let feeds = BTreeMap::from([(
            "x".to_string(),
            Tensor::new(vec![2], vec![1.5, -1.0]).convert(ElementType::F16),
        )]);
        let out = evaluate(&g, &feeds).unwrap();
        assert_eq!(out["out"].element_type(), ElementType::F16);
        assert_eq!(out["out"].to_f32_vec(), vec![3.0, -2.0]);
    }
}
