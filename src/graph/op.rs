//! Operation set of the graph IR and per-op output type/shape inference.

use serde::{Deserialize, Serialize};

use super::shape::{broadcast, Dim, PartialShape};
use crate::error::InferenceError;
use crate::tensor::{normalize_axis, ElementType, Tensor};

/// Sentinel `stop` for [`Op::Slice`] meaning "to the end of the axis".
pub const SLICE_TO_END: i64 = i64::MAX;

/// Node operation. Every op produces exactly one output tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Parameter,
    Constant(Tensor),
    /// Graph output; reads its single input.
    Result,
    Convert {
        to: ElementType,
    },
    MatMul {
        transpose_a: bool,
        transpose_b: bool,
    },
    Transpose {
        order: Vec<usize>,
    },
    Concat {
        axis: i64,
    },
    Softmax {
        axis: i64,
    },
    Add,
    Subtract,
    Multiply,
    Divide,
    Sqrt,
    /// `select(cond, then, else)` with broadcasting.
    Select,
    LogicalNot,
    GreaterEqual,
    /// Runtime extent of one input axis as an i64 scalar.
    DimOf {
        axis: i64,
    },
    /// `[start, stop)` with step 1 from two i64 scalars.
    Range,
    Unsqueeze {
        axis: i64,
    },
    /// Target pattern: `0` copies the input dim, `-1` is inferred.
    Reshape {
        pattern: Vec<i64>,
    },
    /// Inputs: data, indices.
    Gather {
        axis: i64,
    },
    Slice {
        axis: i64,
        start: i64,
        stop: i64,
    },
    /// Inputs: query, key, value, optional mask, optional scale.
    ScaledDotProductAttention {
        causal: bool,
    },
}

impl Op {
    pub fn type_name(&self) -> &'static str {
        match self {
            Op::Parameter => "Parameter",
            Op::Constant(_) => "Constant",
            Op::Result => "Result",
            Op::Convert { .. } => "Convert",
            Op::MatMul { .. } => "MatMul",
            Op::Transpose { .. } => "Transpose",
            Op::Concat { .. } => "Concat",
            Op::Softmax { .. } => "Softmax",
            Op::Add => "Add",
            Op::Subtract => "Subtract",
            Op::Multiply => "Multiply",
            Op::Divide => "Divide",
            Op::Sqrt => "Sqrt",
            Op::Select => "Select",
            Op::LogicalNot => "LogicalNot",
            Op::GreaterEqual => "GreaterEqual",
            Op::DimOf { .. } => "DimOf",
            Op::Range => "Range",
            Op::Unsqueeze { .. } => "Unsqueeze",
            Op::Reshape { .. } => "Reshape",
            Op::Gather { .. } => "Gather",
            Op::Slice { .. } => "Slice",
            Op::ScaledDotProductAttention { .. } => "ScaledDotProductAttention",
        }
    }

    /// Accepted input counts as an inclusive range.
    fn arity(&self) -> (usize, usize) {
        match self {
            Op::Parameter | Op::Constant(_) => (0, 0),
            Op::Result
            | Op::Convert { .. }
            | Op::Transpose { .. }
            | Op::Softmax { .. }
            | Op::Sqrt
            | Op::LogicalNot
            | Op::DimOf { .. }
            | Op::Unsqueeze { .. }
            | Op::Reshape { .. }
            | Op::Slice { .. } => (1, 1),
            Op::MatMul { .. }
            | Op::Add
            | Op::Subtract
            | Op::Multiply
            | Op::Divide
            | Op::GreaterEqual
            | Op::Range
            | Op::Gather { .. } => (2, 2),
            Op::Select => (3, 3),
            Op::Concat { .. } => (1, usize::MAX),
            Op::ScaledDotProductAttention { .. } => (3, 5),
        }
    }
}

/// Element type and shape of an op output given its inputs.
///
/// `inputs` carries each input's type, shape and, for constants, its value.
pub fn infer_output(
    op: &Op,
    inputs: &[(ElementType, &PartialShape, Option<&Tensor>)],
) -> Result<(ElementType, PartialShape), InferenceError> {
    let (lo, hi) = op.arity();
    if inputs.len() < lo || inputs.len() > hi {
        return Err(InferenceError::Graph(format!(
            "{} expects {}..={} inputs, got {}",
            op.type_name(),
            lo,
            hi,
            inputs.len()
        )));
    }

    match op {
        Op::Parameter => Err(InferenceError::Graph(
            "parameters carry their own type and shape".to_string(),
        )),
        Op::Constant(t) => Ok((t.element_type(), PartialShape::from_static(t.shape()))),
        Op::Result | Op::Sqrt => Ok((inputs[0].0, inputs[0].1.clone())),
        Op::Convert { to } => Ok((*to, inputs[0].1.clone())),
        Op::LogicalNot => {
            expect_type(op, inputs[0].0, ElementType::Bool)?;
            Ok((ElementType::Bool, inputs[0].1.clone()))
        }
        Op::Softmax { axis } => {
            normalize_axis(*axis, inputs[0].1.rank())?;
            Ok((inputs[0].0, inputs[0].1.clone()))
        }
        Op::Add | Op::Subtract | Op::Multiply | Op::Divide => {
            expect_type(op, inputs[1].0, inputs[0].0)?;
            Ok((inputs[0].0, broadcast(inputs[0].1, inputs[1].1)?))
        }
        Op::GreaterEqual => {
            expect_type(op, inputs[1].0, inputs[0].0)?;
            Ok((ElementType::Bool, broadcast(inputs[0].1, inputs[1].1)?))
        }
        Op::Select => {
            expect_type(op, inputs[0].0, ElementType::Bool)?;
            expect_type(op, inputs[2].0, inputs[1].0)?;
            let shape = broadcast(&broadcast(inputs[0].1, inputs[1].1)?, inputs[2].1)?;
            Ok((inputs[1].0, shape))
        }
        Op::MatMul {
            transpose_a,
            transpose_b,
        } => infer_matmul(inputs[0].1, inputs[1].1, *transpose_a, *transpose_b)
            .map(|shape| (inputs[0].0, shape)),
        Op::Transpose { order } => {
            let input = inputs[0].1;
            let mut seen = vec![false; order.len()];
            let valid = order.len() == input.rank()
                && order.iter().all(|&o| o < order.len() && !std::mem::replace(&mut seen[o], true));
            if !valid {
                return Err(InferenceError::Graph(format!(
                    "invalid transpose order {:?} for shape {}",
                    order, input
                )));
            }
            Ok((
                inputs[0].0,
                PartialShape(order.iter().map(|&o| input.dim(o)).collect()),
            ))
        }
        Op::Concat { axis } => {
            let first = inputs[0].1;
            let axis = normalize_axis(*axis, first.rank())?;
            let mut dims = first.0.clone();
            for (et, shape, _) in &inputs[1..] {
                expect_type(op, *et, inputs[0].0)?;
                if shape.rank() != first.rank() {
                    return Err(InferenceError::Graph(format!(
                        "concat rank mismatch: {} vs {}",
                        first, shape
                    )));
                }
                for (i, d) in dims.iter_mut().enumerate() {
                    if i == axis {
                        *d = d.add(shape.dim(i));
                    } else {
                        *d = d.unify(shape.dim(i)).ok_or_else(|| {
                            InferenceError::Graph(format!(
                                "concat dim {} mismatch: {} vs {}",
                                i, first, shape
                            ))
                        })?;
                    }
                }
            }
            Ok((inputs[0].0, PartialShape(dims)))
        }
        Op::DimOf { axis } => {
            normalize_axis(*axis, inputs[0].1.rank())?;
            Ok((ElementType::I64, PartialShape::scalar()))
        }
        Op::Range => {
            for (et, shape, _) in inputs {
                if !et.is_integer() || shape.rank() != 0 {
                    return Err(InferenceError::Graph(format!(
                        "Range bounds must be integer scalars, got {} {}",
                        et, shape
                    )));
                }
            }
            let len = match (inputs[0].2, inputs[1].2) {
                (Some(start), Some(stop)) => {
                    let start = start.to_i64_vec()[0];
                    let stop = stop.to_i64_vec()[0];
                    Dim::Static((stop - start).max(0) as usize)
                }
                _ => Dim::Dynamic,
            };
            Ok((ElementType::I64, PartialShape(vec![len])))
        }
        Op::Unsqueeze { axis } => {
            let input = inputs[0].1;
            let axis = normalize_axis(*axis, input.rank() + 1)?;
            let mut dims = input.0.clone();
            dims.insert(axis, Dim::Static(1));
            Ok((inputs[0].0, PartialShape(dims)))
        }
        Op::Reshape { pattern } => {
            infer_reshape(inputs[0].1, pattern).map(|shape| (inputs[0].0, shape))
        }
        Op::Gather { axis } => {
            let (data, indices) = (inputs[0].1, inputs[1].1);
            if !inputs[1].0.is_integer() {
                return Err(InferenceError::Graph(format!(
                    "Gather indices must be integer, got {}",
                    inputs[1].0
                )));
            }
            let axis = normalize_axis(*axis, data.rank())?;
            let mut dims = data.0[..axis].to_vec();
            dims.extend_from_slice(&indices.0);
            dims.extend_from_slice(&data.0[axis + 1..]);
            Ok((inputs[0].0, PartialShape(dims)))
        }
        Op::Slice { axis, start, stop } => {
            let input = inputs[0].1;
            let axis = normalize_axis(*axis, input.rank())?;
            let mut dims = input.0.clone();
            dims[axis] = match input.dim(axis) {
                Dim::Static(n) => {
                    let (s, e) = resolve_slice(n, *start, *stop);
                    Dim::Static(e - s)
                }
                Dim::Dynamic => Dim::Dynamic,
            };
            Ok((inputs[0].0, PartialShape(dims)))
        }
        Op::ScaledDotProductAttention { .. } => {
            let (q, k, v) = (inputs[0].1, inputs[1].1, inputs[2].1);
            if q.rank() < 2 || k.rank() != q.rank() || v.rank() != q.rank() {
                return Err(InferenceError::Graph(format!(
                    "attention expects q/k/v of equal rank >= 2, got {} {} {}",
                    q, k, v
                )));
            }
            let mut dims = q.0.clone();
            let last = dims.len() - 1;
            dims[last] = v.dim(last);
            Ok((inputs[0].0, PartialShape(dims)))
        }
    }
}

/// Clamp `[start, stop)` against an axis of extent `n`; negatives count from the end.
pub fn resolve_slice(n: usize, start: i64, stop: i64) -> (usize, usize) {
    let clamp = |v: i64| -> usize {
        let v = if v < 0 { v + n as i64 } else { v };
        v.clamp(0, n as i64) as usize
    };
    let s = clamp(start);
    let e = clamp(stop);
    (s, e.max(s))
}

fn expect_type(op: &Op, actual: ElementType, expected: ElementType) -> Result<(), InferenceError> {
    if actual != expected {
        return Err(InferenceError::TypeMismatch {
            name: op.type_name().to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn infer_matmul(
    a: &PartialShape,
    b: &PartialShape,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<PartialShape, InferenceError> {
    if a.rank() < 2 || b.rank() < 2 {
        return Err(InferenceError::Graph(format!(
            "MatMul expects rank >= 2 inputs, got {} and {}",
            a, b
        )));
    }
    let (ra, rb) = (a.rank(), b.rank());
    let (m, ka) = if transpose_a {
        (a.dim(ra - 1), a.dim(ra - 2))
    } else {
        (a.dim(ra - 2), a.dim(ra - 1))
    };
    let (kb, n) = if transpose_b {
        (b.dim(rb - 1), b.dim(rb - 2))
    } else {
        (b.dim(rb - 2), b.dim(rb - 1))
    };
    if !ka.compatible(kb) {
        return Err(InferenceError::Graph(format!(
            "MatMul inner dims differ: {} (a={}) vs {} (b={})",
            ka, a, kb, b
        )));
    }
    let batch = broadcast(
        &PartialShape(a.0[..ra - 2].to_vec()),
        &PartialShape(b.0[..rb - 2].to_vec()),
    )?;
    let mut dims = batch.0;
    dims.push(m);
    dims.push(n);
    Ok(PartialShape(dims))
}

fn infer_reshape(input: &PartialShape, pattern: &[i64]) -> Result<PartialShape, InferenceError> {
    let mut dims = Vec::with_capacity(pattern.len());
    let mut infer_at = None;
    for (i, &p) in pattern.iter().enumerate() {
        match p {
            0 => {
                if i >= input.rank() {
                    return Err(InferenceError::Graph(format!(
                        "reshape pattern {:?} copies dim {} of {}",
                        pattern, i, input
                    )));
                }
                dims.push(input.dim(i));
            }
            -1 => {
                if infer_at.replace(i).is_some() {
                    return Err(InferenceError::Graph(format!(
                        "reshape pattern {:?} has more than one -1",
                        pattern
                    )));
                }
                dims.push(Dim::Dynamic);
            }
            n if n > 0 => dims.push(Dim::Static(n as usize)),
            n => {
                return Err(InferenceError::Graph(format!(
                    "invalid reshape pattern entry {}",
                    n
                )))
            }
        }
    }

    let total = input.to_static().map(|s| s.iter().product::<usize>());
    let known = dims
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != infer_at)
        .map(|(_, d)| d.get())
        .collect::<Option<Vec<usize>>>()
        .map(|v| v.iter().product::<usize>());

    match (infer_at, total, known) {
        (Some(i), Some(total), Some(known)) => {
            if known == 0 || total % known != 0 {
                return Err(InferenceError::Graph(format!(
                    "cannot reshape {} with pattern {:?}",
                    input, pattern
                )));
            }
            dims[i] = Dim::Static(total / known);
        }
        (None, Some(total), Some(known)) if total != known => {
            return Err(InferenceError::Graph(format!(
                "cannot reshape {} ({} elements) with pattern {:?}",
                input, total, pattern
            )));
        }
        _ => {}
    }
    Ok(PartialShape(dims))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ps(dims: &[usize]) -> PartialShape {
        PartialShape::from_static(dims)
    }

    #[test]
    fn test_matmul_transpose_b() {
        let q = ps(&[1, 2, 5, 8]);
        let k = ps(&[1, 2, 7, 8]);
        let (_, out) = infer_output(
            &Op::MatMul {
                transpose_a: false,
                transpose_b: true,
            },
            &[(ElementType::F32, &q, None), (ElementType::F32, &k, None)],
        )
        .unwrap();
        assert_eq!(out, ps(&[1, 2, 5, 7]));
    }

    #[test]
    fn test_matmul_inner_mismatch() {
        let a = ps(&[2, 3]);
        let b = ps(&[4, 5]);
        let op = Op::MatMul {
            transpose_a: false,
            transpose_b: false,
        };
        assert!(infer_output(&op, &[(ElementType::F32, &a, None), (ElementType::F32, &b, None)]).is_err());
    }

    #[test]
    fn test_reshape_pattern() {
        let input = ps(&[1, 6, 32]);
        let (_, out) = infer_output(
            &Op::Reshape {
                pattern: vec![0, 0, 4, -1],
            },
            &[(ElementType::F32, &input, None)],
        )
        .unwrap();
        assert_eq!(out, ps(&[1, 6, 4, 8]));
    }

    #[test]
    fn test_reshape_dynamic_input_keeps_copied_dims() {
        let input = PartialShape(vec![Dim::Static(1), Dim::Dynamic, Dim::Static(32)]);
        let (_, out) = infer_output(
            &Op::Reshape {
                pattern: vec![0, 0, 4, 8],
            },
            &[(ElementType::F32, &input, None)],
        )
        .unwrap();
        assert_eq!(out.0[1], Dim::Dynamic);
        assert_eq!(out.0[3], Dim::Static(8));
    }

    #[test]
    fn test_concat_sums_axis() {
        let a = ps(&[1, 2, 3, 4]);
        let b = ps(&[1, 2, 1, 4]);
        let (_, out) = infer_output(
            &Op::Concat { axis: 2 },
            &[(ElementType::F32, &a, None), (ElementType::F32, &b, None)],
        )
        .unwrap();
        assert_eq!(out, ps(&[1, 2, 4, 4]));
    }

    #[test]
    fn test_concat_type_mismatch() {
        let a = ps(&[1, 2]);
        let result = infer_output(
            &Op::Concat { axis: 1 },
            &[(ElementType::F32, &a, None), (ElementType::F16, &a, None)],
        );
        assert!(matches!(result, Err(InferenceError::TypeMismatch { .. })));
    }

    #[test]
    fn test_slice_to_end() {
        let input = ps(&[1, 2, 9, 4]);
        let (_, out) = infer_output(
            &Op::Slice {
                axis: 2,
                start: 1,
                stop: SLICE_TO_END,
            },
            &[(ElementType::F16, &input, None)],
        )
        .unwrap();
        assert_eq!(out, ps(&[1, 2, 8, 4]));
    }

    #[test]
    fn test_range_with_constant_bounds() {
        let start = Tensor::scalar_i64(1);
        let stop = Tensor::scalar_i64(5);
        let scalar = PartialShape::scalar();
        let (et, out) = infer_output(
            &Op::Range,
            &[
                (ElementType::I64, &scalar, Some(&start)),
                (ElementType::I64, &scalar, Some(&stop)),
            ],
        )
        .unwrap();
        assert_eq!(et, ElementType::I64);
        assert_eq!(out, ps(&[4]));
    }

    #[test]
    fn test_arity_checked() {
        let a = ps(&[2]);
        assert!(infer_output(&Op::Add, &[(ElementType::F32, &a, None)]).is_err());
    }

    #[test]
    fn test_resolve_slice() {
        assert_eq!(resolve_slice(10, 1, SLICE_TO_END), (1, 10));
        assert_eq!(resolve_slice(10, -3, SLICE_TO_END), (7, 10));
        assert_eq!(resolve_slice(10, 8, 2), (8, 8));
    }
}
