//! N-dimensional host tensor with typed storage.
//!
//! [`Tensor`] is used for graph constants, inference request inputs/outputs and
//! the reference device's KV cache. Storage is always dense row-major. F16 values
//! are stored as raw `u16` bits and converted with the `half` crate; U4 values are
//! stored one per byte with only the low nibble significant.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::InferenceError;

/// Element type of tensor data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    F32,
    F16,
    I64,
    I32,
    Bool,
    U4,
}

impl ElementType {
    pub fn is_float(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F16)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, ElementType::I64 | ElementType::I32 | ElementType::U4)
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::F16 => "f16",
            ElementType::I64 => "i64",
            ElementType::I32 => "i32",
            ElementType::Bool => "boolean",
            ElementType::U4 => "u4",
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Storage for tensor data, one variant per element type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorStorage {
    /// Serialized as bit patterns so non-finite constants (`-inf` masks) round-trip.
    F32(#[serde(with = "f32_bits")] Vec<f32>),
    /// 16-bit floating point values stored as raw u16 bits.
    F16(Vec<u16>),
    I64(Vec<i64>),
    I32(Vec<i32>),
    Bool(Vec<bool>),
    /// One 4-bit value per byte.
    U4(Vec<u8>),
}

/// Apply the same expression to a pair of storages with matching variants.
macro_rules! with_matching_storage {
    ($dst:expr, $src:expr, |$d:ident, $s:ident| $body:expr) => {
        match ($dst, $src) {
            (TensorStorage::F32($d), TensorStorage::F32($s)) => $body,
            (TensorStorage::F16($d), TensorStorage::F16($s)) => $body,
            (TensorStorage::I64($d), TensorStorage::I64($s)) => $body,
            (TensorStorage::I32($d), TensorStorage::I32($s)) => $body,
            (TensorStorage::Bool($d), TensorStorage::Bool($s)) => $body,
            (TensorStorage::U4($d), TensorStorage::U4($s)) => $body,
            (d, s) => {
                return Err(InferenceError::TypeMismatch {
                    name: "tensor storage".to_string(),
                    expected: d.element_type().to_string(),
                    actual: s.element_type().to_string(),
                })
            }
        }
    };
}

/// Apply the same expression to every storage variant, rebuilding the same variant.
macro_rules! map_storage {
    ($storage:expr, |$d:ident| $body:expr) => {
        match $storage {
            TensorStorage::F32($d) => TensorStorage::F32($body),
            TensorStorage::F16($d) => TensorStorage::F16($body),
            TensorStorage::I64($d) => TensorStorage::I64($body),
            TensorStorage::I32($d) => TensorStorage::I32($body),
            TensorStorage::Bool($d) => TensorStorage::Bool($body),
            TensorStorage::U4($d) => TensorStorage::U4($body),
        }
    };
}

impl TensorStorage {
    pub fn element_type(&self) -> ElementType {
        match self {
            TensorStorage::F32(_) => ElementType::F32,
            TensorStorage::F16(_) => ElementType::F16,
            TensorStorage::I64(_) => ElementType::I64,
            TensorStorage::I32(_) => ElementType::I32,
            TensorStorage::Bool(_) => ElementType::Bool,
            TensorStorage::U4(_) => ElementType::U4,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorStorage::F32(d) => d.len(),
            TensorStorage::F16(d) => d.len(),
            TensorStorage::I64(d) => d.len(),
            TensorStorage::I32(d) => d.len(),
            TensorStorage::Bool(d) => d.len(),
            TensorStorage::U4(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn zeros(element_type: ElementType, n: usize) -> Self {
        match element_type {
            ElementType::F32 => TensorStorage::F32(vec![0.0; n]),
            ElementType::F16 => TensorStorage::F16(vec![half::f16::ZERO.to_bits(); n]),
            ElementType::I64 => TensorStorage::I64(vec![0; n]),
            ElementType::I32 => TensorStorage::I32(vec![0; n]),
            ElementType::Bool => TensorStorage::Bool(vec![false; n]),
            ElementType::U4 => TensorStorage::U4(vec![0; n]),
        }
    }

    /// Gather elements by flat index into a new storage of the same type.
    fn pick(&self, indices: &[usize]) -> Self {
        map_storage!(self, |d| indices.iter().map(|&i| d[i]).collect())
    }

    /// Copy `len` contiguous elements from `src[src_start..]` to `self[dst_start..]`.
    fn copy_run(
        &mut self,
        dst_start: usize,
        src: &TensorStorage,
        src_start: usize,
        len: usize,
    ) -> Result<(), InferenceError> {
        with_matching_storage!(self, src, |d, s| {
            d[dst_start..dst_start + len].copy_from_slice(&s[src_start..src_start + len])
        });
        Ok(())
    }

    /// Element at flat index `i` widened to f64.
    fn value_f64(&self, i: usize) -> f64 {
        match self {
            TensorStorage::F32(d) => d[i] as f64,
            TensorStorage::F16(d) => half::f16::from_bits(d[i]).to_f64(),
            TensorStorage::I64(d) => d[i] as f64,
            TensorStorage::I32(d) => d[i] as f64,
            TensorStorage::Bool(d) => {
                if d[i] {
                    1.0
                } else {
                    0.0
                }
            }
            TensorStorage::U4(d) => (d[i] & 0x0F) as f64,
        }
    }
}

mod f32_bits {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        let bits: Vec<u32> = data.iter().map(|v| v.to_bits()).collect();
        bits.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        let bits = Vec::<u32>::deserialize(deserializer)?;
        Ok(bits.into_iter().map(f32::from_bits).collect())
    }
}

/// N-dimensional tensor with element type and dense storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorRepr", into = "TensorRepr")]
pub struct Tensor {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage: TensorStorage,
}

#[derive(Serialize, Deserialize)]
struct TensorRepr {
    shape: Vec<usize>,
    storage: TensorStorage,
}

impl From<Tensor> for TensorRepr {
    fn from(t: Tensor) -> Self {
        TensorRepr {
            shape: t.shape,
            storage: t.storage,
        }
    }
}

impl TryFrom<TensorRepr> for Tensor {
    type Error = InferenceError;

    fn try_from(repr: TensorRepr) -> Result<Self, Self::Error> {
        Tensor::from_storage(repr.shape, repr.storage)
    }
}

/// Compute row-major strides from shape.
/// strides[i] = product of shape[i+1..]
pub(crate) fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; shape.len()];
    if shape.is_empty() {
        return strides;
    }
    strides[shape.len() - 1] = 1;
    for i in (0..shape.len() - 1).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Resolve a possibly negative axis against a rank.
pub fn normalize_axis(axis: i64, rank: usize) -> Result<usize, InferenceError> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved as usize >= rank {
        return Err(InferenceError::Graph(format!(
            "axis {} out of range for rank {}",
            axis, rank
        )));
    }
    Ok(resolved as usize)
}

impl Tensor {
    /// Create an F32 tensor from shape and data.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        let n_elements: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            n_elements,
            "Data length {} does not match shape {:?} (expected {})",
            data.len(),
            shape,
            n_elements
        );
        let strides = compute_strides(&shape);
        Self {
            shape,
            strides,
            storage: TensorStorage::F32(data),
        }
    }

    /// Create a tensor from any storage, validating the element count.
    pub fn from_storage(shape: Vec<usize>, storage: TensorStorage) -> Result<Self, InferenceError> {
        let n_elements: usize = shape.iter().product();
        if storage.len() != n_elements {
            return Err(InferenceError::Graph(format!(
                "{} data length {} does not match shape {:?} (expected {})",
                storage.element_type(),
                storage.len(),
                shape,
                n_elements
            )));
        }
        let strides = compute_strides(&shape);
        Ok(Self {
            shape,
            strides,
            storage,
        })
    }

    /// Create a zero-filled tensor of the given element type.
    pub fn zeros(shape: &[usize], element_type: ElementType) -> Self {
        let n_elements: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            strides: compute_strides(shape),
            storage: TensorStorage::zeros(element_type, n_elements),
        }
    }

    /// Create an F16 tensor from shape and raw u16 bit data.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn from_f16(shape: Vec<usize>, data: Vec<u16>) -> Self {
        let n_elements: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            n_elements,
            "F16 data length {} does not match shape {:?} (expected {})",
            data.len(),
            shape,
            n_elements
        );
        let strides = compute_strides(&shape);
        Self {
            shape,
            strides,
            storage: TensorStorage::F16(data),
        }
    }

    /// Create an I64 tensor.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn from_i64(shape: Vec<usize>, data: Vec<i64>) -> Self {
        let n_elements: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            n_elements,
            "I64 data length {} does not match shape {:?} (expected {})",
            data.len(),
            shape,
            n_elements
        );
        let strides = compute_strides(&shape);
        Self {
            shape,
            strides,
            storage: TensorStorage::I64(data),
        }
    }

    /// Create a boolean tensor.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn from_bool(shape: Vec<usize>, data: Vec<bool>) -> Self {
        let n_elements: usize = shape.iter().product();
        assert_eq!(data.len(), n_elements, "Bool data length does not match shape {:?}", shape);
        let strides = compute_strides(&shape);
        Self {
            shape,
            strides,
            storage: TensorStorage::Bool(data),
        }
    }

    /// Create a U4 tensor from one byte per element. High nibbles are kept as-is.
    pub fn from_u4(shape: Vec<usize>, data: Vec<u8>) -> Self {
        let n_elements: usize = shape.iter().product();
        assert_eq!(data.len(), n_elements, "U4 data length does not match shape {:?}", shape);
        let strides = compute_strides(&shape);
        Self {
            shape,
            strides,
            storage: TensorStorage::U4(data),
        }
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self::new(Vec::new(), vec![value])
    }

    pub fn scalar_i64(value: i64) -> Self {
        Self::from_i64(Vec::new(), vec![value])
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the strides of the tensor.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn element_type(&self) -> ElementType {
        self.storage.element_type()
    }

    pub fn storage(&self) -> &TensorStorage {
        &self.storage
    }

    /// Returns the total number of elements in the tensor.
    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns a reference to the underlying F32 data.
    ///
    /// # Panics
    /// Panics if the tensor is not F32.
    pub fn as_f32(&self) -> &[f32] {
        match &self.storage {
            TensorStorage::F32(data) => data,
            other => panic!("Tensor is {}, not f32", other.element_type()),
        }
    }

    /// # Panics
    /// Panics if the tensor is not F32.
    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        match &mut self.storage {
            TensorStorage::F32(data) => data,
            other => panic!("Tensor is {}, not f32", other.element_type()),
        }
    }

    /// # Panics
    /// Panics if the tensor is not I64.
    pub fn as_i64(&self) -> &[i64] {
        match &self.storage {
            TensorStorage::I64(data) => data,
            other => panic!("Tensor is {}, not i64", other.element_type()),
        }
    }

    /// # Panics
    /// Panics if the tensor is not I64.
    pub fn as_i64_mut(&mut self) -> &mut [i64] {
        match &mut self.storage {
            TensorStorage::I64(data) => data,
            other => panic!("Tensor is {}, not i64", other.element_type()),
        }
    }

    /// Grow the last axis of an I64 row tensor (`[n]` or `[1, .., n]`) by one
    /// element. Storage reserved up front is reused.
    pub fn append_i64(&mut self, value: i64) -> Result<(), InferenceError> {
        let rank = self.shape.len();
        if rank == 0 || self.shape[..rank - 1].iter().any(|&d| d != 1) {
            return Err(InferenceError::Precondition(format!(
                "append needs a single row, got shape {:?}",
                self.shape
            )));
        }
        let TensorStorage::I64(data) = &mut self.storage else {
            return Err(InferenceError::TypeMismatch {
                name: "append".to_string(),
                expected: ElementType::I64.name().to_string(),
                actual: self.storage.element_type().name().to_string(),
            });
        };
        data.push(value);
        self.shape[rank - 1] += 1;
        self.strides = compute_strides(&self.shape);
        Ok(())
    }

    /// # Panics
    /// Panics if the tensor is not boolean.
    pub fn as_bool(&self) -> &[bool] {
        match &self.storage {
            TensorStorage::Bool(data) => data,
            other => panic!("Tensor is {}, not boolean", other.element_type()),
        }
    }

    /// # Panics
    /// Panics if the tensor is not U4.
    pub fn as_u4(&self) -> &[u8] {
        match &self.storage {
            TensorStorage::U4(data) => data,
            other => panic!("Tensor is {}, not u4", other.element_type()),
        }
    }

    /// Element values widened to f32, whatever the storage type.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.storage {
            TensorStorage::F32(data) => data.clone(),
            TensorStorage::F16(bits) => bits
                .iter()
                .map(|&b| half::f16::from_bits(b).to_f32())
                .collect(),
            other => (0..other.len()).map(|i| other.value_f64(i) as f32).collect(),
        }
    }

    /// Element values as i64 (floats truncate toward zero).
    pub fn to_i64_vec(&self) -> Vec<i64> {
        match &self.storage {
            TensorStorage::I64(data) => data.clone(),
            TensorStorage::I32(data) => data.iter().map(|&v| v as i64).collect(),
            other => (0..other.len()).map(|i| other.value_f64(i) as i64).collect(),
        }
    }

    /// Convert to another element type.
    ///
    /// Float → integer truncates, anything → boolean is `value != 0`, anything → U4
    /// keeps the low nibble.
    pub fn convert(&self, to: ElementType) -> Tensor {
        if self.element_type() == to {
            return self.clone();
        }
        let n = self.n_elements();
        let s = &self.storage;
        let storage = match to {
            ElementType::F32 => TensorStorage::F32(self.to_f32_vec()),
            ElementType::F16 => TensorStorage::F16(
                (0..n)
                    .map(|i| half::f16::from_f64(s.value_f64(i)).to_bits())
                    .collect(),
            ),
            ElementType::I64 => TensorStorage::I64(self.to_i64_vec()),
            ElementType::I32 => TensorStorage::I32((0..n).map(|i| s.value_f64(i) as i32).collect()),
            ElementType::Bool => TensorStorage::Bool((0..n).map(|i| s.value_f64(i) != 0.0).collect()),
            ElementType::U4 => {
                TensorStorage::U4((0..n).map(|i| (s.value_f64(i) as i64 as u8) & 0x0F).collect())
            }
        };
        trace!(from = %self.element_type(), %to, n, "Converted tensor");
        Tensor {
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            storage,
        }
    }

    /// Reshape the tensor to a new shape with the same number of elements.
    ///
    /// # Panics
    /// Panics if the new shape has a different number of elements.
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_n_elements: usize = new_shape.iter().product();
        assert_eq!(
            self.n_elements(),
            new_n_elements,
            "Cannot reshape tensor of {} elements to shape {:?} ({} elements)",
            self.n_elements(),
            new_shape,
            new_n_elements
        );
        Tensor {
            shape: new_shape.to_vec(),
            strides: compute_strides(new_shape),
            storage: self.storage.clone(),
        }
    }

    /// Build a tensor of `shape` from elements of `self` picked by flat index.
    pub(crate) fn pick(&self, shape: Vec<usize>, indices: &[usize]) -> Tensor {
        debug_assert_eq!(shape.iter().product::<usize>(), indices.len());
        Tensor {
            strides: compute_strides(&shape),
            shape,
            storage: self.storage.pick(indices),
        }
    }

    /// Copy of the sub-range `[start, end)` along `axis`; other axes are kept whole.
    pub fn slice(&self, axis: usize, start: usize, end: usize) -> Result<Tensor, InferenceError> {
        if axis >= self.rank() || start > end || end > self.shape[axis] {
            return Err(InferenceError::Graph(format!(
                "invalid slice [{}, {}) on axis {} of shape {:?}",
                start, end, axis, self.shape
            )));
        }
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        let len = end - start;
        let mut shape = self.shape.clone();
        shape[axis] = len;

        let mut out = Tensor::zeros(&shape, self.element_type());
        for o in 0..outer {
            let src = (o * self.shape[axis] + start) * inner;
            let dst = o * len * inner;
            out.storage.copy_run(dst, &self.storage, src, len * inner)?;
        }
        Ok(out)
    }

    /// Write `len` positions of `src` along `axis` (starting at `src_start`) into
    /// `self` at `dst_start`. All other dimensions must agree.
    pub fn copy_along_axis(
        &mut self,
        axis: usize,
        dst_start: usize,
        src: &Tensor,
        src_start: usize,
        len: usize,
    ) -> Result<(), InferenceError> {
        if self.rank() != src.rank() || axis >= self.rank() {
            return Err(InferenceError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: src.shape.clone(),
            });
        }
        let same_outer = self
            .shape
            .iter()
            .zip(src.shape.iter())
            .enumerate()
            .all(|(i, (a, b))| i == axis || a == b);
        if !same_outer || dst_start + len > self.shape[axis] || src_start + len > src.shape[axis] {
            return Err(InferenceError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: src.shape.clone(),
            });
        }
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        for o in 0..outer {
            let d = (o * self.shape[axis] + dst_start) * inner;
            let s = (o * src.shape[axis] + src_start) * inner;
            self.storage.copy_run(d, &src.storage, s, len * inner)?;
        }
        Ok(())
    }

    /// Copy all elements of `src` into `self`'s flat storage starting at `offset`.
    pub fn copy_with_offset(&mut self, src: &Tensor, offset: usize) -> Result<(), InferenceError> {
        let n = src.n_elements();
        if offset + n > self.n_elements() {
            return Err(InferenceError::Capacity(format!(
                "cannot copy {} elements at offset {} into tensor of {}",
                n,
                offset,
                self.n_elements()
            )));
        }
        self.storage.copy_run(offset, &src.storage, 0, n)
    }

    /// Concatenate tensors along `axis`. All inputs share element type and the
    /// remaining dimensions.
    pub fn concat(tensors: &[&Tensor], axis: usize) -> Result<Tensor, InferenceError> {
        let first = tensors
            .first()
            .ok_or_else(|| InferenceError::Graph("concat of zero tensors".to_string()))?;
        let mut shape = first.shape.clone();
        shape[axis] = tensors.iter().map(|t| t.shape[axis]).sum();
        for t in tensors {
            let compatible = t.rank() == first.rank()
                && t.element_type() == first.element_type()
                && (0..t.rank()).all(|i| i == axis || t.shape[i] == first.shape[i]);
            if !compatible {
                return Err(InferenceError::ShapeMismatch {
                    expected: first.shape.clone(),
                    actual: t.shape.clone(),
                });
            }
        }
        let outer: usize = shape[..axis].iter().product();
        let inner: usize = shape[axis + 1..].iter().product();
        let mut out = Tensor::zeros(&shape, first.element_type());
        let mut dst = 0;
        for o in 0..outer {
            for t in tensors {
                let run = t.shape[axis] * inner;
                out.storage.copy_run(dst, &t.storage, o * run, run)?;
                dst += run;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_strides() {
        assert_eq!(compute_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(compute_strides(&[3, 5]), vec![5, 1]);
        assert_eq!(compute_strides(&[10]), vec![1]);
        assert_eq!(compute_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn test_new_f32_tensor() {
        let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.element_type(), ElementType::F32);
        assert_eq!(t.n_elements(), 6);
        assert_eq!(t.strides(), &[3, 1]);
    }

    #[test]
    #[should_panic(expected = "Data length")]
    fn test_new_shape_mismatch() {
        Tensor::new(vec![2, 3], vec![1.0, 2.0]);
    }

    #[test]
    fn test_from_storage_rejects_wrong_length() {
        let result = Tensor::from_storage(vec![4], TensorStorage::I64(vec![1, 2]));
        assert!(result.is_err());
    }

    #[test]
    fn test_normalize_axis() {
        assert_eq!(normalize_axis(-1, 4).unwrap(), 3);
        assert_eq!(normalize_axis(2, 4).unwrap(), 2);
        assert!(normalize_axis(4, 4).is_err());
        assert!(normalize_axis(-5, 4).is_err());
    }

    #[test]
    fn test_convert_f32_to_f16_and_back() {
        let t = Tensor::new(vec![3], vec![1.0, -2.5, 0.125]);
        let h = t.convert(ElementType::F16);
        assert_eq!(h.element_type(), ElementType::F16);
        assert_eq!(h.convert(ElementType::F32).as_f32(), &[1.0, -2.5, 0.125]);
    }

    #[test]
    fn test_convert_to_bool_and_u4() {
        let t = Tensor::from_i64(vec![3], vec![0, 1, 0x1F]);
        assert_eq!(t.convert(ElementType::Bool).as_bool(), &[false, true, true]);
        assert_eq!(t.convert(ElementType::U4).as_u4(), &[0, 1, 0x0F]);
    }

    #[test]
    fn test_u4_reads_low_nibble() {
        let t = Tensor::from_u4(vec![1], vec![0xF8]);
        assert_eq!(t.to_f32_vec(), vec![8.0]);
    }

    #[test]
    fn test_slice_middle_axis() {
        // [2, 3, 2]
        let t = Tensor::new(vec![2, 3, 2], (0..12).map(|v| v as f32).collect());
        let s = t.slice(1, 1, 3).unwrap();
        assert_eq!(s.shape(), &[2, 2, 2]);
        assert_eq!(s.as_f32(), &[2.0, 3.0, 4.0, 5.0, 8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_slice_out_of_range() {
        let t = Tensor::zeros(&[1, 4], ElementType::F32);
        assert!(t.slice(1, 2, 5).is_err());
        assert!(t.slice(2, 0, 1).is_err());
    }

    #[test]
    fn test_copy_along_axis_f16() {
        let mut dst = Tensor::zeros(&[1, 2, 4], ElementType::F16);
        let src = Tensor::new(vec![1, 2, 1], vec![1.5, -3.0]).convert(ElementType::F16);
        dst.copy_along_axis(2, 3, &src, 0, 1).unwrap();
        assert_eq!(
            dst.to_f32_vec(),
            vec![0.0, 0.0, 0.0, 1.5, 0.0, 0.0, 0.0, -3.0]
        );
    }

    #[test]
    fn test_copy_along_axis_type_mismatch() {
        let mut dst = Tensor::zeros(&[1, 4], ElementType::F16);
        let src = Tensor::zeros(&[1, 1], ElementType::F32);
        assert!(dst.copy_along_axis(1, 0, &src, 0, 1).is_err());
    }

    #[test]
    fn test_copy_with_offset_right_aligns() {
        let mut padded = Tensor::zeros(&[1, 5], ElementType::I64);
        let ids = Tensor::from_i64(vec![1, 2], vec![7, 9]);
        padded.copy_with_offset(&ids, 3).unwrap();
        assert_eq!(padded.as_i64(), &[0, 0, 0, 7, 9]);
        assert!(padded.copy_with_offset(&ids, 4).is_err());
    }

    #[test]
    fn test_concat_axis_1() {
        let a = Tensor::new(vec![2, 1], vec![1.0, 2.0]);
        let b = Tensor::new(vec![2, 2], vec![3.0, 4.0, 5.0, 6.0]);
        let c = Tensor::concat(&[&a, &b], 1).unwrap();
        assert_eq!(c.shape(), &[2, 3]);
        assert_eq!(c.as_f32(), &[1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn test_serde_keeps_non_finite_values() {
        let t = Tensor::new(vec![2], vec![f32::NEG_INFINITY, 0.5]);
        let json = serde_json::to_string(&t).unwrap();
        let back: Tensor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
        assert_eq!(back.strides(), &[1]);
    }

    #[test]
    fn test_reshape_preserves_element_type() {
        let t = Tensor::from_i64(vec![2, 2], vec![1, 2, 3, 4]);
        let r = t.reshape(&[4]);
        assert_eq!(r.element_type(), ElementType::I64);
        assert_eq!(r.strides(), &[1]);
    }

    #[test]
    #[should_panic(expected = "Cannot reshape")]
    fn test_reshape_wrong_size() {
        Tensor::zeros(&[2, 3], ElementType::F32).reshape(&[4]);
    }

    #[test]
    fn test_append_i64_reuses_reserved_storage() {
        let mut data = Vec::with_capacity(8);
        data.extend([1, 1]);
        let mut mask = Tensor::from_i64(vec![1, 2], data);
        let base = mask.as_i64().as_ptr();
        for _ in 0..6 {
            mask.append_i64(1).unwrap();
        }
        assert_eq!(mask.shape(), &[1, 8]);
        assert_eq!(mask.strides(), &[8, 1]);
        assert_eq!(mask.as_i64().as_ptr(), base, "no reallocation within capacity");
    }

    #[test]
    fn test_append_i64_rejects_non_row() {
        let mut t = Tensor::from_i64(vec![2, 1], vec![1, 2]);
        assert!(matches!(t.append_i64(3), Err(InferenceError::Precondition(_))));
        let mut f = Tensor::new(vec![1, 1], vec![0.0]);
        assert!(matches!(f.append_i64(3), Err(InferenceError::TypeMismatch { .. })));
    }
}
