//! Partial shapes: static dimensions mixed with dynamic ones.

use serde::{Deserialize, Serialize};

use crate::error::InferenceError;

/// One dimension of a partial shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Static(usize),
    Dynamic,
}

impl Dim {
    pub fn is_static(self) -> bool {
        matches!(self, Dim::Static(_))
    }

    pub fn get(self) -> Option<usize> {
        match self {
            Dim::Static(n) => Some(n),
            Dim::Dynamic => None,
        }
    }

    /// Whether two dims can describe the same runtime extent.
    pub fn compatible(self, other: Dim) -> bool {
        match (self, other) {
            (Dim::Static(a), Dim::Static(b)) => a == b,
            _ => true,
        }
    }

    /// The more specific of two compatible dims.
    pub fn unify(self, other: Dim) -> Option<Dim> {
        match (self, other) {
            (Dim::Static(a), Dim::Static(b)) if a != b => None,
            (Dim::Static(a), _) | (_, Dim::Static(a)) => Some(Dim::Static(a)),
            _ => Some(Dim::Dynamic),
        }
    }

    pub fn add(self, other: Dim) -> Dim {
        match (self, other) {
            (Dim::Static(a), Dim::Static(b)) => Dim::Static(a + b),
            _ => Dim::Dynamic,
        }
    }
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dim::Static(n) => write!(f, "{}", n),
            Dim::Dynamic => f.write_str("?"),
        }
    }
}

/// Shape whose rank is known but whose dims may be dynamic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartialShape(pub Vec<Dim>);

impl PartialShape {
    pub fn from_static(dims: &[usize]) -> Self {
        PartialShape(dims.iter().map(|&d| Dim::Static(d)).collect())
    }

    pub fn dynamic(rank: usize) -> Self {
        PartialShape(vec![Dim::Dynamic; rank])
    }

    pub fn scalar() -> Self {
        PartialShape(Vec::new())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    pub fn is_static(&self) -> bool {
        self.0.iter().all(|d| d.is_static())
    }

    /// Concrete dims, or `None` if any dim is dynamic.
    pub fn to_static(&self) -> Option<Vec<usize>> {
        self.0.iter().map(|d| d.get()).collect()
    }

    pub fn dim(&self, axis: usize) -> Dim {
        self.0[axis]
    }

    pub fn set_dim(&mut self, axis: usize, dim: Dim) {
        self.0[axis] = dim;
    }

    /// Whether a tensor of `shape` fits this partial shape.
    pub fn accepts(&self, shape: &[usize]) -> bool {
        self.rank() == shape.len()
            && self
                .0
                .iter()
                .zip(shape)
                .all(|(d, &n)| d.compatible(Dim::Static(n)))
    }
}

impl std::fmt::Display for PartialShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", d)?;
        }
        f.write_str("]")
    }
}

/// Numpy-style broadcast of two partial shapes.
pub fn broadcast(a: &PartialShape, b: &PartialShape) -> Result<PartialShape, InferenceError> {
    let rank = a.rank().max(b.rank());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = if i + a.rank() >= rank {
            a.0[i + a.rank() - rank]
        } else {
            Dim::Static(1)
        };
        let db = if i + b.rank() >= rank {
            b.0[i + b.rank() - rank]
        } else {
            Dim::Static(1)
        };
        let d = match (da, db) {
            (Dim::Static(x), Dim::Static(y)) if x == y => Dim::Static(x),
            (Dim::Static(1), other) | (other, Dim::Static(1)) => other,
            (Dim::Static(x), Dim::Static(y)) => {
                return Err(InferenceError::Graph(format!(
                    "cannot broadcast {} with {} (dim {} vs {})",
                    a, b, x, y
                )))
            }
            (Dim::Static(x), Dim::Dynamic) | (Dim::Dynamic, Dim::Static(x)) => Dim::Static(x),
            (Dim::Dynamic, Dim::Dynamic) => Dim::Dynamic,
        };
        out.push(d);
    }
    Ok(PartialShape(out))
}

/// Broadcast of two concrete shapes.
pub fn broadcast_static(a: &[usize], b: &[usize]) -> Result<Vec<usize>, InferenceError> {
    let shape = broadcast(&PartialShape::from_static(a), &PartialShape::from_static(b))?;
    Ok(shape.to_static().unwrap_or_default())
}
