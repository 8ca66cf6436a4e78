//! Named box bounds over the design variables.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One named input dimension and its `[min, max]` interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    /// Name of the design variable.
    pub name: String,
    /// Lower limit.
    pub min: f64,
    /// Upper limit.
    pub max: f64,
}

/// Ordered mapping from input-dimension name to `[min, max]`.
///
/// The order of insertion defines the column order of every input matrix
/// used with these bounds.
///
/// # Examples
///
/// ```
/// use surrogate_optimizer::Bounds;
///
/// let bounds = Bounds::new([("aLte", 0.0, 4.0), ("aLti", 1.0, 3.0)]).unwrap();
/// assert_eq!(bounds.len(), 2);
/// assert_eq!(bounds.names(), vec!["aLte", "aLti"]);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    dims: Vec<Bound>,
}

impl Bounds {
    /// Creates bounds from `(name, min, max)` triples.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBounds`] if any `min >= max` or a limit is
    /// not finite, and [`Error::InvalidConfig`] when no dimension is given.
    pub fn new<S: Into<String>>(dims: impl IntoIterator<Item = (S, f64, f64)>) -> Result<Self> {
        let dims: Vec<Bound> = dims
            .into_iter()
            .map(|(name, min, max)| Bound {
                name: name.into(),
                min,
                max,
            })
            .collect();
        if dims.is_empty() {
            return Err(Error::InvalidConfig("bounds need at least one dimension".into()));
        }
        for b in &dims {
            if !(b.min.is_finite() && b.max.is_finite() && b.min < b.max) {
                return Err(Error::InvalidBounds {
                    name: b.name.clone(),
                    low: b.min,
                    high: b.max,
                });
            }
        }
        Ok(Self { dims })
    }

    /// Number of input dimensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dims.len()
    }

    /// Always `false`; construction rejects empty bounds.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// Dimension names, in column order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.dims.iter().map(|b| b.name.as_str()).collect()
    }

    /// Iterate over the individual bounds.
    pub fn iter(&self) -> impl Iterator<Item = &Bound> {
        self.dims.iter()
    }

    /// Lower limits as a vector.
    #[must_use]
    pub fn lower(&self) -> DVector<f64> {
        DVector::from_iterator(self.len(), self.dims.iter().map(|b| b.min))
    }

    /// Upper limits as a vector.
    #[must_use]
    pub fn upper(&self) -> DVector<f64> {
        DVector::from_iterator(self.len(), self.dims.iter().map(|b| b.max))
    }

    /// Map a raw point into the unit hypercube.
    #[must_use]
    pub fn normalize(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(&self.dims)
            .map(|(&v, b)| (v - b.min) / (b.max - b.min))
            .collect()
    }

    /// Map a unit-hypercube point back into raw units.
    #[must_use]
    pub fn denormalize(&self, u: &[f64]) -> Vec<f64> {
        u.iter()
            .zip(&self.dims)
            .map(|(&v, b)| b.min + v * (b.max - b.min))
            .collect()
    }

    /// Clamp a raw point into the box.
    #[must_use]
    pub fn clip(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(&self.dims)
            .map(|(&v, b)| v.clamp(b.min, b.max))
            .collect()
    }

    /// Clamp every row of a raw input matrix into the box.
    #[must_use]
    pub fn clip_rows(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| {
            let b = &self.dims[j];
            x[(i, j)].clamp(b.min, b.max)
        })
    }

    /// Whether a raw point lies inside the box (inclusive).
    #[must_use]
    pub fn contains(&self, x: &[f64]) -> bool {
        x.len() == self.len()
            && x
                .iter()
                .zip(&self.dims)
                .all(|(&v, b)| v >= b.min && v <= b.max)
    }

    /// Euclidean distance between two raw points, measured in normalized
    /// coordinates and divided by `sqrt(d)` so it lies in `[0, 1]` for
    /// in-bounds points.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn normalized_distance(&self, a: &[f64], b: &[f64]) -> f64 {
        let sq: f64 = a
            .iter()
            .zip(b)
            .zip(&self.dims)
            .map(|((&p, &q), d)| ((p - q) / (d.max - d.min)).powi(2))
            .sum();
        (sq / self.len() as f64).sqrt()
    }
}
