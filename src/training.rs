//! Training data: evaluated points, their uncertainties and the avoid-set.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};

/// How output uncertainties are supplied to [`TrainingSet::from_columns`].
#[derive(Clone, Debug, PartialEq)]
pub enum Noise {
    /// One standard deviation per point and output (`n × m`).
    PerSample(DMatrix<f64>),
    /// A single absolute standard deviation for every point and output.
    Absolute(f64),
    /// A single standard deviation expressed as a fraction of each output.
    Relative(f64),
}

impl Noise {
    /// Interpret a bare scalar: positive means absolute, non-positive means
    /// relative (magnitude taken).
    #[must_use]
    pub fn from_scalar(value: f64) -> Self {
        if value > 0.0 {
            Noise::Absolute(value)
        } else {
            Noise::Relative(value.abs())
        }
    }
}

/// Ordered sequence of evaluated points.
///
/// `x` is `n × d` (raw design variables), `y` is `n × m` (raw outputs) and
/// `ystd` is `n × m` (one standard deviation per output). All three always
/// share the leading dimension and `ystd` is non-negative.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingSet {
    x: DMatrix<f64>,
    y: DMatrix<f64>,
    ystd: DMatrix<f64>,
}

impl TrainingSet {
    /// Creates a training set from 2-D arrays.
    ///
    /// Negative or NaN uncertainties are clipped to zero with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] when the arrays disagree on the
    /// number of points or `ystd` does not match the output count.
    pub fn new(x: DMatrix<f64>, y: DMatrix<f64>, ystd: DMatrix<f64>) -> Result<Self> {
        if y.nrows() != x.nrows() {
            return Err(Error::ShapeMismatch {
                what: "y rows vs x rows",
                expected: x.nrows(),
                got: y.nrows(),
            });
        }
        if ystd.nrows() != y.nrows() {
            return Err(Error::ShapeMismatch {
                what: "ystd rows vs y rows",
                expected: y.nrows(),
                got: ystd.nrows(),
            });
        }
        if ystd.ncols() != y.ncols() {
            return Err(Error::ShapeMismatch {
                what: "ystd columns vs y columns",
                expected: y.ncols(),
                got: ystd.ncols(),
            });
        }
        let ystd = clip_uncertainty(ystd);
        Ok(Self { x, y, ystd })
    }

    /// Creates a training set from possibly one-dimensional data.
    ///
    /// A flat `x` is read as `n` points of a single design variable, a flat
    /// `y` as `n` values of a single output. Both reshapes are logged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] when the reshaped arrays still
    /// disagree.
    pub fn from_columns(x: Array, y: Array, noise: Noise) -> Result<Self> {
        let x = x.into_matrix("x");
        let y = y.into_matrix("y");
        let ystd = match noise {
            Noise::PerSample(m) => {
                if m.ncols() != y.ncols() && m.ncols() == 1 && m.nrows() == y.nrows() {
                    trace_warn!("ystd had one column only, broadcasting to every output");
                    DMatrix::from_fn(y.nrows(), y.ncols(), |i, _| m[(i, 0)])
                } else {
                    m
                }
            }
            Noise::Absolute(s) => {
                trace_warn!(
                    ystd = s,
                    "single noise value given, assuming constant std in absolute terms"
                );
                DMatrix::from_element(y.nrows(), y.ncols(), s)
            }
            Noise::Relative(r) => {
                trace_warn!(
                    fraction = r,
                    "single noise value given, assuming constant std in relative terms"
                );
                y.map(|v| (v * r).abs())
            }
        };
        Self::new(x, y, ystd)
    }

    /// Appends one evaluated point.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the row lengths do not match the
    /// existing columns.
    pub fn push(&mut self, x: &[f64], y: &[f64], ystd: &[f64]) -> Result<()> {
        if x.len() != self.n_inputs() {
            return Err(Error::ShapeMismatch {
                what: "appended x row",
                expected: self.n_inputs(),
                got: x.len(),
            });
        }
        if y.len() != self.n_outputs() || ystd.len() != self.n_outputs() {
            return Err(Error::ShapeMismatch {
                what: "appended y/ystd row",
                expected: self.n_outputs(),
                got: y.len().min(ystd.len()),
            });
        }
        let n = self.n_points();
        self.x = append_row(&self.x, x);
        self.y = append_row(&self.y, y);
        let clipped: Vec<f64> = ystd
            .iter()
            .map(|&s| if s.is_nan() || s < 0.0 { 0.0 } else { s })
            .collect();
        self.ystd = append_row(&self.ystd, &clipped);
        trace_debug!(point = n, "appended training point");
        Ok(())
    }

    /// Number of evaluated points.
    #[must_use]
    pub fn n_points(&self) -> usize {
        self.x.nrows()
    }

    /// Number of design variables.
    #[must_use]
    pub fn n_inputs(&self) -> usize {
        self.x.ncols()
    }

    /// Number of predicted outputs.
    #[must_use]
    pub fn n_outputs(&self) -> usize {
        self.y.ncols()
    }

    /// Raw inputs (`n × d`).
    #[must_use]
    pub fn x(&self) -> &DMatrix<f64> {
        &self.x
    }

    /// Raw outputs (`n × m`).
    #[must_use]
    pub fn y(&self) -> &DMatrix<f64> {
        &self.y
    }

    /// Output standard deviations (`n × m`).
    #[must_use]
    pub fn ystd(&self) -> &DMatrix<f64> {
        &self.ystd
    }

    /// Output variances (`n × m`).
    #[must_use]
    pub fn yvar(&self) -> DMatrix<f64> {
        self.ystd.map(|s| s * s)
    }
}

/// Either a flat vector or a 2-D matrix, for [`TrainingSet::from_columns`].
#[derive(Clone, Debug, PartialEq)]
pub enum Array {
    /// One value per point.
    Flat(Vec<f64>),
    /// Points in rows.
    Matrix(DMatrix<f64>),
}

impl Array {
    fn into_matrix(self, _name: &'static str) -> DMatrix<f64> {
        match self {
            Array::Flat(v) => {
                trace_warn!(array = _name, "array only had 1 dimension, treating it as a single column");
                DMatrix::from_column_slice(v.len(), 1, &v)
            }
            Array::Matrix(m) => m,
        }
    }
}

impl From<Vec<f64>> for Array {
    fn from(v: Vec<f64>) -> Self {
        Array::Flat(v)
    }
}

impl From<DMatrix<f64>> for Array {
    fn from(m: DMatrix<f64>) -> Self {
        Array::Matrix(m)
    }
}

/// Indices of training points excluded from one fitting pass.
///
/// Grows additively during a fit (user-specified points, then outliers)
/// and is rebuilt for every optimization step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AvoidSet {
    indices: BTreeSet<usize>,
}

impl AvoidSet {
    /// Creates an empty avoid-set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds indices to the set.
    pub fn extend(&mut self, indices: impl IntoIterator<Item = usize>) {
        self.indices.extend(indices);
    }

    /// Whether `index` is avoided.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    /// Number of avoided points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether nothing is avoided.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Avoided indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().copied()
    }

    /// Borrow the underlying ordered set.
    #[must_use]
    pub fn as_set(&self) -> &BTreeSet<usize> {
        &self.indices
    }

    /// Keep only the rows of `m` whose index is not avoided.
    #[must_use]
    pub fn retain_rows(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        let kept: Vec<usize> = (0..m.nrows()).filter(|i| !self.contains(*i)).collect();
        select_rows(m, &kept)
    }
}

impl FromIterator<usize> for AvoidSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        Self {
            indices: iter.into_iter().collect(),
        }
    }
}

/// Side-channel points for one output, merged into its surrogate only.
///
/// `x` holds physics-space features, possibly wider than the current run's
/// feature count. Rows are never dropped.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtraPoints {
    x: DMatrix<f64>,
    y: DVector<f64>,
    yvar: DVector<f64>,
}

impl ExtraPoints {
    /// Creates extra points from matching arrays.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `y` or `yvar` do not have one
    /// entry per row of `x`.
    pub fn new(x: DMatrix<f64>, y: DVector<f64>, yvar: DVector<f64>) -> Result<Self> {
        if y.len() != x.nrows() || yvar.len() != x.nrows() {
            return Err(Error::ShapeMismatch {
                what: "extra points y/yvar vs x rows",
                expected: x.nrows(),
                got: y.len().min(yvar.len()),
            });
        }
        Ok(Self { x, y, yvar })
    }

    /// No points, `width` feature columns.
    #[must_use]
    pub fn empty(width: usize) -> Self {
        Self {
            x: DMatrix::zeros(0, width),
            y: DVector::zeros(0),
            yvar: DVector::zeros(0),
        }
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.y.len()
    }

    /// Whether there are no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// Number of feature columns.
    #[must_use]
    pub fn width(&self) -> usize {
        self.x.ncols()
    }

    /// Features (`k × w`).
    #[must_use]
    pub fn x(&self) -> &DMatrix<f64> {
        &self.x
    }

    /// Outputs.
    #[must_use]
    pub fn y(&self) -> &DVector<f64> {
        &self.y
    }

    /// Output variances.
    #[must_use]
    pub fn yvar(&self) -> &DVector<f64> {
        &self.yvar
    }
}

fn clip_uncertainty(ystd: DMatrix<f64>) -> DMatrix<f64> {
    let bad = ystd.iter().filter(|s| s.is_nan() || **s < 0.0).count();
    if bad > 0 {
        trace_warn!(count = bad, "negative or NaN uncertainties clipped to zero");
        ystd.map(|s| if s.is_nan() || s < 0.0 { 0.0 } else { s })
    } else {
        ystd
    }
}

/// Build a matrix from the given rows of `m`, in order.
pub(crate) fn select_rows(m: &DMatrix<f64>, rows: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), m.ncols(), |i, j| m[(rows[i], j)])
}

/// Stack `b` below `a`. Both must have the same number of columns.
pub(crate) fn vstack(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
    let n = a.nrows();
    DMatrix::from_fn(n + b.nrows(), a.ncols(), |i, j| {
        if i < n { a[(i, j)] } else { b[(i - n, j)] }
    })
}

fn append_row(m: &DMatrix<f64>, row: &[f64]) -> DMatrix<f64> {
    let n = m.nrows();
    DMatrix::from_fn(n + 1, m.ncols(), |i, j| if i < n { m[(i, j)] } else { row[j] })
}
