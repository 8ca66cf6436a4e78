//! Joint view over the per-output surrogates.

use std::sync::Arc;

use nalgebra::DMatrix;

use crate::error::{Error, Result};
use crate::surrogate::{Prediction, SurrogateModel};

/// Concatenates independent per-output posteriors.
///
/// Column `j` of every prediction belongs to `models[j]`; the order given
/// to [`new`](Self::new) is kept for the lifetime of the model.
#[derive(Clone, Debug)]
pub struct CompositeModel {
    models: Vec<Arc<SurrogateModel>>,
    train_x: Option<DMatrix<f64>>,
    train_y: Option<DMatrix<f64>>,
}

impl CompositeModel {
    /// Assemble fitted surrogates sharing one raw input space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty list,
    /// [`Error::InvalidPhase`] if a model is not fitted and
    /// [`Error::ShapeMismatch`] if the models disagree on the input count.
    pub fn new(models: Vec<Arc<SurrogateModel>>) -> Result<Self> {
        let Some(first) = models.first() else {
            return Err(Error::InvalidConfig(String::from(
                "a composite model needs at least one output",
            )));
        };
        let d = first.n_inputs();
        for m in &models {
            if !m.is_fitted() {
                return Err(Error::InvalidPhase {
                    expected: "fitted",
                    found: "unfitted",
                });
            }
            if m.n_inputs() != d {
                return Err(Error::ShapeMismatch {
                    what: "composite model input columns",
                    expected: d,
                    got: m.n_inputs(),
                });
            }
        }
        Ok(Self {
            models,
            train_x: None,
            train_y: None,
        })
    }

    /// Attach the raw training data the models were built from, one output
    /// column per model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the shapes disagree with the models.
    pub fn with_training_data(mut self, x: DMatrix<f64>, y: DMatrix<f64>) -> Result<Self> {
        if x.ncols() != self.n_inputs() {
            return Err(Error::ShapeMismatch {
                what: "composite training x columns",
                expected: self.n_inputs(),
                got: x.ncols(),
            });
        }
        if y.ncols() != self.n_outputs() {
            return Err(Error::ShapeMismatch {
                what: "composite training y columns",
                expected: self.n_outputs(),
                got: y.ncols(),
            });
        }
        if y.nrows() != x.nrows() {
            return Err(Error::ShapeMismatch {
                what: "composite training rows",
                expected: x.nrows(),
                got: y.nrows(),
            });
        }
        self.train_x = Some(x);
        self.train_y = Some(y);
        Ok(self)
    }

    /// Joint posterior at raw inputs `x`; see [`SurrogateModel::predict`].
    ///
    /// # Errors
    ///
    /// Propagates the first per-output failure.
    pub fn predict(
        &self,
        x: &DMatrix<f64>,
        fundamental: bool,
        n_samples: Option<usize>,
    ) -> Result<Prediction> {
        let parts = self
            .models
            .iter()
            .map(|m| m.predict(x, fundamental, n_samples))
            .collect::<Result<Vec<_>>>()?;
        Ok(Prediction::concat(&parts))
    }

    /// [`predict`](Self::predict) over several batches.
    ///
    /// # Errors
    ///
    /// Propagates the first failure.
    pub fn predict_batched(
        &self,
        batches: &[DMatrix<f64>],
        fundamental: bool,
        n_samples: Option<usize>,
    ) -> Result<Vec<Prediction>> {
        batches
            .iter()
            .map(|b| self.predict(b, fundamental, n_samples))
            .collect()
    }

    /// Output names in column order.
    #[must_use]
    pub fn output_names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.output()).collect()
    }

    /// Column of `output`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownOutput`] for a name not in the model.
    pub fn output_index(&self, output: &str) -> Result<usize> {
        self.models
            .iter()
            .position(|m| m.output() == output)
            .ok_or_else(|| Error::UnknownOutput(output.to_string()))
    }

    /// Surrogate of `output`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownOutput`] for a name not in the model.
    pub fn model(&self, output: &str) -> Result<&Arc<SurrogateModel>> {
        Ok(&self.models[self.output_index(output)?])
    }

    /// Constituent surrogates in column order.
    #[must_use]
    pub fn models(&self) -> &[Arc<SurrogateModel>] {
        &self.models
    }

    /// Raw training inputs, when attached.
    #[must_use]
    pub fn train_x(&self) -> Option<&DMatrix<f64>> {
        self.train_x.as_ref()
    }

    /// Raw training outputs, when attached.
    #[must_use]
    pub fn train_y(&self) -> Option<&DMatrix<f64>> {
        self.train_y.as_ref()
    }

    /// Number of outputs.
    #[must_use]
    pub fn n_outputs(&self) -> usize {
        self.models.len()
    }

    /// Number of raw inputs.
    #[must_use]
    pub fn n_inputs(&self) -> usize {
        self.models.first().map_or(0, |m| m.n_inputs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn fitted(name: &str, slope: f64) -> Arc<SurrogateModel> {
        let x = DMatrix::from_row_slice(5, 1, &[0.0, 0.25, 0.5, 0.75, 1.0]);
        let y = DVector::from_fn(5, |i, _| 1.0 + slope * x[(i, 0)]);
        let yvar = DVector::from_element(5, 1e-4);
        let mut m = SurrogateModel::builder(name, x, y, yvar).build().unwrap();
        m.fit().unwrap();
        Arc::new(m)
    }

    #[test]
    fn columns_follow_model_order() {
        let a = fitted("a", 2.0);
        let b = fitted("b", -3.0);
        let c = CompositeModel::new(vec![a.clone(), b.clone()]).unwrap();
        let xs = DMatrix::from_row_slice(3, 1, &[0.1, 0.6, 0.9]);
        let joint = c.predict(&xs, false, None).unwrap();
        let pa = a.predict(&xs, false, None).unwrap();
        let pb = b.predict(&xs, false, None).unwrap();
        assert_eq!(joint.mean.column(0), pa.mean.column(0));
        assert_eq!(joint.mean.column(1), pb.mean.column(0));
        assert_eq!(joint.variance.column(1), pb.variance.column(0));
        assert_eq!(c.output_names(), vec!["a", "b"]);
        assert_eq!(c.output_index("b").unwrap(), 1);
    }

    #[test]
    fn unknown_output_is_an_error() {
        let c = CompositeModel::new(vec![fitted("a", 1.0)]).unwrap();
        assert!(matches!(c.model("z"), Err(Error::UnknownOutput(o)) if o == "z"));
    }

    #[test]
    fn empty_composite_is_rejected() {
        assert!(matches!(CompositeModel::new(Vec::new()), Err(Error::InvalidConfig(_))));
    }
}
