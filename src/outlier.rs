//! Leave-one-out outlier detection over the training outputs.
//!
//! For every point and output channel, the point's value is compared with
//! the mean and standard deviation of the *other* points in that channel.
//! A channel flags the point when the value lies more than `stds_outside`
//! standard deviations away. The point is reported when at least
//! `stds_outside_checker` channels flag it.
//!
//! Channels with fewer than [`MIN_PEERS`] other points, or whose peers have
//! no spread at all, carry no usable statistic and are skipped.

use std::collections::BTreeSet;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::stats;

/// Minimum number of peers (other points) for the leave-one-out test.
pub const MIN_PEERS: usize = 3;

/// Configuration of the outlier test.
///
/// # Examples
///
/// ```
/// use nalgebra::DMatrix;
/// use surrogate_optimizer::OutlierFilter;
///
/// let y = DMatrix::from_column_slice(6, 1, &[1.0, 1.1, 0.9, 1.05, 0.95, 50.0]);
/// let yvar = DMatrix::from_element(6, 1, 0.01);
/// let filter = OutlierFilter::new(Some(5.0), 1);
/// let outliers = filter.find(&y, &yvar, &Default::default());
/// assert_eq!(outliers.into_iter().collect::<Vec<_>>(), vec![5]);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutlierFilter {
    /// Threshold in standard deviations of the peers. `None` disables the test.
    pub stds_outside: Option<f64>,
    /// Number of channels that must flag a point.
    pub stds_outside_checker: usize,
}

impl Default for OutlierFilter {
    fn default() -> Self {
        Self {
            stds_outside: Some(5.0),
            stds_outside_checker: 1,
        }
    }
}

impl OutlierFilter {
    /// Creates a filter.
    #[must_use]
    pub fn new(stds_outside: Option<f64>, stds_outside_checker: usize) -> Self {
        Self {
            stds_outside,
            stds_outside_checker,
        }
    }

    /// Finds the points to exclude.
    ///
    /// `y` holds one column per channel. `yvar` is only used for logging.
    /// Indices already in `already_avoided` are never reported again.
    #[must_use]
    #[allow(clippy::similar_names)]
    pub fn find(
        &self,
        y: &DMatrix<f64>,
        yvar: &DMatrix<f64>,
        already_avoided: &BTreeSet<usize>,
    ) -> BTreeSet<usize> {
        let mut outliers = BTreeSet::new();
        let Some(stds_outside) = self.stds_outside else {
            return outliers;
        };
        trace_debug!(
            stds_outside,
            checker = self.stds_outside_checker,
            "checking outliers against the rest of the population"
        );

        let needed = self.stds_outside_checker.max(1);
        for i in 0..y.nrows() {
            let mut flagged = 0;
            for j in 0..y.ncols() {
                let value = y[(i, j)];
                let peers: Vec<f64> = (0..y.nrows())
                    .filter(|&k| k != i)
                    .map(|k| y[(k, j)])
                    .filter(|v| v.is_finite())
                    .collect();
                if is_outlier(value, &peers, stds_outside) {
                    flagged += 1;
                    trace_info!(
                        point = i,
                        channel = j,
                        value,
                        variance = yvar[(i, j)],
                        "point is an outlier in this channel"
                    );
                }
            }
            if flagged >= needed && !already_avoided.contains(&i) {
                outliers.insert(i);
            }
        }
        outliers
    }
}

/// Whether `value` lies more than `stds_outside` peer standard deviations
/// from the peer mean. Degenerate populations never flag.
fn is_outlier(value: f64, peers: &[f64], stds_outside: f64) -> bool {
    if peers.len() < MIN_PEERS {
        trace_debug!(peers = peers.len(), "too few peers for the outlier statistic, skipping");
        return false;
    }
    let mean = stats::mean(peers);
    let std = stats::std_dev(peers, 1);
    if !std.is_finite() || std <= f64::EPSILON * mean.abs().max(1.0) {
        return false;
    }
    (value - mean).abs() > stds_outside * std
}
