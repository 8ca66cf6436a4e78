#![allow(clippy::cast_precision_loss)]

mod acquisition;
mod fit;
mod proximity;
mod search;

use std::path::PathBuf;

use nalgebra::DMatrix;
use surrogate_optimizer::prelude::*;

pub(crate) fn temp_dir(tag: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut path = std::env::temp_dir();
    path.push(format!(
        "step_test_{tag}_{}_{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    path
}

/// Two outputs on one input: a parabola with its minimum at 0.3 and a line.
pub(crate) fn training() -> TrainingSet {
    let x = DMatrix::<f64>::from_row_slice(6, 1, &[0.0, 0.15, 0.45, 0.6, 0.8, 1.0]);
    let y = DMatrix::from_fn(6, 2, |i, j| {
        let v = x[(i, 0)];
        if j == 0 { (v - 0.3).powi(2) } else { 0.5 * v }
    });
    TrainingSet::new(x, y, DMatrix::from_element(6, 2, 1e-3)).unwrap()
}

pub(crate) fn bounds() -> Bounds {
    Bounds::new([("x", 0.0, 1.0)]).unwrap()
}
