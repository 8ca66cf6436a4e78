#![allow(clippy::cast_precision_loss)]

mod degenerate;
mod extra_points;
mod fitting;

use std::path::PathBuf;

pub(crate) fn temp_path(tag: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut path = std::env::temp_dir();
    path.push(format!(
        "surrogate_test_{tag}_{}_{}.json",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    path
}
