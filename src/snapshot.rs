//! On-disk training-data snapshot shared by every surrogate of a step.
//!
//! The snapshot is one JSON document holding, per output, the complete
//! physics-space design matrix, the outputs and their variances, plus the
//! names of the feature columns. A later run can feed an entry back in as
//! extra points for the same output. Missing values (NaN) are stored as
//! `null` and infinities as `"inf"` / `"-inf"`, so every number reads back
//! exactly as written.
//!
//! The file is read, updated for one output and written back wholesale.
//! Writers serialise on an exclusive lock file next to the snapshot and
//! replace the document atomically (temp file + rename), so a crash never
//! leaves a half-written snapshot behind.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use nalgebra::{DMatrix, DVector};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::training::ExtraPoints;

/// Schema version written into every snapshot.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Training data of one output.
///
/// Rows of `x` may differ in length when entries from runs with different
/// feature counts were merged; [`x_matrix`](Self::x_matrix) pads with NaN.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Output this entry belongs to.
    pub output: String,
    /// Names of the feature columns.
    pub x_names: Vec<String>,
    /// Physics-space inputs, one row per point.
    #[serde(with = "nan_rows")]
    pub x: Vec<Vec<f64>>,
    /// Physics-space outputs.
    #[serde(with = "nan_values")]
    pub y: Vec<f64>,
    /// Output variances.
    #[serde(with = "nan_values")]
    pub yvar: Vec<f64>,
}

impl SnapshotEntry {
    /// Builds an entry from matrices. `y` and `yvar` must have `x.nrows()`
    /// entries.
    #[must_use]
    pub fn from_matrices(
        output: impl Into<String>,
        x_names: Vec<String>,
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        yvar: &DVector<f64>,
    ) -> Self {
        Self {
            output: output.into(),
            x_names,
            x: x.row_iter().map(|r| r.iter().copied().collect()).collect(),
            y: y.iter().copied().collect(),
            yvar: yvar.iter().copied().collect(),
        }
    }

    /// Number of stored points.
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.y.len()
    }

    /// Widest row length.
    #[must_use]
    pub fn width(&self) -> usize {
        self.x.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Inputs as a matrix, padding short rows with NaN.
    #[must_use]
    pub fn x_matrix(&self) -> DMatrix<f64> {
        let width = self.width();
        DMatrix::from_fn(self.x.len(), width, |i, j| {
            self.x[i].get(j).copied().unwrap_or(f64::NAN)
        })
    }

    /// Outputs as a vector.
    #[must_use]
    pub fn y_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.y)
    }

    /// Variances as a vector.
    #[must_use]
    pub fn yvar_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.yvar)
    }
}

/// The whole snapshot document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingSnapshot {
    /// Schema version for forward compatibility.
    pub version: u32,
    /// Entries in output order.
    pub entries: Vec<SnapshotEntry>,
}

impl Default for TrainingSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            entries: Vec::new(),
        }
    }
}

impl TrainingSnapshot {
    /// Entry of `output`, if present.
    #[must_use]
    pub fn get(&self, output: &str) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|e| e.output == output)
    }

    /// Replace the entry of the same output, or append it.
    pub fn upsert(&mut self, entry: SnapshotEntry) {
        match self.entries.iter_mut().find(|e| e.output == entry.output) {
            Some(slot) => *slot = entry,
            None => self.entries.push(entry),
        }
    }

    /// Total number of points across entries whose output name contains
    /// any of `include` (all entries if `include` is empty).
    #[must_use]
    pub fn count_rows(&self, include: &[String]) -> usize {
        self.selected(include).map(SnapshotEntry::n_rows).sum()
    }

    fn selected<'a>(&'a self, include: &'a [String]) -> impl Iterator<Item = &'a SnapshotEntry> {
        self.entries
            .iter()
            .filter(move |e| include.is_empty() || include.iter().any(|s| e.output.contains(s.as_str())))
    }
}

/// Handle on a snapshot file.
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    /// Serialise in-process writers so the file lock is held briefly.
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Opens a store at `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Creates (or resets) the file with an empty entry per output.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn create<S: AsRef<str>>(path: impl AsRef<Path>, outputs: &[S]) -> Result<Self> {
        let store = Self::new(path);
        let snapshot = TrainingSnapshot {
            version: SNAPSHOT_VERSION,
            entries: outputs
                .iter()
                .map(|o| SnapshotEntry {
                    output: o.as_ref().to_string(),
                    ..SnapshotEntry::default()
                })
                .collect(),
        };
        {
            let _guard = store.write_lock.lock();
            let lock = store.lock_file()?;
            store.write_atomic(&snapshot)?;
            FileExt::unlock(&lock).map_err(|e| Error::Snapshot(e.to_string()))?;
        }
        Ok(store)
    }

    /// Location of the snapshot document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole document. A missing file reads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Snapshot`] if the file cannot be parsed.
    pub fn read(&self) -> Result<TrainingSnapshot> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TrainingSnapshot::default());
            }
            Err(e) => return Err(e.into()),
        };
        file.lock_shared().map_err(|e| Error::Snapshot(e.to_string()))?;
        let parsed = serde_json::from_reader(BufReader::new(&file));
        FileExt::unlock(&file).map_err(|e| Error::Snapshot(e.to_string()))?;
        let snapshot: TrainingSnapshot = parsed?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(Error::Snapshot(format!(
                "snapshot version {} is newer than supported version {SNAPSHOT_VERSION}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    /// Replaces the entry of `entry.output` and writes the document back.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or written.
    pub fn update(&self, entry: SnapshotEntry) -> Result<()> {
        let _guard = self.write_lock.lock();
        let lock = self.lock_file()?;
        let mut snapshot = self.read()?;
        trace_debug!(
            output = %entry.output,
            rows = entry.n_rows(),
            path = %self.path.display(),
            "updating training snapshot"
        );
        snapshot.upsert(entry);
        self.write_atomic(&snapshot)?;
        FileExt::unlock(&lock).map_err(|e| Error::Snapshot(e.to_string()))?;
        Ok(())
    }

    /// Extra points stored for `output`. An absent or empty entry yields
    /// zero rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be read.
    pub fn extra_points(&self, output: &str) -> Result<ExtraPoints> {
        let snapshot = self.read()?;
        Ok(match snapshot.get(output) {
            Some(entry) => ExtraPoints::new(entry.x_matrix(), entry.y_vector(), entry.yvar_vector())?,
            None => {
                trace_info!(output, path = %self.path.display(), "no extra points stored for output");
                ExtraPoints::empty(0)
            }
        })
    }

    /// Writes the tabulated values and errors of the entries selected by
    /// `include` into `folder`, returning both paths.
    ///
    /// Each row holds the output name, the inputs (NaN-padded to the widest
    /// entry) and the output value, or its standard deviation for the
    /// errors table.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be read or the tables cannot
    /// be written.
    pub fn export_tables(&self, include: &[String], folder: &Path) -> Result<(PathBuf, PathBuf)> {
        let snapshot = self.read()?;
        let stem = if include.is_empty() {
            String::from("training_data")
        } else {
            format!("training_data_{}", include.join("_"))
        };
        let values = folder.join(format!("{stem}_table.dat"));
        let errors = folder.join(format!("{stem}_table_errors.dat"));
        write_table(&snapshot, include, &values, |e, i| e.y[i])?;
        write_table(&snapshot, include, &errors, |e, i| e.yvar[i].sqrt())?;
        trace_info!(
            rows = snapshot.count_rows(include),
            path = %values.display(),
            "training tables written"
        );
        Ok((values, errors))
    }

    fn lock_file(&self) -> Result<File> {
        let name = self
            .path
            .file_name()
            .map_or_else(|| "snapshot".into(), |n| n.to_string_lossy().into_owned());
        let lock_path = self.parent().join(format!(".{name}.lock"));
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path)?;
        lock.lock_exclusive().map_err(|e| Error::Snapshot(e.to_string()))?;
        Ok(lock)
    }

    fn parent(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }

    fn write_atomic(&self, snapshot: &TrainingSnapshot) -> Result<()> {
        let name = self
            .path
            .file_name()
            .map_or_else(|| "snapshot".into(), |n| n.to_string_lossy().into_owned());
        let tmp_path = self.parent().join(format!(".{name}.tmp"));
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        serde_json::to_writer_pretty(&mut writer, snapshot)?;
        writer.flush()?;
        drop(writer);
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn write_table(
    snapshot: &TrainingSnapshot,
    include: &[String],
    path: &Path,
    value: impl Fn(&SnapshotEntry, usize) -> f64,
) -> Result<()> {
    let width = snapshot.selected(include).map(SnapshotEntry::width).max().unwrap_or(0);
    let mut out = BufWriter::new(File::create(path)?);
    write!(out, "# {:<10}", "output")?;
    for j in 0..width {
        write!(out, " {:>24}", format!("x_{j}"))?;
    }
    writeln!(out, " {:>24}", "y")?;
    for entry in snapshot.selected(include) {
        for (i, row) in entry.x.iter().enumerate() {
            write!(out, "  {:<10}", entry.output)?;
            for j in 0..width {
                write!(out, " {:>24.16e}", row.get(j).copied().unwrap_or(f64::NAN))?;
            }
            writeln!(out, " {:>24.16e}", value(entry, i))?;
        }
    }
    out.flush()?;
    Ok(())
}

/// One stored number: NaN is `null`, infinities are the strings `"inf"` and
/// `"-inf"`, everything else a plain JSON number.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Cell {
    Number(f64),
    Infinite(Infinity),
}

#[derive(Serialize, Deserialize)]
enum Infinity {
    #[serde(rename = "inf")]
    Positive,
    #[serde(rename = "-inf")]
    Negative,
}

fn encode(x: f64) -> Option<Cell> {
    if x.is_nan() {
        None
    } else if x.is_infinite() {
        Some(Cell::Infinite(if x.is_sign_positive() {
            Infinity::Positive
        } else {
            Infinity::Negative
        }))
    } else {
        Some(Cell::Number(x))
    }
}

fn decode(cell: Option<Cell>) -> f64 {
    match cell {
        None => f64::NAN,
        Some(Cell::Number(x)) => x,
        Some(Cell::Infinite(Infinity::Positive)) => f64::INFINITY,
        Some(Cell::Infinite(Infinity::Negative)) => f64::NEG_INFINITY,
    }
}

/// Non-finite-aware encoding of a flat vector.
mod nan_values {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{Cell, decode, encode};

    pub(super) fn serialize<S: Serializer>(v: &[f64], s: S) -> Result<S::Ok, S::Error> {
        let cells: Vec<Option<Cell>> = v.iter().copied().map(encode).collect();
        cells.serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        let cells: Vec<Option<Cell>> = Vec::deserialize(d)?;
        Ok(cells.into_iter().map(decode).collect())
    }
}

/// Non-finite-aware encoding of rows of values.
mod nan_rows {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{Cell, decode, encode};

    pub(super) fn serialize<S: Serializer>(v: &[Vec<f64>], s: S) -> Result<S::Ok, S::Error> {
        let cells: Vec<Vec<Option<Cell>>> = v
            .iter()
            .map(|r| r.iter().copied().map(encode).collect())
            .collect();
        cells.serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<f64>>, D::Error> {
        let cells: Vec<Vec<Option<Cell>>> = Vec::deserialize(d)?;
        Ok(cells
            .into_iter()
            .map(|r| r.into_iter().map(decode).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        let unique = format!(
            "snapshot_{tag}_{}_{}.json",
            std::process::id(),
            fastrand::u64(..)
        );
        std::env::temp_dir().join(unique)
    }

    fn entry(output: &str, rows: usize) -> SnapshotEntry {
        let x = DMatrix::from_fn(rows, 2, |i, j| (i * 2 + j) as f64 * 0.1);
        let y = DVector::from_fn(rows, |i, _| i as f64);
        let yvar = DVector::from_element(rows, 0.01);
        SnapshotEntry::from_matrices(output, vec!["a".into(), "b".into()], &x, &y, &yvar)
    }

    #[test]
    fn update_replaces_only_one_output() {
        let path = temp_path("update");
        let store = SnapshotStore::create(&path, &["Qe", "Qi"]).unwrap();
        store.update(entry("Qe", 3)).unwrap();
        store.update(entry("Qi", 2)).unwrap();
        store.update(entry("Qe", 4)).unwrap();
        let snap = store.read().unwrap();
        assert_eq!(snap.entries.len(), 2);
        assert_eq!(snap.get("Qe").unwrap().n_rows(), 4);
        assert_eq!(snap.get("Qi").unwrap().n_rows(), 2);
        assert_eq!(snap.entries[0].output, "Qe");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn nan_survives_roundtrip() {
        let path = temp_path("nan");
        let store = SnapshotStore::new(&path);
        let mut e = entry("Qe", 2);
        e.x[1].push(f64::NAN);
        e.y[0] = f64::NAN;
        store.update(e).unwrap();
        let back = store.read().unwrap();
        let got = back.get("Qe").unwrap();
        assert!(got.y[0].is_nan());
        assert_eq!(got.y[1], 1.0);
        assert_eq!(got.width(), 3);
        assert!(got.x_matrix()[(0, 2)].is_nan());
        assert!(got.x_matrix()[(1, 2)].is_nan());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn floats_roundtrip_exactly() {
        let path = temp_path("exact");
        let store = SnapshotStore::new(&path);
        let mut e = entry("Qe", 1);
        e.y[0] = 0.1 + 0.2;
        e.x[0][0] = 1.0 / 3.0;
        store.update(e.clone()).unwrap();
        assert_eq!(store.read().unwrap().get("Qe").unwrap(), &e);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_reads_empty() {
        let store = SnapshotStore::new(temp_path("missing"));
        assert!(store.read().unwrap().entries.is_empty());
        assert_eq!(store.extra_points("Qe").unwrap().len(), 0);
    }

    #[test]
    fn tables_hold_selected_rows() {
        let path = temp_path("tables");
        let store = SnapshotStore::create(&path, &["Qe_1", "Qi_1"]).unwrap();
        store.update(entry("Qe_1", 3)).unwrap();
        store.update(entry("Qi_1", 2)).unwrap();
        let (values, errors) = store
            .export_tables(&["Qe".to_string()], &std::env::temp_dir())
            .unwrap();
        let text = std::fs::read_to_string(&values).unwrap();
        assert_eq!(text.lines().count(), 1 + 3);
        let err_text = std::fs::read_to_string(&errors).unwrap();
        let std: f64 = err_text
            .lines()
            .nth(1)
            .and_then(|l| l.split_whitespace().last())
            .unwrap()
            .parse()
            .unwrap();
        assert!((std - 0.1).abs() < 1e-12);
        for p in [path, values, errors] {
            std::fs::remove_file(p).ok();
        }
    }
}
