//! Dataset files: whitespace-separated reals, one row per example.

use std::fs;
use std::path::Path;

use ndarray::Array2;

use crate::config::Config;
use crate::errors::{PintError, PintResult};

/// Examples and labels for one sweep. Examples are only needed where the
/// opening layer lives (first worker), labels where the classification
/// layer lives (last worker); the other side stays `None`.
#[derive(Debug, Clone)]
pub struct DataSet {
    pub nelements: usize,
    pub examples: Option<Array2<f64>>,
    pub labels: Option<Array2<f64>>,
}

impl DataSet {
    /// Load the slice of the dataset this worker needs.
    pub fn load(
        config: &Config,
        example_file: &str,
        label_file: &str,
        nelements: usize,
        rank: usize,
        size: usize,
    ) -> PintResult<DataSet> {
        let examples = if rank == 0 {
            Some(read_matrix(
                Path::new(&config.data_path(example_file)),
                nelements,
                config.nfeatures,
            )?)
        } else {
            None
        };
        let labels = if rank == size - 1 {
            Some(read_matrix(
                Path::new(&config.data_path(label_file)),
                nelements,
                config.nclasses,
            )?)
        } else {
            None
        };
        Ok(DataSet { nelements, examples, labels })
    }

    /// In-memory dataset, used by tests and by single-worker runs.
    pub fn from_arrays(examples: Array2<f64>, labels: Array2<f64>) -> DataSet {
        debug_assert_eq!(examples.nrows(), labels.nrows());
        DataSet { nelements: examples.nrows(), examples: Some(examples), labels: Some(labels) }
    }
}

/// Read `nrows x ncols` reals from a text file.
pub fn read_matrix(path: &Path, nrows: usize, ncols: usize) -> PintResult<Array2<f64>> {
    let text = fs::read_to_string(path)
        .map_err(|e| PintError::Dataset(format!("cannot open {}: {e}", path.display())))?;
    let mut values = Vec::with_capacity(nrows * ncols);
    for token in text.split_whitespace().take(nrows * ncols) {
        let v: f64 = token.parse().map_err(|_| {
            PintError::Dataset(format!("non-numeric token '{token}' in {}", path.display()))
        })?;
        values.push(v);
    }
    if values.len() != nrows * ncols {
        return Err(PintError::Dataset(format!(
            "{} holds {} values, expected {}x{}",
            path.display(),
            values.len(),
            nrows,
            ncols
        )));
    }
    Array2::from_shape_vec((nrows, ncols), values)
        .map_err(|e| PintError::Dataset(format!("shape error reading {}: {e}", path.display())))
}

/// Read a flat vector of reals (used for initial weight files).
pub fn read_vector(path: &Path, len: usize) -> PintResult<Vec<f64>> {
    let matrix = read_matrix(path, len, 1)?;
    Ok(matrix.into_raw_vec())
}

/// Write one real per line, `%1.14e` style.
pub fn write_vector(path: &Path, values: &[f64]) -> PintResult<()> {
    use std::io::Write;
    let mut file = fs::File::create(path)?;
    for v in values {
        writeln!(file, "{v:.14e}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_row_major_matrices() {
        let dir = std::env::temp_dir().join("pint_net_dataset_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("m.dat");
        std::fs::write(&path, "1.0 2.0\n3.0 4.0\n").unwrap();
        let m = read_matrix(&path, 2, 2).unwrap();
        assert_eq!(m[[1, 0]], 3.0);
    }

    #[test]
    fn truncated_file_is_an_error() {
        let dir = std::env::temp_dir().join("pint_net_dataset_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("short.dat");
        std::fs::write(&path, "1.0 2.0 3.0").unwrap();
        assert!(read_matrix(&path, 2, 2).is_err());
    }

    #[test]
    fn vector_round_trip() {
        let dir = std::env::temp_dir().join("pint_net_dataset_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("v.dat");
        write_vector(&path, &[0.5, -1.25]).unwrap();
        assert_eq!(read_vector(&path, 2).unwrap(), vec![0.5, -1.25]);
    }
}
