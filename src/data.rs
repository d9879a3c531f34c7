//! In-memory datasets for supervised and reconstruction training.

use std::path::Path;

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed-size dataset of dense input rows, optionally labeled with class
/// indices. Reconstruction phases use the input row itself as the target.
pub struct Dataset {
    inputs: Array2<f32>,
    classes: Option<Vec<usize>>,
}

/// On-disk dataset layout, one row per example.
#[derive(Serialize, Deserialize)]
struct DatasetFile {
    inputs: Vec<Vec<f32>>,
    #[serde(default)]
    classes: Option<Vec<usize>>,
}

impl Dataset {
    pub fn labeled(inputs: Array2<f32>, classes: Vec<usize>) -> Result<Self> {
        if classes.len() != inputs.nrows() {
            return Err(Error::data(format!(
                "{} class labels for {} examples",
                classes.len(),
                inputs.nrows()
            )));
        }
        Ok(Self {
            inputs,
            classes: Some(classes),
        })
    }

    pub fn unlabeled(inputs: Array2<f32>) -> Self {
        Self {
            inputs,
            classes: None,
        }
    }

    /// Build a dataset from precomputed rows of equal width.
    pub fn from_rows(rows: Vec<Array1<f32>>) -> Result<Self> {
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut inputs = Array2::zeros((rows.len(), width));
        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(Error::data(format!(
                    "row {i} has {} values, expected {width}",
                    row.len()
                )));
            }
            inputs.row_mut(i).assign(row);
        }
        Ok(Self {
            inputs,
            classes: None,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let file: DatasetFile = serde_json::from_str(&raw)?;
        let n = file.inputs.len();
        let width = file.inputs.first().map(|r| r.len()).unwrap_or(0);
        let mut inputs = Array2::zeros((n, width));
        for (i, row) in file.inputs.iter().enumerate() {
            if row.len() != width {
                return Err(Error::data(format!(
                    "{}: row {i} has {} values, expected {width}",
                    path.display(),
                    row.len()
                )));
            }
            for (j, &v) in row.iter().enumerate() {
                inputs[(i, j)] = v;
            }
        }
        match file.classes {
            Some(classes) => Self::labeled(inputs, classes),
            None => Ok(Self::unlabeled(inputs)),
        }
    }

    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.nrows() == 0
    }

    pub fn input_width(&self) -> usize {
        self.inputs.ncols()
    }

    pub fn is_labeled(&self) -> bool {
        self.classes.is_some()
    }

    pub fn input(&self, index: usize) -> ArrayView1<f32> {
        self.inputs.row(index)
    }

    pub fn class(&self, index: usize) -> Result<usize> {
        self.classes
            .as_ref()
            .map(|c| c[index])
            .ok_or_else(|| Error::data("dataset has no class labels"))
    }

    /// Largest class index plus one, for sizing the classifier head.
    pub fn n_classes(&self) -> Option<usize> {
        self.classes
            .as_ref()
            .map(|c| c.iter().max().map(|&m| m + 1).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;

    #[test]
    fn labeled_length_mismatch_rejected() {
        let inputs = array![[1.0, 2.0], [3.0, 4.0]];
        assert!(Dataset::labeled(inputs, vec![0]).is_err());
    }

    #[test]
    fn from_rows_checks_widths() {
        let rows = vec![array![1.0, 2.0], array![3.0]];
        assert!(Dataset::from_rows(rows).is_err());
    }

    #[test]
    fn load_labeled_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"inputs": [[1.0, 0.0], [0.0, 1.0]], "classes": [0, 1]}}"#
        )
        .unwrap();
        let ds = Dataset::load(file.path()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.input_width(), 2);
        assert_eq!(ds.class(1).unwrap(), 1);
        assert_eq!(ds.n_classes(), Some(2));
    }

    #[test]
    fn unlabeled_dataset_has_no_classes() {
        let ds = Dataset::unlabeled(array![[1.0], [2.0]]);
        assert!(!ds.is_labeled());
        assert!(ds.class(0).is_err());
    }
}
