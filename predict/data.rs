//! # Covariate Tables
//!
//! Prediction inputs are tables of named covariate columns, one row per
//! location. Numeric columns hold `f64` values with `NaN` marking a missing
//! entry; text columns are kept as categorical so that structural validation
//! can reject factor covariates before any computation.
//!
//! Tables are built in memory or read from tab-separated files with the
//! `polars` CSV reader. `NA` and empty fields are read as missing.

use ahash::AHashMap;
use ndarray::{Array1, ArrayView1};
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// The values of one covariate column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    /// Numeric values; `NaN` marks a missing entry.
    Numeric(Array1<f64>),
    /// Text labels of a factor covariate.
    Categorical(Vec<Option<String>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(values) => values.len(),
            Self::Categorical(labels) => labels.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self, Self::Categorical(_))
    }

    pub fn as_numeric(&self) -> Option<ArrayView1<'_, f64>> {
        match self {
            Self::Numeric(values) => Some(values.view()),
            Self::Categorical(_) => None,
        }
    }
}

/// A comprehensive error type for all table construction and loading failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the covariate table. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("The column name '{0}' appears more than once in the covariate table.")]
    DuplicateColumn(String),
    #[error("The column '{column_name}' has {found} rows, but the table has {expected}.")]
    RaggedColumns {
        column_name: String,
        found: usize,
        expected: usize,
    },
}

/// Named covariate columns sharing one row count.
#[derive(Debug, Clone, Default)]
pub struct CovariateTable {
    names: Vec<String>,
    columns: Vec<ColumnData>,
    lookup: AHashMap<String, usize>,
    n_rows: usize,
}

impl CovariateTable {
    /// Builds a table from `(name, column)` pairs. Names must be unique and
    /// every column must have the same length.
    pub fn new(columns: Vec<(String, ColumnData)>) -> Result<Self, DataError> {
        let mut table = Self::default();
        for (name, data) in columns {
            table.push_column(name, data)?;
        }
        Ok(table)
    }

    /// Builds an all-numeric table from `(name, values)` pairs.
    pub fn from_numeric<S: Into<String>>(
        columns: Vec<(S, Array1<f64>)>,
    ) -> Result<Self, DataError> {
        Self::new(
            columns
                .into_iter()
                .map(|(name, values)| (name.into(), ColumnData::Numeric(values)))
                .collect(),
        )
    }

    pub fn push_column(&mut self, name: String, data: ColumnData) -> Result<(), DataError> {
        if self.lookup.contains_key(&name) {
            return Err(DataError::DuplicateColumn(name));
        }
        if self.columns.is_empty() {
            self.n_rows = data.len();
        } else if data.len() != self.n_rows {
            return Err(DataError::RaggedColumns {
                column_name: name,
                found: data.len(),
                expected: self.n_rows,
            });
        }
        self.lookup.insert(name.clone(), self.columns.len());
        self.names.push(name);
        self.columns.push(data);
        Ok(())
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.lookup.get(name).map(|&idx| &self.columns[idx])
    }

    /// A numeric column by name.
    pub fn numeric(&self, name: &str) -> Result<ArrayView1<'_, f64>, DataError> {
        let column = self
            .column(name)
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))?;
        column.as_numeric().ok_or_else(|| DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: "categorical".to_string(),
        })
    }

    /// Names of every categorical (factor) column, in table order.
    pub fn categorical_columns(&self) -> Vec<&str> {
        self.names
            .iter()
            .zip(&self.columns)
            .filter(|(_, column)| column.is_categorical())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Loads a tab-separated covariate file into a table.
///
/// Integer, float and boolean columns become numeric (nulls become `NaN`);
/// text columns become categorical.
pub fn load_covariate_table(path: &str) -> Result<CovariateTable, DataError> {
    log::info!("Loading covariates from '{path}'");

    let df = CsvReader::new(File::open(Path::new(path))?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(
                    CsvParseOptions::default()
                        .with_separator(b'\t')
                        .with_null_values(Some(NullValues::AllColumnsSingle("NA".into()))),
                ),
        )
        .finish()?;

    let mut table = CovariateTable::default();
    for column in df.get_columns() {
        let name = column.name().to_string();
        let data = if column.dtype() == &DataType::String {
            let labels = column
                .str()?
                .into_iter()
                .map(|label| label.map(str::to_string))
                .collect();
            ColumnData::Categorical(labels)
        } else {
            let casted = column
                .cast(&DataType::Float64)
                .map_err(|_| DataError::ColumnWrongType {
                    column_name: name.clone(),
                    expected_type: "f64 (numeric)",
                    found_type: format!("{:?}", column.dtype()),
                })?;
            let values: Vec<f64> = casted
                .f64()?
                .into_iter()
                .map(|value| value.unwrap_or(f64::NAN))
                .collect();
            ColumnData::Numeric(Array1::from_vec(values))
        };
        table.push_column(name, data)?;
    }

    log::info!(
        "Loaded {} rows and {} columns ({} categorical)",
        table.n_rows(),
        table.n_cols(),
        table.categorical_columns().len()
    );
    Ok(table)
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    /// A robust helper to create a temporary TSV file for testing.
    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn test_load_marks_missing_and_categorical() {
        let content = "x\ty\televation\tlandcover\n\
                       1.0\t2.0\t10.5\tforest\n\
                       1.5\t2.5\tNA\turban\n\
                       2.0\t3.0\t12.0\tforest";
        let file = create_test_tsv(content).unwrap();
        let table = load_covariate_table(file.path().to_str().unwrap()).unwrap();

        assert_eq!(table.n_rows(), 3);
        assert_eq!(table.names(), &["x", "y", "elevation", "landcover"]);
        assert_eq!(table.categorical_columns(), vec!["landcover"]);

        let elevation = table.numeric("elevation").unwrap();
        assert_eq!(elevation[0], 10.5);
        assert!(elevation[1].is_nan());
        assert_eq!(elevation[2], 12.0);
    }

    #[test]
    fn test_numeric_lookup_errors() {
        let table = CovariateTable::new(vec![
            ("a".to_string(), ColumnData::Numeric(array![1.0, 2.0])),
            (
                "kind".to_string(),
                ColumnData::Categorical(vec![Some("u".to_string()), None]),
            ),
        ])
        .unwrap();

        match table.numeric("missing") {
            Err(DataError::ColumnNotFound(name)) => assert_eq!(name, "missing"),
            other => panic!("Expected ColumnNotFound, got {other:?}"),
        }
        match table.numeric("kind") {
            Err(DataError::ColumnWrongType { column_name, .. }) => assert_eq!(column_name, "kind"),
            other => panic!("Expected ColumnWrongType, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_duplicate_and_ragged_columns() {
        let duplicate = CovariateTable::from_numeric(vec![
            ("a", array![1.0, 2.0]),
            ("a", array![3.0, 4.0]),
        ]);
        assert!(matches!(duplicate, Err(DataError::DuplicateColumn(name)) if name == "a"));

        let ragged = CovariateTable::from_numeric(vec![("a", array![1.0, 2.0]), ("b", array![3.0])]);
        match ragged {
            Err(DataError::RaggedColumns {
                column_name,
                found,
                expected,
            }) => {
                assert_eq!(column_name, "b");
                assert_eq!(found, 1);
                assert_eq!(expected, 2);
            }
            other => panic!("Expected RaggedColumns, got {other:?}"),
        }
    }
}
