//! # Raster Prediction
//!
//! Predicts over every cell of a covariate raster stack. Cells where any band
//! is missing are skipped and stay `NaN` in the output layers; the remaining
//! cells go through `predict_inla` as one covariate table, with coordinates
//! taken from the cell centres and constant covariates broadcast to every
//! cell.

use crate::data::{ColumnData, CovariateTable, DataError};
use crate::model::{FittedModel, LinkFunction};
use crate::orchestrate::{
    PredictionError, PredictionRequest, PredictionType, PredictionWarning, predict_inla,
};
use crate::spatial::Mesh;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RasterError {
    #[error("Invalid raster grid: {0}")]
    InvalidGrid(String),
    #[error("Constant covariate '{name}' must be a single value, but has {len}.")]
    InvalidConstantShape { name: String, len: usize },
    #[error(
        "Covariate name '{0}' is used more than once across raster bands, constants and coordinate columns."
    )]
    DuplicateCovariateName(String),
    #[error("Fixed effect '{0}' is neither a raster band nor a constant covariate.")]
    MissingFixedEffectSource(String),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Prediction(#[from] PredictionError),
}

/// A stack of co-registered covariate bands over a regular grid.
pub trait Grid: Sync {
    /// `(rows, columns)` of every band.
    fn shape(&self) -> (usize, usize);
    fn band_names(&self) -> &[String];
    fn band(&self, idx: usize) -> ArrayView2<'_, f64>;
    /// Longitude/latitude of the centre of a cell.
    fn cell_centre(&self, row: usize, col: usize) -> [f64; 2];
}

/// A north-up raster: row 0 is the top edge at `origin[1]`, column 0 the left
/// edge at `origin[0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterGrid {
    origin: [f64; 2],
    resolution: [f64; 2],
    names: Vec<String>,
    bands: Vec<Array2<f64>>,
}

impl RasterGrid {
    pub fn new(
        origin: [f64; 2],
        resolution: [f64; 2],
        bands: Vec<(String, Array2<f64>)>,
    ) -> Result<Self, RasterError> {
        if !resolution.iter().all(|r| r.is_finite() && *r > 0.0) {
            return Err(RasterError::InvalidGrid(format!(
                "cell size must be positive, got {resolution:?}"
            )));
        }
        let Some(shape) = bands.first().map(|(_, band)| band.dim()) else {
            return Err(RasterError::InvalidGrid("no bands".to_string()));
        };
        if let Some((name, band)) = bands.iter().find(|(_, band)| band.dim() != shape) {
            return Err(RasterError::InvalidGrid(format!(
                "band '{name}' is {:?} but the first band is {shape:?}",
                band.dim()
            )));
        }
        let (names, bands) = bands.into_iter().unzip();
        Ok(Self {
            origin,
            resolution,
            names,
            bands,
        })
    }
}

impl Grid for RasterGrid {
    fn shape(&self) -> (usize, usize) {
        self.bands[0].dim()
    }

    fn band_names(&self) -> &[String] {
        &self.names
    }

    fn band(&self, idx: usize) -> ArrayView2<'_, f64> {
        self.bands[idx].view()
    }

    fn cell_centre(&self, row: usize, col: usize) -> [f64; 2] {
        [
            self.origin[0] + (col as f64 + 0.5) * self.resolution[0],
            self.origin[1] - (row as f64 + 0.5) * self.resolution[1],
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstantValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

/// A covariate with one value shared by every cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantCovariate {
    pub name: String,
    pub value: ConstantValue,
}

impl ConstantCovariate {
    pub fn scalar(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value: ConstantValue::Scalar(value),
        }
    }

    fn as_scalar(&self) -> Result<f64, RasterError> {
        match &self.value {
            ConstantValue::Scalar(value) => Ok(*value),
            ConstantValue::Vector(values) if values.len() == 1 => Ok(values[0]),
            ConstantValue::Vector(values) => Err(RasterError::InvalidConstantShape {
                name: self.name.clone(),
                len: values.len(),
            }),
        }
    }
}

/// One output layer per draw, each the shape of the input grid.
#[derive(Debug, Clone)]
pub struct RasterPrediction {
    pub layers: Vec<Array2<f64>>,
    pub valid_cells: usize,
    pub link: LinkFunction,
    pub prediction_type: PredictionType,
    pub warnings: Vec<PredictionWarning>,
}

/// Predicts `model` over every cell of `grid`.
///
/// Constants, covariate names and fixed-effect sources are checked before any
/// prediction work starts.
pub fn predict_raster_inla(
    model: &dyn FittedModel,
    grid: &dyn Grid,
    mesh: &dyn Mesh,
    constants: &[ConstantCovariate],
    request: &PredictionRequest,
) -> Result<RasterPrediction, RasterError> {
    let scalars = constants
        .iter()
        .map(ConstantCovariate::as_scalar)
        .collect::<Result<Vec<f64>, _>>()?;

    if let Some(name) = grid
        .band_names()
        .iter()
        .chain(constants.iter().map(|constant| &constant.name))
        .chain(&request.coordinate_columns)
        .duplicates()
        .next()
    {
        return Err(RasterError::DuplicateCovariateName(name.clone()));
    }

    let is_supplied = |term: &str| {
        grid.band_names().iter().any(|band| band == term)
            || constants.iter().any(|constant| constant.name == term)
    };
    if let Some(row) = model.fixed_summary().iter().find(|row| !is_supplied(row.name.as_str())) {
        return Err(RasterError::MissingFixedEffectSource(row.name.clone()));
    }

    let (n_rows, n_cols) = grid.shape();
    let n_bands = grid.band_names().len();
    let valid: Vec<(usize, usize)> = (0..n_rows)
        .cartesian_product(0..n_cols)
        .filter(|&(r, c)| (0..n_bands).all(|b| grid.band(b)[[r, c]].is_finite()))
        .collect();
    log::info!(
        "Predicting {} of {} raster cells ({} skipped for missing covariates)",
        valid.len(),
        n_rows * n_cols,
        n_rows * n_cols - valid.len()
    );

    let table = internal::cell_table(grid, &valid, constants, &scalars, request)?;
    let result = predict_inla(model, &table, mesh, request)?;

    let layers = result
        .values
        .columns()
        .into_iter()
        .map(|draw| {
            let mut layer = Array2::from_elem((n_rows, n_cols), f64::NAN);
            for (&(r, c), &value) in valid.iter().zip(draw.iter()) {
                layer[[r, c]] = value;
            }
            layer
        })
        .collect();

    Ok(RasterPrediction {
        layers,
        valid_cells: valid.len(),
        link: result.link,
        prediction_type: result.prediction_type,
        warnings: result.warnings,
    })
}

mod internal {
    use super::*;

    /// Covariate table over the valid cells: bands, then coordinates, then constants.
    pub(super) fn cell_table(
        grid: &dyn Grid,
        cells: &[(usize, usize)],
        constants: &[ConstantCovariate],
        scalars: &[f64],
        request: &PredictionRequest,
    ) -> Result<CovariateTable, RasterError> {
        let mut table = CovariateTable::default();
        for (idx, name) in grid.band_names().iter().enumerate() {
            let band = grid.band(idx);
            let values: Array1<f64> = cells.iter().map(|&(r, c)| band[[r, c]]).collect();
            table.push_column(name.clone(), ColumnData::Numeric(values))?;
        }

        let centres: Vec<[f64; 2]> = cells
            .iter()
            .map(|&(r, c)| grid.cell_centre(r, c))
            .collect();
        for (axis, name) in request.coordinate_columns.iter().enumerate().take(2) {
            let values: Array1<f64> = centres.iter().map(|centre| centre[axis]).collect();
            table.push_column(name.clone(), ColumnData::Numeric(values))?;
        }

        for (constant, &value) in constants.iter().zip(scalars) {
            table.push_column(
                constant.name.clone(),
                ColumnData::Numeric(Array1::from_elem(cells.len(), value)),
            )?;
        }
        Ok(table)
    }
}
