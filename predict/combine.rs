use crate::data::CovariateTable;
use crate::fixed::{FixedEffectError, predict_fixed};
use crate::params::ParameterSet;
use crate::spatial::{Mesh, ProjectionMatrix, SpatialError, predict_projected, predict_spatial};
use ndarray::{Array1, ArrayView2};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CombineError {
    #[error("Spatial prediction needs a mesh and an N×2 coordinate table: {0}")]
    InvalidMeshOrCoords(String),
    #[error("Fixed-effect prediction needs a covariate table and an optional list of covariates: {0}")]
    InvalidFixedInputs(String),
    #[error("Coordinates have {coords} rows but the covariate table has {data}.")]
    RowCountMismatch { coords: usize, data: usize },
    #[error(transparent)]
    Fixed(#[from] FixedEffectError),
    #[error(transparent)]
    Spatial(#[from] SpatialError),
}

/// Shared read-only inputs of every draw.
#[derive(Clone, Copy)]
pub struct DrawInputs<'a> {
    pub mesh: Option<&'a dyn Mesh>,
    /// Longitude/latitude of each location.
    pub coords: Option<ArrayView2<'a, f64>>,
    /// Projection of `coords` built once and shared by every draw.
    pub projector: Option<&'a ProjectionMatrix>,
    pub data: Option<&'a CovariateTable>,
    pub fixed_subset: Option<&'a [String]>,
    pub include_fixed: bool,
    pub include_spatial: bool,
}

impl DrawInputs<'_> {
    /// Checks the preconditions of the requested terms.
    fn validate(&self) -> Result<(), CombineError> {
        if self.include_spatial {
            if self.mesh.is_none() {
                return Err(CombineError::InvalidMeshOrCoords("no mesh supplied".to_string()));
            }
            match self.coords {
                None => {
                    return Err(CombineError::InvalidMeshOrCoords(
                        "no coordinates supplied".to_string(),
                    ));
                }
                Some(coords) if coords.ncols() != 2 => {
                    return Err(CombineError::InvalidMeshOrCoords(format!(
                        "coordinates have {} columns",
                        coords.ncols()
                    )));
                }
                Some(coords) => {
                    if let Some(projector) = self.projector {
                        if projector.n_rows() != coords.nrows() {
                            return Err(CombineError::InvalidMeshOrCoords(format!(
                                "projector has {} rows for {} coordinates",
                                projector.n_rows(),
                                coords.nrows()
                            )));
                        }
                    }
                }
            }
        }

        if self.include_fixed {
            if self.data.is_none() {
                return Err(CombineError::InvalidFixedInputs(
                    "no covariate table supplied".to_string(),
                ));
            }
            if self.fixed_subset.is_some_and(|subset| subset.is_empty()) {
                return Err(CombineError::InvalidFixedInputs(
                    "the covariate subset is empty".to_string(),
                ));
            }
        }

        if self.include_fixed && self.include_spatial {
            if let (Some(coords), Some(data)) = (self.coords, self.data) {
                if coords.nrows() != data.n_rows() {
                    return Err(CombineError::RowCountMismatch {
                        coords: coords.nrows(),
                        data: data.n_rows(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of locations when no term is computed.
    fn n_locations(&self) -> usize {
        self.data
            .map(CovariateTable::n_rows)
            .or_else(|| self.coords.map(|coords| coords.nrows()))
            .unwrap_or(0)
    }
}

/// Linear predictor `η = Xβ + Aξ` of one draw.
///
/// A term that is switched off contributes zero. With both terms off the
/// result is a zero vector with one entry per row of `data` (or of `coords`
/// when no table is given).
pub fn predict_all(
    draw: usize,
    params: &ParameterSet,
    inputs: &DrawInputs<'_>,
) -> Result<Array1<f64>, CombineError> {
    inputs.validate()?;

    let fixed = match (inputs.include_fixed, inputs.data) {
        (true, Some(data)) => Some(predict_fixed(params, data, draw, inputs.fixed_subset)?),
        _ => None,
    };
    let spatial = match (inputs.include_spatial, inputs.mesh, inputs.coords) {
        (true, Some(mesh), Some(coords)) => Some(match inputs.projector {
            Some(projector) => predict_projected(params, projector, mesh, draw)?,
            None => predict_spatial(params, coords, mesh, draw, None, None)?,
        }),
        _ => None,
    };

    Ok(match (fixed, spatial) {
        (Some(fixed), Some(spatial)) => fixed + spatial,
        (Some(term), None) | (None, Some(term)) => term,
        (None, None) => Array1::zeros(inputs.n_locations()),
    })
}
