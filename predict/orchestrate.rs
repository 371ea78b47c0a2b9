//! # Prediction Orchestration
//!
//! Drives a full prediction request:
//! 1. Validates the fit and the inputs once, into a `ModelDescriptor`.
//! 2. Extracts the parameter set (MAP point estimate or posterior samples).
//! 3. Evaluates every draw independently, sequentially or on a thread pool
//!    that lives only for the duration of the call.
//! 4. Stacks the draws as columns, in draw order, and optionally maps them to
//!    the response scale.

use crate::combine::{CombineError, DrawInputs, predict_all};
use crate::data::{ColumnData, CovariateTable};
use crate::model::{FittedModel, LinkFunction, ModelError, RandomEffectKind};
use crate::params::{Method, ParameterError, extract};
use crate::spatial::{Mesh, MeshError};
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The scale predictions are reported on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionType {
    /// The linear predictor `η`.
    Link,
    /// The inverse link applied to `η`.
    Response,
}

impl FromStr for PredictionType {
    type Err = PredictionError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim().to_ascii_lowercase().as_str() {
            "link" => Ok(Self::Link),
            "response" => Ok(Self::Response),
            _ => Err(PredictionError::InvalidPredictionType(text.to_string())),
        }
    }
}

/// The structural precondition a model or its inputs failed.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeViolation {
    RandomEffectCount(usize),
    UnsupportedRandomEffect(RandomEffectKind),
    CategoricalCovariate(String),
    EmptyMesh,
    CoordinateColumnCount(usize),
    MissingCoordinateColumn(String),
    MissingFixedEffect(String),
}

impl fmt::Display for ShapeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RandomEffectCount(found) => write!(
                f,
                "expected exactly one spatial random effect, found {found}"
            ),
            Self::UnsupportedRandomEffect(kind) => write!(
                f,
                "random effect of class '{kind}' is not supported; only SPDE2 fields can be projected"
            ),
            Self::CategoricalCovariate(name) => {
                write!(f, "column '{name}' is categorical; factor covariates are not supported")
            }
            Self::EmptyMesh => f.write_str("the mesh has no nodes"),
            Self::CoordinateColumnCount(found) => {
                write!(f, "expected two coordinate column names, got {found}")
            }
            Self::MissingCoordinateColumn(name) => {
                write!(f, "coordinate column '{name}' is not in the data")
            }
            Self::MissingFixedEffect(name) => {
                write!(f, "fixed effect '{name}' has no column in the data")
            }
        }
    }
}

/// A condition that was handled without failing the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredictionWarning {
    /// MAP prediction is a single draw, so it runs on one worker.
    ParallelMapDowngraded { requested: usize },
}

impl fmt::Display for PredictionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParallelMapDowngraded { requested } => write!(
                f,
                "MAP prediction uses a single draw; running on 1 worker instead of {requested}"
            ),
        }
    }
}

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Unsupported model shape: {0}")]
    UnsupportedModelShape(ShapeViolation),
    #[error("The model has an intercept term '{0}'; fit the intercept as a covariate column instead.")]
    InterceptNotSupported(String),
    #[error("The model declares {} link functions ({}); only single-likelihood models are supported.", .0.len(), .0.join(", "))]
    MultipleLinkFunctionsUnsupported(Vec<String>),
    #[error("Unknown prediction type '{0}'. Expected 'link' or 'response'.")]
    InvalidPredictionType(String),
    #[error("The fixed-effect subset is empty.")]
    EmptyFixedSubset,
    #[error("Covariate '{0}' was requested but is not a fixed effect of the model.")]
    UnknownFixedEffect(String),
    #[error("At least one worker is required.")]
    InvalidWorkerCount,
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error(transparent)]
    Link(#[from] ModelError),
    #[error(transparent)]
    Parameters(#[from] ParameterError),
    #[error("Failed to create worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Prediction of draw {draw} failed: {source}")]
    Draw {
        draw: usize,
        #[source]
        source: CombineError,
    },
}

/// Caller options for one prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRequest {
    /// Names of the longitude and latitude columns of the data.
    pub coordinate_columns: Vec<String>,
    pub method: Method,
    /// Number of posterior draws; ignored for `Method::Map`.
    pub n_draws: usize,
    pub prediction_type: PredictionType,
    pub include_fixed: bool,
    pub include_spatial: bool,
    pub fixed_subset: Option<Vec<String>>,
    pub ncpu: usize,
    pub seed: u64,
}

impl Default for PredictionRequest {
    fn default() -> Self {
        Self {
            coordinate_columns: vec!["x".to_string(), "y".to_string()],
            method: Method::Map,
            n_draws: 1,
            prediction_type: PredictionType::Link,
            include_fixed: true,
            include_spatial: true,
            fixed_subset: None,
            ncpu: 1,
            seed: 0,
        }
    }
}

/// Draw-wise predictions, one row per location and one column per draw.
#[derive(Debug, Clone)]
pub struct PredictionResult {
    pub values: Array2<f64>,
    pub link: LinkFunction,
    pub prediction_type: PredictionType,
    pub warnings: Vec<PredictionWarning>,
}

impl PredictionResult {
    pub fn n_draws(&self) -> usize {
        self.values.ncols()
    }

    pub fn draw(&self, draw: usize) -> ArrayView1<'_, f64> {
        self.values.column(draw)
    }
}

/// The validated capabilities of a fit: what the prediction pipeline relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub link: LinkFunction,
    pub spatial_block: String,
    pub fixed_terms: Vec<String>,
}

impl ModelDescriptor {
    /// Checks that a fit has the shape `η = Xβ + Aξ`: one SPDE field, no
    /// intercept, and a single link function.
    pub fn inspect(model: &dyn FittedModel) -> Result<Self, PredictionError> {
        let block = match model.random_effects() {
            [block] => block,
            blocks => {
                return Err(PredictionError::UnsupportedModelShape(
                    ShapeViolation::RandomEffectCount(blocks.len()),
                ));
            }
        };
        if !block.kind.is_spatial_spde() {
            return Err(PredictionError::UnsupportedModelShape(
                ShapeViolation::UnsupportedRandomEffect(block.kind.clone()),
            ));
        }

        let fixed_terms: Vec<String> = model
            .fixed_summary()
            .iter()
            .map(|row| row.name.clone())
            .collect();
        if let Some(intercept) = fixed_terms.iter().find(|name| internal::is_intercept(name)) {
            return Err(PredictionError::InterceptNotSupported(intercept.clone()));
        }

        let link = match model.link_names() {
            [] => LinkFunction::Identity,
            [name] => name.parse()?,
            names => return Err(PredictionError::MultipleLinkFunctionsUnsupported(names.to_vec())),
        };

        Ok(Self {
            link,
            spatial_block: block.name.clone(),
            fixed_terms,
        })
    }

    /// Checks the prediction inputs and the covariate subset against this model.
    pub fn validate_inputs(
        &self,
        data: &CovariateTable,
        mesh: &dyn Mesh,
        request: &PredictionRequest,
    ) -> Result<(), PredictionError> {
        let coordinate_columns = request.coordinate_columns.as_slice();
        let shape = |violation| Err(PredictionError::UnsupportedModelShape(violation));

        if let Some(name) = data.categorical_columns().first() {
            return shape(ShapeViolation::CategoricalCovariate(name.to_string()));
        }
        if mesh.n_nodes() == 0 {
            return shape(ShapeViolation::EmptyMesh);
        }
        if coordinate_columns.len() != 2 {
            return shape(ShapeViolation::CoordinateColumnCount(coordinate_columns.len()));
        }
        if let Some(name) = coordinate_columns.iter().find(|name| !data.contains(name)) {
            return shape(ShapeViolation::MissingCoordinateColumn(name.clone()));
        }
        if let Some(name) = self.fixed_terms.iter().find(|name| !data.contains(name)) {
            return shape(ShapeViolation::MissingFixedEffect(name.clone()));
        }
        if let (true, Some(subset)) = (request.include_fixed, &request.fixed_subset) {
            if subset.is_empty() {
                return Err(PredictionError::EmptyFixedSubset);
            }
            if let Some(name) = subset.iter().find(|name| !self.fixed_terms.contains(*name)) {
                return Err(PredictionError::UnknownFixedEffect(name.clone()));
            }
        }
        Ok(())
    }
}

/// Predicts the linear predictor (or response) of `model` at every row of `data`.
///
/// Returns an `nrow(data) × n` matrix for `Method::Sample` and an
/// `nrow(data) × 1` matrix for `Method::Map`. Columns are in draw order
/// regardless of `ncpu`.
pub fn predict_inla(
    model: &dyn FittedModel,
    data: &CovariateTable,
    mesh: &dyn Mesh,
    request: &PredictionRequest,
) -> Result<PredictionResult, PredictionError> {
    let descriptor = ModelDescriptor::inspect(model)?;
    descriptor.validate_inputs(data, mesh, request)?;

    if request.ncpu == 0 {
        return Err(PredictionError::InvalidWorkerCount);
    }
    let mut warnings = Vec::new();
    let mut workers = request.ncpu;
    if request.method == Method::Map && workers > 1 {
        let warning = PredictionWarning::ParallelMapDowngraded { requested: workers };
        log::warn!("{warning}");
        warnings.push(warning);
        workers = 1;
    }

    let coords = internal::coordinate_matrix(data, &request.coordinate_columns)?;
    let params = extract(model, request.method, request.n_draws, request.seed)?;
    let n_draws = params.n_draws();
    let projector = if request.include_spatial {
        Some(mesh.projector(coords.view())?)
    } else {
        None
    };

    let inputs = DrawInputs {
        mesh: Some(mesh),
        coords: Some(coords.view()),
        projector: projector.as_ref(),
        data: Some(data),
        fixed_subset: request.fixed_subset.as_deref(),
        include_fixed: request.include_fixed,
        include_spatial: request.include_spatial,
    };
    let run_draw = |draw: usize| -> Result<Array1<f64>, PredictionError> {
        predict_all(draw, &params, &inputs).map_err(|source| PredictionError::Draw { draw, source })
    };

    let columns: Vec<Array1<f64>> = if workers == 1 {
        log::debug!("Predicting {n_draws} draw(s) on the calling thread");
        (0..n_draws).map(run_draw).collect::<Result<_, _>>()?
    } else {
        let threads = workers.min(n_draws);
        if workers > num_cpus::get() {
            log::debug!(
                "Requested {workers} workers but only {} CPUs are available",
                num_cpus::get()
            );
        }
        log::debug!("Predicting {n_draws} draws on a pool of {threads} workers");
        // The pool is dropped with this frame, on success and on error.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?;
        pool.install(|| {
            (0..n_draws)
                .into_par_iter()
                .map(run_draw)
                .collect::<Result<_, _>>()
        })?
    };

    let mut values = Array2::zeros((data.n_rows(), n_draws));
    for (draw, column) in columns.iter().enumerate() {
        values.column_mut(draw).assign(column);
    }
    if request.prediction_type == PredictionType::Response {
        let link = descriptor.link;
        values.mapv_inplace(|eta| link.inverse(eta));
    }

    log::info!(
        "Predicted {} locations × {} draws on the {} scale",
        values.nrows(),
        values.ncols(),
        match request.prediction_type {
            PredictionType::Link => "link",
            PredictionType::Response => descriptor.link.name(),
        }
    );

    Ok(PredictionResult {
        values,
        link: descriptor.link,
        prediction_type: request.prediction_type,
        warnings,
    })
}

mod internal {
    use super::*;

    pub(super) fn is_intercept(name: &str) -> bool {
        name == "(Intercept)" || name.eq_ignore_ascii_case("intercept")
    }

    /// Stacks the two coordinate columns into an N×2 matrix.
    pub(super) fn coordinate_matrix(
        data: &CovariateTable,
        columns: &[String],
    ) -> Result<Array2<f64>, PredictionError> {
        let mut coords = Array2::zeros((data.n_rows(), columns.len()));
        for (idx, name) in columns.iter().enumerate() {
            match data.column(name) {
                Some(ColumnData::Numeric(values)) => coords.column_mut(idx).assign(values),
                Some(ColumnData::Categorical(_)) => {
                    return Err(PredictionError::UnsupportedModelShape(
                        ShapeViolation::CategoricalCovariate(name.clone()),
                    ));
                }
                None => {
                    return Err(PredictionError::UnsupportedModelShape(
                        ShapeViolation::MissingCoordinateColumn(name.clone()),
                    ));
                }
            }
        }
        Ok(coords)
    }
}
