use crate::data::{ColumnData, CovariateTable};
use crate::params::{ParameterError, ParameterRole, ParameterSet};
use ndarray::{Array1, Array2};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FixedEffectError {
    #[error("Covariate '{0}' was requested but is not a fixed effect of the model.")]
    UnknownCovariate(String),
    #[error("Fixed effect '{0}' has no matching column in the prediction data.")]
    MissingColumn(String),
    #[error("Fixed effect '{0}' refers to a categorical column; only numeric covariates are supported.")]
    CategoricalColumn(String),
    #[error(transparent)]
    Parameters(#[from] ParameterError),
}

/// Replaces missing (`NaN`) covariate values with zero.
///
/// This is the modelling convention, not an error path: INLA treats an
/// unobserved fixed-effect covariate as contributing nothing to the linear
/// predictor, and prediction must agree with the fit.
pub fn zero_fill_missing(mut covariates: Array2<f64>) -> Array2<f64> {
    covariates.mapv_inplace(|value| if value.is_nan() { 0.0 } else { value });
    covariates
}

/// Computes the fixed-effect contribution `X β` of one draw.
///
/// When `subset` is given only those covariates contribute; every name in it
/// must be a fixed effect of the model.
pub fn predict_fixed(
    params: &ParameterSet,
    data: &CovariateTable,
    draw: usize,
    subset: Option<&[String]>,
) -> Result<Array1<f64>, FixedEffectError> {
    let values = params.draw(draw)?;

    let mut terms: Vec<(&str, usize)> = params
        .fixed_index()
        .iter()
        .filter_map(|&position| match &params.roles()[position] {
            ParameterRole::Fixed(name) => Some((name.as_str(), position)),
            _ => None,
        })
        .collect();

    if let Some(subset) = subset {
        if let Some(unknown) = subset
            .iter()
            .find(|name| !terms.iter().any(|&(term, _)| term == name.as_str()))
        {
            return Err(FixedEffectError::UnknownCovariate(unknown.clone()));
        }
        terms.retain(|&(term, _)| subset.iter().any(|name| name.as_str() == term));
    }

    let mut covariates = Array2::<f64>::zeros((data.n_rows(), terms.len()));
    let mut beta = Array1::<f64>::zeros(terms.len());
    for (col_idx, &(term, position)) in terms.iter().enumerate() {
        let column = match data.column(term) {
            Some(ColumnData::Numeric(column)) => column,
            Some(ColumnData::Categorical(_)) => {
                return Err(FixedEffectError::CategoricalColumn(term.to_string()));
            }
            None => return Err(FixedEffectError::MissingColumn(term.to_string())),
        };
        covariates.column_mut(col_idx).assign(column);
        beta[col_idx] = values[position];
    }

    Ok(zero_fill_missing(covariates).dot(&beta))
}
