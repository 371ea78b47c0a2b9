//! # Parameter Extraction
//!
//! Decomposes a fitted model's posterior into one draw-indexed parameter
//! matrix whose columns carry a typed role: a fixed-effect covariate, a
//! spatial field value at a mesh node, or a hyperparameter. Roles are decided
//! once here, so downstream predictors never inspect parameter names.
//!
//! Two sources are supported:
//! - `Method::Map`: posterior modes from the model's summary tables (one draw).
//! - `Method::Sample`: joint posterior samples, whose INLA latent names
//!   (`Predictor:3`, `field:012`, `elevation:1`) are parsed into roles.

use crate::model::{FittedModel, ModelError, PosteriorDraw};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Latent-name prefixes of the training-data linear predictor.
const PREDICTOR_PREFIXES: [&str; 2] = ["APredictor:", "Predictor:"];

/// How model parameters are summarised for prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Posterior mode point estimate; always a single draw.
    #[serde(alias = "MAP")]
    Map,
    /// Joint samples from the posterior.
    Sample,
}

impl FromStr for Method {
    type Err = ParameterError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim().to_ascii_lowercase().as_str() {
            "map" => Ok(Self::Map),
            "sample" => Ok(Self::Sample),
            _ => Err(ParameterError::InvalidMethod(text.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map => f.write_str("MAP"),
            Self::Sample => f.write_str("sample"),
        }
    }
}

/// A 1-based mesh node identifier, as INLA numbers SPDE field entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn new(id: usize) -> Option<Self> {
        (id >= 1).then_some(Self(id))
    }

    /// Parses a numeric node label, ignoring leading zeros (`"007"` is node 7).
    pub fn parse(label: &str) -> Result<Self, ParameterError> {
        let digits = label.trim();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParameterError::InvalidNodeId(label.to_string()));
        }
        digits
            .parse::<usize>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| ParameterError::InvalidNodeId(label.to_string()))
    }

    pub fn get(self) -> usize {
        self.0
    }

    /// Zero-based position of this node in a field vector.
    pub fn index(self) -> usize {
        self.0 - 1
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a parameter position means to the linear predictor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterRole {
    /// Coefficient of the covariate column with this name.
    Fixed(String),
    /// Spatial field value at a mesh node.
    Spatial(NodeId),
    Hyper(String),
}

/// Errors raised while extracting parameters from a fitted model.
#[derive(Error, Debug)]
pub enum ParameterError {
    #[error("Unknown prediction method '{0}'. Expected 'MAP' or 'sample'.")]
    InvalidMethod(String),
    #[error(
        "The model has {found} random-effect blocks; only models with a single spatial random effect are supported."
    )]
    InconsistentRandomEffect { found: usize },
    #[error("The model has no random-effect block to take the spatial field from.")]
    MissingRandomEffect,
    #[error("At least one posterior draw must be requested.")]
    InvalidDrawCount,
    #[error("Posterior draw {draw} does not share the parameter layout of the first draw.")]
    InconsistentDrawLayout { draw: usize },
    #[error("'{0}' is not a valid mesh node identifier.")]
    InvalidNodeId(String),
    #[error("Mesh node {0} appears more than once in the spatial field.")]
    DuplicateNode(NodeId),
    #[error("Draw {draw} was requested but only {n_draws} draws were extracted.")]
    DrawOutOfRange { draw: usize, n_draws: usize },
    #[error("Posterior sampling failed: {0}")]
    Sampling(#[from] ModelError),
    #[error("Parameter matrix has the wrong shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Draw-indexed parameters with a fixed/spatial/hyper partition of positions.
#[derive(Debug, Clone)]
pub struct ParameterSet {
    method: Method,
    names: Vec<String>,
    roles: Vec<ParameterRole>,
    /// Shape: [n_draws, n_parameters].
    values: Array2<f64>,
    fixed_index: Vec<usize>,
    /// Ordered by ascending node id.
    spatial_index: Vec<usize>,
    hyper_index: Vec<usize>,
}

impl ParameterSet {
    pub fn method(&self) -> Method {
        self.method
    }

    pub fn n_draws(&self) -> usize {
        self.values.nrows()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn roles(&self) -> &[ParameterRole] {
        &self.roles
    }

    pub fn fixed_index(&self) -> &[usize] {
        &self.fixed_index
    }

    pub fn spatial_index(&self) -> &[usize] {
        &self.spatial_index
    }

    pub fn hyper_index(&self) -> &[usize] {
        &self.hyper_index
    }

    /// Full parameter vector of one draw (0-based).
    pub fn draw(&self, draw: usize) -> Result<ArrayView1<'_, f64>, ParameterError> {
        if draw >= self.n_draws() {
            return Err(ParameterError::DrawOutOfRange {
                draw,
                n_draws: self.n_draws(),
            });
        }
        Ok(self.values.row(draw))
    }

    /// Covariate names of the fixed effects, in position order.
    pub fn fixed_names(&self) -> Vec<&str> {
        self.fixed_index
            .iter()
            .filter_map(|&i| match &self.roles[i] {
                ParameterRole::Fixed(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Node ids of the spatial field, ascending.
    pub fn spatial_nodes(&self) -> Vec<NodeId> {
        self.spatial_index
            .iter()
            .filter_map(|&i| match self.roles[i] {
                ParameterRole::Spatial(node) => Some(node),
                _ => None,
            })
            .collect()
    }

    fn from_roles(
        method: Method,
        roles: Vec<ParameterRole>,
        values: Array2<f64>,
    ) -> Result<Self, ParameterError> {
        debug_assert_eq!(roles.len(), values.ncols());

        let mut fixed_index = Vec::new();
        let mut spatial: Vec<(NodeId, usize)> = Vec::new();
        let mut hyper_index = Vec::new();
        for (position, role) in roles.iter().enumerate() {
            match role {
                ParameterRole::Fixed(_) => fixed_index.push(position),
                ParameterRole::Spatial(node) => spatial.push((*node, position)),
                ParameterRole::Hyper(_) => hyper_index.push(position),
            }
        }

        spatial.sort_unstable();
        if let Some(pair) = spatial.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(ParameterError::DuplicateNode(pair[0].0));
        }
        let spatial_index = spatial.into_iter().map(|(_, position)| position).collect();

        let names = roles
            .iter()
            .map(|role| match role {
                ParameterRole::Fixed(name) | ParameterRole::Hyper(name) => name.clone(),
                ParameterRole::Spatial(node) => node.to_string(),
            })
            .collect();

        Ok(Self {
            method,
            names,
            roles,
            values,
            fixed_index,
            spatial_index,
            hyper_index,
        })
    }
}

/// Builds the parameter set for one prediction request.
///
/// `n` and `seed` only matter for `Method::Sample`; MAP extraction always
/// yields exactly one draw.
pub fn extract(
    model: &dyn FittedModel,
    method: Method,
    n: usize,
    seed: u64,
) -> Result<ParameterSet, ParameterError> {
    let block_name = internal::single_block_name(model)?;

    let set = match method {
        Method::Map => internal::extract_map(model)?,
        Method::Sample => {
            if n == 0 {
                return Err(ParameterError::InvalidDrawCount);
            }
            let draws = model.sample_posterior(n, seed)?;
            internal::extract_samples(&draws, block_name)?
        }
    };

    log::info!(
        "Extracted {} parameters ({} fixed, {} spatial, {} hyper) across {} {} draw(s)",
        set.names.len(),
        set.fixed_index.len(),
        set.spatial_index.len(),
        set.hyper_index.len(),
        set.n_draws(),
        method
    );
    Ok(set)
}

/// Internal module for name parsing and matrix assembly.
mod internal {
    use super::*;

    pub(super) fn single_block_name(model: &dyn FittedModel) -> Result<&str, ParameterError> {
        match model.random_effects() {
            [] => Err(ParameterError::MissingRandomEffect),
            [block] => Ok(block.name.as_str()),
            blocks => Err(ParameterError::InconsistentRandomEffect {
                found: blocks.len(),
            }),
        }
    }

    pub(super) fn extract_map(model: &dyn FittedModel) -> Result<ParameterSet, ParameterError> {
        let fixed = model.fixed_summary();
        let hyper = model.hyper_summary();
        // single_block_name has already checked there is exactly one block.
        let block = &model.random_effects()[0];

        let n_params = fixed.len() + block.len() + hyper.len();
        let mut roles = Vec::with_capacity(n_params);
        let mut values = Vec::with_capacity(n_params);

        for row in fixed {
            roles.push(ParameterRole::Fixed(row.name.clone()));
            values.push(row.mode);
        }
        for (&id, &mode) in block.ids.iter().zip(&block.mode) {
            let node = NodeId::new(id).ok_or_else(|| ParameterError::InvalidNodeId(id.to_string()))?;
            roles.push(ParameterRole::Spatial(node));
            values.push(mode);
        }
        for row in hyper {
            roles.push(ParameterRole::Hyper(row.name.clone()));
            values.push(row.mode);
        }

        let values = Array2::from_shape_vec((1, roles.len()), values)?;
        ParameterSet::from_roles(Method::Map, roles, values)
    }

    pub(super) fn extract_samples(
        draws: &[PosteriorDraw],
        block_name: &str,
    ) -> Result<ParameterSet, ParameterError> {
        let Some(first) = draws.first() else {
            return Err(ParameterError::InvalidDrawCount);
        };
        let spatial_prefix = format!("{block_name}:");

        // Decide the role of every latent entry once, from the first draw.
        let mut kept_latent = Vec::with_capacity(first.latent.len());
        let mut latent_roles = Vec::with_capacity(first.latent.len());
        let mut spatial_roles = Vec::new();
        for (position, (name, _)) in first.latent.iter().enumerate() {
            if is_predictor(name) {
                continue;
            }
            if let Some(label) = name.strip_prefix(&spatial_prefix) {
                spatial_roles.push((position, ParameterRole::Spatial(NodeId::parse(label)?)));
            } else {
                kept_latent.push(position);
                latent_roles.push(ParameterRole::Fixed(strip_draw_suffix(name).to_string()));
            }
        }
        // Fixed entries first, then the spatial field, then hyperparameters.
        for (position, role) in spatial_roles {
            kept_latent.push(position);
            latent_roles.push(role);
        }
        let mut roles = latent_roles;
        roles.extend(
            first
                .hyper
                .iter()
                .map(|(name, _)| ParameterRole::Hyper(name.clone())),
        );

        let n_params = roles.len();
        let mut values = Vec::with_capacity(draws.len() * n_params);
        for (draw_idx, draw) in draws.iter().enumerate() {
            if !same_layout(first, draw) {
                return Err(ParameterError::InconsistentDrawLayout { draw: draw_idx });
            }
            values.extend(kept_latent.iter().map(|&position| draw.latent[position].1));
            values.extend(draw.hyper.iter().map(|(_, value)| *value));
        }

        let values = Array2::from_shape_vec((draws.len(), n_params), values)?;

        log::debug!(
            "Sampled latent layout keeps {n_params} of {} entries per draw",
            first.latent.len() + first.hyper.len()
        );

        ParameterSet::from_roles(Method::Sample, roles, values)
    }

    fn is_predictor(name: &str) -> bool {
        PREDICTOR_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
    }

    /// Strips INLA's `:<digits>` suffix from a sampled fixed-effect name.
    pub(super) fn strip_draw_suffix(name: &str) -> &str {
        match name.rsplit_once(':') {
            Some((stem, suffix)) if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) => {
                stem
            }
            _ => name,
        }
    }

    fn same_layout(reference: &PosteriorDraw, draw: &PosteriorDraw) -> bool {
        reference.latent.len() == draw.latent.len()
            && reference.hyper.len() == draw.hyper.len()
            && reference
                .latent
                .iter()
                .zip(&draw.latent)
                .all(|((a, _), (b, _))| a == b)
            && reference
                .hyper
                .iter()
                .zip(&draw.hyper)
                .all(|((a, _), (b, _))| a == b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RandomEffectKind, RandomEffectSummary, SummaryRow};
    use approx::assert_abs_diff_eq;

    /// A model whose posterior draws are fixed up front.
    struct StubModel {
        fixed: Vec<SummaryRow>,
        hyper: Vec<SummaryRow>,
        random: Vec<RandomEffectSummary>,
        links: Vec<String>,
        draws: Vec<PosteriorDraw>,
    }

    impl FittedModel for StubModel {
        fn fixed_summary(&self) -> &[SummaryRow] {
            &self.fixed
        }
        fn hyper_summary(&self) -> &[SummaryRow] {
            &self.hyper
        }
        fn random_effects(&self) -> &[RandomEffectSummary] {
            &self.random
        }
        fn link_names(&self) -> &[String] {
            &self.links
        }
        fn sample_posterior(&self, n: usize, seed: u64) -> Result<Vec<PosteriorDraw>, ModelError> {
            let _ = seed;
            Ok(self.draws.iter().take(n).cloned().collect())
        }
    }

    fn row(name: &str, mode: f64) -> SummaryRow {
        SummaryRow {
            name: name.to_string(),
            mean: mode,
            sd: 0.0,
            mode,
        }
    }

    fn named(entries: &[(&str, f64)]) -> Vec<(String, f64)> {
        entries.iter().map(|(n, v)| (n.to_string(), *v)).collect()
    }

    fn stub() -> StubModel {
        let draw = |shift: f64| PosteriorDraw {
            latent: named(&[
                ("APredictor:1", 9.0),
                ("Predictor:1", 9.0),
                ("Predictor:2", 9.0),
                ("field:003", 0.3 + shift),
                ("field:1", 0.1 + shift),
                ("field:2", 0.2 + shift),
                ("elevation:1", 0.5 + shift),
                ("rainfall:1", -1.0 + shift),
            ]),
            hyper: named(&[("Range for field", 2.0 + shift), ("Stdev for field", 1.0)]),
        };
        StubModel {
            fixed: vec![row("elevation", 0.5), row("rainfall", -1.0)],
            hyper: vec![row("Range for field", 2.0)],
            random: vec![RandomEffectSummary {
                name: "field".to_string(),
                kind: RandomEffectKind::Spde2,
                ids: vec![1, 2, 3],
                mean: vec![0.1, 0.2, 0.3],
                sd: vec![0.0; 3],
                mode: vec![0.1, 0.2, 0.3],
            }],
            links: vec!["identity".to_string()],
            draws: vec![draw(0.0), draw(1.0), draw(2.0)],
        }
    }

    fn assert_partition(set: &ParameterSet) {
        let mut all: Vec<usize> = set
            .fixed_index()
            .iter()
            .chain(set.spatial_index())
            .chain(set.hyper_index())
            .copied()
            .collect();
        all.sort_unstable();
        let expected: Vec<usize> = (0..set.names().len()).collect();
        assert_eq!(all, expected, "indices must partition every position exactly once");
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("MAP".parse::<Method>().unwrap(), Method::Map);
        assert_eq!("sample".parse::<Method>().unwrap(), Method::Sample);
        match "mean".parse::<Method>() {
            Err(ParameterError::InvalidMethod(text)) => assert_eq!(text, "mean"),
            other => panic!("Expected InvalidMethod, got {other:?}"),
        }
    }

    #[test]
    fn test_node_id_canonical_form() {
        assert_eq!(NodeId::parse("007").unwrap().get(), 7);
        assert_eq!(NodeId::parse("12").unwrap().index(), 11);
        assert!(NodeId::parse("0").is_err());
        assert!(NodeId::parse("1a").is_err());
        assert!(NodeId::parse("").is_err());
    }

    #[test]
    fn test_map_extraction_is_contiguous_and_single_draw() {
        let model = stub();
        let set = extract(&model, Method::Map, 50, 0).unwrap();
        assert_eq!(set.n_draws(), 1);
        assert_eq!(set.fixed_index(), &[0, 1]);
        assert_eq!(set.spatial_index(), &[2, 3, 4]);
        assert_eq!(set.hyper_index(), &[5]);
        assert_eq!(set.names(), &["elevation", "rainfall", "1", "2", "3", "Range for field"]);
        assert_partition(&set);

        let values = set.draw(0).unwrap();
        assert_abs_diff_eq!(values[0], 0.5);
        assert_abs_diff_eq!(values[4], 0.3);
    }

    #[test]
    fn test_sample_extraction_discards_predictor_and_canonicalises_names() {
        let model = stub();
        let set = extract(&model, Method::Sample, 3, 0).unwrap();
        assert_eq!(set.n_draws(), 3);
        assert_partition(&set);

        assert_eq!(set.fixed_names(), vec!["elevation", "rainfall"]);
        let nodes: Vec<usize> = set.spatial_nodes().iter().map(|n| n.get()).collect();
        assert_eq!(nodes, vec![1, 2, 3]);
        assert!(set.names().iter().all(|name| !name.contains("Predictor")));
        assert!(set.names().contains(&"3".to_string()));

        // Spatial values come back ordered by node id in every draw.
        let second = set.draw(1).unwrap();
        let field: Vec<f64> = set.spatial_index().iter().map(|&i| second[i]).collect();
        assert_abs_diff_eq!(field[0], 1.1);
        assert_abs_diff_eq!(field[1], 1.2);
        assert_abs_diff_eq!(field[2], 1.3);

        let hyper: Vec<&str> = set
            .hyper_index()
            .iter()
            .map(|&i| set.names()[i].as_str())
            .collect();
        assert_eq!(hyper, vec!["Range for field", "Stdev for field"]);
    }

    #[test]
    fn test_multiple_random_effects_rejected() {
        let mut model = stub();
        let mut second = model.random[0].clone();
        second.name = "district".to_string();
        second.kind = RandomEffectKind::Iid;
        model.random.push(second);

        for method in [Method::Map, Method::Sample] {
            match extract(&model, method, 2, 0) {
                Err(ParameterError::InconsistentRandomEffect { found }) => assert_eq!(found, 2),
                other => panic!("Expected InconsistentRandomEffect, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_zero_draws_rejected_for_sampling() {
        let model = stub();
        assert!(matches!(
            extract(&model, Method::Sample, 0, 0),
            Err(ParameterError::InvalidDrawCount)
        ));
    }

    #[test]
    fn test_inconsistent_draw_layout_rejected() {
        let mut model = stub();
        model.draws[2].latent[6].0 = "slope:1".to_string();
        match extract(&model, Method::Sample, 3, 0) {
            Err(ParameterError::InconsistentDrawLayout { draw }) => assert_eq!(draw, 2),
            other => panic!("Expected InconsistentDrawLayout, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_spatial_node_rejected() {
        let mut model = stub();
        model.random[0].ids = vec![1, 2, 2];
        assert!(matches!(
            extract(&model, Method::Map, 1, 0),
            Err(ParameterError::DuplicateNode(node)) if node.get() == 2
        ));
    }

    #[test]
    fn test_draw_out_of_range() {
        let set = extract(&stub(), Method::Map, 1, 0).unwrap();
        assert!(matches!(
            set.draw(1),
            Err(ParameterError::DrawOutOfRange { draw: 1, n_draws: 1 })
        ));
    }

    #[test]
    fn test_strip_draw_suffix() {
        assert_eq!(internal::strip_draw_suffix("elevation:1"), "elevation");
        assert_eq!(internal::strip_draw_suffix("elevation"), "elevation");
        assert_eq!(internal::strip_draw_suffix("ratio:a"), "ratio:a");
    }
}
