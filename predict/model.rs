use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::f64::consts::SQRT_2;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::str::FromStr;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the public, human-readable format of a fitted model
// when serialized to a TOML file.

/// Defines the link function, connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkFunction {
    /// The identity link, for continuous outcomes (e.g., Gaussian regression).
    Identity,
    /// The logit link, for binary or proportional outcomes (e.g., binomial prevalence).
    /// Maps probabilities (0, 1) to the real line (-inf, +inf).
    Logit,
    /// The log link, for counts and rates (e.g., Poisson incidence).
    Log,
    /// The probit link, the inverse standard normal CDF.
    Probit,
    /// The complementary log-log link.
    Cloglog,
}

impl LinkFunction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Logit => "logit",
            Self::Log => "log",
            Self::Probit => "probit",
            Self::Cloglog => "cloglog",
        }
    }

    /// Maps a value on the linear-predictor scale to the response scale.
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            Self::Identity => eta,
            Self::Logit => {
                // Clamp eta to prevent numerical overflow in exp()
                let eta_clamped = eta.clamp(-700.0, 700.0);
                1.0 / (1.0 + f64::exp(-eta_clamped))
            }
            Self::Log => eta.exp(),
            Self::Probit => 0.5 * erfc(-eta / SQRT_2),
            Self::Cloglog => -f64::exp_m1(-eta.exp()),
        }
    }
}

impl fmt::Display for LinkFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LinkFunction {
    type Err = ModelError;

    /// Resolves an INLA link name. `default` depends on the likelihood family
    /// and is rejected; fits must name their link explicitly.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "identity" => Ok(Self::Identity),
            "logit" => Ok(Self::Logit),
            "log" => Ok(Self::Log),
            "probit" => Ok(Self::Probit),
            "cloglog" => Ok(Self::Cloglog),
            _ => Err(ModelError::UnknownLinkFunction(name.to_string())),
        }
    }
}

/// The declared model class of a random-effect block.
///
/// Stored as the INLA class string so that fits exported from R keep their
/// original labels (`"SPDE2 model"`, `"IID model"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RandomEffectKind {
    Spde2,
    Iid,
    Rw1,
    Rw2,
    Ar1,
    Besag,
    Other(String),
}

impl RandomEffectKind {
    pub fn is_spatial_spde(&self) -> bool {
        matches!(self, Self::Spde2)
    }
}

impl From<String> for RandomEffectKind {
    fn from(label: String) -> Self {
        let key = label
            .trim()
            .trim_end_matches(" model")
            .trim_end_matches(" Model")
            .to_ascii_lowercase();
        match key.as_str() {
            "spde2" => Self::Spde2,
            "iid" => Self::Iid,
            "rw1" => Self::Rw1,
            "rw2" => Self::Rw2,
            "ar1" => Self::Ar1,
            "besag" => Self::Besag,
            _ => Self::Other(label),
        }
    }
}

impl From<RandomEffectKind> for String {
    fn from(kind: RandomEffectKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for RandomEffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spde2 => f.write_str("SPDE2 model"),
            Self::Iid => f.write_str("IID model"),
            Self::Rw1 => f.write_str("RW1 model"),
            Self::Rw2 => f.write_str("RW2 model"),
            Self::Ar1 => f.write_str("AR1 model"),
            Self::Besag => f.write_str("Besag model"),
            Self::Other(label) => f.write_str(label),
        }
    }
}

/// Posterior marginal summary of one named scalar (a fixed effect or a hyperparameter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub name: String,
    pub mean: f64,
    #[serde(default)]
    pub sd: f64,
    /// Posterior mode, the MAP point estimate used for `Method::Map`.
    pub mode: f64,
}

/// Posterior summary of a random-effect block, one entry per mesh node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomEffectSummary {
    pub name: String,
    pub kind: RandomEffectKind,
    /// Node identifiers in the block's native order (1-based for SPDE fields).
    pub ids: Vec<usize>,
    pub mean: Vec<f64>,
    pub sd: Vec<f64>,
    pub mode: Vec<f64>,
}

impl RandomEffectSummary {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// One joint posterior draw, with INLA-style entry names.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorDraw {
    /// Every latent unknown, e.g. `Predictor:3`, `field:12`, `elevation:1`.
    pub latent: Vec<(String, f64)>,
    pub hyper: Vec<(String, f64)>,
}

/// Read-only view of a fitted hierarchical model.
pub trait FittedModel {
    fn fixed_summary(&self) -> &[SummaryRow];
    fn hyper_summary(&self) -> &[SummaryRow];
    fn random_effects(&self) -> &[RandomEffectSummary];
    /// Link function names declared on the fit, one per likelihood.
    fn link_names(&self) -> &[String];
    /// Draws `n` joint samples from the posterior. Identical seeds give identical draws.
    fn sample_posterior(&self, n: usize, seed: u64) -> Result<Vec<PosteriorDraw>, ModelError>;
}

/// Custom error type for model loading, saving, and posterior sampling.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Unknown link function '{0}'.")]
    UnknownLinkFunction(String),
    #[error(
        "Random effect '{name}' has {ids} node ids but {values} summary values; every node needs a mean, sd and mode."
    )]
    MismatchedBlockLengths {
        name: String,
        ids: usize,
        values: usize,
    },
    #[error("Posterior spread for '{0}' must be finite and non-negative.")]
    InvalidPosteriorSpread(String),
}

/// An INLA fit exported as plain posterior summaries.
///
/// Sampling uses independent Gaussian marginals built from each entry's mean
/// and sd, which reproduces the layout of `inla.posterior.sample` output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InlaFit {
    #[serde(default)]
    pub links: Vec<String>,
    /// Posterior means of the training-data linear predictor.
    #[serde(default)]
    pub predictor: Vec<f64>,
    #[serde(default)]
    pub fixed: Vec<SummaryRow>,
    #[serde(default)]
    pub hyperpar: Vec<SummaryRow>,
    #[serde(default)]
    pub random: Vec<RandomEffectSummary>,
}

impl InlaFit {
    /// Saves the fit to a file in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a fit from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let fit: Self = toml::from_str(&toml_string)?;
        fit.validate()?;
        Ok(fit)
    }

    fn validate(&self) -> Result<(), ModelError> {
        for block in &self.random {
            for values in [&block.mean, &block.sd, &block.mode] {
                if values.len() != block.ids.len() {
                    return Err(ModelError::MismatchedBlockLengths {
                        name: block.name.clone(),
                        ids: block.ids.len(),
                        values: values.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl FittedModel for InlaFit {
    fn fixed_summary(&self) -> &[SummaryRow] {
        &self.fixed
    }

    fn hyper_summary(&self) -> &[SummaryRow] {
        &self.hyperpar
    }

    fn random_effects(&self) -> &[RandomEffectSummary] {
        &self.random
    }

    fn link_names(&self) -> &[String] {
        &self.links
    }

    fn sample_posterior(&self, n: usize, seed: u64) -> Result<Vec<PosteriorDraw>, ModelError> {
        self.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut draws = Vec::with_capacity(n);

        for _ in 0..n {
            let mut latent = Vec::with_capacity(
                self.predictor.len()
                    + self.random.iter().map(RandomEffectSummary::len).sum::<usize>()
                    + self.fixed.len(),
            );

            // INLA order: linear predictor, random effects, fixed effects.
            for (i, &eta) in self.predictor.iter().enumerate() {
                latent.push((format!("Predictor:{}", i + 1), eta));
            }
            for block in &self.random {
                for ((&id, &mean), &sd) in block.ids.iter().zip(&block.mean).zip(&block.sd) {
                    let label = format!("{}:{id}", block.name);
                    let value = internal::draw_marginal(&mut rng, &label, mean, sd)?;
                    latent.push((label, value));
                }
            }
            for row in &self.fixed {
                let value = internal::draw_marginal(&mut rng, &row.name, row.mean, row.sd)?;
                latent.push((format!("{}:1", row.name), value));
            }

            let mut hyper = Vec::with_capacity(self.hyperpar.len());
            for row in &self.hyperpar {
                let value = internal::draw_marginal(&mut rng, &row.name, row.mean, row.sd)?;
                hyper.push((row.name.clone(), value));
            }

            draws.push(PosteriorDraw { latent, hyper });
        }

        log::debug!("Sampled {n} posterior draws with seed {seed}");
        Ok(draws)
    }
}

mod internal {
    use super::*;

    pub(super) fn draw_marginal(
        rng: &mut StdRng,
        name: &str,
        mean: f64,
        sd: f64,
    ) -> Result<f64, ModelError> {
        if !sd.is_finite() || sd < 0.0 {
            return Err(ModelError::InvalidPosteriorSpread(name.to_string()));
        }
        let normal = Normal::new(mean, sd)
            .map_err(|_| ModelError::InvalidPosteriorSpread(name.to_string()))?;
        Ok(normal.sample(rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tempfile::NamedTempFile;

    fn toy_fit() -> InlaFit {
        InlaFit {
            links: vec!["logit".to_string()],
            predictor: vec![0.1, -0.2, 0.3],
            fixed: vec![
                SummaryRow {
                    name: "elevation".to_string(),
                    mean: 0.5,
                    sd: 0.1,
                    mode: 0.48,
                },
                SummaryRow {
                    name: "rainfall".to_string(),
                    mean: -1.0,
                    sd: 0.2,
                    mode: -1.1,
                },
            ],
            hyperpar: vec![SummaryRow {
                name: "Range for field".to_string(),
                mean: 2.0,
                sd: 0.3,
                mode: 1.8,
            }],
            random: vec![RandomEffectSummary {
                name: "field".to_string(),
                kind: RandomEffectKind::Spde2,
                ids: vec![1, 2, 3, 4],
                mean: vec![0.0, 0.1, 0.2, 0.3],
                sd: vec![0.5, 0.5, 0.5, 0.5],
                mode: vec![0.0, 0.1, 0.2, 0.3],
            }],
        }
    }

    #[test]
    fn test_inverse_links() {
        assert_abs_diff_eq!(LinkFunction::Identity.inverse(1.3), 1.3);
        assert_abs_diff_eq!(LinkFunction::Logit.inverse(0.0), 0.5);
        assert_abs_diff_eq!(LinkFunction::Log.inverse(0.0), 1.0);
        assert_abs_diff_eq!(LinkFunction::Probit.inverse(0.0), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(LinkFunction::Probit.inverse(1.96), 0.9750021, epsilon = 1e-6);
        assert_abs_diff_eq!(
            LinkFunction::Cloglog.inverse(0.0),
            1.0 - (-1.0f64).exp(),
            epsilon = 1e-12
        );
        // Extreme logits stay finite
        assert!(LinkFunction::Logit.inverse(-1e6).is_finite());
    }

    #[test]
    fn test_link_names_resolve() {
        assert_eq!(" identity ".parse::<LinkFunction>().unwrap(), LinkFunction::Identity);
        assert!(matches!(
            "default".parse::<LinkFunction>(),
            Err(ModelError::UnknownLinkFunction(name)) if name == "default"
        ));
        assert_eq!("Logit".parse::<LinkFunction>().unwrap(), LinkFunction::Logit);
        match "tan".parse::<LinkFunction>() {
            Err(ModelError::UnknownLinkFunction(name)) => assert_eq!(name, "tan"),
            other => panic!("Expected UnknownLinkFunction, got {other:?}"),
        }
    }

    #[test]
    fn test_random_effect_kind_labels() {
        assert_eq!(
            RandomEffectKind::from("SPDE2 model".to_string()),
            RandomEffectKind::Spde2
        );
        assert_eq!(RandomEffectKind::from("iid".to_string()), RandomEffectKind::Iid);
        let other = RandomEffectKind::from("generic0".to_string());
        assert_eq!(other, RandomEffectKind::Other("generic0".to_string()));
        assert!(!other.is_spatial_spde());
        assert_eq!(String::from(RandomEffectKind::Spde2), "SPDE2 model");
    }

    #[test]
    fn test_sampler_layout_and_reproducibility() {
        let fit = toy_fit();
        let first = fit.sample_posterior(3, 42).unwrap();
        let second = fit.sample_posterior(3, 42).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);

        let names: Vec<&str> = first[0].latent.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Predictor:1",
                "Predictor:2",
                "Predictor:3",
                "field:1",
                "field:2",
                "field:3",
                "field:4",
                "elevation:1",
                "rainfall:1",
            ]
        );
        assert_eq!(first[0].hyper[0].0, "Range for field");

        let different = fit.sample_posterior(3, 7).unwrap();
        assert_ne!(first, different);
    }

    #[test]
    fn test_sampler_rejects_negative_sd() {
        let mut fit = toy_fit();
        fit.fixed[0].sd = -1.0;
        match fit.sample_posterior(1, 0) {
            Err(ModelError::InvalidPosteriorSpread(name)) => assert_eq!(name, "elevation"),
            other => panic!("Expected InvalidPosteriorSpread, got {other:?}"),
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let fit = toy_fit();
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        fit.save(path).unwrap();

        let loaded = InlaFit::load(path).unwrap();
        assert_eq!(loaded.links, fit.links);
        assert_eq!(loaded.fixed, fit.fixed);
        assert_eq!(loaded.random, fit.random);
        assert_eq!(loaded.random[0].kind, RandomEffectKind::Spde2);
    }

    #[test]
    fn test_load_rejects_ragged_block() {
        let mut fit = toy_fit();
        fit.random[0].mode.pop();
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        fit.save(path).unwrap();

        match InlaFit::load(path) {
            Err(ModelError::MismatchedBlockLengths { ids, values, .. }) => {
                assert_eq!(ids, 4);
                assert_eq!(values, 3);
            }
            other => panic!("Expected MismatchedBlockLengths, got {other:?}"),
        }
    }
}
