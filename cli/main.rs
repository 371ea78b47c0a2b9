#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::process;

use mbgpredict::{
    DrawSummary, InlaFit, Method, PredictionConfig, PredictionResult, PredictionType,
    TriangleMesh, load_covariate_table, predict_inla, summarise_draws,
};

#[derive(Clone, Copy, ValueEnum)]
pub enum MethodCli {
    Map,
    Sample,
}

impl From<MethodCli> for Method {
    fn from(method: MethodCli) -> Self {
        match method {
            MethodCli::Map => Method::Map,
            MethodCli::Sample => Method::Sample,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ScaleCli {
    Link,
    Response,
}

impl From<ScaleCli> for PredictionType {
    fn from(scale: ScaleCli) -> Self {
        match scale {
            ScaleCli::Link => PredictionType::Link,
            ScaleCli::Response => PredictionType::Response,
        }
    }
}

#[derive(Args)]
pub struct PredictArgs {
    /// Path to the fitted model (TOML)
    #[arg(long)]
    pub model: String,

    /// Path to the triangulated mesh the spatial field was fitted on (TOML)
    #[arg(long)]
    pub mesh: String,

    /// Path to a TSV of prediction locations with coordinate and covariate columns
    #[arg(long)]
    pub data: String,

    /// Optional TOML file with prediction options; flags below override it
    #[arg(long)]
    pub config: Option<String>,

    #[arg(long, value_enum)]
    pub method: Option<MethodCli>,

    /// Number of posterior draws (sample method only)
    #[arg(long, value_name = "N")]
    pub draws: Option<usize>,

    /// Report the linear predictor or the response scale
    #[arg(long = "type", value_enum)]
    pub prediction_type: Option<ScaleCli>,

    /// Number of worker threads for draw evaluation
    #[arg(long)]
    pub ncpu: Option<usize>,

    /// Seed of the posterior sampler
    #[arg(long)]
    pub seed: Option<u64>,

    /// Drop the fixed-effect term from the linear predictor
    #[arg(long)]
    pub no_fixed: bool,

    /// Drop the spatial term from the linear predictor
    #[arg(long)]
    pub no_spatial: bool,

    #[arg(long, default_value = "predictions.tsv")]
    pub output: String,
}

#[derive(Parser)]
#[command(
    name = "mbgpredict",
    about = "Prediction from fitted model-based geostatistics models",
    long_about = "Predicts the linear predictor or response of a fitted spatial model \
                 (fixed effects plus an SPDE random field) at new locations, either at the \
                 posterior mode or across posterior draws."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Predict at new locations (outputs: predictions.tsv)")]
    Predict(PredictArgs),
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_version_info() {
    println!("mbgpredict {}", env!("CARGO_PKG_VERSION"));
    match option_env!("MBGPREDICT_RELEASE_TAG") {
        Some(tag) => println!("Release: {tag}"),
        None => println!("Release: development build"),
    }
}

/// Resolves the prediction options: config file first, then flag overrides.
fn resolve_config(args: &PredictArgs) -> Result<PredictionConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => PredictionConfig::load(path)?,
        None => PredictionConfig::default(),
    };
    if let Some(method) = args.method {
        config.method = method.into();
    }
    if let Some(draws) = args.draws {
        config.draws = draws;
    }
    if let Some(scale) = args.prediction_type {
        config.prediction_type = scale.into();
    }
    if let Some(ncpu) = args.ncpu {
        config.ncpu = ncpu;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.include_fixed &= !args.no_fixed;
    config.include_spatial &= !args.no_spatial;
    config.validate()?;
    Ok(config)
}

pub fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&args)?;

    println!("Loading model from: {}", args.model);
    let model = InlaFit::load(&args.model)?;
    println!("Loading mesh from: {}", args.mesh);
    let mesh = TriangleMesh::load(&args.mesh)?;
    let data = load_covariate_table(&args.data)?;
    println!("Loaded {} locations for prediction", data.n_rows());

    let result = predict_inla(&model, &data, &mesh, &config.to_request())?;
    for warning in &result.warnings {
        println!("Warning: {warning}");
    }
    let summary = summarise_draws(result.values.view(), config.interval)?;

    save_predictions(&result, &summary, &args.output)?;
    println!(
        "Predictions ({} draw(s), {} scale) saved to: {}",
        result.n_draws(),
        match result.prediction_type {
            PredictionType::Link => "link",
            PredictionType::Response => "response",
        },
        args.output
    );
    Ok(())
}

/// Writes one row per location: every draw, then the draw summary.
fn save_predictions(
    result: &PredictionResult,
    summary: &DrawSummary,
    output_path: &str,
) -> Result<(), csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(output_path)?;

    let mut header: Vec<String> = (1..=result.n_draws()).map(|d| format!("draw_{d}")).collect();
    header.extend(["mean", "sd", "lower", "upper"].map(String::from));
    writer.write_record(&header)?;

    for (i, draws) in result.values.rows().into_iter().enumerate() {
        let record: Vec<String> = draws
            .iter()
            .chain([
                &summary.mean[i],
                &summary.sd[i],
                &summary.lower[i],
                &summary.upper[i],
            ])
            .map(|&value| format_value(value))
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NA".to_string()
    } else {
        format!("{value}")
    }
}
