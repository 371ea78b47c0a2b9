#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod combine;
pub mod config;
pub mod data;
pub mod fixed;
pub mod model;
pub mod orchestrate;
pub mod params;
pub mod raster;
pub mod spatial;
pub mod summary;

pub use combine::{CombineError, DrawInputs, predict_all};
pub use config::{ConfigError, PredictionConfig};
pub use data::{ColumnData, CovariateTable, DataError, load_covariate_table};
pub use fixed::{FixedEffectError, predict_fixed, zero_fill_missing};
pub use model::{
    FittedModel, InlaFit, LinkFunction, ModelError, PosteriorDraw, RandomEffectKind,
    RandomEffectSummary, SummaryRow,
};
pub use orchestrate::{
    ModelDescriptor, PredictionError, PredictionRequest, PredictionResult,
    PredictionType, PredictionWarning, ShapeViolation, predict_inla,
};
pub use params::{Method, NodeId, ParameterError, ParameterRole, ParameterSet, extract};
pub use raster::{
    ConstantCovariate, ConstantValue, Grid, RasterError, RasterGrid, RasterPrediction,
    predict_raster_inla,
};
pub use spatial::{
    Mesh, MeshError, ProjectionMatrix, SpatialError, TemporalSlice, TriangleMesh,
    predict_projected, predict_spatial,
};
pub use summary::{DrawSummary, SummaryError, summarise_draws};
