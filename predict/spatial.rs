//! # Spatial Random-Effect Projection
//!
//! The spatial field is estimated at the nodes of a triangulated mesh. Its
//! value at an arbitrary location is a linear combination of node values:
//! `A ξ`, where each row of the projection matrix `A` holds the barycentric
//! weights of the triangle containing the location.
//!
//! - `Mesh` is the projection primitive the predictors depend on.
//! - `TriangleMesh` implements it for a planar triangulation. Locations
//!   outside every triangle take the value of the nearest node.

use crate::params::{ParameterError, ParameterSet};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// Barycentric coordinates above `-INSIDE_TOLERANCE` count as inside a triangle.
const INSIDE_TOLERANCE: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Failed to read or write mesh file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML mesh file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize mesh to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid triangulation: {0}")]
    InvalidTriangulation(String),
    #[error("Coordinates must have exactly two columns (longitude, latitude); found {ncols}.")]
    InvalidCoordinates { ncols: usize },
    #[error("Projection expects a field of length {expected}, but got {found}.")]
    FieldLengthMismatch { expected: usize, found: usize },
}

#[derive(Error, Debug)]
pub enum SpatialError {
    #[error("A time slice was given without the number of time groups.")]
    MissingTemporalExtent,
    #[error("Time slice {time} is outside the {n_time} available time groups.")]
    TimeSliceOutOfRange { time: usize, n_time: usize },
    #[error("Coordinates must have exactly two columns (longitude, latitude); found {ncols}.")]
    InvalidCoordinates { ncols: usize },
    #[error(
        "Spatial field nodes must be numbered 1..n without gaps; position {position} holds node {found}."
    )]
    NonContiguousNodes { position: usize, found: usize },
    #[error("The spatial field has {found} values but the mesh requires {expected}.")]
    FieldSizeMismatch { expected: usize, found: usize },
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error(transparent)]
    Parameters(#[from] ParameterError),
}

/// One discrete time group among `n_groups`, for space-time basis matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalSlice {
    pub index: usize,
    pub n_groups: usize,
}

impl TemporalSlice {
    pub fn new(index: usize, n_groups: usize) -> Result<Self, SpatialError> {
        if index >= n_groups {
            return Err(SpatialError::TimeSliceOutOfRange {
                time: index,
                n_time: n_groups,
            });
        }
        Ok(Self { index, n_groups })
    }
}

/// A sparse matrix mapping field values at mesh nodes to locations.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionMatrix {
    n_cols: usize,
    /// Non-zero `(column, weight)` entries of each row.
    rows: Vec<Vec<(usize, f64)>>,
}

impl ProjectionMatrix {
    pub fn new(n_cols: usize, rows: Vec<Vec<(usize, f64)>>) -> Result<Self, MeshError> {
        if let Some(&(col, _)) = rows.iter().flatten().find(|(col, _)| *col >= n_cols) {
            return Err(MeshError::InvalidTriangulation(format!(
                "projection entry references column {col} of {n_cols}"
            )));
        }
        Ok(Self { n_cols, rows })
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn row(&self, idx: usize) -> &[(usize, f64)] {
        &self.rows[idx]
    }

    /// Sparse matrix-vector product `A ξ`.
    pub fn dot(&self, field: ArrayView1<f64>) -> Result<Array1<f64>, MeshError> {
        if field.len() != self.n_cols {
            return Err(MeshError::FieldLengthMismatch {
                expected: self.n_cols,
                found: field.len(),
            });
        }
        Ok(self
            .rows
            .iter()
            .map(|row| row.iter().map(|&(col, weight)| weight * field[col]).sum::<f64>())
            .collect())
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.rows.len(), self.n_cols));
        for (i, row) in self.rows.iter().enumerate() {
            for &(col, weight) in row {
                dense[[i, col]] += weight;
            }
        }
        dense
    }

    /// Moves every column into the block of one time group.
    fn into_time_group(self, slice: TemporalSlice) -> Self {
        let offset = slice.index * self.n_cols;
        let rows = self
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(|(col, w)| (col + offset, w)).collect())
            .collect();
        Self {
            n_cols: self.n_cols * slice.n_groups,
            rows,
        }
    }
}

/// The mesh-projection primitive used by spatial prediction.
pub trait Mesh: Sync {
    fn n_nodes(&self) -> usize;

    /// Projection matrix from mesh nodes to `coords` (N×2, longitude then latitude).
    fn projector(&self, coords: ArrayView2<f64>) -> Result<ProjectionMatrix, MeshError>;

    /// Interpolates per-node `field` values through `projector`.
    fn project(
        &self,
        projector: &ProjectionMatrix,
        field: ArrayView1<f64>,
    ) -> Result<Array1<f64>, MeshError> {
        projector.dot(field)
    }

    /// Basis matrix tying `coords` to mesh nodes, optionally within one time
    /// group of a space-time field laid out group by group.
    fn basis_matrix(
        &self,
        coords: ArrayView2<f64>,
        slice: Option<TemporalSlice>,
    ) -> Result<ProjectionMatrix, MeshError> {
        let spatial = self.projector(coords)?;
        Ok(match slice {
            Some(slice) => spatial.into_time_group(slice),
            None => spatial,
        })
    }
}

/// A planar triangulation with 0-based node indices.
#[derive(Debug, Clone, Serialize)]
pub struct TriangleMesh {
    nodes: Vec<[f64; 2]>,
    triangles: Vec<[usize; 3]>,
}

/// On-disk layout; validated into a `TriangleMesh` on load.
#[derive(Deserialize)]
struct MeshFile {
    nodes: Vec<[f64; 2]>,
    triangles: Vec<[usize; 3]>,
}

impl TriangleMesh {
    pub fn new(nodes: Vec<[f64; 2]>, triangles: Vec<[usize; 3]>) -> Result<Self, MeshError> {
        if nodes.is_empty() {
            return Err(MeshError::InvalidTriangulation(
                "mesh has no nodes".to_string(),
            ));
        }
        if let Some(node) = nodes.iter().position(|p| !p[0].is_finite() || !p[1].is_finite()) {
            return Err(MeshError::InvalidTriangulation(format!(
                "node {node} has non-finite coordinates"
            )));
        }
        for (t, triangle) in triangles.iter().enumerate() {
            if let Some(&vertex) = triangle.iter().find(|&&v| v >= nodes.len()) {
                return Err(MeshError::InvalidTriangulation(format!(
                    "triangle {t} references node {vertex} but the mesh has {} nodes",
                    nodes.len()
                )));
            }
            let [a, b, c] = triangle.map(|v| nodes[v]);
            if internal::signed_area(a, b, c).abs() <= f64::EPSILON {
                return Err(MeshError::InvalidTriangulation(format!(
                    "triangle {t} is degenerate"
                )));
            }
        }
        Ok(Self { nodes, triangles })
    }

    pub fn nodes(&self) -> &[[f64; 2]] {
        &self.nodes
    }

    pub fn triangles(&self) -> &[[usize; 3]] {
        &self.triangles
    }

    /// Saves the mesh to a file in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), MeshError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads and validates a mesh from a TOML file.
    pub fn load(path: &str) -> Result<Self, MeshError> {
        let toml_string = fs::read_to_string(path)?;
        let raw: MeshFile = toml::from_str(&toml_string)?;
        Self::new(raw.nodes, raw.triangles)
    }

    /// Non-zero projection weights of a single location. A location with a
    /// missing coordinate gets an empty row.
    fn locate(&self, point: [f64; 2]) -> Vec<(usize, f64)> {
        if !point.iter().all(|v| v.is_finite()) {
            return Vec::new();
        }
        for triangle in &self.triangles {
            let [a, b, c] = triangle.map(|v| self.nodes[v]);
            if let Some(weights) = internal::barycentric(point, a, b, c) {
                return triangle
                    .iter()
                    .zip(weights)
                    .filter(|(_, w)| *w != 0.0)
                    .map(|(&v, w)| (v, w))
                    .collect();
            }
        }
        vec![(self.nearest_node(point), 1.0)]
    }

    fn nearest_node(&self, point: [f64; 2]) -> usize {
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        for (idx, node) in self.nodes.iter().enumerate() {
            let dx = node[0] - point[0];
            let dy = node[1] - point[1];
            let dist = dx * dx + dy * dy;
            if dist < best_dist {
                best_dist = dist;
                best = idx;
            }
        }
        best
    }
}

impl Mesh for TriangleMesh {
    fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    fn projector(&self, coords: ArrayView2<f64>) -> Result<ProjectionMatrix, MeshError> {
        if coords.ncols() != 2 {
            return Err(MeshError::InvalidCoordinates {
                ncols: coords.ncols(),
            });
        }
        // Sequential: parallelism belongs to the caller's draw-level pool.
        let rows: Vec<Vec<(usize, f64)>> = coords
            .axis_iter(Axis(0))
            .map(|row| self.locate([row[0], row[1]]))
            .collect();
        ProjectionMatrix::new(self.nodes.len(), rows)
    }
}

/// Computes the spatial contribution `A ξ` of one draw at `coords`.
///
/// Without `time` the field is projected with `mesh.projector`. With `time`,
/// the field holds `n_time` stacked copies of the mesh and the basis matrix
/// of that slice is used; `n_time` is then required.
pub fn predict_spatial(
    params: &ParameterSet,
    coords: ArrayView2<f64>,
    mesh: &dyn Mesh,
    draw: usize,
    time: Option<usize>,
    n_time: Option<usize>,
) -> Result<Array1<f64>, SpatialError> {
    if coords.ncols() != 2 {
        return Err(SpatialError::InvalidCoordinates {
            ncols: coords.ncols(),
        });
    }
    let field = node_field(params, draw)?;

    match time {
        None => {
            let projector = mesh.projector(coords)?;
            project_field(field, &projector, mesh)
        }
        Some(time) => {
            let n_time = n_time.ok_or(SpatialError::MissingTemporalExtent)?;
            let slice = TemporalSlice::new(time, n_time)?;
            let expected = mesh.n_nodes() * n_time;
            if field.len() != expected {
                return Err(SpatialError::FieldSizeMismatch {
                    expected,
                    found: field.len(),
                });
            }
            let basis = mesh.basis_matrix(coords, Some(slice))?;
            Ok(basis.dot(field.view())?)
        }
    }
}

/// Computes `A ξ` of one draw through a projector built once for many draws.
pub fn predict_projected(
    params: &ParameterSet,
    projector: &ProjectionMatrix,
    mesh: &dyn Mesh,
    draw: usize,
) -> Result<Array1<f64>, SpatialError> {
    project_field(node_field(params, draw)?, projector, mesh)
}

/// Field values of one draw in node order; node ids must run `1..n`.
fn node_field(params: &ParameterSet, draw: usize) -> Result<Array1<f64>, SpatialError> {
    let values = params.draw(draw)?;
    for (position, node) in params.spatial_nodes().iter().enumerate() {
        if node.index() != position {
            return Err(SpatialError::NonContiguousNodes {
                position,
                found: node.get(),
            });
        }
    }
    Ok(params.spatial_index().iter().map(|&i| values[i]).collect())
}

fn project_field(
    field: Array1<f64>,
    projector: &ProjectionMatrix,
    mesh: &dyn Mesh,
) -> Result<Array1<f64>, SpatialError> {
    if field.len() != mesh.n_nodes() {
        return Err(SpatialError::FieldSizeMismatch {
            expected: mesh.n_nodes(),
            found: field.len(),
        });
    }
    Ok(mesh.project(projector, field.view())?)
}

mod internal {
    pub(super) fn signed_area(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
        0.5 * ((b[0] - a[0]) * (c[1] - a[1]) - (c[0] - a[0]) * (b[1] - a[1]))
    }

    /// Barycentric weights of `p` in triangle `abc`, or `None` when outside.
    pub(super) fn barycentric(
        p: [f64; 2],
        a: [f64; 2],
        b: [f64; 2],
        c: [f64; 2],
    ) -> Option<[f64; 3]> {
        let det = (b[1] - c[1]) * (a[0] - c[0]) + (c[0] - b[0]) * (a[1] - c[1]);
        let l1 = ((b[1] - c[1]) * (p[0] - c[0]) + (c[0] - b[0]) * (p[1] - c[1])) / det;
        let l2 = ((c[1] - a[1]) * (p[0] - c[0]) + (a[0] - c[0]) * (p[1] - c[1])) / det;
        let l3 = 1.0 - l1 - l2;
        let tol = -super::INSIDE_TOLERANCE;
        (l1 >= tol && l2 >= tol && l3 >= tol).then_some([l1, l2, l3])
    }
}
