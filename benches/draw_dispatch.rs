use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use mbgpredict::{
    CovariateTable, InlaFit, Method, PredictionRequest, RandomEffectKind, RandomEffectSummary,
    SummaryRow, TriangleMesh, predict_inla,
};
use ndarray::Array1;
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A regular `k × k` grid of unit squares, each split into two triangles.
fn grid_mesh(k: usize) -> TriangleMesh {
    let side = k + 1;
    let nodes = (0..side * side)
        .map(|i| [(i % side) as f64, (i / side) as f64])
        .collect();
    let mut triangles = Vec::with_capacity(2 * k * k);
    for row in 0..k {
        for col in 0..k {
            let v = row * side + col;
            triangles.push([v, v + 1, v + side + 1]);
            triangles.push([v, v + side + 1, v + side]);
        }
    }
    TriangleMesh::new(nodes, triangles).expect("grid mesh")
}

fn fit_for(mesh_nodes: usize, n_covariates: usize) -> InlaFit {
    InlaFit {
        links: vec!["logit".to_string()],
        fixed: (0..n_covariates)
            .map(|j| SummaryRow {
                name: format!("cov{j}"),
                mean: 0.1 * j as f64,
                sd: 0.05,
                mode: 0.1 * j as f64,
            })
            .collect(),
        random: vec![RandomEffectSummary {
            name: "field".to_string(),
            kind: RandomEffectKind::Spde2,
            ids: (1..=mesh_nodes).collect(),
            mean: vec![0.0; mesh_nodes],
            sd: vec![0.5; mesh_nodes],
            mode: vec![0.0; mesh_nodes],
        }],
        ..InlaFit::default()
    }
}

fn random_locations(n: usize, extent: f64, n_covariates: usize) -> CovariateTable {
    let mut rng = StdRng::seed_from_u64(0x5EED_0B6 + n as u64);
    let mut column = |scale: f64| -> Array1<f64> {
        (0..n).map(|_| scale * rng.sample::<f64, _>(Standard)).collect()
    };
    let mut columns = vec![("x".to_string(), column(extent)), ("y".to_string(), column(extent))];
    for j in 0..n_covariates {
        columns.push((format!("cov{j}"), column(1.0)));
    }
    CovariateTable::from_numeric(columns).expect("benchmark table")
}

fn benchmark_draw_dispatch(c: &mut Criterion) {
    let k = 30;
    let mesh = grid_mesh(k);
    let fit = fit_for((k + 1) * (k + 1), 5);
    let data = random_locations(2_000, k as f64, 5);
    let n_draws = 64;

    let mut group = c.benchmark_group("draw_dispatch");
    group.throughput(Throughput::Elements((n_draws * data.n_rows()) as u64));
    for ncpu in [1_usize, 2, 4] {
        let request = PredictionRequest {
            method: Method::Sample,
            n_draws,
            ncpu,
            seed: 1,
            ..PredictionRequest::default()
        };
        group.bench_with_input(BenchmarkId::new("sample", ncpu), &request, |b, request| {
            b.iter(|| {
                let result = predict_inla(&fit, black_box(&data), &mesh, request).expect("predict");
                black_box(result);
            });
        });
    }
    group.finish();
}

criterion_group!(draw_dispatch, benchmark_draw_dispatch);
criterion_main!(draw_dispatch);
