use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SummaryError {
    #[error("Credible interval mass must lie strictly between 0 and 1, got {0}.")]
    InvalidInterval(f64),
    #[error("Cannot summarise a prediction with no draws.")]
    NoDraws,
}

/// Per-location summary of a draw matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawSummary {
    pub mean: Array1<f64>,
    /// Sample standard deviation; `NaN` with fewer than two draws.
    pub sd: Array1<f64>,
    pub lower: Array1<f64>,
    pub upper: Array1<f64>,
    pub interval: f64,
}

/// Summarises each row of an `N × n_draws` matrix: mean, standard deviation
/// and the equal-tailed credible interval holding `interval` of the mass.
///
/// Rows containing a `NaN` summarise to `NaN`.
pub fn summarise_draws(
    values: ArrayView2<f64>,
    interval: f64,
) -> Result<DrawSummary, SummaryError> {
    if !(interval > 0.0 && interval < 1.0) {
        return Err(SummaryError::InvalidInterval(interval));
    }
    if values.ncols() == 0 {
        return Err(SummaryError::NoDraws);
    }
    let tail = (1.0 - interval) / 2.0;

    let rows: Vec<[f64; 4]> = values
        .axis_iter(Axis(0))
        .map(|row| summarise_row(row, tail))
        .collect();

    let column = |k: usize| rows.iter().map(|stats| stats[k]).collect::<Array1<f64>>();
    Ok(DrawSummary {
        mean: column(0),
        sd: column(1),
        lower: column(2),
        upper: column(3),
        interval,
    })
}

fn summarise_row(row: ArrayView1<f64>, tail: f64) -> [f64; 4] {
    if row.iter().any(|value| value.is_nan()) {
        return [f64::NAN; 4];
    }
    let n = row.len() as f64;
    let mean = row.sum() / n;
    let sd = if row.len() < 2 {
        f64::NAN
    } else {
        (row.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    };

    let mut sorted = row.to_vec();
    sorted.sort_by(f64::total_cmp);
    [mean, sd, quantile(&sorted, tail), quantile(&sorted, 1.0 - tail)]
}

/// Linearly interpolated quantile of sorted values.
fn quantile(sorted: &[f64], p: f64) -> f64 {
    let h = (sorted.len() - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_row_statistics() {
        let values = array![[1.0, 2.0, 3.0, 4.0, 5.0], [0.0, 0.0, 0.0, 0.0, 0.0]];
        let summary = summarise_draws(values.view(), 0.5).unwrap();

        assert_abs_diff_eq!(summary.mean[0], 3.0);
        assert_abs_diff_eq!(summary.sd[0], 2.5f64.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(summary.lower[0], 2.0);
        assert_abs_diff_eq!(summary.upper[0], 4.0);
        assert_abs_diff_eq!(summary.sd[1], 0.0);
    }

    #[test]
    fn test_draw_order_does_not_matter() {
        let a = summarise_draws(array![[3.0, 1.0, 2.0]].view(), 0.9).unwrap();
        let b = summarise_draws(array![[1.0, 2.0, 3.0]].view(), 0.9).unwrap();
        assert_eq!(a, b);
        assert_abs_diff_eq!(a.lower[0], 1.1, epsilon = 1e-12);
        assert_abs_diff_eq!(a.upper[0], 2.9, epsilon = 1e-12);
    }

    #[test]
    fn test_single_draw_and_missing_rows() {
        let summary = summarise_draws(array![[2.5], [f64::NAN]].view(), 0.95).unwrap();
        assert_eq!(summary.mean[0], 2.5);
        assert!(summary.sd[0].is_nan());
        assert_eq!(summary.lower[0], 2.5);
        assert_eq!(summary.upper[0], 2.5);
        assert!(summary.mean[1].is_nan());
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(matches!(
            summarise_draws(array![[1.0]].view(), 1.0),
            Err(SummaryError::InvalidInterval(_))
        ));
        let empty = ndarray::Array2::<f64>::zeros((3, 0));
        assert!(matches!(summarise_draws(empty.view(), 0.95), Err(SummaryError::NoDraws)));
    }
}
