//! Iterative Z-score / IQR outlier trimming for one throughput group.
//!
//! Each round first applies a symmetric z-score cut to the current subset. When that alone
//! leaves no Tukey outliers the round converges on the z-filtered rows; otherwise the Tukey
//! fences are applied to the z-filtered rows and, if that converges, those are returned.
//! Only the IQR-filtered subset is carried into the next round. The ordering matters: it is
//! what the historical reports were produced with.

use std::fmt;

use crate::config::OutlierConfig;
use crate::stats;

/// How the surviving rows of a group were admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutlierMethod {
    /// Group below the minimum size; returned untouched.
    InsufficientData,
    /// Converged right after the z-score step of the given (1-based) round.
    ZScore { iteration: usize },
    /// Converged after the IQR step of the given round.
    Iqr { iteration: usize },
    /// Still had outliers after the last allowed round.
    LoopLimit { iterations: usize },
}

impl fmt::Display for OutlierMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutlierMethod::InsufficientData => write!(f, "insufficient data"),
            OutlierMethod::ZScore { iteration } => write!(f, "Z-Score Loop ×{iteration}"),
            OutlierMethod::Iqr { iteration } => write!(f, "IQR Loop ×{iteration}"),
            OutlierMethod::LoopLimit { iterations } => {
                write!(f, "loop limit reached (×{iterations})")
            }
        }
    }
}

/// Output of [`trim`].
#[derive(Clone, Debug)]
pub struct Trimmed<T> {
    pub rows: Vec<T>,
    pub method: OutlierMethod,
    pub before: usize,
    pub after: usize,
}

impl<T> Trimmed<T> {
    pub fn removed(&self) -> usize {
        self.before - self.after
    }
}

/// Trim outliers from one group of rows.
///
/// `value` extracts the measured quantity; it must be finite for every row.
pub fn trim<T, F>(rows: Vec<T>, value: F, config: &OutlierConfig) -> Trimmed<T>
where
    F: Fn(&T) -> f64,
{
    let before = rows.len();
    let finish = |rows: Vec<T>, method| {
        let after = rows.len();
        Trimmed {
            rows,
            method,
            before,
            after,
        }
    };

    if before < config.min_group_size {
        return finish(rows, OutlierMethod::InsufficientData);
    }

    let mut current = rows;
    for iteration in 1..=config.max_iterations {
        let z_filtered = zscore_filter(current, &value, config.z_threshold);
        if !has_iqr_outliers(&z_filtered, &value, config.iqr_factor) {
            return finish(z_filtered, OutlierMethod::ZScore { iteration });
        }

        let iqr_filtered = iqr_filter(z_filtered, &value, config.iqr_factor);
        if !has_iqr_outliers(&iqr_filtered, &value, config.iqr_factor) {
            return finish(iqr_filtered, OutlierMethod::Iqr { iteration });
        }
        current = iqr_filtered;
    }

    finish(
        current,
        OutlierMethod::LoopLimit {
            iterations: config.max_iterations,
        },
    )
}

fn values_of<T, F: Fn(&T) -> f64>(rows: &[T], value: &F) -> Vec<f64> {
    rows.iter().map(value).collect()
}

/// Keep rows within `±threshold` population standard deviations. A zero spread removes
/// nothing.
pub fn zscore_filter<T, F: Fn(&T) -> f64>(rows: Vec<T>, value: &F, threshold: f64) -> Vec<T> {
    let values = values_of(&rows, value);
    let (Some(mean), Some(std)) = (stats::mean(&values), stats::std_population(&values)) else {
        return rows;
    };
    if std == 0.0 {
        return rows;
    }
    rows.into_iter()
        .filter(|row| ((value(row) - mean) / std).abs() <= threshold)
        .collect()
}

/// Keep rows inside the Tukey fences.
pub fn iqr_filter<T, F: Fn(&T) -> f64>(rows: Vec<T>, value: &F, factor: f64) -> Vec<T> {
    let values = values_of(&rows, value);
    let Some((lower, upper)) = stats::iqr_bounds(&values, factor) else {
        return rows;
    };
    rows.into_iter()
        .filter(|row| {
            let v = value(row);
            v >= lower && v <= upper
        })
        .collect()
}

pub fn has_iqr_outliers<T, F: Fn(&T) -> f64>(rows: &[T], value: &F, factor: f64) -> bool {
    let values = values_of(rows, value);
    match stats::iqr_bounds(&values, factor) {
        Some((lower, upper)) => values.iter().any(|v| *v < lower || *v > upper),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> OutlierConfig {
        OutlierConfig::default()
    }

    #[test]
    fn test_small_group_is_identity() {
        let rows = vec![1.0, 2.0, 1000.0];
        let out = trim(rows.clone(), |v| *v, &config());
        assert_eq!(out.rows, rows);
        assert_eq!(out.method, OutlierMethod::InsufficientData);
        assert_eq!(out.method.to_string(), "insufficient data");
        assert_eq!(out.removed(), 0);
    }

    #[test]
    fn test_single_spike_removed_by_zscore() {
        let mut rows = vec![100.0; 19];
        rows.push(10_000.0);
        let out = trim(rows, |v| *v, &config());
        assert_eq!(out.rows, vec![100.0; 19]);
        assert_eq!(out.method, OutlierMethod::ZScore { iteration: 1 });
        assert_eq!(out.before, 20);
        assert_eq!(out.after, 19);
    }

    #[test]
    fn test_iqr_step_runs_when_zscore_is_not_enough() {
        // The z cut only drops 135; the Tukey fence then drops 130.
        let mut rows: Vec<f64> = (0..18).map(|i| 100.0 + (i % 3) as f64).collect();
        rows.push(130.0);
        rows.push(135.0);
        let out = trim(rows, |v| *v, &config());
        assert_eq!(out.method, OutlierMethod::Iqr { iteration: 1 });
        assert!(out.rows.iter().all(|v| *v < 130.0));
        assert_eq!(out.after, 18);
    }

    #[test]
    fn test_zero_spread_group_converges_immediately() {
        let out = trim(vec![5.0; 15], |v| *v, &config());
        assert_eq!(out.method, OutlierMethod::ZScore { iteration: 1 });
        assert_eq!(out.after, 15);
    }

    #[test]
    fn test_loop_limit_tag() {
        let cfg = OutlierConfig {
            max_iterations: 1,
            ..OutlierConfig::default()
        };
        // A geometric tail keeps producing new Tukey outliers after each cut.
        let rows: Vec<f64> = (0..30).map(|i| 1.5f64.powi(i)).collect();
        let out = trim(rows, |v| *v, &cfg);
        assert_eq!(out.method, OutlierMethod::LoopLimit { iterations: 1 });
        assert_eq!(out.method.to_string(), "loop limit reached (×1)");
    }

    #[test]
    fn test_method_labels() {
        assert_eq!(OutlierMethod::ZScore { iteration: 2 }.to_string(), "Z-Score Loop ×2");
        assert_eq!(OutlierMethod::Iqr { iteration: 3 }.to_string(), "IQR Loop ×3");
    }

    proptest! {
        #[test]
        fn prop_trim_output_is_subset(values in prop::collection::vec(0.0f64..10_000.0, 15..60)) {
            let out = trim(values.clone(), |v| *v, &config());
            prop_assert!(out.rows.len() <= values.len());
            let mut remaining = values.clone();
            for v in &out.rows {
                let pos = remaining.iter().position(|x| x == v);
                prop_assert!(pos.is_some());
                remaining.swap_remove(pos.unwrap());
            }
        }

        #[test]
        fn prop_small_groups_untouched(values in prop::collection::vec(0.0f64..10_000.0, 0..15)) {
            let out = trim(values.clone(), |v| *v, &config());
            prop_assert_eq!(out.rows, values);
            prop_assert_eq!(out.method, OutlierMethod::InsufficientData);
        }
    }
}
