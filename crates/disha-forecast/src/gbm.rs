//! Gradient boosting with Huber loss.
//!
//! A stagewise additive model of shallow regression trees fitted to the
//! Huber pseudo-gradients of the residuals. The Huber delta is re-derived
//! each round as a high quantile of the absolute residuals, so the
//! handful of schools with genuinely wild growth cannot steer the fit the
//! way they would under squared error.
//!
//! Early stopping watches Huber loss on a held-out validation slice and
//! stops once `patience` rounds pass without a `tol` improvement, keeping
//! the effective model size matched to the signal actually present.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use disha_core::config::MlConfig;

use crate::tree::{RegressionTree, TreeParams};

/// A fitted gradient-boosted regressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedRegressor {
    /// Constant initial prediction (median of the training target).
    pub init: f64,
    /// Shrinkage applied to every tree's contribution.
    pub learning_rate: f64,
    /// The fitted trees, in boosting order.
    pub trees: Vec<RegressionTree>,
}

impl GradientBoostedRegressor {
    /// Fits the booster on row-major `features` (`n_cols` per row) and
    /// `targets`.
    ///
    /// Subsampling and the validation split are driven by the seeded RNG
    /// in `config`, so identical inputs always produce an identical
    /// model.
    ///
    /// # Panics
    ///
    /// Panics if `targets` is empty; callers gate on a non-empty
    /// training split.
    #[must_use]
    pub fn fit(features: &[f64], n_cols: usize, targets: &[f64], config: &MlConfig) -> Self {
        assert!(!targets.is_empty(), "training split must be non-empty");
        let n = targets.len();
        let mut rng = StdRng::seed_from_u64(config.seed);

        // Held-out validation slice for early stopping.
        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(&mut rng);
        let n_valid = ((n as f64) * config.validation_fraction) as usize;
        let (valid_rows, train_rows) = indices.split_at(n_valid);

        let init = median(targets, train_rows);
        let mut predictions = vec![init; n];
        let mut trees: Vec<RegressionTree> = Vec::new();

        let params = TreeParams {
            max_depth: config.max_depth,
            min_samples_leaf: config.min_samples_leaf,
        };

        let mut best_loss = f64::INFINITY;
        let mut rounds_without_improvement = 0;

        for round in 0..config.n_estimators {
            // Huber pseudo-gradients of the current residuals.
            let residuals: Vec<f64> = (0..n).map(|i| targets[i] - predictions[i]).collect();
            let delta = huber_delta(&residuals, train_rows, config.huber_quantile);
            let gradients: Vec<f64> = residuals
                .iter()
                .map(|&r| {
                    if r.abs() <= delta {
                        r
                    } else {
                        delta * r.signum()
                    }
                })
                .collect();

            let sample = subsample(train_rows, config.subsample, &mut rng);
            let tree = RegressionTree::fit(features, n_cols, &gradients, &sample, &params);

            for (i, prediction) in predictions.iter_mut().enumerate() {
                *prediction +=
                    config.learning_rate * tree.predict(&features[i * n_cols..(i + 1) * n_cols]);
            }
            trees.push(tree);

            // Early stopping on the validation slice (when one exists).
            if valid_rows.is_empty() {
                continue;
            }
            let loss = huber_loss(targets, &predictions, valid_rows, delta);
            if best_loss - loss > config.tol {
                best_loss = loss;
                rounds_without_improvement = 0;
            } else {
                rounds_without_improvement += 1;
                if rounds_without_improvement >= config.early_stopping_patience {
                    debug!(round, best_loss, "early stopping triggered");
                    break;
                }
            }
        }

        info!(
            n_trees = trees.len(),
            n_train = train_rows.len(),
            n_valid = valid_rows.len(),
            "booster fitted"
        );

        Self {
            init,
            learning_rate: config.learning_rate,
            trees,
        }
    }

    /// Predicts the response for one feature row.
    #[must_use]
    pub fn predict(&self, row: &[f64]) -> f64 {
        self.init
            + self.learning_rate
                * self
                    .trees
                    .iter()
                    .map(|tree| tree.predict(row))
                    .sum::<f64>()
    }

    /// Number of fitted trees (after early stopping).
    #[must_use]
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

/// Median of `values` restricted to `rows`.
fn median(values: &[f64], rows: &[usize]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    let mut selected: Vec<f64> = rows.iter().map(|&r| values[r]).collect();
    selected.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = selected.len() / 2;
    if selected.len() % 2 == 0 {
        (selected[mid - 1] + selected[mid]) / 2.0
    } else {
        selected[mid]
    }
}

/// The Huber transition point: a high quantile of absolute residuals,
/// floored so a perfectly fitted round cannot zero the gradients.
fn huber_delta(residuals: &[f64], rows: &[usize], quantile: f64) -> f64 {
    let mut magnitudes: Vec<f64> = rows.iter().map(|&r| residuals[r].abs()).collect();
    magnitudes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = ((magnitudes.len() - 1) as f64 * quantile).round() as usize;
    magnitudes[index].max(1e-10)
}

fn huber_loss(targets: &[f64], predictions: &[f64], rows: &[usize], delta: f64) -> f64 {
    let total: f64 = rows
        .iter()
        .map(|&r| {
            let diff = (targets[r] - predictions[r]).abs();
            if diff <= delta {
                0.5 * diff * diff
            } else {
                delta * (diff - 0.5 * delta)
            }
        })
        .sum();
    total / rows.len() as f64
}

/// Samples `fraction` of `rows` without replacement, in sorted order.
fn subsample(rows: &[usize], fraction: f64, rng: &mut StdRng) -> Vec<usize> {
    if fraction >= 1.0 {
        return rows.to_vec();
    }
    let k = (((rows.len() as f64) * fraction) as usize).max(1);
    let mut picked: Vec<usize> = rows
        .iter()
        .copied()
        .filter(|_| rng.gen_bool(fraction))
        .collect();
    if picked.len() < k / 2 {
        // Degenerate draw on tiny inputs; fall back to a fixed prefix of
        // a shuffle so the tree still sees enough rows.
        let mut shuffled = rows.to_vec();
        shuffled.shuffle(rng);
        shuffled.truncate(k);
        picked = shuffled;
    }
    picked.sort_unstable();
    picked
}
