//! Depth-bounded regression trees.
//!
//! CART-style variance-reduction trees used as the weak learners of the
//! booster. Shallow depth and a large minimum leaf size are deliberate:
//! the growth target has high noise-to-signal, and deep trees memorise
//! it.

use serde::{Deserialize, Serialize};

/// One node of a fitted tree, index-linked into the tree's node arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    /// An internal split: rows with `feature < threshold` go left.
    Split {
        /// Feature column index.
        feature: usize,
        /// Split threshold (midpoint between adjacent training values).
        threshold: f64,
        /// Arena index of the left child.
        left: usize,
        /// Arena index of the right child.
        right: usize,
    },
    /// A leaf carrying the mean response of its training rows.
    Leaf {
        /// Predicted value.
        value: f64,
    },
}

/// A fitted regression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

/// Growth limits for a tree fit.
#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    /// Maximum depth (root = depth 0).
    pub max_depth: usize,
    /// Minimum rows in each child of a split.
    pub min_samples_leaf: usize,
}

impl RegressionTree {
    /// Fits a tree to `(rows, responses)` where `rows` indexes into the
    /// row-major feature storage.
    ///
    /// `features` holds `n_cols` contiguous values per row.
    #[must_use]
    pub fn fit(
        features: &[f64],
        n_cols: usize,
        responses: &[f64],
        rows: &[usize],
        params: &TreeParams,
    ) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        let mut working = rows.to_vec();
        tree.grow(features, n_cols, responses, &mut working, 0, params);
        tree
    }

    /// Predicts the response for one feature row.
    #[must_use]
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[*feature] < *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    /// Number of nodes in the fitted tree.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Depth of the fitted tree (0 for a single leaf).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth_from(0)
    }

    fn depth_from(&self, index: usize) -> usize {
        match &self.nodes[index] {
            Node::Leaf { .. } => 0,
            Node::Split { left, right, .. } => {
                1 + self.depth_from(*left).max(self.depth_from(*right))
            }
        }
    }

    /// Grows the subtree for `rows`, returning its arena index.
    fn grow(
        &mut self,
        features: &[f64],
        n_cols: usize,
        responses: &[f64],
        rows: &mut [usize],
        depth: usize,
        params: &TreeParams,
    ) -> usize {
        let mean = mean_of(responses, rows);
        if depth >= params.max_depth || rows.len() < 2 * params.min_samples_leaf {
            return self.push(Node::Leaf { value: mean });
        }

        let Some(split) = best_split(features, n_cols, responses, rows, params) else {
            return self.push(Node::Leaf { value: mean });
        };

        // Partition rows in place around the chosen split.
        let mid = partition(features, n_cols, rows, split.feature, split.threshold);
        let (left_rows, right_rows) = rows.split_at_mut(mid);
        debug_assert!(left_rows.len() >= params.min_samples_leaf);
        debug_assert!(right_rows.len() >= params.min_samples_leaf);

        // Reserve the split slot before the children so the root stays at
        // index 0.
        let slot = self.push(Node::Leaf { value: mean });
        let mut left_vec = left_rows.to_vec();
        let mut right_vec = right_rows.to_vec();
        let left = self.grow(features, n_cols, responses, &mut left_vec, depth + 1, params);
        let right = self.grow(features, n_cols, responses, &mut right_vec, depth + 1, params);
        self.nodes[slot] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        slot
    }

    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }
}

struct SplitChoice {
    feature: usize,
    threshold: f64,
}

/// Finds the split maximising the variance reduction
/// `sum_l^2 / n_l + sum_r^2 / n_r` subject to the leaf-size floor.
fn best_split(
    features: &[f64],
    n_cols: usize,
    responses: &[f64],
    rows: &[usize],
    params: &TreeParams,
) -> Option<SplitChoice> {
    let n = rows.len();
    let total_sum: f64 = rows.iter().map(|&r| responses[r]).sum();
    let base_score = total_sum * total_sum / n as f64;

    let mut best: Option<(f64, SplitChoice)> = None;
    let mut order: Vec<usize> = rows.to_vec();

    for feature in 0..n_cols {
        order.sort_by(|&a, &b| {
            let fa = features[a * n_cols + feature];
            let fb = features[b * n_cols + feature];
            fa.partial_cmp(&fb).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut left_sum = 0.0;
        for (i, &row) in order.iter().enumerate().take(n - 1) {
            left_sum += responses[row];
            let n_left = i + 1;
            let n_right = n - n_left;
            if n_left < params.min_samples_leaf {
                continue;
            }
            if n_right < params.min_samples_leaf {
                break;
            }
            let here = features[row * n_cols + feature];
            let next = features[order[i + 1] * n_cols + feature];
            if next <= here {
                // No threshold separates equal values.
                continue;
            }
            let right_sum = total_sum - left_sum;
            let score = left_sum * left_sum / n_left as f64
                + right_sum * right_sum / n_right as f64;
            let gain = score - base_score;
            if gain > 1e-12 && best.as_ref().map_or(true, |(g, _)| gain > *g) {
                best = Some((
                    gain,
                    SplitChoice {
                        feature,
                        threshold: (here + next) / 2.0,
                    },
                ));
            }
        }
    }
    best.map(|(_, choice)| choice)
}

/// Partitions `rows` so those with `feature < threshold` come first;
/// returns the boundary index.
fn partition(features: &[f64], n_cols: usize, rows: &mut [usize], feature: usize, threshold: f64) -> usize {
    let mut boundary = 0;
    for i in 0..rows.len() {
        if features[rows[i] * n_cols + feature] < threshold {
            rows.swap(boundary, i);
            boundary += 1;
        }
    }
    boundary
}

fn mean_of(responses: &[f64], rows: &[usize]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    rows.iter().map(|&r| responses[r]).sum::<f64>() / rows.len() as f64
}
