use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{FeatureMatrix, OutlierModel, OutlierScorer};

const EULER_GAMMA: f64 = 0.577_215_664_9;

/// Average path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn path_length(&self, row: &[f64], depth: f64) -> f64 {
        match self {
            Node::Leaf { size } => depth + average_path_length(*size),
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if row[*feature] < *threshold {
                    left.path_length(row, depth + 1.0)
                } else {
                    right.path_length(row, depth + 1.0)
                }
            }
        }
    }
}

fn grow(rows: &[&[f64]], depth: usize, limit: usize, rng: &mut StdRng) -> Node {
    if depth >= limit || rows.len() <= 1 {
        return Node::Leaf { size: rows.len() };
    }
    let width = rows[0].len();
    let splittable: Vec<(usize, f64, f64)> = (0..width)
        .filter_map(|f| {
            let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
                (lo.min(r[f]), hi.max(r[f]))
            });
            (hi > lo).then_some((f, lo, hi))
        })
        .collect();
    if splittable.is_empty() {
        return Node::Leaf { size: rows.len() };
    }

    let (feature, lo, hi) = splittable[rng.gen_range(0..splittable.len())];
    let threshold = rng.gen_range(lo..hi);
    let (left, right): (Vec<&[f64]>, Vec<&[f64]>) = rows.iter().copied().partition(|r| r[feature] < threshold);
    Node::Split {
        feature,
        threshold,
        left: Box::new(grow(&left, depth + 1, limit, rng)),
        right: Box::new(grow(&right, depth + 1, limit, rng)),
    }
}

/// Isolation forest: anomalies are isolated by fewer random splits.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    pub trees: usize,
    pub sample_size: usize,
    pub seed: u64,
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self {
            trees: 100,
            sample_size: 256,
            seed: 42,
        }
    }
}

pub struct IsolationForestModel {
    trees: Vec<Node>,
    normaliser: f64,
}

impl OutlierScorer for IsolationForest {
    fn name(&self) -> &'static str {
        "isolation_forest"
    }

    fn fit(&self, matrix: &FeatureMatrix) -> Box<dyn OutlierModel> {
        let n = matrix.rows.len();
        if n == 0 {
            return Box::new(IsolationForestModel {
                trees: Vec::new(),
                normaliser: 0.0,
            });
        }
        let psi = self.sample_size.min(n).max(1);
        let limit = (psi as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let trees = (0..self.trees)
            .map(|_| {
                let sample: Vec<&[f64]> = rand::seq::index::sample(&mut rng, n, psi)
                    .into_iter()
                    .map(|i| matrix.rows[i].as_slice())
                    .collect();
                grow(&sample, 0, limit, &mut rng)
            })
            .collect();

        Box::new(IsolationForestModel {
            trees,
            normaliser: average_path_length(psi),
        })
    }
}

impl OutlierModel for IsolationForestModel {
    /// Scores in (0, 1]; values near 1 are anomalous, below 0.5 normal.
    fn score(&self, matrix: &FeatureMatrix) -> Vec<f64> {
        if self.trees.is_empty() || self.normaliser == 0.0 {
            return vec![0.0; matrix.rows.len()];
        }
        matrix
            .rows
            .iter()
            .map(|row| {
                let mean_path = self
                    .trees
                    .iter()
                    .map(|tree| tree.path_length(row, 0.0))
                    .sum::<f64>()
                    / self.trees.len() as f64;
                2f64.powf(-mean_path / self.normaliser)
            })
            .collect()
    }
}
