//! Offset tree: a context-partitioning bandit.
//!
//! The context space is split recursively on single features of the dense
//! context vector. Each leaf runs its own small bandit over the candidate
//! models. Nodes live in an arena (`Vec<Node>`) and refer to each other by
//! index, so the whole tree serializes as plain data.
//!
//! A leaf splits once it holds `min_samples_split` samples, provided the
//! depth limit allows it and the best split leaves at least
//! `min_samples_leaf` samples on each side. Leaf history is capped at
//! `max_history`; older samples are pruned first.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::thompson::BetaArm;
use super::{
    argmax, ensure_candidates, make_rng, AdvancedDiagnostics, ArmStats, BanditPolicy,
    PolicyError, PolicySnapshot,
};
use crate::features::{context_vector, Context};

pub(crate) const NAME: &str = "offset_tree";

/// Criterion used to score candidate splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitCriterion {
    #[default]
    VarianceReduction,
    InformationGain,
    Mse,
}

/// Bandit run inside each leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafPolicy {
    #[default]
    Thompson,
    EpsilonGreedy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsetTreeConfig {
    pub dim: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_history: usize,
    pub split_criterion: SplitCriterion,
    pub leaf_policy: LeafPolicy,
    /// Exploration rate when `leaf_policy` is epsilon-greedy.
    pub epsilon: f64,
}

impl Default for OffsetTreeConfig {
    fn default() -> Self {
        Self {
            dim: 8,
            max_depth: 4,
            min_samples_split: 40,
            min_samples_leaf: 10,
            max_history: 1000,
            split_criterion: SplitCriterion::VarianceReduction,
            leaf_policy: LeafPolicy::Thompson,
            epsilon: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Sample {
    x: Vec<f64>,
    action: String,
    reward: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Split {
    feature: usize,
    threshold: f64,
    left: usize,
    right: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LeafArm {
    beta: BetaArm,
    stats: ArmStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Node {
    depth: usize,
    parent: Option<usize>,
    split: Option<Split>,
    arms: BTreeMap<String, LeafArm>,
    samples: Vec<Sample>,
}

impl Node {
    fn leaf(depth: usize, parent: Option<usize>) -> Self {
        Self {
            depth,
            parent,
            split: None,
            arms: BTreeMap::new(),
            samples: Vec::new(),
        }
    }

    fn observe(&mut self, sample: Sample) {
        let arm = self.arms.entry(sample.action.clone()).or_default();
        arm.beta.observe(sample.reward);
        arm.stats.update(sample.reward);
        self.samples.push(sample);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct State {
    dim: usize,
    nodes: Vec<Node>,
}

#[derive(Debug)]
pub struct OffsetTree {
    config: OffsetTreeConfig,
    state: State,
    last: Option<AdvancedDiagnostics>,
    rng: StdRng,
}

impl OffsetTree {
    pub fn new(config: OffsetTreeConfig, seed: Option<u64>) -> Self {
        let state = State {
            dim: config.dim.max(1),
            nodes: vec![Node::leaf(0, None)],
        };
        Self {
            config,
            state,
            last: None,
            rng: make_rng(seed),
        }
    }

    /// Number of nodes in the arena.
    pub fn node_count(&self) -> usize {
        self.state.nodes.len()
    }

    /// Depth of the deepest leaf.
    pub fn depth(&self) -> usize {
        self.state.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    fn leaf_for(&self, x: &[f64]) -> usize {
        let mut idx = 0;
        while let Some(split) = self.state.nodes[idx].split {
            let value = x.get(split.feature).copied().unwrap_or(0.0);
            idx = if value <= split.threshold {
                split.left
            } else {
                split.right
            };
        }
        idx
    }

    fn try_split(&mut self, idx: usize) {
        let node = &self.state.nodes[idx];
        if node.depth >= self.config.max_depth
            || node.samples.len() < self.config.min_samples_split
        {
            return;
        }

        let Some((feature, threshold)) = best_split(
            &node.samples,
            self.state.dim,
            self.config.min_samples_leaf.max(1),
            self.config.split_criterion,
        ) else {
            return;
        };

        let depth = node.depth + 1;
        let samples = std::mem::take(&mut self.state.nodes[idx].samples);
        let left = self.state.nodes.len();
        let right = left + 1;
        let mut left_node = Node::leaf(depth, Some(idx));
        let mut right_node = Node::leaf(depth, Some(idx));
        for sample in samples {
            if sample.x.get(feature).copied().unwrap_or(0.0) <= threshold {
                left_node.observe(sample);
            } else {
                right_node.observe(sample);
            }
        }
        self.state.nodes.push(left_node);
        self.state.nodes.push(right_node);

        let parent = &mut self.state.nodes[idx];
        parent.split = Some(Split {
            feature,
            threshold,
            left,
            right,
        });
        parent.arms.clear();
        tracing::debug!(node = idx, feature, threshold, depth, "offset tree split");
    }

    fn prune(&mut self, idx: usize) {
        let max = self.config.max_history.max(1);
        let node = &mut self.state.nodes[idx];
        if node.samples.len() > max {
            let excess = node.samples.len() - max;
            node.samples.drain(..excess);
        }
    }
}

impl BanditPolicy for OffsetTree {
    fn name(&self) -> &'static str {
        NAME
    }

    fn recommend(&mut self, context: &Context, candidates: &[String]) -> Result<String, PolicyError> {
        ensure_candidates(candidates)?;
        let x = context_vector(context, self.state.dim);
        let leaf = self.leaf_for(&x);
        let arms = &self.state.nodes[leaf].arms;

        let idx = match self.config.leaf_policy {
            LeafPolicy::Thompson => {
                let rng = &mut self.rng;
                let draws: Vec<f64> = candidates
                    .iter()
                    .map(|c| arms.get(c).map(|a| a.beta).unwrap_or_default().sample(rng))
                    .collect();
                argmax(draws)
            }
            LeafPolicy::EpsilonGreedy => {
                let eps = self.config.epsilon.clamp(0.0, 1.0);
                if eps > 0.0 && self.rng.gen::<f64>() < eps {
                    self.rng.gen_range(0..candidates.len())
                } else {
                    argmax(
                        candidates
                            .iter()
                            .map(|c| arms.get(c).map(|a| a.stats.mean).unwrap_or(0.0)),
                    )
                }
            }
        };
        Ok(candidates[idx].clone())
    }

    fn update(&mut self, action: &str, reward: f64, context: &Context) {
        if !reward.is_finite() {
            return;
        }
        let x = context_vector(context, self.state.dim);
        let leaf = self.leaf_for(&x);
        self.state.nodes[leaf].observe(Sample {
            x,
            action: action.to_string(),
            reward,
        });
        self.prune(leaf);
        self.try_split(leaf);

        self.last = Some(AdvancedDiagnostics {
            reward_model_mse: None,
            tree_depth: Some(self.depth() as f64),
            importance_weight: None,
            ci_width: None,
        });
    }

    fn export_state(&self) -> PolicySnapshot {
        PolicySnapshot::new(NAME, &self.state)
    }

    fn import_state(&mut self, snapshot: &PolicySnapshot) -> bool {
        match snapshot.decode::<State>(NAME) {
            Some(state) if is_well_formed(&state) => {
                self.state = state;
                true
            }
            _ => false,
        }
    }

    fn set_prior(&mut self, action: &str, mean: f64, weight: f64) {
        let mean_c = mean.clamp(0.0, 1.0);
        let weight = weight.max(0.0);
        for node in self.state.nodes.iter_mut().filter(|n| n.split.is_none()) {
            node.arms.insert(
                action.to_string(),
                LeafArm {
                    beta: BetaArm {
                        alpha: 1.0 + mean_c * weight,
                        beta: 1.0 + (1.0 - mean_c) * weight,
                    },
                    stats: ArmStats {
                        pulls: weight.round() as u64,
                        mean,
                    },
                },
            );
        }
    }

    fn diagnostics(&self) -> Option<AdvancedDiagnostics> {
        self.last
    }
}

const MAX_DIM: usize = 4096;

/// The arena is a single tree rooted at node 0: every other node is the
/// child of exactly one split, reachable from the root one level deeper
/// than its parent.
fn is_well_formed(state: &State) -> bool {
    let nodes = &state.nodes;
    if nodes.is_empty() || state.dim == 0 || state.dim > MAX_DIM {
        return false;
    }
    if nodes[0].parent.is_some() || nodes[0].depth != 0 {
        return false;
    }

    let mut seen = vec![false; nodes.len()];
    seen[0] = true;
    let mut stack = vec![0usize];
    while let Some(i) = stack.pop() {
        let Some(split) = nodes[i].split else {
            continue;
        };
        for child in [split.left, split.right] {
            if child >= nodes.len() || seen[child] {
                return false;
            }
            let node = &nodes[child];
            if node.parent != Some(i) || node.depth != nodes[i].depth + 1 {
                return false;
            }
            seen[child] = true;
            stack.push(child);
        }
    }
    seen.into_iter().all(|s| s)
}

fn best_split(
    samples: &[Sample],
    dim: usize,
    min_leaf: usize,
    criterion: SplitCriterion,
) -> Option<(usize, f64)> {
    let parent_impurity = impurity(samples.iter(), criterion);
    let n = samples.len() as f64;
    let mut best: Option<(usize, f64, f64)> = None;

    // Feature 0 is the bias term.
    for feature in 1..dim {
        for threshold in candidate_thresholds(samples, feature) {
            let (left, right): (Vec<&Sample>, Vec<&Sample>) = samples
                .iter()
                .partition(|s| s.x.get(feature).copied().unwrap_or(0.0) <= threshold);
            if left.len() < min_leaf || right.len() < min_leaf {
                continue;
            }

            let weighted = (left.len() as f64 / n) * impurity(left.iter().copied(), criterion)
                + (right.len() as f64 / n) * impurity(right.iter().copied(), criterion);
            let gain = parent_impurity - weighted;
            if gain > 1e-9 && best.map_or(true, |(_, _, g)| gain > g) {
                best = Some((feature, threshold, gain));
            }
        }
    }
    best.map(|(f, t, _)| (f, t))
}

/// Midpoints between distinct feature values, thinned to at most `MAX_THRESHOLDS`.
fn candidate_thresholds(samples: &[Sample], feature: usize) -> Vec<f64> {
    const MAX_THRESHOLDS: usize = 16;

    let mut values: Vec<f64> = samples
        .iter()
        .map(|s| s.x.get(feature).copied().unwrap_or(0.0))
        .collect();
    values.sort_by(|a, b| a.total_cmp(b));
    values.dedup();

    let midpoints: Vec<f64> = values.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
    if midpoints.len() <= MAX_THRESHOLDS {
        return midpoints;
    }
    let step = midpoints.len() as f64 / MAX_THRESHOLDS as f64;
    (0..MAX_THRESHOLDS)
        .map(|i| midpoints[(i as f64 * step) as usize])
        .collect()
}

/// Node impurity under `criterion`.
///
/// Variance reduction looks at rewards alone; the other two criteria group
/// samples by action, so a split can separate regions where different
/// models win even when the average reward is the same.
fn impurity<'a, I: Iterator<Item = &'a Sample>>(samples: I, criterion: SplitCriterion) -> f64 {
    let samples: Vec<&Sample> = samples.collect();
    if samples.is_empty() {
        return 0.0;
    }
    let n = samples.len() as f64;
    match criterion {
        SplitCriterion::VarianceReduction => {
            let mean = samples.iter().map(|s| s.reward).sum::<f64>() / n;
            samples.iter().map(|s| (s.reward - mean).powi(2)).sum::<f64>() / n
        }
        SplitCriterion::InformationGain => {
            let mut by_action: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
            for s in &samples {
                let entry = by_action.entry(s.action.as_str()).or_insert((0.0, 0.0));
                entry.0 += 1.0;
                if s.reward >= 0.5 {
                    entry.1 += 1.0;
                }
            }
            by_action
                .values()
                .map(|(count, wins)| (count / n) * entropy(wins / count))
                .sum()
        }
        SplitCriterion::Mse => {
            let mut by_action: BTreeMap<&str, ArmStats> = BTreeMap::new();
            for s in &samples {
                by_action.entry(s.action.as_str()).or_default().update(s.reward);
            }
            samples
                .iter()
                .map(|s| (s.reward - by_action[s.action.as_str()].mean).powi(2))
                .sum::<f64>()
                / n
        }
    }
}

fn entropy(p: f64) -> f64 {
    if p <= 0.0 || p >= 1.0 {
        return 0.0;
    }
    -(p * p.log2() + (1.0 - p) * (1.0 - p).log2())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tree(criterion: SplitCriterion) -> OffsetTree {
        OffsetTree::new(
            OffsetTreeConfig {
                dim: 2,
                max_depth: 2,
                min_samples_split: 20,
                min_samples_leaf: 5,
                max_history: 100,
                split_criterion: criterion,
                leaf_policy: LeafPolicy::Thompson,
                epsilon: 0.0,
            },
            Some(17),
        )
    }

    fn feed_separable(tree: &mut OffsetTree, rounds: usize) {
        let low = Context::new().with("f", 0.0);
        let high = Context::new().with("f", 1.0);
        for _ in 0..rounds {
            tree.update("a", 1.0, &low);
            tree.update("b", 0.0, &low);
            tree.update("a", 0.0, &high);
            tree.update("b", 0.6, &high);
        }
    }

    #[test]
    fn test_splits_on_informative_feature() {
        for criterion in [
            SplitCriterion::VarianceReduction,
            SplitCriterion::InformationGain,
            SplitCriterion::Mse,
        ] {
            let mut tree = small_tree(criterion);
            feed_separable(&mut tree, 30);
            assert!(tree.node_count() >= 3, "{criterion:?} did not split");
        }
    }

    #[test]
    fn test_leaves_learn_different_arms() {
        let mut tree = small_tree(SplitCriterion::Mse);
        feed_separable(&mut tree, 60);
        let candidates: Vec<String> = vec!["a".into(), "b".into()];
        let low = Context::new().with("f", 0.0);
        let high = Context::new().with("f", 1.0);
        let low_a = (0..50)
            .filter(|_| tree.recommend(&low, &candidates).unwrap() == "a")
            .count();
        let high_b = (0..50)
            .filter(|_| tree.recommend(&high, &candidates).unwrap() == "b")
            .count();
        assert!(low_a > 45 && high_b > 45, "low_a={low_a} high_b={high_b}");
    }

    #[test]
    fn test_depth_is_bounded() {
        let mut tree = small_tree(SplitCriterion::VarianceReduction);
        for i in 0..2000 {
            let ctx = Context::new().with("f", (i % 97) as f64);
            tree.update("a", ((i * 7) % 11) as f64 / 10.0, &ctx);
        }
        assert!(tree.depth() <= 2);
        assert_eq!(tree.diagnostics().unwrap().tree_depth, Some(tree.depth() as f64));
    }

    #[test]
    fn test_history_is_pruned() {
        let mut tree = OffsetTree::new(
            OffsetTreeConfig {
                dim: 1,
                max_history: 10,
                ..Default::default()
            },
            Some(1),
        );
        let ctx = Context::new();
        for _ in 0..50 {
            tree.update("a", 0.5, &ctx);
        }
        assert!(tree.state.nodes[0].samples.len() <= 10);
    }

    #[test]
    fn test_snapshot_round_trip_and_corrupt_import() {
        let mut tree = small_tree(SplitCriterion::VarianceReduction);
        feed_separable(&mut tree, 30);
        let snapshot = tree.export_state();

        let mut restored = small_tree(SplitCriterion::VarianceReduction);
        assert!(restored.import_state(&snapshot));
        assert_eq!(restored.node_count(), tree.node_count());

        let mut corrupt = snapshot.clone();
        corrupt.state.insert("nodes".to_string(), serde_json::json!([]));
        let mut untouched = small_tree(SplitCriterion::VarianceReduction);
        assert!(!untouched.import_state(&corrupt));
        assert_eq!(untouched.node_count(), 1);
    }

    #[test]
    fn test_cyclic_snapshot_is_rejected() {
        // 0 -> 1 -> 2 -> 3 -> 0, with every child pointing back at its parent.
        let split_to = |child: usize| {
            Some(Split {
                feature: 1,
                threshold: 0.0,
                left: child,
                right: child,
            })
        };
        let nodes: Vec<Node> = (0..4)
            .map(|i| Node {
                depth: i,
                parent: Some((i + 3) % 4),
                split: split_to((i + 1) % 4),
                arms: BTreeMap::new(),
                samples: Vec::new(),
            })
            .collect();
        let snapshot = PolicySnapshot::new(NAME, &State { dim: 2, nodes });

        let mut tree = small_tree(SplitCriterion::VarianceReduction);
        assert!(!tree.import_state(&snapshot));
        assert_eq!(tree.node_count(), 1);

        let candidates: Vec<String> = vec!["a".into(), "b".into()];
        let ctx = Context::new().with("f", 0.0);
        assert!(tree.recommend(&ctx, &candidates).is_ok());
    }

    #[test]
    fn test_orphan_and_oversized_snapshots_are_rejected() {
        let mut orphan = State {
            dim: 2,
            nodes: vec![Node::leaf(0, None), Node::leaf(1, Some(0))],
        };
        let mut tree = small_tree(SplitCriterion::VarianceReduction);
        assert!(!tree.import_state(&PolicySnapshot::new(NAME, &orphan)));

        orphan.nodes.truncate(1);
        orphan.dim = MAX_DIM + 1;
        assert!(!tree.import_state(&PolicySnapshot::new(NAME, &orphan)));

        orphan.dim = 2;
        assert!(tree.import_state(&PolicySnapshot::new(NAME, &orphan)));
    }
}
