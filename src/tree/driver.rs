//! The agglomerative merge driver.
//!
//! Implements the Bayesian hierarchical clustering recurrence of Heller
//! & Ghahramani (2005): every candidate pair (i, j) carries the log
//! prior π_k that its items form a single cluster under the
//! Dirichlet-process prior, the log marginal under that one-cluster
//! hypothesis, and the log marginal under the tree hypothesis; the pair
//! with the greatest posterior log odds merges, and the surviving
//! candidates are re-scored against the new node.

use super::node::MergeNode;
use crate::error::{Error, Result};
use crate::likelihood::{ClusterModel, GpFit};
use crate::math::{log_add_exp, GammaTable};

/// One candidate pair's bookkeeping: log(π_k·p(D|H₁)),
/// log((1−π_k)·p(D|T)), and their difference (the posterior log odds).
#[derive(Debug, Clone, PartialEq)]
struct PairScore {
    num1: f64,
    num2: f64,
    wt: f64,
    fit: Option<GpFit>,
}

impl PairScore {
    fn empty() -> Self {
        Self {
            num1: f64::NEG_INFINITY,
            num2: f64::NEG_INFINITY,
            wt: f64::NEG_INFINITY,
            fit: None,
        }
    }
}

/// Flat upper-triangular table of pair scores over all 2N−1 slots,
/// allocated once per run.
struct PairTable {
    n_slots: usize,
    scores: Vec<PairScore>,
}

impl PairTable {
    fn new(n_slots: usize) -> Self {
        let len = n_slots * (n_slots - 1) / 2;
        Self {
            n_slots,
            scores: vec![PairScore::empty(); len],
        }
    }

    #[inline]
    fn index(&self, i: usize, j: usize) -> usize {
        debug_assert!(i < j && j < self.n_slots);
        // Row i starts after the rows above it; row r holds
        // n_slots − r − 1 entries.
        i * (2 * self.n_slots - i - 1) / 2 + (j - i - 1)
    }

    #[inline]
    fn get(&self, i: usize, j: usize) -> &PairScore {
        &self.scores[self.index(i, j)]
    }

    #[inline]
    fn set(&mut self, i: usize, j: usize, score: PairScore) {
        let idx = self.index(i, j);
        self.scores[idx] = score;
    }
}

/// Score the hypothetical merge of nodes `i` and `j`.
fn pair_score<M: ClusterModel>(
    model: &M,
    gamma: &GammaTable,
    log_alpha: f64,
    nodes: &[MergeNode],
    i: usize,
    j: usize,
) -> Result<PairScore> {
    let tr1 = log_alpha + gamma.lookup(nodes[i].size + nodes[j].size);
    let tr2 = nodes[i].log_ck + nodes[j].log_ck;
    let ckt = log_add_exp(tr1, tr2);
    let log_pi = tr1 - ckt;
    let evidence = model.evidence(i, Some(j))?;
    let num1 = log_pi + evidence.log_marginal;
    let num2 = (tr2 - ckt) + nodes[i].log_marginal + nodes[j].log_marginal;
    Ok(PairScore {
        num1,
        num2,
        wt: num1 - num2,
        fit: evidence.fit,
    })
}

#[cfg(feature = "parallel")]
fn score_pairs<F>(pairs: &[(usize, usize)], score: F) -> Result<Vec<PairScore>>
where
    F: Fn((usize, usize)) -> Result<PairScore> + Send + Sync,
{
    use rayon::prelude::*;
    // Collection preserves pair order, so the write-back below is
    // identical to the sequential path.
    pairs.par_iter().map(|&p| score(p)).collect()
}

#[cfg(not(feature = "parallel"))]
fn score_pairs<F>(pairs: &[(usize, usize)], score: F) -> Result<Vec<PairScore>>
where
    F: Fn((usize, usize)) -> Result<PairScore>,
{
    pairs.iter().map(|&p| score(p)).collect()
}

/// Run the full agglomeration and return the populated node arena.
pub(crate) fn run<M: ClusterModel>(model: &mut M, alpha: f64) -> Result<Vec<MergeNode>> {
    if !(alpha > 0.0) || !alpha.is_finite() {
        return Err(Error::InvalidHyperparameter {
            name: "alpha",
            value: alpha,
            constraint: "must be > 0 and finite",
        });
    }
    let n = model.n_items();
    if n == 0 {
        return Err(Error::input("no items to cluster"));
    }
    let n_slots = 2 * n - 1;
    let log_alpha = alpha.ln();
    let gamma = GammaTable::new(n.max(2));

    // Leaf initialisation.
    let mut nodes = Vec::with_capacity(n_slots);
    for i in 0..n {
        let evidence = model.evidence(i, None)?;
        if !evidence.log_marginal.is_finite() {
            return Err(Error::numeric(format!(
                "non-finite leaf evidence for item {i}"
            )));
        }
        nodes.push(MergeNode::leaf(evidence.log_marginal, log_alpha, evidence.fit));
    }
    nodes.resize(n_slots, MergeNode::unallocated());

    if n == 1 {
        return Ok(nodes);
    }

    // Pair initialisation over all leaf pairs.
    let mut table = PairTable::new(n_slots);
    {
        let mut pairs = Vec::with_capacity(n * (n - 1) / 2);
        for i in 0..n {
            for j in (i + 1)..n {
                pairs.push((i, j));
            }
        }
        let model_ref: &M = model;
        let nodes_ref: &[MergeNode] = &nodes;
        let scores = score_pairs(&pairs, |(i, j)| {
            pair_score(model_ref, &gamma, log_alpha, nodes_ref, i, j)
        })?;
        for (&(i, j), score) in pairs.iter().zip(scores) {
            table.set(i, j, score);
        }
    }

    // N−1 merges.
    let mut merged_node = n - 1;
    for _ in 1..n {
        merged_node += 1;

        // Ascending scan; strictly greater wins, so the first of any
        // tied pairs is kept.
        let mut best_wt = f64::NEG_INFINITY;
        let mut best: Option<(usize, usize)> = None;
        for i in 0..merged_node {
            if nodes[i].consumed {
                continue;
            }
            for j in (i + 1)..merged_node {
                if nodes[j].consumed {
                    continue;
                }
                let wt = table.get(i, j).wt;
                if wt > best_wt {
                    best_wt = wt;
                    best = Some((i, j));
                }
            }
        }
        let (node1, node2) = best.ok_or_else(|| {
            Error::numeric("no candidate pair with finite posterior odds".to_string())
        })?;

        // Populate the new node.
        let winner = table.get(node1, node2).clone();
        let tr1 = log_alpha + gamma.lookup(nodes[node1].size + nodes[node2].size);
        let tr2 = nodes[node1].log_ck + nodes[node2].log_ck;
        nodes[merged_node] = MergeNode {
            left: Some(node1),
            right: Some(node2),
            size: nodes[node1].size + nodes[node2].size,
            log_marginal: log_add_exp(winner.num1, winner.num2),
            merge_log_odds: winner.wt,
            fit: winner.fit,
            log_ck: log_add_exp(tr1, tr2),
            consumed: false,
        };
        model.record_merge(merged_node, node1, node2);
        nodes[node1].consumed = true;
        nodes[node2].consumed = true;

        // Re-score every surviving candidate against the new node.
        let partners: Vec<(usize, usize)> = (0..merged_node)
            .filter(|&k| !nodes[k].consumed)
            .map(|k| (k, merged_node))
            .collect();
        let model_ref: &M = model;
        let nodes_ref: &[MergeNode] = &nodes;
        let scores = score_pairs(&partners, |(k, m)| {
            pair_score(model_ref, &gamma, log_alpha, nodes_ref, k, m)
        })?;
        for (&(k, m), score) in partners.iter().zip(scores) {
            table.set(k, m, score);
        }
    }

    Ok(nodes)
}
