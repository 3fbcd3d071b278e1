//! The seam between the merge driver and the likelihood families.

use crate::error::Result;

/// Best-fit Gaussian-process hyperparameters for one cluster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpFit {
    /// Squared-exponential length-scale ℓ.
    pub length_scale: f64,
    /// Noise-free (signal) scale s_f.
    pub noise_free_scale: f64,
    /// Observation noise σ.
    pub noise_sigma: f64,
    /// Fitted outlier-mixture weight a ∈ (0, 1].
    pub mixture_weight: f64,
}

/// The outcome of scoring a candidate cluster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evidence {
    /// log p(D | one cluster).
    pub log_marginal: f64,
    /// Fitted hyperparameters, for models that optimise any.
    pub fit: Option<GpFit>,
}

/// A marginal-likelihood model over the item set.
///
/// Implementations hold per-node state (count tables or member lists)
/// for all 2N−1 dendrogram slots. Scoring is read-only so candidate
/// pairs can be evaluated in parallel; [`record_merge`] runs between
/// scans with exclusive access.
///
/// [`record_merge`]: ClusterModel::record_merge
pub trait ClusterModel: Sync {
    /// Number of leaf items.
    fn n_items(&self) -> usize;

    /// log p(D | H₁) for the union of nodes `i` and `j`, or the leaf
    /// marginal of `i` when `j` is `None`.
    fn evidence(&self, i: usize, j: Option<usize>) -> Result<Evidence>;

    /// Record that node `parent` now covers the union of `left` and
    /// `right`.
    fn record_merge(&mut self, parent: usize, left: usize, right: usize);
}
