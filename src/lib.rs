//! # bhc
//!
//! Bayesian hierarchical clustering: bottom-up construction of a binary
//! dendrogram by greedily merging the pair of clusters whose posterior
//! evidence ratio under a Dirichlet-process mixture model is highest
//! (Heller & Ghahramani, 2005).
//!
//! Unlike distance-based agglomerative clustering, there is no linkage
//! metric to choose: each candidate merge is scored by the marginal
//! likelihood that its items came from a single mixture component,
//! traded off against the best tree structure found below. The root's
//! marginal is a lower bound on the model evidence, and cutting the
//! tree where the merge odds turn negative yields a flat partition
//! without picking k in advance.
//!
//! # Likelihood families
//!
//! | Data | Mode | Marginal |
//! |------|------|----------|
//! | Categorical | [`Mode::Multinomial`] | Dirichlet-multinomial |
//! | Time courses | [`Mode::TimecourseGlobalNoise`] | Robust squared-exponential GP |
//! | Time courses | [`Mode::TimecourseEstimatedNoise`] | As above, noise fixed from replicate scatter |
//!
//! The time-course marginal is *robust*: the full-data GP likelihood is
//! mixed with every leave-one-observation-out variant weighted by a
//! uniform outlier density, so a single anomalous observation
//! down-weights instead of vetoing a merge.
//!
//! # Example
//!
//! ```
//! use bhc::{Bhc, ItemMatrix, Mode};
//!
//! let items = ItemMatrix::Categorical {
//!     values: vec![
//!         vec![0, 0, 1],
//!         vec![0, 0, 1],
//!         vec![1, 1, 0],
//!         vec![1, 1, 0],
//!     ],
//!     n_values: 2,
//! };
//!
//! let tree = Bhc::new().fit(&items, Mode::Multinomial).unwrap();
//! assert_eq!(tree.n_items(), 4);
//!
//! // Flat clusters from the posterior-odds tree cut.
//! let labels = tree.partition();
//! assert_eq!(labels[0], labels[1]);
//! ```
//!
//! # References
//!
//! - Heller & Ghahramani (2005). "Bayesian Hierarchical Clustering." ICML.
//! - Cooke et al. (2011). "Bayesian hierarchical clustering of gene
//!   expression time series data with replicates and outlier measurements."
//!   BMC Bioinformatics.

pub mod covariance;
mod engine;
pub mod error;
pub mod likelihood;
pub mod math;
pub mod tree;

pub use covariance::{BlockCovarianceMatrix, ReducedCovarianceMatrix};
pub use engine::{Bhc, ItemMatrix, Mode};
pub use error::{Error, Result};
pub use likelihood::{
    ClusterModel, Evidence, GpBrackets, GpFit, MultinomialModel, NoiseMode, TimecourseModel,
};
pub use tree::{ClusterTree, MergeNode};
