//! Per-cluster marginal likelihoods.
//!
//! The merge driver is generic over a [`ClusterModel`]: anything that
//! can score "these items form one cluster" with a log marginal
//! likelihood. Two families are provided:
//!
//! - [`MultinomialModel`] — discrete feature values under a
//!   Dirichlet-multinomial marginal, with per-dimension hyperparameters
//!   scaled by a global concentration.
//! - [`TimecourseModel`] — real-valued series under a
//!   squared-exponential Gaussian-process marginal, made robust against
//!   single anomalous observations by mixing in leave-one-out variants
//!   weighted by a uniform outlier density.

mod multinomial;
mod timecourse;
mod traits;

pub use multinomial::MultinomialModel;
pub use timecourse::{GpBrackets, NoiseMode, TimecourseModel};
pub use traits::{ClusterModel, Evidence, GpFit};
