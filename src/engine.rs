//! Engine entry point: input description, configuration, dispatch.

use crate::error::{Error, Result};
use crate::likelihood::{GpBrackets, MultinomialModel, NoiseMode, TimecourseModel};
use crate::math::golden_section_min;
use crate::tree::{driver, ClusterTree};

/// The input item matrix with its declared element kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemMatrix {
    /// Real-valued items (time courses): N rows of T values.
    Real {
        /// Row-per-item values.
        values: Vec<Vec<f64>>,
    },
    /// Categorical items: N rows of D values in `[0, n_values)`.
    Categorical {
        /// Row-per-item values.
        values: Vec<Vec<usize>>,
        /// Size of the value domain V.
        n_values: usize,
    },
}

/// Which marginal-likelihood family scores candidate clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Dirichlet-multinomial marginal over categorical items.
    Multinomial,
    /// Robust GP marginal with a single optimised noise scale.
    TimecourseGlobalNoise,
    /// Robust GP marginal with per-time noise fixed from replicate
    /// scatter.
    TimecourseEstimatedNoise,
}

// Iteration cap for the global concentration search.
const CONCENTRATION_MAX_ITER: usize = 32;

/// Bayesian hierarchical clustering engine.
///
/// Configure with the builder methods, then call [`fit`](Self::fit):
///
/// ```
/// use bhc::{Bhc, ItemMatrix, Mode};
///
/// let items = ItemMatrix::Categorical {
///     values: vec![vec![0, 0], vec![0, 0], vec![1, 1], vec![1, 1]],
///     n_values: 2,
/// };
/// let tree = Bhc::new().fit(&items, Mode::Multinomial).unwrap();
/// assert_eq!(tree.n_items(), 4);
/// assert!(tree.log_evidence().is_finite());
/// ```
#[derive(Debug, Clone)]
pub struct Bhc {
    /// Dirichlet-process concentration α.
    alpha: f64,
    /// Kernel coordinates for time-course data; defaults to 0..T.
    time_points: Option<Vec<f64>>,
    /// GP hyperparameter brackets; unset fields resolve from the data.
    gp_brackets: GpBrackets,
    /// Search bracket for the multinomial concentration.
    concentration_bracket: (f64, f64),
}

impl Bhc {
    /// Engine with default configuration (α = 0.001).
    pub fn new() -> Self {
        Self {
            alpha: 0.001,
            time_points: None,
            gp_brackets: GpBrackets::default(),
            concentration_bracket: (0.01, 100.0),
        }
    }

    /// Set the Dirichlet-process concentration α.
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set explicit time-point coordinates for the kernel.
    pub fn with_time_points(mut self, time_points: Vec<f64>) -> Self {
        self.time_points = Some(time_points);
        self
    }

    /// Override the GP hyperparameter brackets.
    pub fn with_gp_brackets(mut self, brackets: GpBrackets) -> Self {
        self.gp_brackets = brackets;
        self
    }

    /// Override the multinomial concentration bracket.
    pub fn with_concentration_bracket(mut self, lo: f64, hi: f64) -> Self {
        self.concentration_bracket = (lo, hi);
        self
    }

    /// Cluster the items and return the dendrogram.
    ///
    /// All configuration and input validation happens before any
    /// computation; on error no partial tree is produced.
    pub fn fit(&self, items: &ItemMatrix, mode: Mode) -> Result<ClusterTree> {
        if !(self.alpha > 0.0) || !self.alpha.is_finite() {
            return Err(Error::InvalidHyperparameter {
                name: "alpha",
                value: self.alpha,
                constraint: "must be > 0 and finite",
            });
        }

        match (items, mode) {
            (ItemMatrix::Categorical { values, n_values }, Mode::Multinomial) => {
                self.fit_multinomial(values, *n_values)
            }
            (ItemMatrix::Real { values }, Mode::TimecourseGlobalNoise) => {
                self.fit_timecourse(values, NoiseMode::Global)
            }
            (ItemMatrix::Real { values }, Mode::TimecourseEstimatedNoise) => {
                self.fit_timecourse(values, NoiseMode::Estimated)
            }
            (ItemMatrix::Real { .. }, Mode::Multinomial) => Err(Error::Unsupported {
                reason: "multinomial mode requires categorical items".to_string(),
            }),
            (ItemMatrix::Categorical { .. }, _) => Err(Error::Unsupported {
                reason: "time-course modes require real-valued items".to_string(),
            }),
        }
    }

    fn fit_multinomial(&self, values: &[Vec<usize>], n_values: usize) -> Result<ClusterTree> {
        let (lo, hi) = self.concentration_bracket;
        if !(lo > 0.0) || !(hi > lo) || !hi.is_finite() {
            return Err(Error::InvalidHyperparameter {
                name: "concentration_bracket",
                value: lo,
                constraint: "bracket requires 0 < lo < hi < inf",
            });
        }
        // Validate the input once up front, so a bad matrix is rejected
        // before the concentration search starts running clusterings.
        MultinomialModel::new(values, n_values, lo)?;

        // Choose the global concentration by maximising the dendrogram
        // log evidence over the bracket.
        let mut captured: Option<Error> = None;
        let tol = (hi - lo) * 1e-3;
        let searched = golden_section_min(lo, hi, tol, CONCENTRATION_MAX_ITER, |cc| {
            match self.run_multinomial(values, n_values, cc) {
                Ok((_, log_evidence)) => -log_evidence,
                Err(e) => {
                    captured.get_or_insert(e);
                    f64::INFINITY
                }
            }
        });
        let (concentration, _) = match searched {
            Ok(best) => best,
            Err(e) => return Err(captured.unwrap_or(e)),
        };

        let (nodes, _) = self.run_multinomial(values, n_values, concentration)?;
        Ok(ClusterTree::new(nodes, values.len()))
    }

    fn run_multinomial(
        &self,
        values: &[Vec<usize>],
        n_values: usize,
        concentration: f64,
    ) -> Result<(Vec<crate::tree::MergeNode>, f64)> {
        let mut model = MultinomialModel::new(values, n_values, concentration)?;
        let nodes = driver::run(&mut model, self.alpha)?;
        let log_evidence = nodes
            .last()
            .map(|node| node.log_marginal)
            .unwrap_or(f64::NEG_INFINITY);
        Ok((nodes, log_evidence))
    }

    fn fit_timecourse(&self, values: &[Vec<f64>], noise_mode: NoiseMode) -> Result<ClusterTree> {
        if values.is_empty() {
            return Err(Error::input("no items"));
        }
        let t = values[0].len();
        let times: Vec<f64> = match &self.time_points {
            Some(times) => {
                if times.len() != t {
                    return Err(Error::input(format!(
                        "{} time points supplied for items of length {t}",
                        times.len()
                    )));
                }
                times.clone()
            }
            None => (0..t).map(|i| i as f64).collect(),
        };

        let mut model = TimecourseModel::new(values, &times, noise_mode, self.gp_brackets)?;
        let nodes = driver::run(&mut model, self.alpha)?;
        Ok(ClusterTree::new(nodes, values.len()))
    }
}

impl Default for Bhc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_and_kind_must_match() {
        let real = ItemMatrix::Real {
            values: vec![vec![0.0, 1.0], vec![1.0, 2.0]],
        };
        let cat = ItemMatrix::Categorical {
            values: vec![vec![0], vec![1]],
            n_values: 2,
        };
        assert!(matches!(
            Bhc::new().fit(&real, Mode::Multinomial),
            Err(Error::Unsupported { .. })
        ));
        assert!(matches!(
            Bhc::new().fit(&cat, Mode::TimecourseGlobalNoise),
            Err(Error::Unsupported { .. })
        ));
        assert!(matches!(
            Bhc::new().fit(&cat, Mode::TimecourseEstimatedNoise),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn alpha_is_validated_first() {
        let cat = ItemMatrix::Categorical {
            values: vec![vec![0], vec![1]],
            n_values: 2,
        };
        let err = Bhc::new().with_alpha(0.0).fit(&cat, Mode::Multinomial);
        assert!(matches!(err, Err(Error::InvalidHyperparameter { .. })));
    }

    #[test]
    fn empty_input_is_rejected() {
        let cat = ItemMatrix::Categorical {
            values: vec![],
            n_values: 2,
        };
        assert!(matches!(
            Bhc::new().fit(&cat, Mode::Multinomial),
            Err(Error::InvalidInput { .. })
        ));
    }

    #[test]
    fn bad_concentration_bracket_is_rejected() {
        let cat = ItemMatrix::Categorical {
            values: vec![vec![0], vec![1]],
            n_values: 2,
        };
        let err = Bhc::new()
            .with_concentration_bracket(1.0, 0.5)
            .fit(&cat, Mode::Multinomial);
        assert!(matches!(err, Err(Error::InvalidHyperparameter { .. })));
    }

    #[test]
    fn mismatched_time_points_are_rejected() {
        let real = ItemMatrix::Real {
            values: vec![vec![0.0, 1.0], vec![1.0, 2.0]],
        };
        let err = Bhc::new()
            .with_time_points(vec![0.0, 1.0, 2.0])
            .fit(&real, Mode::TimecourseGlobalNoise);
        assert!(matches!(err, Err(Error::InvalidInput { .. })));
    }
}
