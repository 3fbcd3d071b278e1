//! Full block-structured covariance matrix.

use faer::prelude::*;
use faer::Mat;
use ndarray::Array2;

use super::reduced::ReducedCovarianceMatrix;
use super::lu_log_determinant;
use crate::error::{Error, Result};

/// A (T·B)×(T·B) covariance matrix stored as T×T block coefficients.
///
/// Block (i, j) equals `noise_free[i][j] · J_B`, plus `noisy[i] · I_B`
/// on the diagonal blocks. T is the *rank* of the representation (the
/// number of time points) and B the block size (the number of
/// replicates sharing each time point).
#[derive(Debug, Clone)]
pub struct BlockCovarianceMatrix {
    /// Number of blocks per side (T).
    n_rank: usize,
    /// Rows per block (B).
    block_size: usize,
    /// Noise-free coefficient per block pair (T×T, symmetric).
    noise_free: Array2<f64>,
    /// Noisy coefficient per diagonal block (length T).
    noisy: Vec<f64>,
}

impl BlockCovarianceMatrix {
    /// Build from a squared-exponential kernel over the time points.
    ///
    /// `noise_free[i][j] = s_f · exp(−(t_i − t_j)² / (2ℓ²))`; the noisy
    /// coefficients start at zero.
    ///
    /// # Errors
    ///
    /// `InvalidHyperparameter` for a non-positive length-scale or
    /// signal scale, or a zero block size / empty time grid.
    pub fn squared_exponential(
        time_points: &[f64],
        block_size: usize,
        length_scale: f64,
        noise_free_scale: f64,
    ) -> Result<Self> {
        if !(length_scale > 0.0) {
            return Err(Error::InvalidHyperparameter {
                name: "length_scale",
                value: length_scale,
                constraint: "must be > 0",
            });
        }
        if !(noise_free_scale > 0.0) {
            return Err(Error::InvalidHyperparameter {
                name: "noise_free_scale",
                value: noise_free_scale,
                constraint: "must be > 0",
            });
        }
        if block_size == 0 {
            return Err(Error::InvalidHyperparameter {
                name: "block_size",
                value: 0.0,
                constraint: "must be >= 1",
            });
        }
        let t = time_points.len();
        if t == 0 {
            return Err(Error::input("empty time grid"));
        }

        let denom = 2.0 * length_scale * length_scale;
        let mut noise_free = Array2::zeros((t, t));
        for i in 0..t {
            for j in 0..t {
                let dt = time_points[i] - time_points[j];
                noise_free[[i, j]] = noise_free_scale * (-(dt * dt) / denom).exp();
            }
        }

        Ok(Self {
            n_rank: t,
            block_size,
            noise_free,
            noisy: vec![0.0; t],
        })
    }

    /// Add a constant observation-noise variance to every diagonal
    /// block.
    pub fn add_noise(&mut self, variance: f64) {
        for d in &mut self.noisy {
            *d += variance;
        }
    }

    /// Add a per-time-point noise variance (estimated-noise mode).
    ///
    /// `variances` must have one entry per block.
    pub fn add_noise_per_block(&mut self, variances: &[f64]) -> Result<()> {
        if variances.len() != self.n_rank {
            return Err(Error::input(format!(
                "expected {} per-block variances, got {}",
                self.n_rank,
                variances.len()
            )));
        }
        for (d, &v) in self.noisy.iter_mut().zip(variances) {
            *d += v;
        }
        Ok(())
    }

    /// Number of blocks per side (T).
    pub fn n_rank(&self) -> usize {
        self.n_rank
    }

    /// Rows per block (B).
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Full dimension T·B.
    pub fn dim(&self) -> usize {
        self.n_rank * self.block_size
    }

    pub(crate) fn noise_free_coeff(&self, i: usize, j: usize) -> f64 {
        self.noise_free[[i, j]]
    }

    pub(crate) fn noisy_coeff(&self, i: usize) -> f64 {
        self.noisy[i]
    }

    /// The T×T rank matrix `R[i][j] = B·noise_free[i][j] + δ_ij·noisy[i]`.
    ///
    /// Its determinant, together with the (B−1)-fold repeated
    /// eigenvalues `noisy[i]` of each diagonal block, determines the
    /// full determinant.
    fn rank_matrix(&self) -> Mat<f64> {
        let t = self.n_rank;
        let b = self.block_size as f64;
        let mut r = Mat::<f64>::zeros(t, t);
        for i in 0..t {
            for j in 0..t {
                r[(i, j)] = b * self.noise_free[[i, j]];
            }
            r[(i, i)] += self.noisy[i];
        }
        r
    }

    /// log det K.
    ///
    /// `Σ_i (B−1)·ln(noisy[i]) + log det R`. Fails with
    /// `NumericFailure` when a diagonal coefficient is non-positive
    /// (with B > 1) or the rank matrix is singular.
    pub fn log_determinant(&self) -> Result<f64> {
        let mut log_det = 0.0;
        if self.block_size > 1 {
            let repeats = (self.block_size - 1) as f64;
            for (i, &d) in self.noisy.iter().enumerate() {
                if !(d > 0.0) {
                    return Err(Error::numeric(format!(
                        "non-positive noisy coefficient {d} at block {i}"
                    )));
                }
                log_det += repeats * d.ln();
            }
        }
        log_det += lu_log_determinant(&self.rank_matrix(), "block covariance")?;
        Ok(log_det)
    }

    /// The quadratic form y·K⁻¹·y.
    ///
    /// Partition y into T groups of B. With ȳ_i the group means and
    /// ḡ_i = B·ȳ_i the group sums,
    ///
    /// ```text
    /// y·K⁻¹·y = Σ_i (‖y_i‖² − B·ȳ_i²)/noisy[i] + (ḡ·R⁻¹·ḡ)/B
    /// ```
    ///
    /// The residual-within-group term vanishes identically for B = 1.
    pub fn quadratic_form(&self, y: &[f64]) -> Result<f64> {
        let t = self.n_rank;
        let b = self.block_size;
        if y.len() != t * b {
            return Err(Error::input(format!(
                "vector length {} does not match covariance dimension {}",
                y.len(),
                t * b
            )));
        }

        let mut acc = 0.0;
        let mut group_sums = Mat::<f64>::zeros(t, 1);
        for i in 0..t {
            let group = &y[i * b..(i + 1) * b];
            let sum: f64 = group.iter().sum();
            group_sums[(i, 0)] = sum;
            if b > 1 {
                let d = self.noisy[i];
                if !(d > 0.0) {
                    return Err(Error::numeric(format!(
                        "non-positive noisy coefficient {d} at block {i}"
                    )));
                }
                let sum_sq: f64 = group.iter().map(|v| v * v).sum();
                acc += (sum_sq - sum * sum / b as f64) / d;
            }
        }

        let solved = self.rank_matrix().full_piv_lu().solve(&group_sums);
        let mut rank_term = 0.0;
        for i in 0..t {
            rank_term += group_sums[(i, 0)] * solved[(i, 0)];
        }
        acc += rank_term / b as f64;

        if !acc.is_finite() {
            return Err(Error::numeric("non-finite quadratic form".to_string()));
        }
        Ok(acc)
    }

    /// The covariance with a single row/column deleted from `block`.
    ///
    /// The deleted block is rotated to the front, so the reduced
    /// structure is "one block of size B−1, then the remaining blocks in
    /// ascending original order". Determinant and factorisation happen
    /// once at construction so the result can be reused across all
    /// replicates of the block.
    pub fn missing_observation(&self, block: usize) -> Result<ReducedCovarianceMatrix> {
        if block >= self.n_rank {
            return Err(Error::input(format!(
                "block {block} out of range for rank {}",
                self.n_rank
            )));
        }
        ReducedCovarianceMatrix::from_block(self, block)
    }

    /// Assemble the dense matrix (reference implementation for tests).
    #[cfg(test)]
    pub(crate) fn dense(&self) -> Mat<f64> {
        let n = self.dim();
        let b = self.block_size;
        let mut m = Mat::<f64>::zeros(n, n);
        for r in 0..n {
            for c in 0..n {
                let (bi, bj) = (r / b, c / b);
                m[(r, c)] = self.noise_free[[bi, bj]];
                if r == c {
                    m[(r, c)] += self.noisy[bi];
                }
            }
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::prelude::*;
    use rand_distr::{Distribution, Normal};

    fn dense_log_determinant(m: &Mat<f64>) -> f64 {
        lu_log_determinant(m, "dense reference").unwrap()
    }

    fn dense_quadratic_form(m: &Mat<f64>, y: &[f64]) -> f64 {
        let n = y.len();
        let mut rhs = Mat::<f64>::zeros(n, 1);
        for (i, &v) in y.iter().enumerate() {
            rhs[(i, 0)] = v;
        }
        let x = m.full_piv_lu().solve(&rhs);
        (0..n).map(|i| y[i] * x[(i, 0)]).sum()
    }

    fn random_matrix(rng: &mut StdRng, t: usize, b: usize) -> BlockCovarianceMatrix {
        let times: Vec<f64> = (0..t).map(|i| i as f64 + rng.random_range(-0.2..0.2)).collect();
        let mut cov = BlockCovarianceMatrix::squared_exponential(
            &times,
            b,
            rng.random_range(0.5..3.0),
            rng.random_range(0.5..2.0),
        )
        .unwrap();
        cov.add_noise(rng.random_range(0.1..0.5));
        cov
    }

    #[test]
    fn kernel_construction_shapes() {
        let cov =
            BlockCovarianceMatrix::squared_exponential(&[0.0, 1.0, 2.0], 4, 1.0, 2.0).unwrap();
        assert_eq!(cov.n_rank(), 3);
        assert_eq!(cov.block_size(), 4);
        assert_eq!(cov.dim(), 12);
        // Diagonal coefficient equals the signal scale; off-diagonal decays.
        assert_abs_diff_eq!(cov.noise_free_coeff(0, 0), 2.0, epsilon = 1e-12);
        assert!(cov.noise_free_coeff(0, 2) < cov.noise_free_coeff(0, 1));
    }

    #[test]
    fn rejects_bad_hyperparameters() {
        assert!(BlockCovarianceMatrix::squared_exponential(&[0.0, 1.0], 2, 0.0, 1.0).is_err());
        assert!(BlockCovarianceMatrix::squared_exponential(&[0.0, 1.0], 2, 1.0, -1.0).is_err());
        assert!(BlockCovarianceMatrix::squared_exponential(&[0.0, 1.0], 0, 1.0, 1.0).is_err());
    }

    #[test]
    fn log_determinant_matches_dense_reference() {
        let mut rng = StdRng::seed_from_u64(42);
        for &(t, b) in &[(2usize, 2usize), (3, 1), (4, 4), (8, 8), (5, 3)] {
            let cov = random_matrix(&mut rng, t, b);
            let dense = cov.dense();
            assert_abs_diff_eq!(
                cov.log_determinant().unwrap(),
                dense_log_determinant(&dense),
                epsilon = 1e-8
            );
        }
    }

    #[test]
    fn quadratic_form_matches_dense_reference() {
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(0.0, 1.0).unwrap();
        for &(t, b) in &[(2usize, 2usize), (3, 1), (4, 4), (8, 8), (5, 3)] {
            let cov = random_matrix(&mut rng, t, b);
            let y: Vec<f64> = (0..cov.dim()).map(|_| normal.sample(&mut rng)).collect();
            let dense = cov.dense();
            assert_abs_diff_eq!(
                cov.quadratic_form(&y).unwrap(),
                dense_quadratic_form(&dense, &y),
                epsilon = 1e-8
            );
        }
    }

    #[test]
    fn per_block_noise_matches_dense_reference() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut cov =
            BlockCovarianceMatrix::squared_exponential(&[0.0, 1.0, 2.0, 3.0], 3, 1.5, 1.0)
                .unwrap();
        cov.add_noise_per_block(&[0.1, 0.4, 0.2, 0.3]).unwrap();
        let dense = cov.dense();
        assert_abs_diff_eq!(
            cov.log_determinant().unwrap(),
            dense_log_determinant(&dense),
            epsilon = 1e-8
        );
        let y: Vec<f64> = (0..cov.dim()).map(|_| rng.random_range(-1.0..1.0)).collect();
        assert_abs_diff_eq!(
            cov.quadratic_form(&y).unwrap(),
            dense_quadratic_form(&dense, &y),
            epsilon = 1e-8
        );
        // A mismatched variance vector is rejected.
        assert!(cov.add_noise_per_block(&[0.1, 0.2]).is_err());
    }

    #[test]
    fn noiseless_repeated_blocks_are_singular() {
        // B > 1 with zero noise: replicates are perfectly correlated and
        // the matrix is rank deficient.
        let cov = BlockCovarianceMatrix::squared_exponential(&[0.0, 1.0], 2, 1.0, 1.0).unwrap();
        assert!(cov.log_determinant().is_err());
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut cov =
            BlockCovarianceMatrix::squared_exponential(&[0.0, 1.0], 2, 1.0, 1.0).unwrap();
        cov.add_noise(0.3);
        assert!(cov.quadratic_form(&[1.0, 2.0, 3.0]).is_err());
    }
}
