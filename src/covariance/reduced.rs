//! Covariance with a single observation deleted from one block.

use faer::prelude::*;
use faer::Mat;
use ndarray::Array2;

use super::block::BlockCovarianceMatrix;
use super::lu_log_determinant;
use crate::error::{Error, Result};

/// A block covariance with one row/column removed from a chosen block.
///
/// The affected block is rotated to the front, so the layout is "one
/// block of size B−1, then the remaining blocks of size B in ascending
/// original order" (the emptied block disappears entirely when B = 1).
/// Replicates within a block are exchangeable, so which row of the
/// block was deleted never matters.
///
/// The log-determinant and the T×T core factorisation are computed once
/// at construction; [`quadratic_form`](Self::quadratic_form) then costs
/// one dense T×T multiply per vector, which is what makes the
/// leave-one-observation-out sweep affordable.
#[derive(Debug, Clone)]
pub struct ReducedCovarianceMatrix {
    /// Retained block sizes, front block first.
    block_sizes: Vec<usize>,
    /// Permuted noise-free coefficients over the retained blocks.
    noise_free: Array2<f64>,
    /// Permuted noisy coefficients.
    noisy: Vec<f64>,
    /// Cached log det.
    log_det: f64,
    /// (I + W·A)⁻¹ with W = diag(b_i / noisy[i]).
    inv_core: Mat<f64>,
}

impl ReducedCovarianceMatrix {
    pub(super) fn from_block(cov: &BlockCovarianceMatrix, block: usize) -> Result<Self> {
        let t = cov.n_rank();
        let b = cov.block_size();

        // Rotate `block` to the front, keep the rest in order, and drop
        // the front block if deleting its only row emptied it.
        let order: Vec<usize> = std::iter::once(block)
            .chain((0..t).filter(|&i| i != block))
            .collect();
        let sizes: Vec<usize> = order
            .iter()
            .enumerate()
            .map(|(pos, _)| if pos == 0 { b - 1 } else { b })
            .collect();
        let retained: Vec<usize> = (0..t).filter(|&pos| sizes[pos] > 0).collect();

        let tr = retained.len();
        let mut noise_free = Array2::zeros((tr, tr));
        let mut noisy = Vec::with_capacity(tr);
        let mut block_sizes = Vec::with_capacity(tr);
        for (ri, &pos_i) in retained.iter().enumerate() {
            let src_i = order[pos_i];
            let d = cov.noisy_coeff(src_i);
            if !(d > 0.0) {
                return Err(Error::numeric(format!(
                    "non-positive noisy coefficient {d} at block {src_i} in reduced covariance"
                )));
            }
            noisy.push(d);
            block_sizes.push(sizes[pos_i]);
            for (rj, &pos_j) in retained.iter().enumerate() {
                noise_free[[ri, rj]] = cov.noise_free_coeff(src_i, order[pos_j]);
            }
        }

        // log det = Σ (b_i − 1)·ln d_i + log det G,
        // G[i][j] = b_j·a_ij + δ_ij·d_i.
        let mut log_det = 0.0;
        let mut g = Mat::<f64>::zeros(tr, tr);
        for i in 0..tr {
            log_det += (block_sizes[i] as f64 - 1.0) * noisy[i].ln();
            for j in 0..tr {
                g[(i, j)] = block_sizes[j] as f64 * noise_free[[i, j]];
            }
            g[(i, i)] += noisy[i];
        }
        log_det += lu_log_determinant(&g, "reduced covariance")?;

        // Core system (I + W·A) for the quadratic form, inverted once.
        let mut core = Mat::<f64>::zeros(tr, tr);
        let mut identity = Mat::<f64>::zeros(tr, tr);
        for i in 0..tr {
            let w = block_sizes[i] as f64 / noisy[i];
            for j in 0..tr {
                core[(i, j)] = w * noise_free[[i, j]];
            }
            core[(i, i)] += 1.0;
            identity[(i, i)] = 1.0;
        }
        let inv_core = core.full_piv_lu().solve(&identity);

        Ok(Self {
            block_sizes,
            noise_free,
            noisy,
            log_det,
            inv_core,
        })
    }

    /// Dimension of the reduced matrix (T·B − 1).
    pub fn dim(&self) -> usize {
        self.block_sizes.iter().sum()
    }

    /// log det of the reduced matrix.
    pub fn log_determinant(&self) -> f64 {
        self.log_det
    }

    /// The quadratic form y·M⁻¹·y over the reduced matrix.
    ///
    /// Solves the T×T system `(I + W·A) z = w` with `w_i = s_i/noisy[i]`
    /// (s_i the group sums of y), then
    ///
    /// ```text
    /// y·M⁻¹·y = Σ_i ‖y_i‖²/noisy[i] − Σ_i (s_i/noisy[i])·(A·z)_i
    /// ```
    ///
    /// using the factorisation cached at construction.
    pub fn quadratic_form(&self, y: &[f64]) -> Result<f64> {
        if y.len() != self.dim() {
            return Err(Error::input(format!(
                "vector length {} does not match reduced dimension {}",
                y.len(),
                self.dim()
            )));
        }
        let tr = self.block_sizes.len();

        let mut acc = 0.0;
        let mut w = vec![0.0; tr];
        let mut sums = vec![0.0; tr];
        let mut offset = 0;
        for i in 0..tr {
            let group = &y[offset..offset + self.block_sizes[i]];
            offset += self.block_sizes[i];
            let sum: f64 = group.iter().sum();
            let sum_sq: f64 = group.iter().map(|v| v * v).sum();
            sums[i] = sum;
            w[i] = sum / self.noisy[i];
            acc += sum_sq / self.noisy[i];
        }

        // z = (I + W·A)⁻¹ w, then subtract Σ w_i·(A·z)_i.
        let mut z = vec![0.0; tr];
        for i in 0..tr {
            let mut v = 0.0;
            for j in 0..tr {
                v += self.inv_core[(i, j)] * w[j];
            }
            z[i] = v;
        }
        for i in 0..tr {
            let mut az = 0.0;
            for j in 0..tr {
                az += self.noise_free[[i, j]] * z[j];
            }
            acc -= w[i] * az;
        }

        if !acc.is_finite() {
            return Err(Error::numeric(
                "non-finite quadratic form in reduced covariance".to_string(),
            ));
        }
        Ok(acc)
    }

}
