//! Forward-backward (Baum-Welch E-step) over the monotonic alignment lattice.
//!
//! Hidden states are source positions, time steps are target positions.
//! Emissions are `(Tt, B, Ts)` log-probabilities, transitions come from
//! [`TransitionMatrix`]. Everything stays in log space until the posteriors
//! are normalised by the sequence log-likelihood.

use candle::{Device, Result, Tensor};

use super::grid::Grid;
use super::transitions::TransitionMatrix;
use crate::utils::{exp_normalized, log_add, log_sum_exp, log_sum_exp_iter};

/// Posterior statistics for one batch.
#[derive(Debug, Clone)]
pub struct Posteriors {
    /// `(Tt, B, Ts)` forward log-probabilities.
    pub alpha: Grid<3>,
    /// `(Tt, B, Ts)` backward log-probabilities.
    pub beta: Grid<3>,
    /// `(B)` sequence log-likelihood.
    pub prior: Vec<f32>,
    /// `(Tt, B, Ts)` state occupancy.
    pub gamma: Grid<3>,
    /// `(Tt-1, B, Ts, Ts)` transition posteriors.
    pub ksi: Grid<4>,
    /// `(Tt-1, B, Ts)` mass of transitions that read past each position.
    pub read: Grid<3>,
    /// `(Tt-1, B, Ts)` occupancy at the next step, `gamma[1..]`.
    pub write: Grid<3>,
}

impl Posteriors {
    pub fn prior_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::new(self.prior.as_slice(), device)
    }
}

#[derive(Debug, Clone)]
pub struct ForwardBackward<'a> {
    emissions: &'a Grid<3>,
    transitions: &'a TransitionMatrix,
}

impl<'a> ForwardBackward<'a> {
    pub fn new(emissions: &'a Grid<3>, transitions: &'a TransitionMatrix) -> Result<Self> {
        let [tgt_len, b_size, src_len] = emissions.dims();
        if transitions.dims() != (tgt_len, b_size, src_len) {
            candle::bail!(
                "emissions {:?} do not match transitions over (Tt, B, Ts) = {:?}",
                emissions.dims(),
                transitions.dims()
            )
        }
        if tgt_len == 0 || b_size == 0 || src_len == 0 {
            candle::bail!("emissions have an empty axis: {:?}", emissions.dims())
        }
        Ok(Self {
            emissions,
            transitions,
        })
    }

    fn dims(&self) -> [usize; 3] {
        self.emissions.dims()
    }

    /// `alpha[0] = e[0] + log(1/Ts)`,
    /// `alpha[t][j] = lse_k(alpha[t-1][k] + M[t-1][k][j]) + e[t][j]`.
    pub fn alpha(&self) -> Grid<3> {
        let [tgt_len, b_size, src_len] = self.dims();
        let mut alpha = Grid::neg_inf([tgt_len, b_size, src_len]);
        let initial = -(src_len as f32).ln();
        for b in 0..b_size {
            for j in 0..src_len {
                alpha.set([0, b, j], self.emissions.get([0, b, j]) + initial);
            }
        }
        for t in 1..tgt_len {
            for b in 0..b_size {
                for j in 0..src_len {
                    // M[t-1][k][j] is -inf for k > j.
                    let incoming = (0..=j).fold(f32::NEG_INFINITY, |acc, k| {
                        let step = alpha.get([t - 1, b, k]) + self.transitions.get(t - 1, b, k, j);
                        log_add(acc, step)
                    });
                    let value = incoming + self.emissions.get([t, b, j]);
                    alpha.set([t, b, j], value);
                }
            }
        }
        alpha
    }

    /// `beta[Tt-1] = 0`,
    /// `beta[t][k] = lse_j(M[t][k][j] + beta[t+1][j] + e[t+1][j])`.
    pub fn beta(&self) -> Grid<3> {
        let [tgt_len, b_size, src_len] = self.dims();
        let mut beta = Grid::neg_inf([tgt_len, b_size, src_len]);
        for b in 0..b_size {
            beta.row_mut(&[tgt_len - 1, b]).fill(0.0);
        }
        for t in (0..tgt_len - 1).rev() {
            for b in 0..b_size {
                for k in 0..src_len {
                    let outgoing = (k..src_len).map(|j| {
                        self.transitions.get(t, b, k, j)
                            + beta.get([t + 1, b, j])
                            + self.emissions.get([t + 1, b, j])
                    });
                    let value = log_sum_exp_iter(outgoing);
                    beta.set([t, b, k], value);
                }
            }
        }
        beta
    }

    /// Runs both recursions and derives every posterior.
    pub fn run(&self) -> Posteriors {
        let [tgt_len, b_size, src_len] = self.dims();
        let alpha = self.alpha();
        let beta = self.beta();
        let prior: Vec<f32> = (0..b_size)
            .map(|b| log_sum_exp(alpha.row(&[tgt_len - 1, b])))
            .collect();

        let mut gamma = Grid::full([tgt_len, b_size, src_len], 0.0);
        for t in 0..tgt_len {
            for b in 0..b_size {
                for j in 0..src_len {
                    let log_post = alpha.get([t, b, j]) + beta.get([t, b, j]);
                    gamma.set([t, b, j], exp_normalized(log_post, prior[b]));
                }
            }
        }

        let steps = tgt_len - 1;
        let mut ksi = Grid::full([steps, b_size, src_len, src_len], 0.0);
        for t in 0..steps {
            for b in 0..b_size {
                for k in 0..src_len {
                    for j in k..src_len {
                        let log_post = alpha.get([t, b, k])
                            + beta.get([t + 1, b, j])
                            + self.emissions.get([t + 1, b, j])
                            + self.transitions.get(t, b, k, j);
                        ksi.set([t, b, k, j], exp_normalized(log_post, prior[b]));
                    }
                }
            }
        }

        let write = write_labels(&gamma);
        let read = read_labels(&ksi);
        Posteriors {
            alpha,
            beta,
            prior,
            gamma,
            ksi,
            read,
            write,
        }
    }
}

/// `write[t] = gamma[t + 1]`.
pub fn write_labels(gamma: &Grid<3>) -> Grid<3> {
    let [tgt_len, b_size, src_len] = gamma.dims();
    let mut write = Grid::full([tgt_len.saturating_sub(1), b_size, src_len], 0.0);
    for t in 1..tgt_len {
        for b in 0..b_size {
            write.row_mut(&[t - 1, b]).copy_from_slice(gamma.row(&[t, b]));
        }
    }
    write
}

/// `read[t][j] = sum_{k <= j} sum_{j' > j} ksi[t][k][j']`: the posterior mass of
/// transitions leaving a position at or before `j` for one strictly after it.
pub fn read_labels(ksi: &Grid<4>) -> Grid<3> {
    let [steps, b_size, src_len, _] = ksi.dims();
    let mut read = Grid::full([steps, b_size, src_len], 0.0);
    // leaving[k][j] = sum_{j' > j} ksi[t][k][j'], built right to left.
    let mut leaving = Grid::full([src_len, src_len], 0.0);
    for t in 0..steps {
        for b in 0..b_size {
            for k in 0..src_len {
                let row = ksi.row(&[t, b, k]);
                let suffix = leaving.row_mut(&[k]);
                if let Some(last) = suffix.last_mut() {
                    *last = 0.0;
                }
                for j in (0..src_len.saturating_sub(1)).rev() {
                    suffix[j] = suffix[j + 1] + row[j + 1];
                }
            }
            for j in 0..src_len {
                let mass = (0..=j).map(|k| leaving.get([k, j])).sum::<f32>();
                read.set([t, b, j], mass);
            }
        }
    }
    read
}
