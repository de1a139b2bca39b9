//! Read/write controls and the monotonic transition matrix built from them.
//!
//! Controls are stored time-major as `(Tt, B, Ts, 2)` with `[log_rho, log(1-rho)]`
//! in the last axis. Moving from source position `k` to `j >= k` means reading
//! every position in `k..j` and then writing at `j`:
//!
//! `M[t, b, k, j] = log(1 - rho[j]) + sum_{l=k}^{j-1} log(rho[l])`

use candle::{Result, Tensor};

use super::grid::Grid;

pub const READ: usize = 0;
pub const WRITE: usize = 1;

/// Read/write log-probabilities on the `(Tt, B, Ts)` lattice.
#[derive(Debug, Clone, PartialEq)]
pub struct Controls {
    grid: Grid<4>,
}

impl Controls {
    pub fn new(grid: Grid<4>) -> Result<Self> {
        let [tgt_len, b_size, src_len, pair] = grid.dims();
        if pair != 2 {
            candle::bail!("controls must end with a read/write pair, got shape {:?}", grid.dims())
        }
        if tgt_len == 0 || b_size == 0 || src_len == 0 {
            candle::bail!("controls have an empty axis: {:?}", grid.dims())
        }
        Ok(Self { grid })
    }

    /// Copies `(Tt, B, Ts, 2)` controls off the autograd graph.
    pub fn from_tensor(controls: &Tensor) -> Result<Self> {
        Self::new(Grid::from_tensor(controls)?)
    }

    /// `(Tt, B, Ts)`
    pub fn dims(&self) -> (usize, usize, usize) {
        let [tgt_len, b_size, src_len, _] = self.grid.dims();
        (tgt_len, b_size, src_len)
    }

    #[inline]
    pub fn log_read(&self, t: usize, b: usize, j: usize) -> f32 {
        self.grid.get([t, b, j, READ])
    }

    #[inline]
    pub fn log_write(&self, t: usize, b: usize, j: usize) -> f32 {
        self.grid.get([t, b, j, WRITE])
    }

    /// A copy where the last source position can only write (`rho = 0`), which
    /// makes it absorbing. `self` is left untouched.
    pub fn with_absorbing_boundary(&self) -> Self {
        let (tgt_len, b_size, src_len) = self.dims();
        let mut grid = self.grid.clone();
        for t in 0..tgt_len {
            for b in 0..b_size {
                grid.set([t, b, src_len - 1, READ], f32::NEG_INFINITY);
                grid.set([t, b, src_len - 1, WRITE], 0.0);
            }
        }
        Self { grid }
    }
}

/// Log transition matrix `(Tt, B, Ts_from, Ts_to)`, upper triangular in the
/// last two axes; the lower triangle stays at `-inf`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionMatrix {
    grid: Grid<4>,
}

impl TransitionMatrix {
    /// Builds `M` from raw controls, applying the absorbing boundary on a copy.
    pub fn build(controls: &Controls) -> Self {
        let controls = controls.with_absorbing_boundary();
        let (tgt_len, b_size, src_len) = controls.dims();
        let mut grid = Grid::neg_inf([tgt_len, b_size, src_len, src_len]);
        for t in 0..tgt_len {
            for b in 0..b_size {
                for k in 0..src_len {
                    // Running sum of log(rho) over k..j.
                    let mut reads = 0f32;
                    let row = grid.row_mut(&[t, b, k]);
                    for (j, cell) in row.iter_mut().enumerate().skip(k) {
                        *cell = controls.log_write(t, b, j) + reads;
                        reads += controls.log_read(t, b, j);
                    }
                }
            }
        }
        Self { grid }
    }

    /// `(Tt, B, Ts)`
    pub fn dims(&self) -> (usize, usize, usize) {
        let [tgt_len, b_size, src_len, _] = self.grid.dims();
        (tgt_len, b_size, src_len)
    }

    #[inline]
    pub fn get(&self, t: usize, b: usize, from: usize, to: usize) -> f32 {
        self.grid.get([t, b, from, to])
    }

    /// All outgoing log-probabilities from `from` at step `t`.
    pub fn row(&self, t: usize, b: usize, from: usize) -> &[f32] {
        self.grid.row(&[t, b, from])
    }

    pub fn to_tensor(&self, device: &candle::Device) -> Result<Tensor> {
        self.grid.to_tensor(device)
    }
}
