//! HMM read/write controller.
//!
//! The controller predicts, for every (target step, source position) cell, the
//! probability `rho` of reading one more source token before writing. Those
//! probabilities define a monotonic HMM over source positions whose emissions
//! are the alignment scores of the translation model. An E-step on that HMM
//! (forward-backward) gives posterior read/write labels which are then used as
//! soft targets for the controller itself.
//!
//! Shapes:
//! - observations: `(B, Tt, Ts, C)` controller features
//! - emissions: `(Tt, B, Ts)` log-probabilities
//! - controls: `(Tt, B, Ts, 2)` as `[log(rho), log(1 - rho)]`

pub mod forward_backward;
pub mod gate;
pub mod grid;
pub mod transitions;

use candle::{Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::config::ControlsConfig;
pub use forward_backward::{ForwardBackward, Posteriors};
pub use gate::{read_write, GateNetwork};
pub use grid::Grid;
pub use transitions::{Controls, TransitionMatrix};

/// Output of one controller pass.
#[derive(Debug, Clone)]
pub struct ControlsOutput {
    /// `(Tt-1, B, Ts, 2)` predicted read/write log-probabilities, differentiable.
    pub controls: Tensor,
    /// `(Tt, B, Ts)` posterior occupancy, detached.
    pub gamma: Tensor,
    /// `(Tt-1, B, Ts)` soft read labels, detached.
    pub read: Tensor,
    /// `(Tt-1, B, Ts)` soft write labels, detached.
    pub write: Tensor,
    /// `(B)` sequence log-likelihood under the controller HMM, detached.
    pub prior: Tensor,
}

impl ControlsOutput {
    /// Soft binary cross-entropy between the predicted controls and the
    /// posterior labels: `-sum(read * log(rho) + write * log(1 - rho))`.
    pub fn controls_loss(&self) -> Result<Tensor> {
        let log_rho = self.controls.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
        let log_one_minus_rho = self.controls.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?;
        let read = self.read.mul(&log_rho)?;
        let write = self.write.mul(&log_one_minus_rho)?;
        read.add(&write)?.sum_all()?.neg()
    }
}

#[derive(Debug, Clone)]
pub struct HmmControls {
    gate: GateNetwork,
    span: tracing::Span,
    span_e_step: tracing::Span,
}

impl HmmControls {
    pub fn new(cfg: &ControlsConfig, vb: VarBuilder) -> Result<Self> {
        let gate = GateNetwork::new(cfg, vb)?;
        Ok(Self {
            gate,
            span: tracing::span!(tracing::Level::TRACE, "hmm-controls"),
            span_e_step: tracing::span!(tracing::Level::TRACE, "hmm-e-step"),
        })
    }

    pub fn gate(&self) -> &GateNetwork {
        &self.gate
    }

    /// `(B, Tt, Ts, C) -> (B, Tt, Ts, 2)` read/write log-probabilities.
    pub fn predict_read_write(&self, observations: &Tensor) -> Result<Tensor> {
        read_write(&self.gate.forward(observations)?)
    }

    /// Runs the gate, then the E-step on the resulting HMM.
    pub fn forward(&self, observations: &Tensor, emissions: &Tensor) -> Result<ControlsOutput> {
        let _enter = self.span.enter();
        let (b_size, tgt_len, src_len, _) = observations.dims4()?;
        let (e_tgt_len, e_b_size, e_src_len) = emissions.dims3()?;
        if (e_tgt_len, e_b_size, e_src_len) != (tgt_len, b_size, src_len) {
            candle::bail!(
                "emissions (Tt, B, Ts) = {:?} do not match observations (B, Tt, Ts, C) = {:?}",
                emissions.dims(),
                observations.dims()
            )
        }
        let controls = self.predict_read_write(observations)?.permute((1, 0, 2, 3))?;

        // E-step: host copies, no gradient flows through the posteriors.
        let posteriors = {
            let _enter = self.span_e_step.enter();
            let transitions = TransitionMatrix::build(&Controls::from_tensor(&controls)?);
            let emissions = Grid::from_tensor(emissions)?;
            ForwardBackward::new(&emissions, &transitions)?.run()
        };
        if tracing::enabled!(tracing::Level::DEBUG) {
            let mean = posteriors.prior.iter().sum::<f32>() / b_size as f32;
            tracing::debug!(tgt_len, src_len, b_size, mean_log_likelihood = mean, "hmm e-step");
        }

        let device = observations.device();
        Ok(ControlsOutput {
            controls: controls.narrow(0, 0, tgt_len - 1)?,
            gamma: posteriors.gamma.to_tensor(device)?,
            read: posteriors.read.to_tensor(device)?,
            write: posteriors.write.to_tensor(device)?,
            prior: posteriors.prior_tensor(device)?,
        })
    }
}
