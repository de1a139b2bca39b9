//! Training criteria and the contracts they expect from models and batches.

pub mod align_label_smoothed;
pub mod logging;

use candle::{Result, Tensor};

pub use align_label_smoothed::AlignLabelSmoothedCrossEntropy;
pub use logging::{aggregate_logging_outputs, AggregatedLogs, LoggingOutput};

/// What a sequence-to-sequence model returns from its forward pass.
#[derive(Debug, Clone)]
pub struct NetOutput {
    /// `(B, Tt, V)` decoder scores.
    pub logits: Tensor,
    /// `(B, Tt, Ts)` attention over source positions.
    pub attention: Tensor,
}

/// One training batch.
#[derive(Debug, Clone)]
pub struct Sample<I> {
    /// Model inputs, opaque to the criterion.
    pub net_input: I,
    /// `(B, Tt)` target token ids.
    pub target: Tensor,
    /// Number of non-padding target tokens in the batch.
    pub ntokens: usize,
    /// `(B, Tt)` 1-indexed source position aligned with each target token.
    pub contexts: Tensor,
}

/// The parts of a model a criterion needs.
pub trait Seq2SeqModel {
    type Input;

    fn forward(&self, net_input: &Self::Input) -> Result<NetOutput>;

    /// Normalised output distribution, `(B, Tt, V)`.
    fn get_normalized_probs(&self, net_output: &NetOutput, log_probs: bool) -> Result<Tensor>;

    fn get_targets(&self, sample: &Sample<Self::Input>, _net_output: &NetOutput) -> Result<Tensor> {
        Ok(sample.target.clone())
    }
}
