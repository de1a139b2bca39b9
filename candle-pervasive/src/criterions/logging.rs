//! Per-step logging statistics and their reduction across data-parallel workers.

use serde::{Deserialize, Serialize};

/// Raw (unnormalised) statistics of one step on one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingOutput {
    pub loss: f64,
    pub nll_loss: f64,
    pub writing_loss: f64,
    pub regul_loss: f64,
    pub ntokens: usize,
    pub nsentences: usize,
    pub sample_size: usize,
}

impl std::ops::Add for LoggingOutput {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            loss: self.loss + rhs.loss,
            nll_loss: self.nll_loss + rhs.nll_loss,
            writing_loss: self.writing_loss + rhs.writing_loss,
            regul_loss: self.regul_loss + rhs.regul_loss,
            ntokens: self.ntokens + rhs.ntokens,
            nsentences: self.nsentences + rhs.nsentences,
            sample_size: self.sample_size + rhs.sample_size,
        }
    }
}

impl std::iter::Sum for LoggingOutput {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, x| acc + x)
    }
}

/// Statistics normalised per token (per sample for `loss`) and reported in bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedLogs {
    pub loss: f64,
    pub nll_loss: f64,
    pub writing_loss: f64,
    pub regul_loss: f64,
    pub ntokens: usize,
    pub nsentences: usize,
    pub sample_size: usize,
}

fn bits_per(total: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        total / count as f64 / std::f64::consts::LN_2
    }
}

/// Sums every worker's statistics first and normalises once, so uneven
/// batch sizes are weighted by their token counts.
pub fn aggregate_logging_outputs(logging_outputs: &[LoggingOutput]) -> AggregatedLogs {
    let total: LoggingOutput = logging_outputs.iter().copied().sum();
    AggregatedLogs {
        loss: bits_per(total.loss, total.sample_size),
        nll_loss: bits_per(total.nll_loss, total.ntokens),
        writing_loss: bits_per(total.writing_loss, total.ntokens),
        regul_loss: bits_per(total.regul_loss, total.ntokens),
        ntokens: total.ntokens,
        nsentences: total.nsentences,
        sample_size: total.sample_size,
    }
}
