//! Label-smoothed cross-entropy with an alignment regulariser.
//!
//! `loss = (1 - eps) * nll + eps / V * smooth + alpha * align`
//!
//! where `smooth` is the negative sum of all log-probabilities of a position and
//! `align` is the negative log attention on the reference source position.
//! Every term only counts target positions that are not padding.

use candle::{DType, Result, Tensor, D};

use super::{LoggingOutput, Sample, Seq2SeqModel};
use crate::config::CriterionConfig;

/// Floor added to attention weights before taking the log.
pub const ATTENTION_EPS: f64 = 1e-5;

fn item(t: &Tensor) -> Result<f64> {
    t.to_dtype(DType::F64)?.to_scalar::<f64>()
}

#[derive(Debug, Clone)]
pub struct AlignLabelSmoothedCrossEntropy {
    eps: f64,
    alpha: f64,
    sentence_avg: bool,
    padding_idx: u32,
    span: tracing::Span,
}

impl AlignLabelSmoothedCrossEntropy {
    pub fn new(cfg: &CriterionConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            eps: cfg.label_smoothing,
            alpha: cfg.regul_align_scale,
            sentence_avg: cfg.sentence_avg,
            padding_idx: cfg.padding_idx,
            span: tracing::span!(tracing::Level::TRACE, "align-label-smoothed-ce"),
        })
    }

    /// Computes the loss for one batch.
    ///
    /// Returns the loss tensor (still attached to the graph), the sample size
    /// used as the gradient denominator, and the statistics to log.
    pub fn forward<M: Seq2SeqModel>(
        &self,
        model: &M,
        sample: &Sample<M::Input>,
    ) -> Result<(Tensor, usize, LoggingOutput)> {
        let _enter = self.span.enter();
        let net_output = model.forward(&sample.net_input)?;
        let lprobs = model.get_normalized_probs(&net_output, true)?;
        let target = model.get_targets(sample, &net_output)?;
        let (writing_loss, nll_loss) = self.compute_loss(&lprobs, &target, true)?;
        let align_loss =
            self.compute_alignment_loss(&net_output.attention, &sample.contexts, &target)?;
        let loss = writing_loss.add(&align_loss.affine(self.alpha, 0.)?)?;

        let nsentences = sample.target.dim(0)?;
        let sample_size = if self.sentence_avg {
            nsentences
        } else {
            sample.ntokens
        };
        let logging_output = LoggingOutput {
            loss: item(&loss)?,
            nll_loss: item(&nll_loss)?,
            writing_loss: item(&writing_loss)?,
            regul_loss: item(&align_loss)?,
            ntokens: sample.ntokens,
            nsentences,
            sample_size,
        };
        tracing::debug!(?logging_output, "criterion step");
        Ok((loss, sample_size, logging_output))
    }

    /// Label-smoothed token loss.
    ///
    /// `lprobs` is `(..., V)` and `target` holds the matching `(...)` ids. With
    /// `reduce` both returned tensors are scalars, otherwise they are `(N, 1)`
    /// per-position values with padding positions set to zero.
    pub fn compute_loss(
        &self,
        lprobs: &Tensor,
        target: &Tensor,
        reduce: bool,
    ) -> Result<(Tensor, Tensor)> {
        let vocab_size = lprobs.dim(D::Minus1)?;
        let lprobs = lprobs.reshape(((), vocab_size))?;
        let target = target.flatten_all()?.unsqueeze(1)?;
        if target.dim(0)? != lprobs.dim(0)? {
            candle::bail!(
                "{} targets for {} output positions",
                target.dim(0)?,
                lprobs.dim(0)?
            )
        }
        let non_pad_mask = target.ne(self.padding_idx)?;
        let zeros = Tensor::zeros((lprobs.dim(0)?, 1), lprobs.dtype(), lprobs.device())?;

        let nll_loss = lprobs.gather(&target.to_dtype(DType::U32)?, 1)?.neg()?;
        let nll_loss = non_pad_mask.where_cond(&nll_loss, &zeros)?;
        let (nll_loss, loss) = if self.eps == 0. {
            let nll_loss = if reduce { nll_loss.sum_all()? } else { nll_loss };
            (nll_loss.clone(), nll_loss)
        } else {
            let smooth_loss = lprobs.sum_keepdim(1)?.neg()?;
            let smooth_loss = non_pad_mask.where_cond(&smooth_loss, &zeros)?;
            let (nll_loss, smooth_loss) = if reduce {
                (nll_loss.sum_all()?, smooth_loss.sum_all()?)
            } else {
                (nll_loss, smooth_loss)
            };
            let eps_i = self.eps / vocab_size as f64;
            let loss = nll_loss
                .affine(1. - self.eps, 0.)?
                .add(&smooth_loss.affine(eps_i, 0.)?)?;
            (nll_loss, loss)
        };
        Ok((loss, nll_loss))
    }

    /// Summed `-log(attention + 1e-5)` at the reference source position of every
    /// non-padding target token.
    ///
    /// `attention` is `(B, Tt, Ts)`, `contexts` and `target` are `(B, Tt)` with
    /// 1-indexed source positions in `contexts`.
    pub fn compute_alignment_loss(
        &self,
        attention: &Tensor,
        contexts: &Tensor,
        target: &Tensor,
    ) -> Result<Tensor> {
        let (b_size, tgt_len, src_len) = attention.dims3()?;
        if contexts.dims() != [b_size, tgt_len] || target.dims() != [b_size, tgt_len] {
            candle::bail!(
                "attention {:?} does not match contexts {:?} / targets {:?}",
                attention.dims(),
                contexts.dims(),
                target.dims()
            )
        }
        let labels = contexts.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
        let ids = target.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
        let mut index = Vec::with_capacity(labels.len());
        for (pos, (&label, &id)) in labels.iter().zip(ids.iter()).enumerate() {
            if id == self.padding_idx as i64 {
                index.push(0u32);
            } else if label < 1 || label > src_len as i64 {
                candle::bail!(
                    "alignment label {label} at position {pos} is outside 1..={src_len}"
                )
            } else {
                index.push((label - 1) as u32);
            }
        }
        let n = b_size * tgt_len;
        let index = Tensor::from_vec(index, (n, 1), attention.device())?;
        let non_pad_mask = target.flatten_all()?.unsqueeze(1)?.ne(self.padding_idx)?;

        let neg_log_attention = attention
            .affine(1., ATTENTION_EPS)?
            .log()?
            .neg()?
            .reshape((n, src_len))?;
        let loss = neg_log_attention.gather(&index, 1)?;
        let zeros = loss.zeros_like()?;
        non_pad_mask.where_cond(&loss, &zeros)?.sum_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    fn criterion(eps: f64) -> AlignLabelSmoothedCrossEntropy {
        let cfg = CriterionConfig {
            label_smoothing: eps,
            ..Default::default()
        };
        AlignLabelSmoothedCrossEntropy::new(&cfg).unwrap()
    }

    #[test]
    fn test_nll_ignores_padding() -> Result<()> {
        let dev = Device::Cpu;
        let lprobs = Tensor::new(&[[0.5f32, 0.25, 0.25], [0.1, 0.1, 0.8]], &dev)?.log()?;
        // Second position is padding (id 1).
        let target = Tensor::new(&[0u32, 1], &dev)?;
        let (loss, nll) = criterion(0.0).compute_loss(&lprobs, &target, true)?;
        assert!((nll.to_scalar::<f32>()? - 2f32.ln()).abs() < 1e-6);
        assert_eq!(loss.to_scalar::<f32>()?, nll.to_scalar::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_smoothing_weights() -> Result<()> {
        let dev = Device::Cpu;
        let probs = [0.5f32, 0.25, 0.25];
        let lprobs = Tensor::new(&[probs], &dev)?.log()?;
        let target = Tensor::new(&[2u32], &dev)?;
        let eps = 0.1;
        let (loss, nll) = criterion(eps).compute_loss(&lprobs, &target, true)?;
        let nll_expected = -(0.25f32.ln());
        let smooth: f32 = probs.iter().map(|p| -p.ln()).sum();
        let expected = (1.0 - eps as f32) * nll_expected + eps as f32 / 3.0 * smooth;
        assert!((nll.to_scalar::<f32>()? - nll_expected).abs() < 1e-6);
        assert!((loss.to_scalar::<f32>()? - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_unreduced_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let lprobs = Tensor::new(&[[[0.5f32, 0.5], [0.9, 0.1], [0.3, 0.7]]], &dev)?.log()?;
        let target = Tensor::new(&[[0u32, 1, 0]], &dev)?;
        let (loss, nll) = criterion(0.2).compute_loss(&lprobs, &target, false)?;
        assert_eq!(loss.dims(), [3, 1]);
        assert_eq!(nll.dims(), [3, 1]);
        let nll = nll.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(nll[1], 0.0);
        assert!((nll[2] + 0.3f32.ln()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_alignment_loss() -> Result<()> {
        let dev = Device::Cpu;
        let attention = Tensor::new(&[[[0.7f32, 0.3], [0.0, 1.0], [0.5, 0.5]]], &dev)?;
        let contexts = Tensor::new(&[[1u32, 1, 0]], &dev)?;
        // Third position is padding, its label 0 is never looked at.
        let target = Tensor::new(&[[4u32, 5, 1]], &dev)?;
        let loss = criterion(0.0).compute_alignment_loss(&attention, &contexts, &target)?;
        let expected = -(0.7f64 + 1e-5).ln() - (1e-5f64).ln();
        assert!((loss.to_scalar::<f32>()? as f64 - expected).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_alignment_label_out_of_range() -> Result<()> {
        let dev = Device::Cpu;
        let attention = Tensor::full(0.5f32, (1, 2, 2), &dev)?;
        let target = Tensor::new(&[[4u32, 5]], &dev)?;
        let c = criterion(0.0);
        let zero = Tensor::new(&[[1u32, 0]], &dev)?;
        assert!(c.compute_alignment_loss(&attention, &zero, &target).is_err());
        let past_end = Tensor::new(&[[3u32, 1]], &dev)?;
        assert!(c.compute_alignment_loss(&attention, &past_end, &target).is_err());
        let mismatched = Tensor::new(&[[1u32, 1, 1]], &dev)?;
        assert!(c.compute_alignment_loss(&attention, &mismatched, &target).is_err());
        Ok(())
    }
}
