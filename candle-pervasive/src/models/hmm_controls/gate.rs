//! Gate network: per-cell controller features to a read/write logit.
//!
//! Weights are laid out as `gate.{i}.weight` / `gate.{i}.bias`, with the final
//! projection to a single logit at index `num_controller_layers`.

use candle::{DType, Module, Result, Tensor, D};
use candle_nn::{Init, Linear, VarBuilder};

use crate::config::ControlsConfig;
use crate::utils::{glu, log_sigmoid};

/// Linear layer with Xavier-uniform weights and zero bias when freshly created.
fn linear_xavier(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let bound = (6.0 / (in_dim + out_dim) as f64).sqrt();
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.))?;
    Ok(Linear::new(weight, Some(bias)))
}

#[derive(Debug, Clone)]
pub struct GateNetwork {
    layers: Vec<Linear>,
    output: Linear,
    detach: bool,
    span: tracing::Span,
}

impl GateNetwork {
    pub fn new(cfg: &ControlsConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let widths = cfg.layer_widths();
        let vb = vb.pp("gate");
        let mut layers = Vec::with_capacity(cfg.num_controller_layers);
        for (i, &width) in widths[..cfg.num_controller_layers].iter().enumerate() {
            // Square projection, then GLU halves the width.
            layers.push(linear_xavier(width, width, vb.pp(i))?);
        }
        let final_width = widths[cfg.num_controller_layers];
        let output = linear_xavier(final_width, 1, vb.pp(cfg.num_controller_layers))?;
        tracing::debug!(
            ?widths,
            detach = cfg.detach_controls,
            "built controller gate"
        );
        Ok(Self {
            layers,
            output,
            detach: cfg.detach_controls,
            span: tracing::span!(tracing::Level::TRACE, "controller-gate"),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn detaches_input(&self) -> bool {
        self.detach
    }
}

impl Module for GateNetwork {
    /// `(..., C) -> (..., 1)`
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = if self.detach {
            xs.detach()
        } else {
            xs.clone()
        };
        for layer in self.layers.iter() {
            xs = glu(&layer.forward(&xs)?)?;
        }
        self.output.forward(&xs)
    }
}

/// Turns gate logits `(..., 1)` into `[log(rho), log(1 - rho)]` pairs `(..., 2)`.
///
/// `log(1 - rho) = log_sigmoid(x) - x`, which stays accurate where `rho` is
/// close to 1.
pub fn read_write(logits: &Tensor) -> Result<Tensor> {
    if logits.dim(D::Minus1)? != 1 {
        candle::bail!("expected gate logits with a trailing unit axis, got {:?}", logits.dims())
    }
    let log_rho = log_sigmoid(logits)?;
    let log_one_minus_rho = log_rho.sub(logits)?;
    Tensor::cat(&[&log_rho, &log_one_minus_rho], D::Minus1)?.to_dtype(DType::F32)
}
