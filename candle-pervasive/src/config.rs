//! Configuration for the read/write controller and the alignment criterion.
//!
//! Both sections deserialize from JSON with the defaults of the training
//! recipes they come from, and are validated once before any module is built.

use candle::Result;
use serde::{Deserialize, Serialize};

/// Controller section: shape and training mode of the gate network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlsConfig {
    /// Width of the per-cell controller features.
    pub controller_dim: usize,

    /// Number of GLU layers before the final projection (default: 0).
    #[serde(default)]
    pub num_controller_layers: usize,

    /// Stop gradients from flowing back into the controller features (default: false).
    #[serde(default)]
    pub detach_controls: bool,
}

impl ControlsConfig {
    pub fn new(controller_dim: usize) -> Self {
        Self {
            controller_dim,
            num_controller_layers: 0,
            detach_controls: false,
        }
    }

    /// Feature widths seen by each layer, ending with the input of the final projection.
    pub fn layer_widths(&self) -> Vec<usize> {
        (0..=self.num_controller_layers)
            .map(|i| self.controller_dim >> i)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller_dim == 0 {
            candle::bail!("controller_dim must be positive")
        }
        // Every GLU halves the width, so each layer needs an even input.
        let mut width = self.controller_dim;
        for layer in 0..self.num_controller_layers {
            if width < 2 || width % 2 != 0 {
                candle::bail!(
                    "controller_dim {} cannot be halved {} times (layer {layer} sees width {width})",
                    self.controller_dim,
                    self.num_controller_layers
                )
            }
            width /= 2;
        }
        Ok(())
    }
}

/// Criterion section: smoothing, alignment weight and normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionConfig {
    /// Epsilon for label smoothing, 0 disables smoothing (default: 0).
    #[serde(default)]
    pub label_smoothing: f64,

    /// Weight of the alignment loss in the total (default: 0).
    #[serde(default)]
    pub regul_align_scale: f64,

    /// Normalise by sentences instead of tokens (default: false).
    #[serde(default)]
    pub sentence_avg: bool,

    /// Target id excluded from every loss term (default: 1).
    #[serde(default = "default_padding_idx")]
    pub padding_idx: u32,
}

fn default_padding_idx() -> u32 {
    1
}

impl Default for CriterionConfig {
    fn default() -> Self {
        Self {
            label_smoothing: 0.0,
            regul_align_scale: 0.0,
            sentence_avg: false,
            padding_idx: default_padding_idx(),
        }
    }
}

impl CriterionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.label_smoothing) {
            candle::bail!(
                "label_smoothing must be in [0, 1), got {}",
                self.label_smoothing
            )
        }
        if !self.regul_align_scale.is_finite() || self.regul_align_scale < 0.0 {
            candle::bail!(
                "regul_align_scale must be finite and non-negative, got {}",
                self.regul_align_scale
            )
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub controls: ControlsConfig,
    #[serde(default)]
    pub criterion: CriterionConfig,
}

impl Config {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(candle::Error::wrap)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.controls.validate()?;
        self.criterion.validate()
    }
}
