//! Preference losses
//!
//! All losses compare how much more the policy prefers the chosen answer over
//! the rejected one than the reference model does:
//!
//! `logits = (policy_chosen - reference_chosen) - (policy_rejected - reference_rejected)`
//!
//! Includes:
//! - `DPOLoss`: sigmoid loss with optional label smoothing
//! - `HingeLoss`: SLiC-style hinge on the scaled margin
//! - `IPOLoss`: squared distance of the margin to `1 / (2 beta)`
//! - `KTOPairLoss`: paired KTO against batch-level KL estimates

use crate::candle_addons::log_sigmoid;
use crate::config::TrainingConfig;
use candle_core::{Result, Tensor};
use candle_nn::ops::sigmoid;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The preference loss kinds, named as they appear in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LossFunction {
    #[default]
    #[serde(rename = "DPOLoss")]
    Dpo,
    #[serde(rename = "HingeLoss")]
    Hinge,
    #[serde(rename = "IPOLoss")]
    Ipo,
    #[serde(rename = "KTOPairLoss")]
    KtoPair,
}

impl LossFunction {
    pub const ALL: [LossFunction; 4] = [Self::Dpo, Self::Hinge, Self::Ipo, Self::KtoPair];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Dpo => "DPOLoss",
            Self::Hinge => "HingeLoss",
            Self::Ipo => "IPOLoss",
            Self::KtoPair => "KTOPairLoss",
        }
    }
}

impl fmt::Display for LossFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LossFunction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|loss| loss.name() == s)
            .ok_or_else(|| {
                let names = Self::ALL.map(|loss| loss.name()).join(", ");
                anyhow::anyhow!("Unknown loss function `{s}`, expected one of: {names}")
            })
    }
}

/// How per-row losses are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    #[default]
    Mean,
    None,
}

/// Result of a preference loss evaluation.
///
/// Rewards and logits are detached and meant for logging.
#[derive(Debug, Clone)]
pub struct PreferenceLossOutput {
    /// Scalar under `Reduction::Mean`, per-row otherwise. `KTOPairLoss`
    /// produces two rows per pair.
    pub loss: Tensor,
    pub chosen_rewards: Tensor,
    pub rejected_rewards: Tensor,
    /// Unscaled reward margins of each pair.
    pub logits: Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreferenceLoss {
    pub function: LossFunction,
    pub beta: f64,
    pub label_smoothing: f64,
    pub reduction: Reduction,
}

impl PreferenceLoss {
    pub fn new(function: LossFunction, beta: f64) -> Self {
        Self {
            function,
            beta,
            label_smoothing: 0.0,
            reduction: Reduction::Mean,
        }
    }

    pub fn from_config(cfg: &TrainingConfig) -> Self {
        Self::new(cfg.loss_function, cfg.beta).with_label_smoothing(cfg.label_smoothing)
    }

    /// Only used by `DPOLoss`.
    pub fn with_label_smoothing(mut self, label_smoothing: f64) -> Self {
        self.label_smoothing = label_smoothing;
        self
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    /// Computes the loss of a batch of pairs.
    ///
    /// # Arguments
    /// * `policy_chosen_logps` - policy log-probs of the chosen answers [batch_size]
    /// * `policy_rejected_logps` - policy log-probs of the rejected answers [batch_size]
    /// * `reference_chosen_logps` - reference log-probs of the chosen answers [batch_size]
    /// * `reference_rejected_logps` - reference log-probs of the rejected answers [batch_size]
    pub fn forward(
        &self,
        policy_chosen_logps: &Tensor,
        policy_rejected_logps: &Tensor,
        reference_chosen_logps: &Tensor,
        reference_rejected_logps: &Tensor,
    ) -> Result<PreferenceLossOutput> {
        let inputs = [
            policy_chosen_logps,
            policy_rejected_logps,
            reference_chosen_logps,
            reference_rejected_logps,
        ];
        let shape = policy_chosen_logps.shape();
        if shape.rank() != 1 || inputs.iter().any(|xs| xs.shape() != shape) {
            return Err(candle_core::Error::Msg(format!(
                "Expected four log-prob tensors of shape [batch_size], got {:?}",
                inputs.map(|xs| xs.dims().to_vec())
            )));
        }

        let chosen_logratios = (policy_chosen_logps - reference_chosen_logps)?;
        let rejected_logratios = (policy_rejected_logps - reference_rejected_logps)?;
        let logits = (&chosen_logratios - &rejected_logratios)?;
        let beta = self.beta;

        let losses = match self.function {
            LossFunction::Dpo => {
                let eps = self.label_smoothing;
                let chosen_term = (log_sigmoid(&(&logits * beta)?)? * (-(1.0 - eps)))?;
                let rejected_term = (log_sigmoid(&(&logits * -beta)?)? * -eps)?;
                (chosen_term + rejected_term)?
            }
            LossFunction::Hinge => logits.affine(-beta, 1.0)?.relu()?,
            LossFunction::Ipo => (&logits - 1.0 / (2.0 * beta))?.sqr()?,
            LossFunction::KtoPair => {
                // batch-level KL estimates, clamped at zero
                let chosen_kl = chosen_logratios.mean_all()?.relu()?;
                let rejected_kl = rejected_logratios.mean_all()?.relu()?;
                let chosen_losses = sigmoid(&(chosen_logratios.broadcast_sub(&rejected_kl)? * beta)?)?
                    .affine(-1.0, 1.0)?;
                let rejected_losses =
                    sigmoid(&(rejected_logratios.neg()?.broadcast_add(&chosen_kl)? * beta)?)?
                        .affine(-1.0, 1.0)?;
                Tensor::cat(&[chosen_losses, rejected_losses], 0)?
            }
        };

        let loss = match self.reduction {
            Reduction::Mean => losses.mean_all()?,
            Reduction::None => losses,
        };
        Ok(PreferenceLossOutput {
            loss,
            chosen_rewards: (chosen_logratios * beta)?.detach(),
            rejected_rewards: (rejected_logratios * beta)?.detach(),
            logits: logits.detach(),
        })
    }
}
