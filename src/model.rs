//! Preference model wrapper
//!
//! Pairs a trainable policy with a frozen reference model and evaluates a
//! preference loss on the chosen and rejected branches of a batch.

use crate::config::TrainingConfig;
use crate::datasets::loader::{PreferenceBatch, PreferenceDataLoader};
use crate::losses::PreferenceLoss;
use crate::scoring::get_batch_logps;
use candle_core::{DType, Result, Tensor};

/// A causal language model returning next-token logits.
pub trait CausalLm {
    /// `input_ids` and `attention_mask` are `[batch_size, seq_len]`, the
    /// returned logits `[batch_size, seq_len, vocab_size]`.
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;
}

#[derive(Debug, Clone)]
pub struct PreferenceOutput {
    pub loss: Tensor,
    pub chosen_rewards: Tensor,
    pub rejected_rewards: Tensor,
    /// Mean of `chosen_rewards - rejected_rewards`.
    pub reward_margin: Tensor,
    /// Share of pairs whose chosen reward beats the rejected one.
    pub reward_accuracy: Tensor,
}

pub struct PreferenceModel<P: CausalLm, R: CausalLm> {
    policy: P,
    reference: R,
    loss: PreferenceLoss,
    average_log_prob: bool,
}

impl<P: CausalLm, R: CausalLm> PreferenceModel<P, R> {
    pub fn new(policy: P, reference: R, loss: PreferenceLoss, average_log_prob: bool) -> Self {
        Self {
            policy,
            reference,
            loss,
            average_log_prob,
        }
    }

    pub fn from_config(policy: P, reference: R, cfg: &TrainingConfig) -> Self {
        Self::new(
            policy,
            reference,
            PreferenceLoss::from_config(cfg),
            cfg.average_log_prob,
        )
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Log-probs of the `branch` ("chosen" or "rejected") under `model`.
    fn branch_logps<M: CausalLm>(&self, model: &M, batch: &PreferenceBatch, branch: &str) -> Result<Tensor> {
        let input_ids = batch.get(&format!("{branch}_input_ids"))?;
        let attention_mask = batch.get(&format!("{branch}_attention_mask"))?;
        let labels = batch.get(&format!("{branch}_labels"))?;
        let logits = model.forward(input_ids, attention_mask)?;
        get_batch_logps(&logits, labels, self.average_log_prob)
    }

    pub fn forward(&self, batch: &PreferenceBatch) -> Result<PreferenceOutput> {
        let policy_chosen_logps = self.branch_logps(&self.policy, batch, "chosen")?;
        let policy_rejected_logps = self.branch_logps(&self.policy, batch, "rejected")?;
        let reference_chosen_logps = self.branch_logps(&self.reference, batch, "chosen")?.detach();
        let reference_rejected_logps = self
            .branch_logps(&self.reference, batch, "rejected")?
            .detach();

        let out = self.loss.forward(
            &policy_chosen_logps,
            &policy_rejected_logps,
            &reference_chosen_logps,
            &reference_rejected_logps,
        )?;
        let reward_margin = (&out.chosen_rewards - &out.rejected_rewards)?.mean_all()?;
        let reward_accuracy = out
            .chosen_rewards
            .gt(&out.rejected_rewards)?
            .to_dtype(DType::F32)?
            .mean_all()?;
        tracing::debug!(
            "batch of {} pairs: loss {}, reward margin {}",
            batch.batch_size(),
            out.loss,
            reward_margin
        );
        Ok(PreferenceOutput {
            loss: out.loss,
            chosen_rewards: out.chosen_rewards,
            rejected_rewards: out.rejected_rewards,
            reward_margin,
            reward_accuracy,
        })
    }
}

/// Mean loss over the first `num_batches` batches of `data_loader`, or all of
/// them. `NaN` for an empty loader.
pub fn calc_loss_loader<P: CausalLm, R: CausalLm>(
    data_loader: &PreferenceDataLoader,
    model: &PreferenceModel<P, R>,
    num_batches: Option<usize>,
) -> anyhow::Result<f32> {
    let n = match num_batches {
        None => data_loader.len(),
        Some(n) => std::cmp::min(n, data_loader.len()),
    };
    if n == 0 {
        return Ok(f32::NAN);
    }
    let mut total_loss = 0_f32;
    let mut count = 0_usize;
    for batch in data_loader.batcher().take(n) {
        let loss = model.forward(&batch?)?.loss;
        total_loss += loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        count += 1;
    }
    Ok(total_loss / count as f32)
}
