//! Sequence scoring for preference training

use crate::candle_addons::select_or_zero;
use crate::datasets::IGNORE_INDEX;
use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops::log_softmax;

/// Log-probability of the labeled tokens of each sequence.
///
/// Logits at position `t` score the label at position `t + 1`. Positions whose
/// label is `IGNORE_INDEX` are selected out rather than multiplied by zero,
/// so logits at unscored positions may hold any value, including infinities,
/// without changing the result.
///
/// # Arguments
/// * `logits` - [batch_size, seq_len, vocab_size]
/// * `labels` - [batch_size, seq_len]
/// * `average_log_prob` - mean over scored tokens instead of the sum
///
/// # Returns
/// * [batch_size]. Sequences without scored tokens get `0`.
pub fn get_batch_logps(logits: &Tensor, labels: &Tensor, average_log_prob: bool) -> Result<Tensor> {
    let (batch_size, seq_len, _vocab_size) = logits.dims3()?;
    if labels.dims() != [batch_size, seq_len] {
        return Err(candle_core::Error::Msg(format!(
            "Logits {:?} and labels {:?} do not have the same batch and sequence shape.",
            logits.dims(),
            labels.dims()
        )));
    }
    let device = logits.device();
    let num_scored = seq_len.saturating_sub(1);
    if num_scored == 0 {
        return Tensor::zeros(batch_size, logits.dtype(), device);
    }

    let labels = labels.narrow(1, 1, num_scored)?.to_dtype(DType::I64)?;
    let logits = logits.narrow(1, 0, num_scored)?;
    let ignore = Tensor::full(IGNORE_INDEX, (batch_size, num_scored), device)?;
    let loss_mask = labels.ne(&ignore)?;

    // ignored labels would be out of range for the gather
    let token_ids = select_or_zero(&loss_mask, &labels)?.to_dtype(DType::U32)?;
    let per_token_logps = log_softmax(&logits, D::Minus1)?
        .gather(&token_ids.unsqueeze(2)?, 2)?
        .squeeze(2)?;
    let per_token_logps = select_or_zero(&loss_mask, &per_token_logps)?;
    let logps = per_token_logps.sum(1)?;

    if average_log_prob {
        let counts = loss_mask
            .to_dtype(logps.dtype())?
            .sum(1)?
            .clamp(1.0_f64, f64::MAX)?;
        logps.div(&counts)
    } else {
        Ok(logps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::Device;
    use rstest::*;

    #[fixture]
    pub fn vocab_size() -> usize {
        257_usize
    }

    /// Labels with a scored span `start..end` per row.
    fn spans(seq_len: usize, spans: &[(usize, usize)]) -> Vec<i64> {
        spans
            .iter()
            .flat_map(|(start, end)| {
                (0..seq_len).map(move |i| {
                    if (*start..*end).contains(&i) {
                        ((i * 7) % 251) as i64
                    } else {
                        IGNORE_INDEX
                    }
                })
            })
            .collect()
    }

    #[rstest]
    fn test_get_batch_logps_hand_computed() -> Result<()> {
        let dev = Device::cuda_if_available(0)?;
        let logits = Tensor::new(
            &[[[0.0_f32, 1.0, 0.0], [0.0, 0.0, 0.0], [f32::NAN, 0.0, 0.0]]],
            &dev,
        )?;
        let labels = Tensor::new(&[[IGNORE_INDEX, 1, 2]], &dev)?;

        // log(e / (e + 2)) + log(1 / 3)
        let expected_sum = (1.0 - (1.0_f32.exp() + 2.0).ln()) - 3.0_f32.ln();
        let logps = get_batch_logps(&logits, &labels, false)?.to_vec1::<f32>()?;
        assert!((logps[0] - expected_sum).abs() < 1e-6, "{}", logps[0]);

        let logps = get_batch_logps(&logits, &labels, true)?.to_vec1::<f32>()?;
        assert!((logps[0] - expected_sum / 2.0).abs() < 1e-6, "{}", logps[0]);
        Ok(())
    }

    #[rstest]
    #[case(1e30_f32)]
    #[case(-1e30_f32)]
    #[case(f32::INFINITY)]
    #[case(f32::NAN)]
    fn test_get_batch_logps_ignores_unscored_positions(
        vocab_size: usize,
        #[case] fill: f32,
    ) -> Result<()> {
        let dev = Device::cuda_if_available(0)?;
        let (batch_size, seq_len) = (2_usize, 64_usize);
        let logits = Tensor::randn(0_f32, 1.0, (batch_size, seq_len, vocab_size), &dev)?;
        let labels_vec = spans(seq_len, &[(10, 20), (30, 64)]);
        let labels = Tensor::from_vec(labels_vec.clone(), (batch_size, seq_len), &dev)?;
        let expected = get_batch_logps(&logits, &labels, false)?.to_vec1::<f32>()?;

        // logits at t are unscored when the label at t + 1 is ignored, and the
        // final position never scores anything
        let mut values = logits.flatten_all()?.to_vec1::<f32>()?;
        for row in 0..batch_size {
            for t in 0..seq_len {
                let scored = t + 1 < seq_len && labels_vec[row * seq_len + t + 1] != IGNORE_INDEX;
                if !scored {
                    let offset = (row * seq_len + t) * vocab_size;
                    values[offset..offset + vocab_size].fill(fill);
                }
            }
        }
        let perturbed = Tensor::from_vec(values, (batch_size, seq_len, vocab_size), &dev)?;
        let logps = get_batch_logps(&perturbed, &labels, false)?.to_vec1::<f32>()?;

        assert_eq!(logps, expected);
        assert!(logps.iter().all(|x| x.is_finite() && *x < 0.0));
        Ok(())
    }

    #[rstest]
    fn test_get_batch_logps_average(vocab_size: usize) -> Result<()> {
        let dev = Device::cuda_if_available(0)?;
        let seq_len = 16_usize;
        let logits = Tensor::randn(0_f32, 1.0, (1, seq_len, vocab_size), &dev)?;
        let labels = Tensor::from_vec(spans(seq_len, &[(4, 9)]), (1, seq_len), &dev)?;

        let summed = get_batch_logps(&logits, &labels, false)?.to_vec1::<f32>()?;
        let averaged = get_batch_logps(&logits, &labels, true)?.to_vec1::<f32>()?;
        assert!((summed[0] / 5.0 - averaged[0]).abs() < 1e-5);
        Ok(())
    }

    #[rstest]
    fn test_get_batch_logps_without_scored_tokens(vocab_size: usize) -> Result<()> {
        let dev = Device::cuda_if_available(0)?;
        let logits = Tensor::randn(0_f32, 1.0, (2, 8, vocab_size), &dev)?;
        let labels = Tensor::full(IGNORE_INDEX, (2, 8), &dev)?;

        assert_eq!(get_batch_logps(&logits, &labels, false)?.to_vec1::<f32>()?, &[0.0, 0.0]);
        assert_eq!(get_batch_logps(&logits, &labels, true)?.to_vec1::<f32>()?, &[0.0, 0.0]);

        let single = get_batch_logps(&logits.narrow(1, 0, 1)?, &labels.narrow(1, 0, 1)?, true)?;
        assert_eq!(single.dims(), &[2]);
        Ok(())
    }

    #[rstest]
    fn test_get_batch_logps_shape_mismatch() -> Result<()> {
        let dev = Device::Cpu;
        let logits = Tensor::zeros((2, 8, 5), DType::F32, &dev)?;
        let labels = Tensor::zeros((2, 7), DType::I64, &dev)?;
        assert!(get_batch_logps(&logits, &labels, false).is_err());
        assert!(get_batch_logps(&logits.narrow(2, 0, 1)?.squeeze(2)?, &labels, false).is_err());
        Ok(())
    }
}
