//! # Custom addons module to Candle
//!
//! #### Features
//! - `log_sigmoid`: a numerically stable `log(sigmoid(x))`
//! - `select_or_zero`: keeps values where a mask is set, zero elsewhere
//! - `stack_rows`: builds a `(rows, len)` tensor from equal-length rows
use candle_core::{Device, Result, Tensor, WithDType};

/// Computes `log(sigmoid(x)) = min(x, 0) - log(1 + exp(-|x|))` elementwise.
pub fn log_sigmoid(xs: &Tensor) -> Result<Tensor> {
    let min_part = xs.neg()?.relu()?.neg()?;
    let soft_part = (xs.abs()?.neg()?.exp()? + 1.0)?.log()?;
    min_part.sub(&soft_part)
}

/// Returns `xs` where `mask` is non-zero and `0` elsewhere.
///
/// Values at unselected positions never enter the result, so they may be
/// anything, including `NaN` or infinities.
pub fn select_or_zero(mask: &Tensor, xs: &Tensor) -> Result<Tensor> {
    let zeros = xs.zeros_like()?;
    mask.where_cond(xs, &zeros)
}

/// Stacks equal-length rows into a `(rows.len(), len)` tensor.
pub fn stack_rows<T: WithDType>(rows: &[&[T]], device: &Device) -> Result<Tensor> {
    let width = rows.first().map(|row| row.len()).unwrap_or(0);
    if let Some(row) = rows.iter().find(|row| row.len() != width) {
        return Err(candle_core::Error::Msg(format!(
            "Unable to stack rows of different lengths ({} vs {width}).",
            row.len()
        )));
    }
    let flat: Vec<T> = rows.iter().flat_map(|row| row.iter().copied()).collect();
    Tensor::from_vec(flat, (rows.len(), width), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::*;

    #[rstest]
    fn test_log_sigmoid_matches_naive_and_stays_finite() -> Result<()> {
        let dev = Device::cuda_if_available(0)?;
        let xs = Tensor::new(&[-2.0_f32, -0.5, 0.0, 0.5, 2.0], &dev)?;
        let naive = candle_nn::ops::sigmoid(&xs)?.log()?.to_vec1::<f32>()?;
        let stable = log_sigmoid(&xs)?.to_vec1::<f32>()?;
        for (a, b) in naive.iter().zip(stable.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }

        let extreme = Tensor::new(&[-1000.0_f32, 1000.0], &dev)?;
        let out = log_sigmoid(&extreme)?.to_vec1::<f32>()?;
        assert_eq!(out[0], -1000.0);
        assert_eq!(out[1], 0.0);
        Ok(())
    }

    #[rstest]
    fn test_select_or_zero_ignores_non_finite() -> Result<()> {
        let dev = Device::cuda_if_available(0)?;
        let mask = Tensor::new(&[1_u8, 0, 1, 0], &dev)?;
        let xs = Tensor::new(&[1.5_f32, f32::NAN, -2.0, f32::INFINITY], &dev)?;
        let out = select_or_zero(&mask, &xs)?;
        assert_eq!(out.to_vec1::<f32>()?, &[1.5_f32, 0.0, -2.0, 0.0]);
        Ok(())
    }

    #[rstest]
    fn test_stack_rows() -> Result<()> {
        let dev = Device::cuda_if_available(0)?;
        let a = [1_u32, 2, 3];
        let b = [4_u32, 5, 6];
        let stacked = stack_rows(&[&a[..], &b[..]], &dev)?;
        assert_eq!(stacked.to_vec2::<u32>()?, &[[1_u32, 2, 3], [4, 5, 6]]);

        let c = [7_u32];
        assert!(stack_rows(&[&a[..], &c[..]], &dev).is_err());
        Ok(())
    }
}
