//! Deterministic non-zero weights for forward tests.
//!
//! Every value is `sin(0.37 * i + seed)`, seeded by the byte sum of the tensor name and
//! shaped by its role, so a reference implementation can rebuild the same state dict.

use std::collections::HashMap;

use candle_core::{Device, DType, Result, Tensor};
use candle_nn::VarBuilder;

pub(crate) fn wave(name: &str, dims: &[usize]) -> Vec<f32> {
    let seed = name.bytes().map(f64::from).sum::<f64>() * 0.01;
    let len: usize = dims.iter().product();
    let fan_in = (len / dims[0]) as f64;
    (0..len)
        .map(|i| {
            let s = (i as f64 * 0.37 + seed).sin();
            let value = if name.ends_with("running_var") {
                1.0 + 0.5 * s * s
            } else if name.ends_with("running_mean") || name.ends_with("bias") {
                0.1 * s
            } else if name.ends_with("weight") && dims.len() == 1 {
                1.0 + 0.1 * s
            } else if name.ends_with("weight") {
                s / fan_in.sqrt()
            } else {
                0.5 * s
            };
            value as f32
        })
        .collect()
}

pub(crate) fn wave_tensor(name: &str, dims: &[usize], device: &Device) -> Result<Tensor> {
    Tensor::from_vec(wave(name, dims), dims, device)
}

pub(crate) fn var_builder(
    params: &[(String, Vec<usize>)],
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let tensors = params
        .iter()
        .map(|(name, dims)| Ok((name.clone(), wave_tensor(name, dims, device)?)))
        .collect::<Result<HashMap<_, _>>>()?;
    Ok(VarBuilder::from_tensors(tensors, DType::F32, device))
}

/// Asserts `actual` is within `1e-4` of `expected`, elementwise
pub(crate) fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < 1e-4, "index {i}: {a} vs {e}\n{actual:?}");
    }
}
