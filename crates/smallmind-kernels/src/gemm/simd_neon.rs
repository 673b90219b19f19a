//! NEON row kernel for aarch64. NEON is baseline on every aarch64 target
//! tier 1-supported by this crate, so the feature check in
//! [`crate::dispatch`] is a formality rather than a real fallback branch.
//!
//! Weight rows are dequantized a panel (`NR` rows) at a time into the
//! caller's scratch buffer, same as the scalar and AVX2 kernels.

use std::arch::aarch64::*;

use crate::{KernelError, PackedWeight};

pub fn matmul_row_neon(
    a_row: &[f32],
    w: &PackedWeight<'_>,
    scratch: &mut [f32],
    out_row: &mut [f32],
) -> Result<(), KernelError> {
    let row_len = w.row_len();
    for p in 0..w.n_panels() {
        let rows = w.panel_len(p);
        let panel = &mut scratch[..rows * row_len];
        w.dequantize_panel(p, panel)?;
        let col0 = p * w.panel_rows();
        for (r, w_row) in panel.chunks(row_len).enumerate() {
            out_row[col0 + r] = unsafe { dot_neon(a_row, w_row) };
        }
    }
    Ok(())
}

/// # Safety
/// Caller must have verified NEON support before routing here.
unsafe fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let lanes = n - n % 4;
    let mut acc = vdupq_n_f32(0.0);
    let mut i = 0;
    while i < lanes {
        let va = vld1q_f32(a.as_ptr().add(i));
        let vb = vld1q_f32(b.as_ptr().add(i));
        acc = vfmaq_f32(acc, va, vb);
        i += 4;
    }
    let mut sum = vaddvq_f32(acc);
    while i < n {
        sum += a[i] * b[i];
        i += 1;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_neon_matches_scalar() {
        let a: Vec<f32> = (0..17).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..17).map(|i| (17 - i) as f32 * 0.25).collect();
        let expected: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let got = unsafe { dot_neon(&a, &b) };
        assert!((got - expected).abs() < 1e-3);
    }
}
