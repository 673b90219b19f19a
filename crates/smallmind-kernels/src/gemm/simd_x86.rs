//! AVX2+FMA row kernel.
//!
//! Weight rows are dequantized a panel (`NR` rows) at a time into the
//! caller's scratch buffer exactly as in the scalar kernel; the dot product
//! itself is the part that benefits from 8-wide FMA accumulation. AVX-512 is
//! not targeted separately: its intrinsics postdate this workspace's pinned
//! MSRV (1.70), and AVX2 is the floor for every x86_64 target this crate
//! ships kernels for regardless.

use std::arch::x86_64::*;

use crate::{KernelError, PackedWeight};

pub fn matmul_row_avx2(
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
            out_row[col0 + r] = unsafe { dot_avx2(a_row, w_row) };
        }
    }
    Ok(())
}

/// # Safety
/// Caller must have verified AVX2+FMA support via [`crate::dispatch::dispatch`]
/// before routing here; this function does not re-check CPU features.
#[target_feature(enable = "avx2,fma")]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let lanes = n - n % 8;
    let mut acc = _mm256_setzero_ps();
    let mut i = 0;
    while i < lanes {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        acc = _mm256_fmadd_ps(va, vb, acc);
        i += 8;
    }
    let mut buf = [0f32; 8];
    _mm256_storeu_ps(buf.as_mut_ptr(), acc);
    let mut sum: f32 = buf.iter().sum();
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
    fn dot_avx2_matches_scalar_when_available() {
        if !is_x86_feature_detected!("avx2") || !is_x86_feature_detected!("fma") {
            return;
        }
        let a: Vec<f32> = (0..19).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..19).map(|i| (19 - i) as f32 * 0.25).collect();
        let expected: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let got = unsafe { dot_avx2(&a, &b) };
        assert!((got - expected).abs() < 1e-3);
    }
}
