//! Fused dequantize + matrix-multiply kernels.
//!
//! `matmul` computes `out = A * W^T` where `A` is a plain `f32` activation
//! matrix and `W` is a (possibly quantized) weight tensor stored row-major
//! with one row per output feature, i.e. the standard `Linear` layout. `W` is
//! never materialized to `f32` up front; it is viewed as a [`PackedWeight`]
//! of `NR`-row column panels and dequantized one panel at a time into a
//! scratch buffer allocated once per `matmul` call (per rayon task on the
//! parallel path), not once per output row.
//!
//! Row-band parallelism and platform selection both live here; individual
//! kernels only need to know how to dequantize-and-dot a panel at a time.

mod scalar;
#[cfg(target_arch = "aarch64")]
mod simd_neon;
#[cfg(target_arch = "x86_64")]
mod simd_x86;

use rayon::prelude::*;

use crate::dispatch::{dispatch, PlatformTag};
use crate::{KernelError, PackedMatrix, PackedWeight, QuantizedTensor, ROW_PARALLEL_THRESHOLD};

/// Output rows (`NR`) a weight panel covers at a time.
const GEMM_PANEL_ROWS: usize = 8;

/// Compute `out[i][j] = dot(a.row(i), w.row(j))` for all `i, j`.
///
/// `a` has shape `[m, k]`, `w` has shape `[n, k]` (row `j` is output feature
/// `j`'s weight vector), and `out` must already be `[m, n]`.
pub fn matmul(a: &PackedMatrix, w: &QuantizedTensor, out: &mut PackedMatrix) -> Result<(), KernelError> {
    let (m, k) = (a.rows(), a.cols());
    let n = w.n_rows();
    if w.row_len() != k {
        return Err(KernelError::ShapeMismatch(format!(
            "activation has {k} columns but weight rows have {} elements",
            w.row_len()
        )));
    }
    if out.rows() != m || out.cols() != n {
        return Err(KernelError::ShapeMismatch(format!(
            "output is {}x{}, expected {m}x{n}",
            out.rows(),
            out.cols()
        )));
    }

    let platform = dispatch().platform();
    let row_fn = row_kernel(platform);
    let packed = PackedWeight::new(w, GEMM_PANEL_ROWS);
    let scratch_len = packed.panel_rows() * k;

    if m >= ROW_PARALLEL_THRESHOLD {
        out.as_mut_slice()
            .par_chunks_mut(n)
            .enumerate()
            .try_for_each_init(
                || vec![0f32; scratch_len],
                |scratch, (i, out_row)| row_fn(a.row(i), &packed, scratch, out_row),
            )
    } else {
        let mut scratch = vec![0f32; scratch_len];
        for i in 0..m {
            let (a_row, out_row) = (a.row(i), out.row_mut(i));
            row_fn(a_row, &packed, &mut scratch, out_row)?;
        }
        Ok(())
    }
}

type RowKernel = fn(&[f32], &PackedWeight<'_>, &mut [f32], &mut [f32]) -> Result<(), KernelError>;

fn row_kernel(platform: PlatformTag) -> RowKernel {
    match platform {
        #[cfg(target_arch = "x86_64")]
        PlatformTag::Avx2 => simd_x86::matmul_row_avx2,
        #[cfg(target_arch = "aarch64")]
        PlatformTag::Neon => simd_neon::matmul_row_neon,
        _ => scalar::matmul_row_scalar,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QuantTag;
    use std::sync::Arc;

    fn f32_weight(rows: usize, cols: usize, values: Vec<f32>) -> QuantizedTensor {
        let raw: Vec<u8> = values.iter().flat_map(|f| f.to_le_bytes()).collect();
        QuantizedTensor::new(QuantTag::F32, 1, vec![rows, cols], Arc::new(raw)).unwrap()
    }

    #[test]
    fn matmul_matches_naive_f32() {
        let a = PackedMatrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let w = f32_weight(2, 3, vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let mut out = PackedMatrix::zeros(2, 2);
        matmul(&a, &w, &mut out).unwrap();
        assert_eq!(out.row(0), &[1.0, 2.0]);
        assert_eq!(out.row(1), &[4.0, 5.0]);
    }

    #[test]
    fn matmul_parallel_path_matches_serial() {
        let rows = ROW_PARALLEL_THRESHOLD + 4;
        let k = 8;
        let a_data: Vec<f32> = (0..rows * k).map(|i| (i % 7) as f32 * 0.5).collect();
        let w_data: Vec<f32> = (0..k * k).map(|i| (i % 5) as f32 * 0.25).collect();
        let a = PackedMatrix::from_vec(rows, k, a_data).unwrap();
        let w = f32_weight(k, k, w_data);
        let mut out = PackedMatrix::zeros(rows, k);
        matmul(&a, &w, &mut out).unwrap();

        for i in 0..rows {
            let mut row = vec![0f32; k];
            let a_row = a.row(i);
            for j in 0..k {
                let mut w_row = vec![0f32; k];
                w.dequantize_row(j, &mut w_row).unwrap();
                row[j] = a_row.iter().zip(w_row.iter()).map(|(x, y)| x * y).sum();
            }
            assert_eq!(out.row(i), row.as_slice());
        }
    }

    #[test]
    fn matmul_rejects_mismatched_k() {
        let a = PackedMatrix::from_vec(1, 3, vec![1.0, 2.0, 3.0]).unwrap();
        let w = f32_weight(1, 4, vec![0.0; 4]);
        let mut out = PackedMatrix::zeros(1, 1);
        assert!(matmul(&a, &w, &mut out).is_err());
    }
}
