//! Portable scalar fallback kernel: dequantize one weight panel at a time
//! into the caller's scratch buffer, then dot each of its rows against the
//! activation row.

use crate::{KernelError, PackedWeight};

pub fn matmul_row_scalar(
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
            out_row[col0 + r] = dot(a_row, w_row);
        }
    }
    Ok(())
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
