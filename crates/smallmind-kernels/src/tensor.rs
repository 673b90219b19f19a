//! Quantized tensor storage.
//!
//! A [`QuantizedTensor`] owns (or borrows, via [`TensorBytes`]) the raw block
//! codes for one weight matrix and carries enough metadata to dequantize any
//! aligned row range without touching the rest of the buffer. Model loading
//! (`smallmind-core`) constructs these directly from a memory-mapped GGUF or
//! SMQ file; nothing in this crate knows how to parse either format.

use std::sync::Arc;

use crate::dtype::dequantize_range;
use crate::{KernelError, QuantTag};

/// Shared, reference-counted byte storage for a tensor's raw codes.
///
/// Backed either by a `memmap2::Mmap` (via `AsRef<[u8]>`) or an owned `Vec<u8>`
/// when a tensor has been materialized (e.g. dequantized ahead of time or
/// rewritten by the SMQ writer). Cloning is O(1).
pub type TensorBytes = Arc<dyn AsRef<[u8]> + Send + Sync>;

/// A single block-quantized (or plain f32) weight tensor.
#[derive(Clone)]
pub struct QuantizedTensor {
    tag: QuantTag,
    block_size: usize,
    /// Row-major logical shape, outermost dimension first.
    shape: Vec<usize>,
    data: TensorBytes,
}

impl QuantizedTensor {
    /// Build a tensor view over `data`, validating that its length matches
    /// `shape` under `tag`'s canonical block layout.
    ///
    /// This is the single checkpoint for the "codes length equals block
    /// count times bytes-per-block" and "block size is valid for this tag"
    /// invariants; every other method assumes they hold.
    pub fn new(
        tag: QuantTag,
        block_size: usize,
        shape: Vec<usize>,
        data: TensorBytes,
    ) -> Result<Self, KernelError> {
        if !tag.accepts_block_size(block_size) {
            return Err(KernelError::InvalidModel(format!(
                "block size {block_size} is not valid for {tag:?}"
            )));
        }
        if shape.is_empty() {
            return Err(KernelError::InvalidModel("tensor shape is empty".into()));
        }
        let n_elements: usize = shape.iter().product();
        if n_elements % block_size != 0 {
            return Err(KernelError::InvalidModel(format!(
                "tensor with {n_elements} elements does not divide evenly into blocks of {block_size}"
            )));
        }
        let expected_bytes = (n_elements / block_size) * tag.bytes_per_block(block_size);
        let actual_bytes = (*data).as_ref().len();
        if actual_bytes < expected_bytes {
            return Err(KernelError::InvalidModel(format!(
                "tensor data is {actual_bytes} bytes, needs at least {expected_bytes} for shape {shape:?} as {tag:?}"
            )));
        }
        Ok(Self {
            tag,
            block_size,
            shape,
            data,
        })
    }

    /// The tensor's quantization tag.
    pub fn tag(&self) -> QuantTag {
        self.tag
    }

    /// The block size blocks are packed with.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Logical row-major shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of columns (innermost dimension), i.e. the row length for a
    /// 2-D weight matrix.
    pub fn row_len(&self) -> usize {
        *self.shape.last().expect("shape is non-empty")
    }

    /// Number of rows for a 2-D weight matrix (product of all but the last
    /// dimension).
    pub fn n_rows(&self) -> usize {
        self.shape[..self.shape.len() - 1].iter().product()
    }

    fn raw(&self) -> &[u8] {
        (*self.data).as_ref()
    }

    /// Exact byte length of this tensor's packed block codes (the backing
    /// buffer may be longer, e.g. a shared mmap with other tensors after it).
    pub fn byte_len(&self) -> usize {
        let n_elements: usize = self.shape.iter().product();
        (n_elements / self.block_size) * self.tag.bytes_per_block(self.block_size)
    }

    /// This tensor's raw packed block codes, trimmed to exactly
    /// [`QuantizedTensor::byte_len`]. For writers that need to copy a
    /// tensor's bytes verbatim (e.g. the SMQ container writer).
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw()[..self.byte_len()]
    }

    /// Dequantize row `row` in full into `out`, which must have length
    /// [`QuantizedTensor::row_len`].
    pub fn dequantize_row(&self, row: usize, out: &mut [f32]) -> Result<(), KernelError> {
        let row_len = self.row_len();
        if out.len() != row_len {
            return Err(KernelError::ShapeMismatch(format!(
                "row buffer has {} elements, expected {row_len}",
                out.len()
            )));
        }
        let start = row * row_len;
        dequantize_range(self.tag, self.raw(), self.block_size, start, out)
    }

    /// Dequantize every row into a freshly allocated row-major `f32` buffer.
    pub fn dequantize_all(&self) -> Result<Vec<f32>, KernelError> {
        let n: usize = self.shape.iter().product();
        let mut out = vec![0f32; n];
        dequantize_range(self.tag, self.raw(), self.block_size, 0, &mut out)?;
        Ok(out)
    }
}

/// A column-panel view over a weight tensor's rows, `panel_rows`-wide (the
/// GEMM kernels' `NR`).
///
/// A tensor's rows are already stored contiguously (`dequantize_row`'s
/// `start = row * row_len`), so packing needs no data movement: this just
/// fixes where panel boundaries fall and exposes a bulk
/// [`PackedWeight::dequantize_panel`] call that replaces one dequantized row
/// at a time with `panel_rows` at once. GEMM kernels dequantize into a
/// caller-owned scratch buffer sized once per `matmul` call (not once per
/// row), so a weight matrix contributes zero heap allocation per output row.
pub struct PackedWeight<'a> {
    tensor: &'a QuantizedTensor,
    panel_rows: usize,
}

impl<'a> PackedWeight<'a> {
    /// Wrap `tensor` for panel-at-a-time dequantization, `panel_rows` output
    /// rows (`NR`) per panel.
    pub fn new(tensor: &'a QuantizedTensor, panel_rows: usize) -> Self {
        Self { tensor, panel_rows }
    }

    /// Panel width (`NR`): output rows dequantized together per panel.
    pub fn panel_rows(&self) -> usize {
        self.panel_rows
    }

    /// Row length (`K`), shared by every row in the tensor.
    pub fn row_len(&self) -> usize {
        self.tensor.row_len()
    }

    /// Total output rows (`N`) across all panels.
    pub fn n_rows(&self) -> usize {
        self.tensor.n_rows()
    }

    /// Number of panels covering all `n_rows` rows.
    pub fn n_panels(&self) -> usize {
        (self.n_rows() + self.panel_rows - 1) / self.panel_rows
    }

    /// Rows actually present in panel `p` (the last panel may be short).
    pub fn panel_len(&self, p: usize) -> usize {
        let start = p * self.panel_rows;
        (self.n_rows().saturating_sub(start)).min(self.panel_rows)
    }

    /// Dequantize panel `p`'s rows into `out`, row-major, which must have
    /// length `panel_len(p) * row_len()`.
    pub fn dequantize_panel(&self, p: usize, out: &mut [f32]) -> Result<(), KernelError> {
        let rows = self.panel_len(p);
        let row_len = self.row_len();
        if out.len() != rows * row_len {
            return Err(KernelError::ShapeMismatch(format!(
                "panel buffer has {} elements, expected {}",
                out.len(),
                rows * row_len
            )));
        }
        let start = p * self.panel_rows * row_len;
        dequantize_range(self.tensor.tag, self.tensor.raw(), self.tensor.block_size, start, out)
    }
}

/// A named collection of quantized tensors, as loaded from one model file.
///
/// This is a thin lookup table; `smallmind-core` owns the schema of which
/// names must be present for a given architecture.
#[derive(Default, Clone)]
pub struct TensorStore {
    tensors: std::collections::HashMap<String, QuantizedTensor>,
}

impl TensorStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tensor under `name`, replacing any previous entry.
    pub fn insert(&mut self, name: impl Into<String>, tensor: QuantizedTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Look up a tensor by name.
    pub fn get(&self, name: &str) -> Option<&QuantizedTensor> {
        self.tensors.get(name)
    }

    /// Look up a tensor by name, or a descriptive [`KernelError`].
    pub fn require(&self, name: &str) -> Result<&QuantizedTensor, KernelError> {
        self.get(name)
            .ok_or_else(|| KernelError::InvalidModel(format!("missing tensor '{name}'")))
    }

    /// Number of tensors in the store.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the store has no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// A fully materialized, row-major `f32` matrix used as the activation
/// operand (`A`) of a GEMM call, or as a dequantized weight cache.
#[derive(Clone, Debug, PartialEq)]
pub struct PackedMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl PackedMatrix {
    /// Build a matrix from row-major `data`, checking `rows * cols == data.len()`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, KernelError> {
        if rows * cols != data.len() {
            return Err(KernelError::ShapeMismatch(format!(
                "{} elements cannot form a {rows}x{cols} matrix",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// A zero-filled `rows x cols` matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Row count.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Column count.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Immutable view of one row.
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Mutable view of one row.
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Flat row-major backing slice.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable flat row-major backing slice.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(v: Vec<u8>) -> TensorBytes {
        Arc::new(v)
    }

    #[test]
    fn f32_tensor_round_trips() {
        let data: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let raw: Vec<u8> = data.iter().flat_map(|f| f.to_le_bytes()).collect();
        let t = QuantizedTensor::new(QuantTag::F32, 1, vec![2, 4], bytes(raw)).unwrap();
        assert_eq!(t.n_rows(), 2);
        assert_eq!(t.row_len(), 4);
        let mut row = vec![0f32; 4];
        t.dequantize_row(1, &mut row).unwrap();
        assert_eq!(row, vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn rejects_undersized_buffer() {
        let raw = vec![0u8; 4];
        let err = QuantizedTensor::new(QuantTag::F32, 1, vec![4, 4], bytes(raw));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_non_dividing_block_size() {
        let raw = vec![0u8; 1024];
        let err = QuantizedTensor::new(QuantTag::Q4_K, 256, vec![300], bytes(raw));
        assert!(err.is_err());
    }

    #[test]
    fn tensor_store_require_missing_errors() {
        let store = TensorStore::new();
        assert!(store.require("blk.0.attn_q.weight").is_err());
    }

    #[test]
    fn packed_matrix_row_access() {
        let m = PackedMatrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(m.row(1), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn packed_weight_panels_cover_every_row() {
        let data: Vec<f32> = (0..20).map(|i| i as f32).collect();
        let raw: Vec<u8> = data.iter().flat_map(|f| f.to_le_bytes()).collect();
        let t = QuantizedTensor::new(QuantTag::F32, 1, vec![5, 4], bytes(raw)).unwrap();
        let packed = PackedWeight::new(&t, 2);
        assert_eq!(packed.n_panels(), 3);
        assert_eq!(packed.panel_len(0), 2);
        assert_eq!(packed.panel_len(1), 2);
        assert_eq!(packed.panel_len(2), 1); // short final panel

        let mut out = vec![0f32; 2 * 4];
        packed.dequantize_panel(1, &mut out).unwrap();
        assert_eq!(out, vec![8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0]);

        let mut last = vec![0f32; 1 * 4];
        packed.dequantize_panel(2, &mut last).unwrap();
        assert_eq!(last, vec![16.0, 17.0, 18.0, 19.0]);
    }

    #[test]
    fn packed_weight_rejects_wrong_scratch_len() {
        let raw = vec![0u8; 16 * 4];
        let t = QuantizedTensor::new(QuantTag::F32, 1, vec![4, 4], bytes(raw)).unwrap();
        let packed = PackedWeight::new(&t, 8);
        let mut out = vec![0f32; 4]; // should be 4 rows * 4 cols = 16
        assert!(packed.dequantize_panel(0, &mut out).is_err());
    }
}
