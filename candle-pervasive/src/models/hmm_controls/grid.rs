//! Dense host-side lattices used by the E-step.
//!
//! A [`Grid`] is a rank-`N` row-major `Vec<f32>` with offsets computed from its
//! dimensions. The forward-backward recursions only ever touch these owned
//! buffers, which keeps them out of the autograd graph.

use candle::{DType, Device, Result, Tensor};

#[derive(Debug, Clone, PartialEq)]
pub struct Grid<const N: usize> {
    dims: [usize; N],
    data: Vec<f32>,
}

impl<const N: usize> Grid<N> {
    /// A grid of the given shape with every cell set to `value`.
    pub fn full(dims: [usize; N], value: f32) -> Self {
        let len = dims.iter().product();
        Self {
            dims,
            data: vec![value; len],
        }
    }

    /// A grid where every cell is log(0).
    pub fn neg_inf(dims: [usize; N]) -> Self {
        Self::full(dims, f32::NEG_INFINITY)
    }

    pub fn from_vec(dims: [usize; N], data: Vec<f32>) -> Result<Self> {
        let len: usize = dims.iter().product();
        if data.len() != len {
            candle::bail!(
                "grid of shape {:?} expects {len} values, got {}",
                dims,
                data.len()
            )
        }
        Ok(Self { dims, data })
    }

    /// Copies a tensor to the host. The copy carries no gradient history.
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        let dims: [usize; N] = match t.dims().try_into() {
            Ok(dims) => dims,
            Err(_) => candle::bail!("expected a rank {N} tensor, got shape {:?}", t.dims()),
        };
        let data = t.detach().to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Self::from_vec(dims, data)
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_vec(self.data.clone(), self.dims.as_slice(), device)
    }

    pub fn dims(&self) -> [usize; N] {
        self.dims
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn offset(&self, index: [usize; N]) -> usize {
        let mut offset = 0;
        for (i, (&idx, &dim)) in index.iter().zip(self.dims.iter()).enumerate() {
            debug_assert!(idx < dim, "index {idx} out of range {dim} on axis {i}");
            offset = offset * dim + idx;
        }
        offset
    }

    #[inline]
    pub fn get(&self, index: [usize; N]) -> f32 {
        self.data[self.offset(index)]
    }

    #[inline]
    pub fn set(&mut self, index: [usize; N], value: f32) {
        let offset = self.offset(index);
        self.data[offset] = value;
    }

    /// The contiguous innermost row selected by the leading `N - 1` indices.
    pub fn row(&self, prefix: &[usize]) -> &[f32] {
        let (start, len) = self.row_span(prefix);
        &self.data[start..start + len]
    }

    pub fn row_mut(&mut self, prefix: &[usize]) -> &mut [f32] {
        let (start, len) = self.row_span(prefix);
        &mut self.data[start..start + len]
    }

    fn row_span(&self, prefix: &[usize]) -> (usize, usize) {
        debug_assert_eq!(prefix.len() + 1, N);
        let mut start = 0;
        for (&idx, &dim) in prefix.iter().zip(self.dims.iter()) {
            start = start * dim + idx;
        }
        let len = self.dims[N - 1];
        (start * len, len)
    }
}
