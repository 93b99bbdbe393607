//! Host-side tensor views over raw checkpoint bytes.
//!
//! Provides [`DataType`] (the numeric tags shared with the native engine) and
//! [`HostTensor`], a possibly-strided view over raw little-endian bytes. Before
//! bytes are handed to an engine's load primitive they are made contiguous
//! with [`HostTensor::contiguous`].

use std::borrow::Cow;
use std::fmt;

use tracing::debug;

use crate::error::InferenceError;

/// Element type of checkpoint and engine tensors.
///
/// The discriminants are the native engine's dtype tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DataType {
    F16 = 12,
    F32 = 13,
    BF16 = 19,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 | DataType::BF16 => 2,
        }
    }

    /// Native engine tag for this dtype.
    pub fn tag(&self) -> i32 {
        *self as i32
    }

    /// Parse a safetensors header dtype string ("F32", "F16", "BF16").
    pub fn from_safetensors(name: &str) -> Option<Self> {
        match name {
            "F32" => Some(DataType::F32),
            "F16" => Some(DataType::F16),
            "BF16" => Some(DataType::BF16),
            _ => None,
        }
    }

    /// Parse a `torch_dtype` value from a HuggingFace `config.json`.
    pub fn from_torch_dtype(name: &str) -> Option<Self> {
        match name.trim_start_matches("torch.") {
            "float32" | "float" => Some(DataType::F32),
            "float16" | "half" => Some(DataType::F16),
            "bfloat16" => Some(DataType::BF16),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::F32 => write!(f, "f32"),
            DataType::F16 => write!(f, "f16"),
            DataType::BF16 => write!(f, "bf16"),
        }
    }
}

/// Compute row-major strides from shape.
/// strides[i] = product of shape[i+1..]
fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; shape.len()];
    if shape.is_empty() {
        return strides;
    }
    strides[shape.len() - 1] = 1;
    for i in (0..shape.len() - 1).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// A typed, shaped view over raw tensor bytes.
///
/// Strides and offset are in elements. A view produced by a checkpoint file is
/// always contiguous; in-memory sources may hand out strided views (for
/// example a transposed matrix) which [`contiguous`](Self::contiguous)
/// gathers into a fresh row-major buffer.
#[derive(Debug, Clone)]
pub struct HostTensor<'a> {
    dtype: DataType,
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    data: Cow<'a, [u8]>,
}

impl<'a> HostTensor<'a> {
    /// Create a contiguous row-major view.
    ///
    /// Fails if `data` does not hold exactly `product(shape)` elements.
    pub fn new(
        dtype: DataType,
        shape: Vec<usize>,
        data: impl Into<Cow<'a, [u8]>>,
    ) -> Result<Self, InferenceError> {
        let data = data.into();
        let n_elements: usize = shape.iter().product();
        let expected = n_elements * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(InferenceError::InvalidArgument(format!(
                "tensor data length {} does not match shape {:?} ({} bytes of {})",
                data.len(),
                shape,
                expected,
                dtype
            )));
        }
        let strides = compute_strides(&shape);
        Ok(Self {
            dtype,
            shape,
            strides,
            offset: 0,
            data,
        })
    }

    /// Create a strided view. Every addressed element must lie inside `data`.
    pub fn strided(
        dtype: DataType,
        shape: Vec<usize>,
        strides: Vec<usize>,
        offset: usize,
        data: impl Into<Cow<'a, [u8]>>,
    ) -> Result<Self, InferenceError> {
        let data = data.into();
        if strides.len() != shape.len() {
            return Err(InferenceError::InvalidArgument(format!(
                "strides {:?} do not match rank of shape {:?}",
                strides, shape
            )));
        }
        if shape.iter().all(|&d| d > 0) {
            let last: usize = offset
                + shape
                    .iter()
                    .zip(&strides)
                    .map(|(&d, &s)| (d - 1) * s)
                    .sum::<usize>();
            if (last + 1) * dtype.size_in_bytes() > data.len() {
                return Err(InferenceError::InvalidArgument(format!(
                    "strided view (shape {:?}, strides {:?}, offset {}) reads past {} bytes",
                    shape,
                    strides,
                    offset,
                    data.len()
                )));
            }
        }
        Ok(Self {
            dtype,
            shape,
            strides,
            offset,
            data,
        })
    }

    /// Borrow this tensor as a view with the same layout.
    pub fn view(&self) -> HostTensor<'_> {
        HostTensor {
            dtype: self.dtype,
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            offset: self.offset,
            data: Cow::Borrowed(self.data.as_ref()),
        }
    }

    /// Returns the element type.
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the strides of the tensor, in elements.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Total number of elements.
    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of bytes a contiguous copy of this view occupies.
    pub fn byte_len(&self) -> usize {
        self.n_elements() * self.dtype.size_in_bytes()
    }

    /// Whether the elements are laid out row-major with no gaps.
    ///
    /// Dimensions of extent 1 never affect contiguity.
    pub fn is_contiguous(&self) -> bool {
        let expected = compute_strides(&self.shape);
        self.shape
            .iter()
            .zip(self.strides.iter().zip(&expected))
            .all(|(&d, (&s, &e))| d <= 1 || s == e)
    }

    /// Swap the two axes of a 2D view without copying.
    pub fn transposed(&self) -> Result<HostTensor<'_>, InferenceError> {
        if self.shape.len() != 2 {
            return Err(InferenceError::InvalidArgument(format!(
                "transpose requires a 2D tensor, got shape {:?}",
                self.shape
            )));
        }
        Ok(HostTensor {
            dtype: self.dtype,
            shape: vec![self.shape[1], self.shape[0]],
            strides: vec![self.strides[1], self.strides[0]],
            offset: self.offset,
            data: Cow::Borrowed(self.data.as_ref()),
        })
    }

    /// Return a contiguous view, gathering elements into a new buffer only
    /// when the current layout is strided.
    pub fn contiguous(self) -> HostTensor<'a> {
        if self.is_contiguous() {
            return self;
        }

        let elem = self.dtype.size_in_bytes();
        let n = self.n_elements();
        debug!(shape = ?self.shape, strides = ?self.strides, "Gathering strided tensor");

        let mut out = Vec::with_capacity(n * elem);
        let mut index = vec![0usize; self.shape.len()];
        for _ in 0..n {
            let src = self.offset
                + index
                    .iter()
                    .zip(&self.strides)
                    .map(|(&i, &s)| i * s)
                    .sum::<usize>();
            out.extend_from_slice(&self.data[src * elem..(src + 1) * elem]);

            for d in (0..index.len()).rev() {
                index[d] += 1;
                if index[d] < self.shape[d] {
                    break;
                }
                index[d] = 0;
            }
        }

        let strides = compute_strides(&self.shape);
        HostTensor {
            dtype: self.dtype,
            shape: self.shape,
            strides,
            offset: 0,
            data: Cow::Owned(out),
        }
    }

    /// Detach the view from its source buffer, copying borrowed bytes.
    pub fn into_owned(self) -> HostTensor<'static> {
        HostTensor {
            dtype: self.dtype,
            shape: self.shape,
            strides: self.strides,
            offset: self.offset,
            data: Cow::Owned(self.data.into_owned()),
        }
    }

    /// Raw bytes of a contiguous view, or `None` if the view is strided.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        if !self.is_contiguous() {
            return None;
        }
        let elem = self.dtype.size_in_bytes();
        let start = self.offset * elem;
        Some(&self.data[start..start + self.byte_len()])
    }

    /// Widen the elements to f32 in row-major order.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.as_bytes() {
            Some(bytes) => widen_to_f32(self.dtype, bytes),
            None => {
                let gathered = self.clone().contiguous();
                widen_to_f32(gathered.dtype, gathered.as_bytes().unwrap_or_default())
            }
        }
    }
}

/// Decode little-endian bytes of `dtype` into f32 values.
pub fn widen_to_f32(dtype: DataType, bytes: &[u8]) -> Vec<f32> {
    match dtype {
        DataType::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DataType::F16 => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
        DataType::BF16 => bytes
            .chunks_exact(2)
            .map(|c| half::bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
    }
}

/// Encode f32 values as little-endian bytes of `dtype`.
pub fn narrow_from_f32(dtype: DataType, values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * dtype.size_in_bytes());
    for &v in values {
        match dtype {
            DataType::F32 => out.extend_from_slice(&v.to_le_bytes()),
            DataType::F16 => out.extend_from_slice(&half::f16::from_f32(v).to_bits().to_le_bytes()),
            DataType::BF16 => {
                out.extend_from_slice(&half::bf16::from_f32(v).to_bits().to_le_bytes())
            }
        }
    }
    out
}
