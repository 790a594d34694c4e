//! Row-major layout arithmetic for buffer placement.

use crate::error::{Error, Result};
use crate::model::DataType;

/// Calculate contiguous strides for a given shape in row-major (C-style)
/// order, e.g. for shape [2, 3, 4] the strides are [12, 4, 1].
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Linear element offset of a per-axis position under the given strides
pub fn element_offset(strides: &[usize], begin: &[usize]) -> usize {
    strides.iter().zip(begin.iter()).map(|(s, b)| s * b).sum()
}

/// Total size in bytes of a tensor with the given element type and shape,
/// with overflow reported rather than wrapped.
pub fn size_in_bytes(data_type: DataType, shape: &[usize]) -> Result<usize> {
    let mut total = data_type.size_in_bytes();
    for &dim in shape {
        total = total.checked_mul(dim).ok_or_else(|| {
            Error::UnsupportedShape(format!(
                "byte size overflow for shape {:?} of {:?}",
                shape, data_type
            ))
        })?;
    }
    Ok(total)
}
