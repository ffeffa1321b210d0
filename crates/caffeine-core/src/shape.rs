use std::fmt;

use crate::dtype::DType;
use crate::error::{Error, Result};

// BlobShape: the fixed 4-D geometry of a blob
//
// Every blob is (num, channels, height, width), row-major with width
// contiguous:
//
//   offset(n, c, h, w) = ((n * C + c) * H + h) * W + w
//
// Dimensions of zero are legal and give an empty blob. Negative dimensions
// only exist at the API edge (`try_new`), where they are rejected.
//
// Shapes built from `usize` dimensions are not validated. An element count
// that overflows saturates at `usize::MAX`, which no allocation can satisfy,
// so such a blob fails with `AllocationFailure` on first access.

/// Shape of a blob: (N, C, H, W).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlobShape {
    num: usize,
    channels: usize,
    height: usize,
    width: usize,
}

impl BlobShape {
    /// Create a shape from already-valid dimensions.
    pub fn new(num: usize, channels: usize, height: usize, width: usize) -> Self {
        BlobShape {
            num,
            channels,
            height,
            width,
        }
    }

    /// Validate signed dimensions and build a shape.
    ///
    /// Fails with `InvalidShape` if any dimension is negative or the element
    /// count overflows `usize`.
    pub fn try_new(num: i64, channels: i64, height: i64, width: i64) -> Result<Self> {
        let dims = [num, channels, height, width];
        let invalid = || Error::InvalidShape { dims };
        let mut out = [0usize; 4];
        for (slot, &d) in out.iter_mut().zip(dims.iter()) {
            *slot = usize::try_from(d).map_err(|_| invalid())?;
        }
        let shape = BlobShape::new(out[0], out[1], out[2], out[3]);
        shape.checked_count().ok_or_else(invalid)?;
        Ok(shape)
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// The four dimensions in (N, C, H, W) order.
    pub fn dims(&self) -> [usize; 4] {
        [self.num, self.channels, self.height, self.width]
    }

    /// Total number of elements, N·C·H·W, saturating at `usize::MAX`.
    pub fn count(&self) -> usize {
        self.checked_count().unwrap_or(usize::MAX)
    }

    /// N·C·H·W, or None if it overflows `usize`.
    pub fn checked_count(&self) -> Option<usize> {
        self.num
            .checked_mul(self.channels)?
            .checked_mul(self.height)?
            .checked_mul(self.width)
    }

    /// Bytes needed for one buffer of `dtype`, or None if they exceed
    /// `isize::MAX` (the largest allocation Rust can make).
    pub fn checked_bytes(&self, dtype: DType) -> Option<usize> {
        let bytes = self.checked_count()?.checked_mul(dtype.size_in_bytes())?;
        (bytes <= isize::MAX as usize).then_some(bytes)
    }

    /// Signed dimensions, as reported by `InvalidShape`.
    pub fn signed_dims(&self) -> [i64; 4] {
        self.dims().map(|d| i64::try_from(d).unwrap_or(i64::MAX))
    }

    /// Flat index of element (n, c, h, w).
    pub fn offset(&self, n: usize, c: usize, h: usize, w: usize) -> Result<usize> {
        if n >= self.num || c >= self.channels || h >= self.height || w >= self.width {
            return Err(Error::msg(format!(
                "index ({n}, {c}, {h}, {w}) out of bounds for shape {self}"
            )));
        }
        n.checked_mul(self.channels)
            .and_then(|i| i.checked_add(c)?.checked_mul(self.height))
            .and_then(|i| i.checked_add(h)?.checked_mul(self.width))
            .and_then(|i| i.checked_add(w))
            .ok_or_else(|| {
                Error::msg(format!("offset of ({n}, {c}, {h}, {w}) overflows in {self}"))
            })
    }
}

impl fmt::Display for BlobShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.num, self.channels, self.height, self.width
        )
    }
}

impl From<(usize, usize, usize, usize)> for BlobShape {
    fn from((n, c, h, w): (usize, usize, usize, usize)) -> Self {
        BlobShape::new(n, c, h, w)
    }
}

impl From<[usize; 4]> for BlobShape {
    fn from(d: [usize; 4]) -> Self {
        BlobShape::new(d[0], d[1], d[2], d[3])
    }
}
