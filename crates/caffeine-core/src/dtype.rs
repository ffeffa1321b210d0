use std::fmt;

// DType: the element precision of a blob
//
// A blob picks one floating-point precision at construction and keeps it for
// its whole life. Layers are written once, generically over `Dtype`, and
// behave identically for f32 and f64 up to rounding.
//
// The runtime `DType` tag is what crosses the device seam: accelerator
// buffers are untyped trait objects, so the device needs to be told which
// kernel flavour to launch.

/// Runtime tag for the supported element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    /// Bytes taken by `len` elements, saturating at `usize::MAX`.
    pub fn bytes_for(&self, len: usize) -> usize {
        len.saturating_mul(self.size_in_bytes())
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

/// Borrowed typed host memory, handed to a device for host-to-device copies.
#[derive(Debug)]
pub enum HostSlice<'a> {
    F32(&'a [f32]),
    F64(&'a [f64]),
}

/// Mutable typed host memory, the destination of device-to-host copies.
#[derive(Debug)]
pub enum HostSliceMut<'a> {
    F32(&'a mut [f32]),
    F64(&'a mut [f64]),
}

impl HostSlice<'_> {
    pub fn dtype(&self) -> DType {
        match self {
            HostSlice::F32(_) => DType::F32,
            HostSlice::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostSlice::F32(s) => s.len(),
            HostSlice::F64(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HostSliceMut<'_> {
    pub fn dtype(&self) -> DType {
        match self {
            HostSliceMut::F32(_) => DType::F32,
            HostSliceMut::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostSliceMut::F32(s) => s.len(),
            HostSliceMut::F64(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Floating-point element types a blob can hold.
///
/// Bridges the Rust type to the runtime [`DType`] tag and to the typed
/// host views the device seam works with.
pub trait Dtype:
    num_traits::Float + Default + Send + Sync + fmt::Debug + fmt::Display + 'static
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Widen to f64 (for generic numeric code and tolerances).
    fn as_f64(self) -> f64;

    /// Narrow from f64.
    fn from_f64(v: f64) -> Self;

    /// View a host buffer of this type through the device seam.
    fn host_slice(s: &[Self]) -> HostSlice<'_>;

    /// Mutable view of a host buffer of this type.
    fn host_slice_mut(s: &mut [Self]) -> HostSliceMut<'_>;
}

impl Dtype for f32 {
    const DTYPE: DType = DType::F32;
    fn as_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    fn host_slice(s: &[Self]) -> HostSlice<'_> {
        HostSlice::F32(s)
    }
    fn host_slice_mut(s: &mut [Self]) -> HostSliceMut<'_> {
        HostSliceMut::F32(s)
    }
}

impl Dtype for f64 {
    const DTYPE: DType = DType::F64;
    fn as_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
    fn host_slice(s: &[Self]) -> HostSlice<'_> {
        HostSlice::F64(s)
    }
    fn host_slice_mut(s: &mut [Self]) -> HostSliceMut<'_> {
        HostSliceMut::F64(s)
    }
}
