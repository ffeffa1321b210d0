use std::fmt;
use std::sync::Arc;

use crate::device::{Device, DeviceBuffer};
use crate::dtype::Dtype;
use crate::error::{Error, Result};
use crate::shape::BlobShape;
use crate::syncedmem::{SyncHead, SyncedMemory};

// Blob: the unit of storage passed between layers
//
// A blob owns a 4-D array (N, C, H, W) of one floating-point type together
// with a same-sized gradient array. "data" holds forward values, "diff"
// holds gradients. Each is a `SyncedMemory`, so each independently tracks
// which of its host/device copies is current.
//
// ACCESSORS
//
//   host_data()        / host_diff()         read-only, may copy device -> host
//   host_data_mut()    / host_diff_mut()     writable, host becomes authoritative
//   device_data()      / device_diff()       read-only, may copy host -> device
//   device_data_mut()  / device_diff_mut()   writable, device becomes authoritative
//
// The read-only accessors still take `&mut self`: a read can trigger the
// lazy copy into the stale side, which mutates the blob's bookkeeping.
// Gradient rules that need data and diff of the same blob at once use the
// split accessors (`host_data_and_diff_mut`, `device_data_and_diff_mut`).
//
// Storage is owned exclusively by the blob. Blobs are not `Clone`; use
// `copy_from` to duplicate values.

/// A 4-D array of `T` with its gradient, mirrored between host and device.
pub struct Blob<T: Dtype> {
    shape: BlobShape,
    data: SyncedMemory<T>,
    diff: SyncedMemory<T>,
    device: Option<Arc<dyn Device>>,
}

impl<T: Dtype> fmt::Debug for Blob<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Blob(shape={}, dtype={}, data={:?}, diff={:?})",
            self.shape,
            T::DTYPE,
            self.data.head(),
            self.diff.head(),
        )
    }
}

impl<T: Dtype> Blob<T> {
    /// A host-only blob of the given shape.
    pub fn new(shape: impl Into<BlobShape>) -> Self {
        let shape = shape.into();
        Blob {
            shape,
            data: SyncedMemory::new(shape.count(), None),
            diff: SyncedMemory::new(shape.count(), None),
            device: None,
        }
    }

    /// A blob with signed dimensions, rejecting negative ones.
    pub fn try_new(num: i64, channels: i64, height: i64, width: i64) -> Result<Self> {
        Ok(Self::new(BlobShape::try_new(num, channels, height, width)?))
    }

    /// A blob whose device side lives on `device`.
    pub fn with_device(shape: impl Into<BlobShape>, device: Arc<dyn Device>) -> Self {
        let shape = shape.into();
        Blob {
            shape,
            data: SyncedMemory::new(shape.count(), Some(Arc::clone(&device))),
            diff: SyncedMemory::new(shape.count(), Some(Arc::clone(&device))),
            device: Some(device),
        }
    }

    /// Attach (or detach) the accelerator used for the device side.
    ///
    /// Values that were only current on the old device are copied to the host
    /// first.
    pub fn set_device(&mut self, device: Option<Arc<dyn Device>>) -> Result<()> {
        self.data.set_device(device.clone())?;
        self.diff.set_device(device.clone())?;
        self.device = device;
        Ok(())
    }

    pub fn device(&self) -> Option<&Arc<dyn Device>> {
        self.device.as_ref()
    }

    /// The attached device, or `DeviceUnavailable`.
    pub fn require_device(&self) -> Result<Arc<dyn Device>> {
        self.device.clone().ok_or(Error::DeviceUnavailable)
    }

    //  Shape

    /// Change the shape, discarding both buffers.
    ///
    /// Fails with `InvalidShape` (leaving the blob untouched) if any dimension
    /// is negative or one buffer of `T` would not fit in memory.
    pub fn reshape(&mut self, num: i64, channels: i64, height: i64, width: i64) -> Result<()> {
        let shape = BlobShape::try_new(num, channels, height, width)?;
        self.reshape_to(shape)
    }

    /// Change the shape to one given in unsigned dimensions, discarding both
    /// buffers. Same failure rules as `reshape`.
    pub fn reshape_to(&mut self, shape: impl Into<BlobShape>) -> Result<()> {
        let shape = shape.into();
        if shape.checked_bytes(T::DTYPE).is_none() {
            return Err(Error::InvalidShape {
                dims: shape.signed_dims(),
            });
        }
        tracing::debug!(from = %self.shape, to = %shape, "blob reshape");
        self.shape = shape;
        self.data = SyncedMemory::new(shape.count(), self.device.clone());
        self.diff = SyncedMemory::new(shape.count(), self.device.clone());
        Ok(())
    }

    /// Reshape to match another blob.
    pub fn reshape_like(&mut self, other: &Blob<T>) -> Result<()> {
        self.reshape_to(other.shape)
    }

    pub fn shape(&self) -> &BlobShape {
        &self.shape
    }

    pub fn num(&self) -> usize {
        self.shape.num()
    }

    pub fn channels(&self) -> usize {
        self.shape.channels()
    }

    pub fn height(&self) -> usize {
        self.shape.height()
    }

    pub fn width(&self) -> usize {
        self.shape.width()
    }

    /// Element count, N·C·H·W.
    pub fn count(&self) -> usize {
        self.shape.count()
    }

    pub fn offset(&self, n: usize, c: usize, h: usize, w: usize) -> Result<usize> {
        self.shape.offset(n, c, h, w)
    }

    pub fn data_head(&self) -> SyncHead {
        self.data.head()
    }

    pub fn diff_head(&self) -> SyncHead {
        self.diff.head()
    }

    //  Host access

    pub fn host_data(&mut self) -> Result<&[T]> {
        self.data.host()
    }

    pub fn host_data_mut(&mut self) -> Result<&mut [T]> {
        self.data.host_mut()
    }

    pub fn host_diff(&mut self) -> Result<&[T]> {
        self.diff.host()
    }

    pub fn host_diff_mut(&mut self) -> Result<&mut [T]> {
        self.diff.host_mut()
    }

    /// Read data and diff of this blob at the same time.
    pub fn host_data_and_diff(&mut self) -> Result<(&[T], &[T])> {
        let data = self.data.host()?;
        let diff = self.diff.host()?;
        Ok((data, diff))
    }

    /// Read data and write diff of this blob at the same time.
    pub fn host_data_and_diff_mut(&mut self) -> Result<(&[T], &mut [T])> {
        let data = self.data.host()?;
        let diff = self.diff.host_mut()?;
        Ok((data, diff))
    }

    //  Device access

    pub fn device_data(&mut self) -> Result<&dyn DeviceBuffer> {
        self.data.device_buffer()
    }

    pub fn device_data_mut(&mut self) -> Result<&mut dyn DeviceBuffer> {
        self.data.device_buffer_mut()
    }

    pub fn device_diff(&mut self) -> Result<&dyn DeviceBuffer> {
        self.diff.device_buffer()
    }

    pub fn device_diff_mut(&mut self) -> Result<&mut dyn DeviceBuffer> {
        self.diff.device_buffer_mut()
    }

    /// Device counterpart of [`Blob::host_data_and_diff`].
    pub fn device_data_and_diff(&mut self) -> Result<(&dyn DeviceBuffer, &dyn DeviceBuffer)> {
        let data = self.data.device_buffer()?;
        let diff = self.diff.device_buffer()?;
        Ok((data, diff))
    }

    /// Device counterpart of [`Blob::host_data_and_diff_mut`].
    pub fn device_data_and_diff_mut(
        &mut self,
    ) -> Result<(&dyn DeviceBuffer, &mut dyn DeviceBuffer)> {
        let data = self.data.device_buffer()?;
        let diff = self.diff.device_buffer_mut()?;
        Ok((data, diff))
    }

    //  Element helpers

    pub fn data_at(&mut self, n: usize, c: usize, h: usize, w: usize) -> Result<T> {
        let i = self.shape.offset(n, c, h, w)?;
        Ok(self.host_data()?[i])
    }

    pub fn diff_at(&mut self, n: usize, c: usize, h: usize, w: usize) -> Result<T> {
        let i = self.shape.offset(n, c, h, w)?;
        Ok(self.host_diff()?[i])
    }

    /// Copy values from `source`.
    ///
    /// Copies data, or diff when `copy_diff` is set. If the shapes differ the
    /// blob is reshaped when `reshape` is set, otherwise a `ShapeMismatch` is
    /// returned.
    pub fn copy_from(&mut self, source: &mut Blob<T>, copy_diff: bool, reshape: bool) -> Result<()> {
        if source.shape != self.shape {
            if !reshape {
                return Err(Error::blob_mismatch("copy_from", &self.shape, &source.shape));
            }
            self.reshape_like(source)?;
        }
        if copy_diff {
            let src = source.host_diff()?;
            self.host_diff_mut()?.copy_from_slice(src);
        } else {
            let src = source.host_data()?;
            self.host_data_mut()?.copy_from_slice(src);
        }
        Ok(())
    }

    /// Gradient step: data -= diff.
    ///
    /// Runs on the device when the device copy of data is authoritative, on
    /// the host otherwise.
    pub fn update(&mut self) -> Result<()> {
        match self.data.head() {
            SyncHead::DeviceAuthoritative => {
                let device = self.require_device()?;
                let diff = self.diff.device_buffer()?;
                let data = self.data.device_buffer_mut()?;
                device.axpy(-1.0, diff, data)
            }
            _ => {
                let diff = self.diff.host()?;
                let data = self.data.host_mut()?;
                for (d, &g) in data.iter_mut().zip(diff) {
                    *d = *d - g;
                }
                Ok(())
            }
        }
    }

    /// Sum of absolute values of data.
    pub fn asum_data(&mut self) -> Result<T> {
        Ok(self
            .host_data()?
            .iter()
            .fold(T::zero(), |acc, &x| acc + x.abs()))
    }

    /// Sum of absolute values of diff.
    pub fn asum_diff(&mut self) -> Result<T> {
        Ok(self
            .host_diff()?
            .iter()
            .fold(T::zero(), |acc, &x| acc + x.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::EmulatedDevice;
    use crate::error::MemorySide;

    #[test]
    fn test_new_and_dims() {
        let b = Blob::<f32>::new((2, 3, 4, 5));
        assert_eq!(b.num(), 2);
        assert_eq!(b.channels(), 3);
        assert_eq!(b.height(), 4);
        assert_eq!(b.width(), 5);
        assert_eq!(b.count(), 120);
        assert_eq!(b.data_head(), SyncHead::Uninitialized);
    }

    #[test]
    fn test_reshape_discards_values() {
        let mut b = Blob::<f64>::new((1, 1, 2, 2));
        b.host_data_mut().unwrap().fill(3.0);
        b.reshape(1, 1, 2, 3).unwrap();
        assert_eq!(b.count(), 6);
        assert_eq!(b.data_head(), SyncHead::Uninitialized);
        assert_eq!(b.host_data().unwrap(), &[0.0; 6]);
    }

    #[test]
    fn test_reshape_negative_keeps_shape() {
        let mut b = Blob::<f32>::new((2, 2, 2, 2));
        let err = b.reshape(2, -2, 2, 2).unwrap_err();
        assert!(matches!(err, Error::InvalidShape { .. }));
        assert_eq!(b.shape().dims(), [2, 2, 2, 2]);
    }

    #[test]
    fn test_reshape_rejects_unallocatable_sizes() {
        let mut b = Blob::<f64>::new((1, 1, 2, 2));
        b.host_data_mut().unwrap().fill(1.5);
        let err = b.reshape(1, 1, 1, 1 << 61).unwrap_err();
        assert!(matches!(err, Error::InvalidShape { dims: [1, 1, 1, _] }));
        let err = b.reshape_to((usize::MAX, 2, 1, 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidShape { dims: [i64::MAX, 2, 1, 1] }));
        assert_eq!(b.shape().dims(), [1, 1, 2, 2]);
        assert_eq!(b.host_data().unwrap(), &[1.5; 4]);
    }

    #[test]
    fn test_oversized_blob_fails_on_host_access() {
        for shape in [(1, 1, 1, 1usize << 61), (usize::MAX, 2, 1, 1)] {
            let mut b = Blob::<f64>::new(shape);
            match b.host_data() {
                Err(Error::AllocationFailure { side, .. }) => assert_eq!(side, MemorySide::Host),
                other => panic!("expected allocation failure, got {other:?}"),
            }
            assert_eq!(b.data_head(), SyncHead::Uninitialized);
        }
    }

    #[test]
    fn test_oversized_blob_fails_on_device_access() {
        let budgeted: Arc<dyn Device> = Arc::new(EmulatedDevice::new(0).with_budget(1 << 20));
        let unbounded: Arc<dyn Device> = Arc::new(EmulatedDevice::new(1));
        for dev in [budgeted, unbounded] {
            let mut b = Blob::<f64>::with_device((1, 1, 1, 1 << 61), dev);
            match b.device_data() {
                Err(Error::AllocationFailure { side, .. }) => {
                    assert_eq!(side, MemorySide::Device)
                }
                other => panic!("expected allocation failure, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_data_at() {
        let mut b = Blob::<f32>::new((1, 2, 1, 3));
        for (i, v) in b.host_data_mut().unwrap().iter_mut().enumerate() {
            *v = i as f32;
        }
        assert_eq!(b.data_at(0, 1, 0, 2).unwrap(), 5.0);
        assert!(b.data_at(0, 2, 0, 0).is_err());
    }

    #[test]
    fn test_update_host() {
        let mut b = Blob::<f64>::new((1, 1, 1, 3));
        b.host_data_mut().unwrap().copy_from_slice(&[1.0, 2.0, 3.0]);
        b.host_diff_mut().unwrap().copy_from_slice(&[0.5, 0.5, 4.0]);
        b.update().unwrap();
        assert_eq!(b.host_data().unwrap(), &[0.5, 1.5, -1.0]);
        assert_eq!(b.asum_data().unwrap(), 3.0);
        assert_eq!(b.asum_diff().unwrap(), 5.0);
    }

    #[test]
    fn test_update_device() {
        let dev = EmulatedDevice::new(0);
        let mut b = Blob::<f32>::with_device((1, 1, 1, 2), Arc::new(dev.clone()));
        b.host_data_mut().unwrap().copy_from_slice(&[1.0, 1.0]);
        b.host_diff_mut().unwrap().copy_from_slice(&[0.25, -1.0]);
        b.device_data_mut().unwrap();
        b.update().unwrap();
        assert_eq!(b.data_head(), SyncHead::DeviceAuthoritative);
        assert_eq!(b.host_data().unwrap(), &[0.75, 2.0]);
    }

    #[test]
    fn test_copy_from() {
        let mut src = Blob::<f32>::new((1, 1, 1, 2));
        src.host_data_mut().unwrap().copy_from_slice(&[7.0, 8.0]);
        src.host_diff_mut().unwrap().copy_from_slice(&[1.0, 2.0]);

        let mut dst = Blob::<f32>::new((1, 1, 1, 3));
        assert!(matches!(
            dst.copy_from(&mut src, false, false),
            Err(Error::ShapeMismatch { .. })
        ));
        dst.copy_from(&mut src, false, true).unwrap();
        assert_eq!(dst.host_data().unwrap(), &[7.0, 8.0]);
        dst.copy_from(&mut src, true, false).unwrap();
        assert_eq!(dst.host_diff().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_split_access() {
        let mut b = Blob::<f32>::new((1, 1, 1, 2));
        b.host_data_mut().unwrap().copy_from_slice(&[3.0, 4.0]);
        let (data, diff) = b.host_data_and_diff_mut().unwrap();
        diff.copy_from_slice(data);
        assert_eq!(b.host_diff().unwrap(), &[3.0, 4.0]);
    }
}
