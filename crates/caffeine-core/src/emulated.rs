// EmulatedDevice: an accelerator backed by separate host allocations
//
// Behaves like a discrete device from the blob's point of view: its buffers
// are distinct allocations that can only be reached through `copy_htod` /
// `copy_dtoh`, so a stale side really is stale until the sync protocol
// copies it. Kernels run the same scalar rules as the host path.
//
// Used to exercise the host/device coherence logic and the device Forward /
// Backward paths on machines without a GPU. Every copy is counted, and an
// optional allocation budget lets callers provoke `AllocationFailure`.
// Buffers give their bytes back to the budget when dropped.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::device::{check_same_layout, downcast_mut, downcast_ref};
use crate::device::{Device, DeviceBuffer, NeuronOp};
use crate::dtype::{DType, HostSlice, HostSliceMut};
use crate::error::{Error, MemorySide, Result};

/// Element storage of an emulated buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum EmulatedData {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Device-side storage of the emulated accelerator.
///
/// Returns its bytes to the owning device's budget when dropped.
#[derive(Debug)]
pub struct EmulatedBuffer {
    data: EmulatedData,
    counters: Arc<Counters>,
}

impl EmulatedBuffer {
    pub fn data(&self) -> &EmulatedData {
        &self.data
    }

    fn bytes(&self) -> usize {
        self.dtype().bytes_for(self.len())
    }
}

/// A zero-filled vector, or `AllocationFailure` if it cannot be reserved.
fn zeroed<E: Clone + Default>(len: usize, bytes: usize) -> Result<Vec<E>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|e| Error::AllocationFailure {
            bytes,
            side: MemorySide::Device,
            reason: e.to_string(),
        })?;
    v.resize(len, E::default());
    Ok(v)
}

impl Drop for EmulatedBuffer {
    fn drop(&mut self) {
        let bytes = self.bytes();
        self.counters.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}

impl DeviceBuffer for EmulatedBuffer {
    fn dtype(&self) -> DType {
        match self.data {
            EmulatedData::F32(_) => DType::F32,
            EmulatedData::F64(_) => DType::F64,
        }
    }

    fn len(&self) -> usize {
        match &self.data {
            EmulatedData::F32(v) => v.len(),
            EmulatedData::F64(v) => v.len(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Snapshot of transfer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStats {
    /// Host-to-device copies performed.
    pub htod: u64,
    /// Device-to-host copies performed.
    pub dtoh: u64,
    /// Buffers allocated.
    pub allocs: u64,
    /// Bytes currently allocated.
    pub live_bytes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    htod: AtomicU64,
    dtoh: AtomicU64,
    allocs: AtomicU64,
    live_bytes: AtomicUsize,
}

/// A host-memory stand-in for an accelerator.
///
/// Clones share counters and the allocation budget.
#[derive(Debug, Clone)]
pub struct EmulatedDevice {
    ordinal: usize,
    budget: Option<usize>,
    counters: Arc<Counters>,
}

impl EmulatedDevice {
    pub fn new(ordinal: usize) -> Self {
        EmulatedDevice {
            ordinal,
            budget: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Cap the bytes that may be allocated at any one time.
    pub fn with_budget(mut self, bytes: usize) -> Self {
        self.budget = Some(bytes);
        self
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            htod: self.counters.htod.load(Ordering::Relaxed),
            dtoh: self.counters.dtoh.load(Ordering::Relaxed),
            allocs: self.counters.allocs.load(Ordering::Relaxed),
            live_bytes: self.counters.live_bytes.load(Ordering::Relaxed),
        }
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Device for EmulatedDevice {
    fn name(&self) -> String {
        format!("emulated:{}", self.ordinal)
    }

    fn alloc_zeros(&self, dtype: DType, len: usize) -> Result<Box<dyn DeviceBuffer>> {
        let bytes = dtype.bytes_for(len);
        if let Some(budget) = self.budget {
            let live = self.counters.live_bytes.load(Ordering::Relaxed);
            if live.checked_add(bytes).map_or(true, |total| total > budget) {
                return Err(Error::AllocationFailure {
                    bytes,
                    side: MemorySide::Device,
                    reason: format!("budget of {budget} bytes exhausted ({live} in use)"),
                });
            }
        }
        let data = match dtype {
            DType::F32 => EmulatedData::F32(zeroed(len, bytes)?),
            DType::F64 => EmulatedData::F64(zeroed(len, bytes)?),
        };
        self.counters.allocs.fetch_add(1, Ordering::Relaxed);
        self.counters.live_bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(Box::new(EmulatedBuffer {
            data,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn copy_htod(&self, src: HostSlice<'_>, dst: &mut dyn DeviceBuffer) -> Result<()> {
        let dst = downcast_mut::<EmulatedBuffer>(dst)?;
        match (src, &mut dst.data) {
            (HostSlice::F32(s), EmulatedData::F32(d)) if s.len() == d.len() => {
                d.copy_from_slice(s)
            }
            (HostSlice::F64(s), EmulatedData::F64(d)) if s.len() == d.len() => {
                d.copy_from_slice(s)
            }
            (s, _) => {
                return Err(Error::Device(format!(
                    "htod: host {}x{} does not match device buffer",
                    s.dtype(),
                    s.len(),
                )))
            }
        }
        self.counters.htod.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn copy_dtoh(&self, src: &dyn DeviceBuffer, dst: HostSliceMut<'_>) -> Result<()> {
        let src = downcast_ref::<EmulatedBuffer>(src)?;
        match (&src.data, dst) {
            (EmulatedData::F32(s), HostSliceMut::F32(d)) if s.len() == d.len() => {
                d.copy_from_slice(s)
            }
            (EmulatedData::F64(s), HostSliceMut::F64(d)) if s.len() == d.len() => {
                d.copy_from_slice(s)
            }
            (_, d) => {
                return Err(Error::Device(format!(
                    "dtoh: device buffer does not match host {}x{}",
                    d.dtype(),
                    d.len()
                )))
            }
        }
        self.counters.dtoh.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn neuron_forward(
        &self,
        op: NeuronOp,
        x: &dyn DeviceBuffer,
        y: &mut dyn DeviceBuffer,
    ) -> Result<()> {
        check_same_layout(&[x, &*y])?;
        let x = downcast_ref::<EmulatedBuffer>(x)?;
        let y = downcast_mut::<EmulatedBuffer>(y)?;
        match (&x.data, &mut y.data) {
            (EmulatedData::F32(x), EmulatedData::F32(y)) => op.forward_slice(x, y),
            (EmulatedData::F64(x), EmulatedData::F64(y)) => op.forward_slice(x, y),
            _ => return Err(Error::msg("neuron_forward: dtype mismatch")),
        }
        Ok(())
    }

    fn neuron_backward(
        &self,
        op: NeuronOp,
        x: &dyn DeviceBuffer,
        y: &dyn DeviceBuffer,
        dy: &dyn DeviceBuffer,
        dx: &mut dyn DeviceBuffer,
    ) -> Result<()> {
        check_same_layout(&[x, y, dy, &*dx])?;
        let x = downcast_ref::<EmulatedBuffer>(x)?;
        let y = downcast_ref::<EmulatedBuffer>(y)?;
        let dy = downcast_ref::<EmulatedBuffer>(dy)?;
        let dx = downcast_mut::<EmulatedBuffer>(dx)?;
        match (&x.data, &y.data, &dy.data, &mut dx.data) {
            (
                EmulatedData::F32(x),
                EmulatedData::F32(y),
                EmulatedData::F32(dy),
                EmulatedData::F32(dx),
            ) => op.backward_slice(x, y, dy, dx),
            (
                EmulatedData::F64(x),
                EmulatedData::F64(y),
                EmulatedData::F64(dy),
                EmulatedData::F64(dx),
            ) => op.backward_slice(x, y, dy, dx),
            _ => return Err(Error::msg("neuron_backward: dtype mismatch")),
        }
        Ok(())
    }

    fn axpy(&self, alpha: f64, x: &dyn DeviceBuffer, y: &mut dyn DeviceBuffer) -> Result<()> {
        check_same_layout(&[x, &*y])?;
        let x = downcast_ref::<EmulatedBuffer>(x)?;
        let y = downcast_mut::<EmulatedBuffer>(y)?;
        match (&x.data, &mut y.data) {
            (EmulatedData::F32(x), EmulatedData::F32(y)) => {
                let a = alpha as f32;
                y.iter_mut().zip(x).for_each(|(yi, &xi)| *yi += a * xi);
            }
            (EmulatedData::F64(x), EmulatedData::F64(y)) => {
                y.iter_mut().zip(x).for_each(|(yi, &xi)| *yi += alpha * xi);
            }
            _ => return Err(Error::msg("axpy: dtype mismatch")),
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_copy() {
        let dev = EmulatedDevice::new(0);
        let mut buf = dev.alloc_zeros(DType::F32, 3).unwrap();
        dev.copy_htod(HostSlice::F32(&[1.0, -2.0, 3.0]), buf.as_mut())
            .unwrap();
        let mut out = [0.0f32; 3];
        dev.copy_dtoh(buf.as_ref(), HostSliceMut::F32(&mut out))
            .unwrap();
        assert_eq!(out, [1.0, -2.0, 3.0]);
        let s = dev.stats();
        assert_eq!((s.htod, s.dtoh, s.allocs), (1, 1, 1));
        assert_eq!(s.live_bytes, 12);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let dev = EmulatedDevice::new(0);
        let mut buf = dev.alloc_zeros(DType::F64, 2).unwrap();
        assert!(dev
            .copy_htod(HostSlice::F64(&[1.0, 2.0, 3.0]), buf.as_mut())
            .is_err());
        assert!(dev
            .copy_htod(HostSlice::F32(&[1.0, 2.0]), buf.as_mut())
            .is_err());
    }

    #[test]
    fn test_budget() {
        let dev = EmulatedDevice::new(0).with_budget(16);
        let a = dev.alloc_zeros(DType::F64, 2).unwrap();
        let err = dev.alloc_zeros(DType::F32, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::AllocationFailure {
                side: MemorySide::Device,
                ..
            }
        ));
        drop(a);
        assert_eq!(dev.stats().live_bytes, 0);
        assert!(dev.alloc_zeros(DType::F32, 4).is_ok());
    }

    #[test]
    fn test_oversized_allocation_fails() {
        let huge = 1usize << 61;
        for dev in [EmulatedDevice::new(0), EmulatedDevice::new(1).with_budget(64)] {
            match dev.alloc_zeros(DType::F64, huge) {
                Err(Error::AllocationFailure { bytes, side, .. }) => {
                    assert_eq!(bytes, usize::MAX);
                    assert_eq!(side, MemorySide::Device);
                }
                other => panic!("expected allocation failure, got {other:?}"),
            }
            assert_eq!(dev.stats().allocs, 0);
            assert_eq!(dev.stats().live_bytes, 0);
        }
    }

    #[test]
    fn test_relu_kernel() {
        let dev = EmulatedDevice::new(0);
        let mut x = dev.alloc_zeros(DType::F64, 4).unwrap();
        let mut y = dev.alloc_zeros(DType::F64, 4).unwrap();
        dev.copy_htod(HostSlice::F64(&[-1.0, 0.5, -0.25, 2.0]), x.as_mut())
            .unwrap();
        let op = NeuronOp::Relu {
            negative_slope: 0.0,
        };
        dev.neuron_forward(op, x.as_ref(), y.as_mut()).unwrap();
        let mut out = [9.0f64; 4];
        dev.copy_dtoh(y.as_ref(), HostSliceMut::F64(&mut out))
            .unwrap();
        assert_eq!(out, [0.0, 0.5, 0.0, 2.0]);
    }

    #[test]
    fn test_axpy() {
        let dev = EmulatedDevice::new(0);
        let mut x = dev.alloc_zeros(DType::F32, 2).unwrap();
        let mut y = dev.alloc_zeros(DType::F32, 2).unwrap();
        dev.copy_htod(HostSlice::F32(&[1.0, 2.0]), x.as_mut()).unwrap();
        dev.copy_htod(HostSlice::F32(&[10.0, 10.0]), y.as_mut())
            .unwrap();
        dev.axpy(-1.0, x.as_ref(), y.as_mut()).unwrap();
        let mut out = [0.0f32; 2];
        dev.copy_dtoh(y.as_ref(), HostSliceMut::F32(&mut out))
            .unwrap();
        assert_eq!(out, [9.0, 8.0]);
    }
}
