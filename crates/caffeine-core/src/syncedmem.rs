use std::fmt;
use std::sync::Arc;

use crate::device::{Device, DeviceBuffer};
use crate::dtype::Dtype;
use crate::error::{Error, MemorySide, Result};

// SyncedMemory: one logical buffer with a host copy and a device copy
//
// A small cache-coherence protocol. `head` records which copy is
// authoritative:
//
//   Uninitialized      neither side allocated yet
//   HostAuthoritative  host is current, device (if any) is stale
//   DeviceAuthoritative device is current, host (if any) is stale
//   Synced             both copies hold the same values
//
// Reading a side copies into it first if it is stale and moves the head to
// Synced. Writing a side (the `_mut` accessors) makes that side
// authoritative and the other stale; nothing is copied until the stale side
// is next touched. So at no point are both sides stale at once.
//
// Each side is allocated (zero-filled) on first access, never eagerly.

/// Which copy of a [`SyncedMemory`] holds the current values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncHead {
    Uninitialized,
    HostAuthoritative,
    DeviceAuthoritative,
    Synced,
}

impl SyncHead {
    /// Whether reading the host side would trigger a copy.
    pub fn host_stale(&self) -> bool {
        matches!(self, SyncHead::DeviceAuthoritative)
    }

    /// Whether reading the device side would trigger a copy.
    pub fn device_stale(&self) -> bool {
        matches!(self, SyncHead::HostAuthoritative)
    }
}

/// A buffer of `len` elements mirrored between host and an optional device.
pub struct SyncedMemory<T: Dtype> {
    len: usize,
    host: Option<Vec<T>>,
    device_buf: Option<Box<dyn DeviceBuffer>>,
    device: Option<Arc<dyn Device>>,
    head: SyncHead,
}

impl<T: Dtype> fmt::Debug for SyncedMemory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SyncedMemory(len={}, dtype={}, head={:?}, device={:?})",
            self.len,
            T::DTYPE,
            self.head,
            self.device.as_ref().map(|d| d.name()),
        )
    }
}

impl<T: Dtype> SyncedMemory<T> {
    /// A buffer of `len` elements. Nothing is allocated until first access.
    pub fn new(len: usize, device: Option<Arc<dyn Device>>) -> Self {
        SyncedMemory {
            len,
            host: None,
            device_buf: None,
            device,
            head: SyncHead::Uninitialized,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> SyncHead {
        self.head
    }

    pub fn device(&self) -> Option<&Arc<dyn Device>> {
        self.device.as_ref()
    }

    /// Whether each side has been allocated: (host, device).
    pub fn allocated(&self) -> (bool, bool) {
        (self.host.is_some(), self.device_buf.is_some())
    }

    /// Attach a different device (or detach with `None`).
    ///
    /// Device-authoritative values are pulled to the host first so nothing
    /// is lost; the old device allocation is released.
    pub fn set_device(&mut self, device: Option<Arc<dyn Device>>) -> Result<()> {
        if self.head == SyncHead::DeviceAuthoritative {
            self.to_host()?;
        }
        self.device_buf = None;
        self.device = device;
        if self.head == SyncHead::Synced {
            self.head = SyncHead::HostAuthoritative;
        }
        Ok(())
    }

    fn alloc_host(len: usize) -> Result<Vec<T>> {
        let mut v = Vec::new();
        v.try_reserve_exact(len)
            .map_err(|e| Error::AllocationFailure {
                bytes: T::DTYPE.bytes_for(len),
                side: MemorySide::Host,
                reason: e.to_string(),
            })?;
        v.resize(len, T::zero());
        Ok(v)
    }

    fn to_host(&mut self) -> Result<()> {
        match self.head {
            SyncHead::Uninitialized => {
                self.host = Some(Self::alloc_host(self.len)?);
                self.head = SyncHead::HostAuthoritative;
            }
            SyncHead::DeviceAuthoritative => {
                let (device, src) = match (&self.device, &self.device_buf) {
                    (Some(d), Some(b)) => (d, b),
                    _ => return Err(Error::DeviceUnavailable),
                };
                if self.host.is_none() {
                    self.host = Some(Self::alloc_host(self.len)?);
                }
                if let Some(host) = self.host.as_mut() {
                    tracing::trace!(
                        len = self.len,
                        bytes = T::DTYPE.bytes_for(self.len),
                        device = %device.name(),
                        "device -> host"
                    );
                    device.copy_dtoh(src.as_ref(), T::host_slice_mut(host))?;
                }
                self.head = SyncHead::Synced;
            }
            SyncHead::HostAuthoritative | SyncHead::Synced => {}
        }
        Ok(())
    }

    fn to_device(&mut self) -> Result<()> {
        let device = self.device.as_ref().ok_or(Error::DeviceUnavailable)?;
        match self.head {
            SyncHead::Uninitialized => {
                self.device_buf = Some(device.alloc_zeros(T::DTYPE, self.len)?);
                self.head = SyncHead::DeviceAuthoritative;
            }
            SyncHead::HostAuthoritative => {
                if self.device_buf.is_none() {
                    self.device_buf = Some(device.alloc_zeros(T::DTYPE, self.len)?);
                }
                if let (Some(host), Some(dst)) = (self.host.as_ref(), self.device_buf.as_mut()) {
                    tracing::trace!(
                        len = self.len,
                        bytes = T::DTYPE.bytes_for(self.len),
                        device = %device.name(),
                        "host -> device"
                    );
                    device.copy_htod(T::host_slice(host), dst.as_mut())?;
                }
                self.head = SyncHead::Synced;
            }
            SyncHead::DeviceAuthoritative | SyncHead::Synced => {}
        }
        Ok(())
    }

    /// Read-only host view. Syncs from the device if it is authoritative.
    pub fn host(&mut self) -> Result<&[T]> {
        self.to_host()?;
        self.host
            .as_deref()
            .ok_or_else(|| Error::msg("host buffer missing after sync"))
    }

    /// Writable host view. The host becomes authoritative.
    pub fn host_mut(&mut self) -> Result<&mut [T]> {
        self.to_host()?;
        self.head = SyncHead::HostAuthoritative;
        self.host
            .as_deref_mut()
            .ok_or_else(|| Error::msg("host buffer missing after sync"))
    }

    /// Read-only device view. Syncs from the host if it is authoritative.
    pub fn device_buffer(&mut self) -> Result<&dyn DeviceBuffer> {
        self.to_device()?;
        self.device_buf
            .as_deref()
            .ok_or_else(|| Error::msg("device buffer missing after sync"))
    }

    /// Writable device view. The device becomes authoritative.
    pub fn device_buffer_mut(&mut self) -> Result<&mut dyn DeviceBuffer> {
        self.to_device()?;
        self.head = SyncHead::DeviceAuthoritative;
        match self.device_buf.as_mut() {
            Some(b) => Ok(b.as_mut()),
            None => Err(Error::msg("device buffer missing after sync")),
        }
    }
}
