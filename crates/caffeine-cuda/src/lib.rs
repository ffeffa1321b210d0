// CUDA device: the `Device` seam implemented with cudarc
//
// Blobs attached to a `CudaDevice` keep their device copies in `CudaBuffer`s.
// Neuron Forward/Backward and axpy run as NVRTC-compiled kernels (see
// kernels.rs); host/device copies are synchronous.
//
// ARCHITECTURE:
// - CudaDevice wraps cudarc's device handle and a caching memory pool
// - CudaBuffer is an f32 or f64 CudaSlice plus its logical length; on drop
//   the slice goes back to the pool instead of the driver
// - Zero-length buffers are backed by a one-element slice, since the driver
//   rejects empty allocations; copies and launches skip them
//
// USAGE:
//   let device: Arc<dyn Device> = Arc::new(CudaDevice::new(0)?);
//   let blob = Blob::<f32>::with_device((2, 3, 4, 5), device);

mod kernels;
pub mod pool;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use cudarc::driver::{CudaSlice, DeviceRepr, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};

use caffeine_core::device::{check_same_layout, downcast_mut, downcast_ref};
use caffeine_core::device::{Device, DeviceBuffer, NeuronOp};
use caffeine_core::dtype::{DType, HostSlice, HostSliceMut};
use caffeine_core::error::{Error, MemorySide, Result};

use pool::{CudaMemPool, PoolStats};

//  CudaBuffer

enum CudaData {
    F32(CudaSlice<f32>),
    F64(CudaSlice<f64>),
}

/// Device memory owned by a blob on a `CudaDevice`.
pub struct CudaBuffer {
    /// None only while being dropped.
    data: Option<CudaData>,
    len: usize,
    dtype: DType,
    pool: Arc<CudaMemPool>,
}

impl CudaBuffer {
    fn data(&self) -> Result<&CudaData> {
        self.data
            .as_ref()
            .ok_or_else(|| Error::Device("cuda buffer already released".into()))
    }

    fn data_mut(&mut self) -> Result<&mut CudaData> {
        self.data
            .as_mut()
            .ok_or_else(|| Error::Device("cuda buffer already released".into()))
    }
}

impl Drop for CudaBuffer {
    fn drop(&mut self) {
        match self.data.take() {
            Some(CudaData::F32(s)) => self.pool.reclaim_f32(s),
            Some(CudaData::F64(s)) => self.pool.reclaim_f64(s),
            None => {}
        }
    }
}

impl fmt::Debug for CudaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaBuffer")
            .field("dtype", &self.dtype)
            .field("len", &self.len)
            .finish()
    }
}

impl DeviceBuffer for CudaBuffer {
    fn dtype(&self) -> DType {
        self.dtype
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

//  CudaDevice

/// A CUDA GPU. Clones share the driver context and the memory pool.
#[derive(Clone)]
pub struct CudaDevice {
    dev: Arc<cudarc::driver::CudaDevice>,
    pool: Arc<CudaMemPool>,
    ordinal: usize,
}

impl CudaDevice {
    /// Open GPU `ordinal` and compile the kernels for it.
    ///
    /// Returns `DeviceUnavailable` when no such GPU can be opened.
    pub fn new(ordinal: usize) -> Result<Self> {
        let dev = cudarc::driver::CudaDevice::new(ordinal).map_err(|e| {
            tracing::warn!(ordinal, error = %e, "CUDA device unavailable");
            Error::DeviceUnavailable
        })?;

        // Target the device's own architecture (sm_XX) so the PTX version
        // always matches the driver.
        let major = dev
            .attribute(
                cudarc::driver::sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
            )
            .unwrap_or(8);
        let minor = dev
            .attribute(
                cudarc::driver::sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
            )
            .unwrap_or(0);
        let arch: &'static str = Box::leak(format!("sm_{major}{minor}").into_boxed_str());
        let opts = CompileOptions {
            arch: Some(arch),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(kernels::KERNEL_SOURCE, opts)
            .map_err(|e| Error::Device(format!("NVRTC compilation failed: {e}")))?;
        dev.load_ptx(ptx, kernels::MODULE_NAME, kernels::KERNEL_NAMES)
            .map_err(|e| Error::Device(format!("PTX load failed: {e}")))?;

        tracing::debug!(ordinal, arch, "CUDA device ready");
        Ok(CudaDevice {
            dev,
            pool: Arc::new(CudaMemPool::new()),
            ordinal,
        })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// The underlying cudarc handle.
    pub fn device(&self) -> &Arc<cudarc::driver::CudaDevice> {
        &self.dev
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Release all cached GPU memory back to the driver.
    pub fn empty_cache(&self) {
        self.pool.empty_cache();
    }

    fn get_func(&self, name: &str) -> Result<cudarc::driver::CudaFunction> {
        self.dev
            .get_func(kernels::MODULE_NAME, name)
            .ok_or_else(|| Error::Device(format!("CUDA kernel '{name}' not found")))
    }

    fn launch_forward<T: DeviceRepr>(
        &self,
        op: NeuronOp,
        suffix: &str,
        slope: T,
        x: &CudaSlice<T>,
        y: &mut CudaSlice<T>,
        n: u32,
    ) -> Result<()> {
        let name = format!("{}_forward_{suffix}", op.name());
        let func = self.get_func(&name)?;
        let cfg = launch_cfg(n);
        let res = match op {
            NeuronOp::Relu { .. } => unsafe { func.launch(cfg, (x, y, slope, n)) },
            _ => unsafe { func.launch(cfg, (x, y, n)) },
        };
        res.map_err(|e| Error::Device(format!("{name}: {e}")))
    }

    #[allow(clippy::too_many_arguments)]
    fn launch_backward<T: DeviceRepr>(
        &self,
        op: NeuronOp,
        suffix: &str,
        slope: T,
        x: &CudaSlice<T>,
        y: &CudaSlice<T>,
        dy: &CudaSlice<T>,
        dx: &mut CudaSlice<T>,
        n: u32,
    ) -> Result<()> {
        let name = format!("{}_backward_{suffix}", op.name());
        let func = self.get_func(&name)?;
        let cfg = launch_cfg(n);
        // sigmoid and tanh differentiate through the output
        let src = match op {
            NeuronOp::Sigmoid | NeuronOp::TanH => y,
            _ => x,
        };
        let res = match op {
            NeuronOp::Relu { .. } => unsafe { func.launch(cfg, (src, dy, dx, slope, n)) },
            _ => unsafe { func.launch(cfg, (src, dy, dx, n)) },
        };
        res.map_err(|e| Error::Device(format!("{name}: {e}")))
    }

    fn launch_axpy<T: DeviceRepr>(
        &self,
        suffix: &str,
        alpha: T,
        x: &CudaSlice<T>,
        y: &mut CudaSlice<T>,
        n: u32,
    ) -> Result<()> {
        let name = format!("axpy_{suffix}");
        let func = self.get_func(&name)?;
        unsafe { func.launch(launch_cfg(n), (alpha, x, y, n)) }
            .map_err(|e| Error::Device(format!("{name}: {e}")))
    }
}

impl fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CudaDevice(cuda:{})", self.ordinal)
    }
}

impl Device for CudaDevice {
    fn name(&self) -> String {
        format!("cuda:{}", self.ordinal)
    }

    fn alloc_zeros(&self, dtype: DType, len: usize) -> Result<Box<dyn DeviceBuffer>> {
        let n = len.max(1);
        let bytes = dtype.bytes_for(len);
        let data = match dtype {
            DType::F32 => self.pool.alloc_zeros_f32(&self.dev, n).map(CudaData::F32),
            DType::F64 => self.pool.alloc_zeros_f64(&self.dev, n).map(CudaData::F64),
        }
        .map_err(|e| Error::AllocationFailure {
            bytes,
            side: MemorySide::Device,
            reason: e.to_string(),
        })?;
        tracing::trace!(device = %self.name(), %dtype, len, "alloc");
        Ok(Box::new(CudaBuffer {
            data: Some(data),
            len,
            dtype,
            pool: Arc::clone(&self.pool),
        }))
    }

    fn copy_htod(&self, src: HostSlice<'_>, dst: &mut dyn DeviceBuffer) -> Result<()> {
        let dst = downcast_mut::<CudaBuffer>(dst)?;
        if src.dtype() != dst.dtype || src.len() != dst.len {
            return Err(Error::Device(format!(
                "htod: host {}x{} does not match device {}x{}",
                src.dtype(),
                src.len(),
                dst.dtype,
                dst.len
            )));
        }
        if dst.len == 0 {
            return Ok(());
        }
        let res = match (src, dst.data_mut()?) {
            (HostSlice::F32(s), CudaData::F32(d)) => self.dev.htod_sync_copy_into(s, d),
            (HostSlice::F64(s), CudaData::F64(d)) => self.dev.htod_sync_copy_into(s, d),
            _ => return Err(Error::msg("htod: dtype mismatch")),
        };
        res.map_err(|e| Error::Device(format!("htod: {e}")))
    }

    fn copy_dtoh(&self, src: &dyn DeviceBuffer, dst: HostSliceMut<'_>) -> Result<()> {
        let src = downcast_ref::<CudaBuffer>(src)?;
        if src.dtype != dst.dtype() || src.len != dst.len() {
            return Err(Error::Device(format!(
                "dtoh: device {}x{} does not match host {}x{}",
                src.dtype,
                src.len,
                dst.dtype(),
                dst.len()
            )));
        }
        if src.len == 0 {
            return Ok(());
        }
        let res = match (src.data()?, dst) {
            (CudaData::F32(s), HostSliceMut::F32(d)) => self.dev.dtoh_sync_copy_into(s, d),
            (CudaData::F64(s), HostSliceMut::F64(d)) => self.dev.dtoh_sync_copy_into(s, d),
            _ => return Err(Error::msg("dtoh: dtype mismatch")),
        };
        res.map_err(|e| Error::Device(format!("dtoh: {e}")))
    }

    fn neuron_forward(
        &self,
        op: NeuronOp,
        x: &dyn DeviceBuffer,
        y: &mut dyn DeviceBuffer,
    ) -> Result<()> {
        let (_, len) = check_same_layout(&[x, &*y])?;
        if len == 0 {
            return Ok(());
        }
        let n = elem_count_u32(len)?;
        let slope = negative_slope(op);
        let x = downcast_ref::<CudaBuffer>(x)?;
        let y = downcast_mut::<CudaBuffer>(y)?;
        match (x.data()?, y.data_mut()?) {
            (CudaData::F32(x), CudaData::F32(y)) => {
                self.launch_forward(op, "f32", slope as f32, x, y, n)
            }
            (CudaData::F64(x), CudaData::F64(y)) => self.launch_forward(op, "f64", slope, x, y, n),
            _ => Err(Error::msg("neuron_forward: dtype mismatch")),
        }
    }

    fn neuron_backward(
        &self,
        op: NeuronOp,
        x: &dyn DeviceBuffer,
        y: &dyn DeviceBuffer,
        dy: &dyn DeviceBuffer,
        dx: &mut dyn DeviceBuffer,
    ) -> Result<()> {
        let (_, len) = check_same_layout(&[x, y, dy, &*dx])?;
        if len == 0 {
            return Ok(());
        }
        let n = elem_count_u32(len)?;
        let slope = negative_slope(op);
        let x = downcast_ref::<CudaBuffer>(x)?;
        let y = downcast_ref::<CudaBuffer>(y)?;
        let dy = downcast_ref::<CudaBuffer>(dy)?;
        let dx = downcast_mut::<CudaBuffer>(dx)?;
        match (x.data()?, y.data()?, dy.data()?, dx.data_mut()?) {
            (CudaData::F32(x), CudaData::F32(y), CudaData::F32(dy), CudaData::F32(dx)) => {
                self.launch_backward(op, "f32", slope as f32, x, y, dy, dx, n)
            }
            (CudaData::F64(x), CudaData::F64(y), CudaData::F64(dy), CudaData::F64(dx)) => {
                self.launch_backward(op, "f64", slope, x, y, dy, dx, n)
            }
            _ => Err(Error::msg("neuron_backward: dtype mismatch")),
        }
    }

    fn axpy(&self, alpha: f64, x: &dyn DeviceBuffer, y: &mut dyn DeviceBuffer) -> Result<()> {
        let (_, len) = check_same_layout(&[x, &*y])?;
        if len == 0 {
            return Ok(());
        }
        let n = elem_count_u32(len)?;
        let x = downcast_ref::<CudaBuffer>(x)?;
        let y = downcast_mut::<CudaBuffer>(y)?;
        match (x.data()?, y.data_mut()?) {
            (CudaData::F32(x), CudaData::F32(y)) => self.launch_axpy("f32", alpha as f32, x, y, n),
            (CudaData::F64(x), CudaData::F64(y)) => self.launch_axpy("f64", alpha, x, y, n),
            _ => Err(Error::msg("axpy: dtype mismatch")),
        }
    }

    fn synchronize(&self) -> Result<()> {
        self.dev
            .synchronize()
            .map_err(|e| Error::Device(format!("synchronize: {e}")))
    }
}

//  Helpers

/// Standard launch configuration for N elements.
fn launch_cfg(n: u32) -> LaunchConfig {
    const BLOCK: u32 = 256;
    LaunchConfig {
        block_dim: (BLOCK, 1, 1),
        grid_dim: (n.div_ceil(BLOCK).max(1), 1, 1),
        shared_mem_bytes: 0,
    }
}

fn elem_count_u32(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| Error::Device(format!("{len} elements exceed the kernel index range")))
}

fn negative_slope(op: NeuronOp) -> f64 {
    match op {
        NeuronOp::Relu { negative_slope } => negative_slope,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_cfg_covers_all_elements() {
        let cfg = launch_cfg(1000);
        assert_eq!(cfg.block_dim.0, 256);
        assert_eq!(cfg.grid_dim.0, 4);
        assert_eq!(launch_cfg(1).grid_dim.0, 1);
    }

    #[test]
    fn test_elem_count_limit() {
        assert_eq!(elem_count_u32(120).unwrap(), 120);
        assert!(elem_count_u32(u32::MAX as usize + 1).is_err());
    }

    #[test]
    fn test_slope_only_for_relu() {
        assert_eq!(
            negative_slope(NeuronOp::Relu {
                negative_slope: 0.5
            }),
            0.5
        );
        assert_eq!(negative_slope(NeuronOp::TanH), 0.0);
    }
}
