use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::{DType, Dtype, HostSlice, HostSliceMut};
use crate::error::{Error, Result};

// Device: the accelerator seam
//
// The host side of every blob is a plain `Vec<T>`. The accelerator side is
// whatever the attached device hands out: a `Box<dyn DeviceBuffer>` that only
// that device knows how to read. Blobs never look inside a device buffer;
// they ask the device to copy in or out of host memory, and layers ask the
// device to run kernels on buffers it owns.
//
// The trait is object safe so a blob can hold `Arc<dyn Device>` without
// becoming generic over the accelerator. New accelerators (CUDA, the
// emulated device used in tests) live in their own modules or crates and
// implement this trait.
//
// Kernels are parameterised by `NeuronOp` rather than having one trait method
// per activation, so adding an activation touches the op enum and each
// device's kernel table, not the trait.

/// Where a layer runs its Forward/Backward computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Cpu,
    Gpu,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Cpu => write!(f, "cpu"),
            Mode::Gpu => write!(f, "gpu"),
        }
    }
}

/// Element-wise activation functions with a device kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NeuronOp {
    /// max(x, 0) + negative_slope * min(x, 0)
    Relu { negative_slope: f64 },
    /// 1 / (1 + exp(-x))
    Sigmoid,
    TanH,
    /// Binomial normal log likelihood, log(1 + exp(x)).
    Bnll,
    AbsVal,
}

/// Inputs to `exp` in BNLL are clamped to this value in the gradient.
pub const BNLL_THRESHOLD: f64 = 50.0;

impl NeuronOp {
    /// Short lowercase name, also the kernel name prefix on devices.
    pub fn name(&self) -> &'static str {
        match self {
            NeuronOp::Relu { .. } => "relu",
            NeuronOp::Sigmoid => "sigmoid",
            NeuronOp::TanH => "tanh",
            NeuronOp::Bnll => "bnll",
            NeuronOp::AbsVal => "absval",
        }
    }

    /// y = f(x)
    pub fn forward<T: Dtype>(&self, x: T) -> T {
        match *self {
            NeuronOp::Relu { negative_slope } => {
                // A selection, never arithmetic, when the slope is zero:
                // the output is bit-exactly x or +0.
                if x > T::zero() {
                    x
                } else if negative_slope == 0.0 {
                    T::zero()
                } else {
                    x * T::from_f64(negative_slope)
                }
            }
            NeuronOp::Sigmoid => T::one() / (T::one() + (-x).exp()),
            NeuronOp::TanH => x.tanh(),
            NeuronOp::Bnll => {
                if x > T::zero() {
                    x + (T::one() + (-x).exp()).ln()
                } else {
                    (T::one() + x.exp()).ln()
                }
            }
            NeuronOp::AbsVal => x.abs(),
        }
    }

    /// dx = dy * f'(x), with f' written in terms of x or y as convenient.
    ///
    /// ReLU and AbsVal take the zero subgradient at the kink x == 0.
    pub fn backward<T: Dtype>(&self, x: T, y: T, dy: T) -> T {
        match *self {
            NeuronOp::Relu { negative_slope } => {
                if x > T::zero() {
                    dy
                } else {
                    dy * T::from_f64(negative_slope)
                }
            }
            NeuronOp::Sigmoid => dy * y * (T::one() - y),
            NeuronOp::TanH => dy * (T::one() - y * y),
            NeuronOp::Bnll => {
                let e = x.min(T::from_f64(BNLL_THRESHOLD)).exp();
                dy * e / (e + T::one())
            }
            NeuronOp::AbsVal => {
                let sign = if x > T::zero() {
                    T::one()
                } else if x < T::zero() {
                    -T::one()
                } else {
                    T::zero()
                };
                dy * sign
            }
        }
    }

    /// Apply `forward` over a whole buffer.
    pub fn forward_slice<T: Dtype>(&self, x: &[T], y: &mut [T]) {
        for (yi, &xi) in y.iter_mut().zip(x.iter()) {
            *yi = self.forward(xi);
        }
    }

    /// Apply `backward` over whole buffers.
    pub fn backward_slice<T: Dtype>(&self, x: &[T], y: &[T], dy: &[T], dx: &mut [T]) {
        for (i, dxi) in dx.iter_mut().enumerate() {
            *dxi = self.backward(x[i], y[i], dy[i]);
        }
    }
}

/// An allocation owned by a device.
///
/// Devices downcast the buffers they receive back to their own concrete
/// type via [`downcast_ref`] / [`downcast_mut`].
pub trait DeviceBuffer: Send + Sync + fmt::Debug + 'static {
    /// Element type stored in the buffer.
    fn dtype(&self) -> DType;

    /// Number of elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// An accelerator that can hold blob memory and run neuron kernels.
pub trait Device: Send + Sync + fmt::Debug + 'static {
    /// A human-readable name for this device (e.g., "cuda:0").
    fn name(&self) -> String;

    /// Allocate `len` zeroed elements of `dtype`.
    fn alloc_zeros(&self, dtype: DType, len: usize) -> Result<Box<dyn DeviceBuffer>>;

    /// Copy host memory into a device buffer of the same length and dtype.
    fn copy_htod(&self, src: HostSlice<'_>, dst: &mut dyn DeviceBuffer) -> Result<()>;

    /// Copy a device buffer into host memory of the same length and dtype.
    fn copy_dtoh(&self, src: &dyn DeviceBuffer, dst: HostSliceMut<'_>) -> Result<()>;

    /// y[i] = op.forward(x[i])
    fn neuron_forward(
        &self,
        op: NeuronOp,
        x: &dyn DeviceBuffer,
        y: &mut dyn DeviceBuffer,
    ) -> Result<()>;

    /// dx[i] = op.backward(x[i], y[i], dy[i])
    fn neuron_backward(
        &self,
        op: NeuronOp,
        x: &dyn DeviceBuffer,
        y: &dyn DeviceBuffer,
        dy: &dyn DeviceBuffer,
        dx: &mut dyn DeviceBuffer,
    ) -> Result<()>;

    /// y += alpha * x
    fn axpy(&self, alpha: f64, x: &dyn DeviceBuffer, y: &mut dyn DeviceBuffer) -> Result<()>;

    /// Block until all queued work on this device has finished.
    fn synchronize(&self) -> Result<()>;
}

/// Downcast a device buffer to the concrete type a device expects.
pub fn downcast_ref<B: DeviceBuffer>(buf: &dyn DeviceBuffer) -> Result<&B> {
    buf.as_any()
        .downcast_ref::<B>()
        .ok_or_else(|| Error::Device(format!("buffer {buf:?} belongs to a different device")))
}

/// Mutable variant of [`downcast_ref`].
pub fn downcast_mut<B: DeviceBuffer>(buf: &mut dyn DeviceBuffer) -> Result<&mut B> {
    let desc = format!("{buf:?}");
    buf.as_any_mut()
        .downcast_mut::<B>()
        .ok_or_else(|| Error::Device(format!("buffer {desc} belongs to a different device")))
}

/// Check that every buffer taking part in a kernel agrees on dtype and length.
pub fn check_same_layout(buffers: &[&dyn DeviceBuffer]) -> Result<(DType, usize)> {
    let Some(first) = buffers.first() else {
        return Err(Error::msg("kernel launched without buffers"));
    };
    let (dtype, len) = (first.dtype(), first.len());
    for b in &buffers[1..] {
        if b.dtype() != dtype {
            return Err(Error::DTypeMismatch {
                expected: dtype,
                got: b.dtype(),
            });
        }
        if b.len() != len {
            return Err(Error::Device(format!(
                "kernel buffer length mismatch: {} vs {}",
                len,
                b.len()
            )));
        }
    }
    Ok((dtype, len))
}
