//! # Caffeine
//!
//! 4-D blobs with lazily synchronised host and device copies, and the layers
//! that compute on them.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use caffeine::prelude::*;
//!
//! # fn main() -> caffeine::Result<()> {
//! let mut bottom = Blob::<f32>::new((2, 3, 4, 5));
//! let mut top = Blob::<f32>::new((0, 0, 0, 0));
//! get_filler::<f32>(&FillerParameter::new(FillerKind::Gaussian)).fill(&mut bottom)?;
//!
//! let mut relu = ReLULayer::new(LayerParameter::new("ReLU"))?;
//! relu.set_up(&[&mut bottom], &mut [&mut top])?;
//! relu.forward(&mut [&mut bottom], &mut [&mut top])?;
//! assert!(top.host_data()?.iter().all(|&y| y >= 0.0));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `caffeine-core` | Blob, BlobShape, SyncedMemory, Device trait, EmulatedDevice, errors |
//! | `caffeine-nn` | Layer trait, neuron layers, parameters, fillers, gradient checker |
//! | `caffeine-cuda` | CUDA device (feature-gated) |

/// Re-export core types.
pub use caffeine_core::{
    bail, Blob, BlobShape, DType, Device, DeviceBuffer, Dtype, EmulatedDevice, Error, HostSlice,
    HostSliceMut, MemorySide, Mode, NeuronOp, Result, SyncHead, SyncedMemory, TransferStats,
};

/// Re-export the CUDA device (requires `cuda` feature + NVIDIA CUDA Toolkit).
#[cfg(feature = "cuda")]
pub use caffeine_cuda::{CudaBuffer, CudaDevice};

/// Re-export layers, parameters and fillers.
pub mod nn {
    pub use caffeine_nn::*;
}

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::nn::{
        build_layer, get_filler, AbsValLayer, BNLLLayer, Filler, FillerKind, FillerParameter,
        GradientChecker, Layer, LayerParameter, ReLULayer, SigmoidLayer, TanHLayer,
    };
    pub use crate::{Blob, BlobShape, Device, Dtype, EmulatedDevice, Error, Mode, Result};

    #[cfg(feature = "cuda")]
    pub use crate::CudaDevice;
}
