//! # caffeine-core
//!
//! Storage primitives for caffeine.
//!
//! This crate provides:
//! - [`Blob`]: a 4-D array (N, C, H, W) with its gradient, each mirrored
//!   between host and device memory with lazy synchronisation
//! - [`SyncedMemory`] / [`SyncHead`]: the coherence protocol behind a blob buffer
//! - [`BlobShape`]: the blob geometry
//! - [`Dtype`] / [`DType`]: the f32/f64 element types
//! - [`Device`] trait: the accelerator seam, plus [`EmulatedDevice`] for
//!   running device paths without a GPU
//! - [`NeuronOp`]: the element-wise activation rules shared by host and device paths

pub mod blob;
pub mod device;
pub mod dtype;
pub mod emulated;
pub mod error;
pub mod shape;
pub mod syncedmem;

pub use blob::Blob;
pub use device::{Device, DeviceBuffer, Mode, NeuronOp};
pub use dtype::{DType, Dtype, HostSlice, HostSliceMut};
pub use emulated::{EmulatedDevice, TransferStats};
pub use error::{Error, MemorySide, Result};
pub use shape::BlobShape;
pub use syncedmem::{SyncHead, SyncedMemory};
