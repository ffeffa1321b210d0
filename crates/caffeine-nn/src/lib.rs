//! # caffeine-nn
//!
//! Layers built on `caffeine-core` blobs.
//!
//! - [`Layer`]: the set_up / forward / backward contract with host and device dispatch
//! - [`NeuronLayer`]: element-wise activations (ReLU, Sigmoid, TanH, BNLL, AbsVal)
//! - [`build_layer`]: construct a layer from a [`LayerParameter`]
//! - [`Filler`]: blob initialization (constant, uniform, gaussian, positive unitball, xavier)
//! - [`GradientChecker`]: finite-difference verification of Backward
//!
//! ```ignore
//! use caffeine_core::Blob;
//! use caffeine_nn::{Layer, LayerParameter, ReLULayer};
//!
//! let mut bottom = Blob::<f32>::new((2, 3, 4, 5));
//! let mut top = Blob::<f32>::new((0, 0, 0, 0));
//! let mut relu = ReLULayer::new(LayerParameter::new("ReLU"))?;
//! relu.set_up(&[&mut bottom], &mut [&mut top])?;
//! relu.forward(&mut [&mut bottom], &mut [&mut top])?;
//! ```

pub mod activation;
pub mod factory;
pub mod filler;
pub mod gradient_check;
pub mod layer;
pub mod neuron;
pub mod param;

pub use activation::{
    AbsVal, AbsValLayer, BNLLLayer, Bnll, ReLULayer, Relu, Sigmoid, SigmoidLayer, TanH, TanHLayer,
};
pub use factory::{build_layer, LAYER_TYPES};
pub use filler::{
    get_filler, ConstantFiller, Filler, GaussianFiller, PositiveUnitballFiller, UniformFiller,
    XavierFiller,
};
pub use gradient_check::{GradientChecker, GradientFailure, GradientReport};
pub use layer::{check_arity, Layer};
pub use neuron::{Activation, NeuronLayer};
pub use param::{FillerKind, FillerParameter, LayerParameter, ParamValue};
