// Layer factory: build a layer from its parameter's type name
//
//   "ReLU"    ReLULayer
//   "Sigmoid" SigmoidLayer
//   "TanH"    TanHLayer
//   "BNLL"    BNLLLayer
//   "AbsVal"  AbsValLayer

use caffeine_core::dtype::Dtype;
use caffeine_core::error::{Error, Result};

use crate::activation::{AbsValLayer, BNLLLayer, ReLULayer, SigmoidLayer, TanHLayer};
use crate::layer::Layer;
use crate::param::LayerParameter;

/// Type names `build_layer` understands.
pub const LAYER_TYPES: [&str; 5] = ["ReLU", "Sigmoid", "TanH", "BNLL", "AbsVal"];

/// Construct the layer named by `param.layer_type`.
pub fn build_layer<T: Dtype>(param: LayerParameter) -> Result<Box<dyn Layer<T>>> {
    let layer: Box<dyn Layer<T>> = match param.layer_type.as_str() {
        "ReLU" => Box::new(ReLULayer::new(param)?),
        "Sigmoid" => Box::new(SigmoidLayer::new(param)?),
        "TanH" => Box::new(TanHLayer::new(param)?),
        "BNLL" => Box::new(BNLLLayer::new(param)?),
        "AbsVal" => Box::new(AbsValLayer::new(param)?),
        other => {
            return Err(Error::invalid_parameter(
                "type",
                format!("unknown layer type '{other}'"),
            ))
        }
    };
    tracing::debug!(layer = layer.param().display_name(), kind = layer.layer_type(), "built layer");
    Ok(layer)
}
