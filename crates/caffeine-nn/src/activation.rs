// Activations: the concrete neuron layers
//
// Each activation is a small struct implementing `Activation`; the layer type
// is `NeuronLayer<activation>`, aliased below for convenience:
//
//   let relu = ReLULayer::new(LayerParameter::new("ReLU"))?;
//
// Options read from the layer parameter:
//
//   ReLU     negative_slope (default 0): leaky slope for x <= 0

use caffeine_core::device::NeuronOp;
use caffeine_core::error::{Error, Result};

use crate::neuron::{Activation, NeuronLayer};
use crate::param::LayerParameter;

/// Rectified linear unit: max(x, 0), optionally leaky.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Relu {
    negative_slope: f64,
}

impl Relu {
    pub fn negative_slope(&self) -> f64 {
        self.negative_slope
    }
}

impl Activation for Relu {
    const TYPE: &'static str = "ReLU";

    fn from_param(param: &LayerParameter) -> Result<Self> {
        let negative_slope = param.get_f64_or("negative_slope", 0.0)?;
        if !negative_slope.is_finite() {
            return Err(Error::invalid_parameter(
                "negative_slope",
                format!("must be finite, got {negative_slope}"),
            ));
        }
        Ok(Relu { negative_slope })
    }

    fn op(&self) -> NeuronOp {
        NeuronOp::Relu {
            negative_slope: self.negative_slope,
        }
    }
}

/// Logistic sigmoid: 1 / (1 + exp(-x)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sigmoid;

impl Activation for Sigmoid {
    const TYPE: &'static str = "Sigmoid";

    fn from_param(_param: &LayerParameter) -> Result<Self> {
        Ok(Sigmoid)
    }

    fn op(&self) -> NeuronOp {
        NeuronOp::Sigmoid
    }
}

/// Hyperbolic tangent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TanH;

impl Activation for TanH {
    const TYPE: &'static str = "TanH";

    fn from_param(_param: &LayerParameter) -> Result<Self> {
        Ok(TanH)
    }

    fn op(&self) -> NeuronOp {
        NeuronOp::TanH
    }
}

/// Binomial normal log likelihood (softplus): log(1 + exp(x)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bnll;

impl Activation for Bnll {
    const TYPE: &'static str = "BNLL";

    fn from_param(_param: &LayerParameter) -> Result<Self> {
        Ok(Bnll)
    }

    fn op(&self) -> NeuronOp {
        NeuronOp::Bnll
    }
}

/// Absolute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbsVal;

impl Activation for AbsVal {
    const TYPE: &'static str = "AbsVal";

    fn from_param(_param: &LayerParameter) -> Result<Self> {
        Ok(AbsVal)
    }

    fn op(&self) -> NeuronOp {
        NeuronOp::AbsVal
    }
}

pub type ReLULayer = NeuronLayer<Relu>;
pub type SigmoidLayer = NeuronLayer<Sigmoid>;
pub type TanHLayer = NeuronLayer<TanH>;
pub type BNLLLayer = NeuronLayer<Bnll>;
pub type AbsValLayer = NeuronLayer<AbsVal>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu_default_slope() {
        let layer = ReLULayer::new(LayerParameter::new("ReLU")).unwrap();
        assert_eq!(layer.activation().negative_slope(), 0.0);
        assert_eq!(
            layer.activation().op(),
            NeuronOp::Relu {
                negative_slope: 0.0
            }
        );
    }

    #[test]
    fn test_relu_slope_option() {
        let p = LayerParameter::new("ReLU").with_option("negative_slope", 0.01);
        let layer = ReLULayer::new(p).unwrap();
        assert_eq!(layer.activation().negative_slope(), 0.01);
    }

    #[test]
    fn test_relu_bad_slope() {
        let p = LayerParameter::new("ReLU").with_option("negative_slope", "steep");
        assert!(matches!(
            ReLULayer::new(p),
            Err(Error::InvalidParameter { .. })
        ));
        let p = LayerParameter::new("ReLU").with_option("negative_slope", f64::NAN);
        assert!(ReLULayer::new(p).is_err());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Sigmoid::TYPE, "Sigmoid");
        assert_eq!(TanH::TYPE, "TanH");
        assert_eq!(Bnll::TYPE, "BNLL");
        assert_eq!(AbsVal::TYPE, "AbsVal");
    }
}
