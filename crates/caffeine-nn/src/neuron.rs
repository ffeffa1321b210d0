// Neuron layers: element-wise activations
//
// A neuron layer takes exactly one bottom and one top of identical shape and
// applies a scalar function to every element:
//
//   forward:   top.data[i]    = f(bottom.data[i])
//   backward:  bottom.diff[i] = top.diff[i] * f'(bottom.data[i])
//
// (f' may be expressed through top.data instead, e.g. sigmoid and tanh.)
//
// All neuron layers share one `Layer` implementation, `NeuronLayer<A>`,
// parameterised by an `Activation` that knows how to read its options and
// which `NeuronOp` it computes. The host path maps the op over slices; the
// device path hands the same op to the device that bottom and top share.

use std::fmt;
use std::sync::Arc;

use caffeine_core::blob::Blob;
use caffeine_core::device::{Device, NeuronOp};
use caffeine_core::dtype::Dtype;
use caffeine_core::error::{Error, Result};
use caffeine_core::shape::BlobShape;

use crate::layer::{check_arity, Layer};
use crate::param::LayerParameter;

/// The scalar function of a neuron layer.
pub trait Activation: Send + Sync + fmt::Debug + Sized {
    /// Layer type name.
    const TYPE: &'static str;

    /// Read activation options from the layer parameter.
    fn from_param(param: &LayerParameter) -> Result<Self>;

    /// The element-wise rule this activation applies.
    fn op(&self) -> NeuronOp;
}

/// A layer applying activation `A` element-wise.
#[derive(Debug)]
pub struct NeuronLayer<A: Activation> {
    param: LayerParameter,
    activation: A,
    /// Bottom shape seen by the last `set_up`; None before setup.
    shape: Option<BlobShape>,
}

impl<A: Activation> NeuronLayer<A> {
    pub fn new(param: LayerParameter) -> Result<Self> {
        let activation = A::from_param(&param)?;
        Ok(NeuronLayer {
            param,
            activation,
            shape: None,
        })
    }

    pub fn activation(&self) -> &A {
        &self.activation
    }

    /// Re-check blob counts and that shapes still match what `set_up` saw.
    fn check_blobs<T: Dtype>(&self, bottom: &[&mut Blob<T>], top: &[&mut Blob<T>]) -> Result<()> {
        check_arity(&self.param, bottom.len(), 1, top.len(), 1)?;
        let expected = self.shape.ok_or_else(|| Error::NotSetUp {
            layer: self.param.display_name().to_string(),
        })?;
        for blob in bottom.iter().chain(top.iter()) {
            if *blob.shape() != expected {
                return Err(Error::blob_mismatch(
                    self.param.display_name(),
                    &expected,
                    blob.shape(),
                ));
            }
        }
        Ok(())
    }

    /// The device both blobs live on. Kernels cannot mix buffers from
    /// different devices.
    fn shared_device<T: Dtype>(
        &self,
        bottom: &Blob<T>,
        top: &Blob<T>,
    ) -> Result<Arc<dyn Device>> {
        let device = bottom.require_device()?;
        let other = top.require_device()?;
        if device.name() != other.name() {
            return Err(Error::Device(format!(
                "{}: bottom is on {} but top is on {}",
                self.param.display_name(),
                device.name(),
                other.name()
            )));
        }
        Ok(device)
    }
}

impl<T: Dtype, A: Activation> Layer<T> for NeuronLayer<A> {
    fn layer_type(&self) -> &'static str {
        A::TYPE
    }

    fn param(&self) -> &LayerParameter {
        &self.param
    }

    fn is_set_up(&self) -> bool {
        self.shape.is_some()
    }

    fn set_up(&mut self, bottom: &[&mut Blob<T>], top: &mut [&mut Blob<T>]) -> Result<()> {
        check_arity(&self.param, bottom.len(), 1, top.len(), 1)?;
        let shape = *bottom[0].shape();
        if *top[0].shape() != shape {
            top[0].reshape_to(shape)?;
        }
        tracing::debug!(
            layer = self.param.display_name(),
            kind = A::TYPE,
            shape = %shape,
            "set_up"
        );
        self.shape = Some(shape);
        Ok(())
    }

    fn forward_cpu(&self, bottom: &mut [&mut Blob<T>], top: &mut [&mut Blob<T>]) -> Result<()> {
        self.check_blobs(bottom, top)?;
        let x = bottom[0].host_data()?;
        let y = top[0].host_data_mut()?;
        self.activation.op().forward_slice(x, y);
        Ok(())
    }

    fn forward_gpu(&self, bottom: &mut [&mut Blob<T>], top: &mut [&mut Blob<T>]) -> Result<()> {
        self.check_blobs(bottom, top)?;
        let device = self.shared_device(&bottom[0], &top[0])?;
        let x = bottom[0].device_data()?;
        let y = top[0].device_data_mut()?;
        device.neuron_forward(self.activation.op(), x, y)
    }

    fn backward_cpu(
        &self,
        top: &mut [&mut Blob<T>],
        propagate_down: &[bool],
        bottom: &mut [&mut Blob<T>],
    ) -> Result<()> {
        self.check_blobs(bottom, top)?;
        if !propagate_down.first().copied().unwrap_or(false) {
            return Ok(());
        }
        let (y, dy) = top[0].host_data_and_diff()?;
        let (x, dx) = bottom[0].host_data_and_diff_mut()?;
        self.activation.op().backward_slice(x, y, dy, dx);
        Ok(())
    }

    fn backward_gpu(
        &self,
        top: &mut [&mut Blob<T>],
        propagate_down: &[bool],
        bottom: &mut [&mut Blob<T>],
    ) -> Result<()> {
        self.check_blobs(bottom, top)?;
        if !propagate_down.first().copied().unwrap_or(false) {
            return Ok(());
        }
        let device = self.shared_device(&bottom[0], &top[0])?;
        let (y, dy) = top[0].device_data_and_diff()?;
        let (x, dx) = bottom[0].device_data_and_diff_mut()?;
        device.neuron_backward(self.activation.op(), x, y, dy, dx)
    }
}
