// Layer trait: the interface every computation unit implements
//
// A layer reads a list of bottom (input) blobs and writes a list of top
// (output) blobs. The blobs belong to the caller; the layer only borrows
// them for the duration of a call.
//
// LIFECYCLE:
//
//   new(param) ──► set_up(bottom, top) ──► forward / backward, any number of times
//
// `set_up` validates how many blobs were passed and what shapes they have,
// then reshapes the tops. It must run before the first forward/backward and
// again whenever the bottom shapes change. Forward and Backward on a layer
// that was never set up are rejected with `NotSetUp`.
//
// DISPATCH:
//
// `forward` / `backward` are provided methods that check the state and then
// call the host or device implementation according to the layer's `Mode`.
// A layer without a device implementation inherits the host one.
//
// Forward/Backward take `&self`: a layer holds no mutable state between
// calls, so one instance can serve several threads as long as each works on
// its own blobs.

use caffeine_core::blob::Blob;
use caffeine_core::dtype::Dtype;
use caffeine_core::error::{Error, Result};
use caffeine_core::Mode;

use crate::param::LayerParameter;

/// A computation unit with a forward pass and its gradient.
pub trait Layer<T: Dtype>: Send + Sync {
    /// Layer type name, e.g. "ReLU".
    fn layer_type(&self) -> &'static str;

    /// The configuration this layer was built from.
    fn param(&self) -> &LayerParameter;

    /// Whether `set_up` has completed.
    fn is_set_up(&self) -> bool;

    /// Validate the blob lists and shape the tops.
    ///
    /// Bottoms are only read; they are taken as `&[&mut Blob<T>]` so the same
    /// blob list can be passed to `set_up` and then to `forward`.
    fn set_up(&mut self, bottom: &[&mut Blob<T>], top: &mut [&mut Blob<T>]) -> Result<()>;

    /// Host implementation of Forward.
    fn forward_cpu(&self, bottom: &mut [&mut Blob<T>], top: &mut [&mut Blob<T>]) -> Result<()>;

    /// Device implementation of Forward; defaults to the host one.
    fn forward_gpu(&self, bottom: &mut [&mut Blob<T>], top: &mut [&mut Blob<T>]) -> Result<()> {
        self.forward_cpu(bottom, top)
    }

    /// Host implementation of Backward.
    fn backward_cpu(
        &self,
        top: &mut [&mut Blob<T>],
        propagate_down: &[bool],
        bottom: &mut [&mut Blob<T>],
    ) -> Result<()>;

    /// Device implementation of Backward; defaults to the host one.
    fn backward_gpu(
        &self,
        top: &mut [&mut Blob<T>],
        propagate_down: &[bool],
        bottom: &mut [&mut Blob<T>],
    ) -> Result<()> {
        self.backward_cpu(top, propagate_down, bottom)
    }

    /// Where this layer runs.
    fn mode(&self) -> Mode {
        self.param().mode
    }

    /// Compute top data from bottom data.
    fn forward(&self, bottom: &mut [&mut Blob<T>], top: &mut [&mut Blob<T>]) -> Result<()> {
        ensure_set_up(self)?;
        match self.mode() {
            Mode::Cpu => self.forward_cpu(bottom, top),
            Mode::Gpu => self.forward_gpu(bottom, top),
        }
    }

    /// Compute bottom diffs from top diffs.
    ///
    /// `propagate_down[i] == false` lets the layer skip bottom `i`.
    fn backward(
        &self,
        top: &mut [&mut Blob<T>],
        propagate_down: &[bool],
        bottom: &mut [&mut Blob<T>],
    ) -> Result<()> {
        ensure_set_up(self)?;
        if propagate_down.len() != bottom.len() {
            return Err(Error::shape_mismatch(
                self.param().display_name(),
                format!(
                    "{} propagate_down flags for {} bottom blobs",
                    propagate_down.len(),
                    bottom.len()
                ),
            ));
        }
        match self.mode() {
            Mode::Cpu => self.backward_cpu(top, propagate_down, bottom),
            Mode::Gpu => self.backward_gpu(top, propagate_down, bottom),
        }
    }
}

fn ensure_set_up<T: Dtype, L: Layer<T> + ?Sized>(layer: &L) -> Result<()> {
    if layer.is_set_up() {
        Ok(())
    } else {
        Err(Error::NotSetUp {
            layer: layer.param().display_name().to_string(),
        })
    }
}

/// Check the number of bottom and top blobs a layer was given.
pub fn check_arity(
    param: &LayerParameter,
    bottom: usize,
    expected_bottom: usize,
    top: usize,
    expected_top: usize,
) -> Result<()> {
    if bottom != expected_bottom || top != expected_top {
        return Err(Error::shape_mismatch(
            param.display_name(),
            format!(
                "{} takes {expected_bottom} bottom and {expected_top} top blob(s), got {bottom} and {top}",
                param.layer_type
            ),
        ));
    }
    Ok(())
}
