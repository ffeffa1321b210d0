// Integration tests for layers driven through the facade
//
// Layers are built from parameters (in code or from JSON), set up against
// caller-owned blobs and run in both modes.

use std::sync::Arc;

use caffeine::nn::GradientReport;
use caffeine::prelude::*;

fn gaussian_blob<T: Dtype>(shape: (usize, usize, usize, usize), seed: u64) -> Blob<T> {
    let mut blob = Blob::<T>::new(shape);
    let param = FillerParameter::new(FillerKind::Gaussian).with_seed(seed);
    get_filler::<T>(&param)
        .fill(&mut blob)
        .expect("gaussian fill");
    blob
}

fn relu_forward<T: Dtype>() -> caffeine::Result<()> {
    let mut bottom = gaussian_blob::<T>((2, 3, 4, 5), 1701);
    let mut top = Blob::<T>::new((0, 0, 0, 0));
    let mut layer = ReLULayer::new(LayerParameter::new("ReLU"))?;
    layer.set_up(&[&mut bottom], &mut [&mut top])?;
    layer.forward(&mut [&mut bottom], &mut [&mut top])?;

    let x = bottom.host_data()?.to_vec();
    for (&xi, &yi) in x.iter().zip(top.host_data()?) {
        assert!(yi >= T::zero());
        assert!(yi == T::zero() || yi == xi);
    }
    Ok(())
}

#[test]
fn test_relu_forward_float() -> caffeine::Result<()> {
    relu_forward::<f32>()
}

#[test]
fn test_relu_forward_double() -> caffeine::Result<()> {
    relu_forward::<f64>()
}

#[test]
fn test_layer_from_json() -> caffeine::Result<()> {
    let value = serde_json::json!({
        "name": "leaky",
        "type": "ReLU",
        "options": { "negative_slope": 0.1 }
    });
    let param: LayerParameter = serde_json::from_value(value).expect("valid parameter");
    let mut layer = build_layer::<f64>(param)?;
    assert_eq!(layer.layer_type(), "ReLU");
    assert_eq!(layer.param().display_name(), "leaky");

    let mut bottom = Blob::<f64>::new((1, 1, 1, 2));
    bottom.host_data_mut()?.copy_from_slice(&[-2.0, 2.0]);
    let mut top = Blob::new((1, 1, 1, 2));
    layer.set_up(&[&mut bottom], &mut [&mut top])?;
    layer.forward(&mut [&mut bottom], &mut [&mut top])?;
    assert_eq!(top.host_data()?, &[-0.2, 2.0]);
    Ok(())
}

#[test]
fn test_unknown_layer_type() {
    let err = build_layer::<f32>(LayerParameter::new("Convolution"))
        .err()
        .expect("unknown type is rejected");
    assert!(matches!(err, Error::InvalidParameter { .. }));
}

#[test]
fn test_gradients_of_every_neuron_layer() -> caffeine::Result<()> {
    for (layer_type, kink) in [
        ("ReLU", Some(0.0)),
        ("Sigmoid", None),
        ("TanH", None),
        ("BNLL", None),
        ("AbsVal", Some(0.0)),
    ] {
        let mut checker = GradientChecker::new(1e-3, 1e-4);
        if let Some(k) = kink {
            checker = checker.with_kink(k, 2e-3);
        }
        let mut bottom = gaussian_blob::<f64>((2, 3, 4, 5), 7);
        let mut top = Blob::new((0, 0, 0, 0));
        let mut layer = build_layer::<f64>(LayerParameter::new(layer_type))?;
        let report: GradientReport =
            checker.check_gradient_elementwise(layer.as_mut(), &mut bottom, &mut top)?;
        assert!(report.is_ok(), "{layer_type}: {report:?}");
    }
    Ok(())
}

#[test]
fn test_gpu_mode_on_emulated_device() -> caffeine::Result<()> {
    let dev: Arc<dyn Device> = Arc::new(EmulatedDevice::new(0));
    let mut bottom = gaussian_blob::<f32>((2, 3, 4, 5), 11);
    let expected: Vec<f32> = bottom.host_data()?.iter().map(|x| x.abs()).collect();
    bottom.set_device(Some(dev.clone()))?;
    let mut top = Blob::with_device((0, 0, 0, 0), dev);

    let mut layer = build_layer::<f32>(LayerParameter::new("AbsVal").with_mode(Mode::Gpu))?;
    layer.set_up(&[&mut bottom], &mut [&mut top])?;
    layer.forward(&mut [&mut bottom], &mut [&mut top])?;
    assert_eq!(top.data_head(), caffeine::SyncHead::DeviceAuthoritative);
    assert_eq!(top.host_data()?, &expected[..]);
    Ok(())
}

#[test]
fn test_one_layer_shared_across_threads() -> caffeine::Result<()> {
    let mut probe_bottom = Blob::<f64>::new((1, 1, 1, 8));
    let mut probe_top = Blob::<f64>::new((0, 0, 0, 0));
    let mut layer = build_layer::<f64>(LayerParameter::new("Sigmoid"))?;
    layer.set_up(&[&mut probe_bottom], &mut [&mut probe_top])?;
    let layer = &*layer;

    let outputs: Vec<Vec<f64>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|seed| {
                s.spawn(move || -> caffeine::Result<Vec<f64>> {
                    let mut bottom = gaussian_blob::<f64>((1, 1, 1, 8), seed);
                    let mut top = Blob::new((1, 1, 1, 8));
                    layer.forward(&mut [&mut bottom], &mut [&mut top])?;
                    Ok(top.host_data()?.to_vec())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect::<caffeine::Result<Vec<_>>>()
    })?;

    assert_eq!(outputs.len(), 4);
    for y in outputs {
        assert!(y.iter().all(|&v| v > 0.0 && v < 1.0));
    }
    Ok(())
}
