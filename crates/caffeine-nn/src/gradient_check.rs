// Gradient checking: compare Backward against finite differences
//
// The objective is E = 0.5 * sum(top.data^2), so dE/dtop = top.data. The
// checker runs Forward, seeds every top diff with the top data, runs Backward
// and keeps the analytic bottom diffs. Then, for every bottom element x_i, it
// evaluates E at x_i + h and x_i - h and takes the central difference:
//
//   numeric_i = (E(x_i + h) - E(x_i - h)) / (2h)
//
// An element passes when
//
//   |analytic_i - numeric_i| <= threshold * max(|analytic_i|, |numeric_i|, 1)
//
// Elements whose input lies within `kink_range` of `kink` are skipped, since
// functions like ReLU are not differentiable there.
//
// `check_gradient_exhaustive` perturbs one element at a time and works for
// any layer; `check_gradient_elementwise` perturbs every element at once and
// is only valid when top[i] depends on bottom[i] alone.
//
// All arithmetic on the objective is done in f64.

use caffeine_core::blob::Blob;
use caffeine_core::dtype::Dtype;
use caffeine_core::error::{Error, Result};

use crate::layer::Layer;

/// One element whose analytic and numeric gradients disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientFailure {
    /// Index of the bottom blob.
    pub blob: usize,
    /// Flat element index within that blob.
    pub index: usize,
    pub analytic: f64,
    pub numeric: f64,
}

/// Outcome of a gradient check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradientReport {
    pub checked: usize,
    pub skipped: usize,
    /// Largest scaled error among checked elements.
    pub max_error: f64,
    pub failures: Vec<GradientFailure>,
}

impl GradientReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientChecker {
    pub stepsize: f64,
    pub threshold: f64,
    pub kink: f64,
    pub kink_range: f64,
}

impl Default for GradientChecker {
    fn default() -> Self {
        GradientChecker {
            stepsize: 1e-2,
            threshold: 1e-3,
            kink: 0.0,
            kink_range: -1.0,
        }
    }
}

impl GradientChecker {
    pub fn new(stepsize: f64, threshold: f64) -> Self {
        GradientChecker {
            stepsize,
            threshold,
            ..Default::default()
        }
    }

    /// Skip inputs within `range` of `kink`.
    pub fn with_kink(mut self, kink: f64, range: f64) -> Self {
        self.kink = kink;
        self.kink_range = range;
        self
    }

    fn near_kink(&self, x: f64) -> bool {
        x >= self.kink - self.kink_range && x <= self.kink + self.kink_range
    }

    /// Set up `layer` and check the gradient of every bottom element.
    pub fn check_gradient_exhaustive<T, L>(
        &self,
        layer: &mut L,
        bottom: &mut [&mut Blob<T>],
        top: &mut [&mut Blob<T>],
    ) -> Result<GradientReport>
    where
        T: Dtype,
        L: Layer<T> + ?Sized,
    {
        layer.set_up(&*bottom, top)?;

        // analytic pass
        layer.forward(bottom, top)?;
        for blob in top.iter_mut() {
            let (data, diff) = blob.host_data_and_diff_mut()?;
            diff.copy_from_slice(data);
        }
        let propagate_down = vec![true; bottom.len()];
        layer.backward(top, &propagate_down, bottom)?;
        let mut analytic = Vec::with_capacity(bottom.len());
        for blob in bottom.iter_mut() {
            analytic.push(blob.host_diff()?.to_vec());
        }

        let mut report = GradientReport::default();
        for b in 0..bottom.len() {
            for i in 0..bottom[b].count() {
                let x = bottom[b].host_data()?[i];
                if self.near_kink(x.as_f64()) {
                    report.skipped += 1;
                    continue;
                }
                let step = T::from_f64(self.stepsize);

                bottom[b].host_data_mut()?[i] = x + step;
                let plus = objective(layer, bottom, top)?;
                bottom[b].host_data_mut()?[i] = x - step;
                let minus = objective(layer, bottom, top)?;
                bottom[b].host_data_mut()?[i] = x;

                let numeric = (plus - minus) / (2.0 * self.stepsize);
                self.compare(&mut report, b, i, analytic[b][i].as_f64(), numeric);
            }
        }

        log_report(layer.param().display_name(), &report);
        Ok(report)
    }

    /// Check an element-wise layer: top[i] depends only on bottom[i].
    ///
    /// All elements are perturbed at once, so the whole check costs two
    /// extra forward passes. Takes exactly one bottom and one top of equal
    /// count.
    pub fn check_gradient_elementwise<T, L>(
        &self,
        layer: &mut L,
        bottom: &mut Blob<T>,
        top: &mut Blob<T>,
    ) -> Result<GradientReport>
    where
        T: Dtype,
        L: Layer<T> + ?Sized,
    {
        layer.set_up(&[&mut *bottom], &mut [&mut *top])?;
        if bottom.count() != top.count() {
            return Err(Error::shape_mismatch(
                layer.param().display_name(),
                format!(
                    "element-wise check needs equal counts, got {} and {}",
                    bottom.count(),
                    top.count()
                ),
            ));
        }

        layer.forward(&mut [&mut *bottom], &mut [&mut *top])?;
        {
            let (data, diff) = top.host_data_and_diff_mut()?;
            diff.copy_from_slice(data);
        }
        layer.backward(&mut [&mut *top], &[true], &mut [&mut *bottom])?;
        let analytic = bottom.host_diff()?.to_vec();
        let original = bottom.host_data()?.to_vec();

        let step = T::from_f64(self.stepsize);
        let mut shifted = |sign: T| -> Result<Vec<f64>> {
            for (v, &x) in bottom.host_data_mut()?.iter_mut().zip(&original) {
                *v = x + sign * step;
            }
            layer.forward(&mut [&mut *bottom], &mut [&mut *top])?;
            Ok(top
                .host_data()?
                .iter()
                .map(|v| 0.5 * v.as_f64() * v.as_f64())
                .collect())
        };
        let plus = shifted(T::one())?;
        let minus = shifted(-T::one())?;
        bottom.host_data_mut()?.copy_from_slice(&original);

        let mut report = GradientReport::default();
        for i in 0..original.len() {
            if self.near_kink(original[i].as_f64()) {
                report.skipped += 1;
                continue;
            }
            let numeric = (plus[i] - minus[i]) / (2.0 * self.stepsize);
            self.compare(&mut report, 0, i, analytic[i].as_f64(), numeric);
        }

        log_report(layer.param().display_name(), &report);
        Ok(report)
    }

    fn compare(
        &self,
        report: &mut GradientReport,
        blob: usize,
        index: usize,
        analytic: f64,
        numeric: f64,
    ) {
        let scale = analytic.abs().max(numeric.abs()).max(1.0);
        let err = (analytic - numeric).abs() / scale;
        report.checked += 1;
        report.max_error = report.max_error.max(err);
        if err > self.threshold {
            report.failures.push(GradientFailure {
                blob,
                index,
                analytic,
                numeric,
            });
        }
    }
}

fn log_report(layer: &str, report: &GradientReport) {
    tracing::debug!(
        layer,
        checked = report.checked,
        skipped = report.skipped,
        failed = report.failures.len(),
        max_error = report.max_error,
        "gradient check"
    );
}

fn objective<T, L>(layer: &L, bottom: &mut [&mut Blob<T>], top: &mut [&mut Blob<T>]) -> Result<f64>
where
    T: Dtype,
    L: Layer<T> + ?Sized,
{
    layer.forward(bottom, top)?;
    let mut e = 0.0;
    for blob in top.iter_mut() {
        e += blob
            .host_data()?
            .iter()
            .map(|v| v.as_f64() * v.as_f64())
            .sum::<f64>();
    }
    Ok(0.5 * e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{ReLULayer, SigmoidLayer};
    use crate::filler::{Filler, GaussianFiller};
    use crate::param::LayerParameter;

    fn gaussian_pair() -> (Blob<f64>, Blob<f64>) {
        let mut bottom = Blob::<f64>::new((2, 3, 4, 5));
        GaussianFiller {
            mean: 0.0,
            std: 1.0,
            seed: Some(1701),
        }
        .fill(&mut bottom)
        .unwrap();
        (bottom, Blob::new((0, 0, 0, 0)))
    }

    #[test]
    fn test_sigmoid_passes() {
        let (mut bottom, mut top) = gaussian_pair();
        let mut layer = SigmoidLayer::new(LayerParameter::new("Sigmoid")).unwrap();
        let report = GradientChecker::new(1e-3, 1e-4)
            .check_gradient_exhaustive(&mut layer, &mut [&mut bottom], &mut [&mut top])
            .unwrap();
        assert!(report.is_ok(), "{report:?}");
        assert_eq!(report.checked, 120);
    }

    #[test]
    fn test_elementwise_agrees_with_exhaustive() {
        let checker = GradientChecker::new(1e-3, 1e-4).with_kink(0.0, 2e-3);
        let (mut bottom, mut top) = gaussian_pair();
        let mut layer = ReLULayer::new(LayerParameter::new("ReLU")).unwrap();
        let fast = checker
            .check_gradient_elementwise(&mut layer, &mut bottom, &mut top)
            .unwrap();
        let slow = checker
            .check_gradient_exhaustive(&mut layer, &mut [&mut bottom], &mut [&mut top])
            .unwrap();
        assert!(fast.is_ok(), "{fast:?}");
        assert_eq!(fast.checked, slow.checked);
        assert_eq!(fast.skipped, slow.skipped);
        // the blob is restored after perturbation
        let (mut fresh, _) = gaussian_pair();
        assert_eq!(bottom.host_data().unwrap(), fresh.host_data().unwrap());
    }

    #[test]
    fn test_kink_is_skipped() {
        let mut bottom = Blob::<f64>::new((1, 1, 1, 3));
        bottom
            .host_data_mut()
            .unwrap()
            .copy_from_slice(&[-1.0, 0.0, 1.0]);
        let mut top = Blob::new((1, 1, 1, 3));
        let mut layer = ReLULayer::new(LayerParameter::new("ReLU")).unwrap();
        let report = GradientChecker::new(1e-3, 1e-3)
            .with_kink(0.0, 0.01)
            .check_gradient_exhaustive(&mut layer, &mut [&mut bottom], &mut [&mut top])
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.checked, 2);
        assert!(report.is_ok());
    }

    /// A layer whose backward is deliberately off by a factor of two.
    struct Doubled {
        inner: ReLULayer,
        param: LayerParameter,
    }

    impl Layer<f64> for Doubled {
        fn layer_type(&self) -> &'static str {
            "Doubled"
        }
        fn param(&self) -> &LayerParameter {
            &self.param
        }
        fn is_set_up(&self) -> bool {
            Layer::<f64>::is_set_up(&self.inner)
        }
        fn set_up(&mut self, bottom: &[&mut Blob<f64>], top: &mut [&mut Blob<f64>]) -> Result<()> {
            self.inner.set_up(bottom, top)
        }
        fn forward_cpu(
            &self,
            bottom: &mut [&mut Blob<f64>],
            top: &mut [&mut Blob<f64>],
        ) -> Result<()> {
            self.inner.forward_cpu(bottom, top)
        }
        fn backward_cpu(
            &self,
            top: &mut [&mut Blob<f64>],
            propagate_down: &[bool],
            bottom: &mut [&mut Blob<f64>],
        ) -> Result<()> {
            self.inner.backward_cpu(top, propagate_down, bottom)?;
            for d in bottom[0].host_diff_mut()? {
                *d *= 2.0;
            }
            Ok(())
        }
    }

    #[test]
    fn test_wrong_gradient_is_reported() {
        let (mut bottom, mut top) = gaussian_pair();
        let mut layer = Doubled {
            inner: ReLULayer::new(LayerParameter::new("ReLU")).unwrap(),
            param: LayerParameter::new("Doubled"),
        };
        let report = GradientChecker::new(1e-3, 1e-3)
            .with_kink(0.0, 0.01)
            .check_gradient_exhaustive(&mut layer, &mut [&mut bottom], &mut [&mut top])
            .unwrap();
        assert!(!report.is_ok());
        let f = &report.failures[0];
        assert!(f.analytic > 0.0);
        assert!((f.analytic - 2.0 * f.numeric).abs() < 1e-6);
    }
}
