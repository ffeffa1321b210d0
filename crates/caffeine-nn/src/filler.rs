// Fillers: initialize a blob's data from a distribution
//
// AVAILABLE FILLERS:
//
//   constant          all elements = value
//   uniform           U(min, max)
//   gaussian          N(mean, std)
//   positive_unitball U(0, 1), then each of the `num` rows scaled to sum to 1
//   xavier            U(-s, s) with s = sqrt(3 / fan_in), fan_in = count / num
//
// Values are drawn in f64 and converted to the blob's element type. With a
// seed the fill is reproducible; without one the generator is seeded from
// system entropy. Fillers only write host data, so a blob with a device
// uploads lazily on its next device access.

use rand::distributions::{Distribution, Uniform as UniformDist};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Normal;

use caffeine_core::blob::Blob;
use caffeine_core::dtype::Dtype;
use caffeine_core::error::{Error, Result};

use crate::param::{FillerKind, FillerParameter};

/// Writes initial values into a blob's data.
pub trait Filler<T: Dtype> {
    fn fill(&self, blob: &mut Blob<T>) -> Result<()>;
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

fn sample_into<T: Dtype, D: Distribution<f64>>(dist: &D, seed: Option<u64>, out: &mut [T]) {
    let mut rng = make_rng(seed);
    for v in out.iter_mut() {
        *v = T::from_f64(dist.sample(&mut rng));
    }
}

fn uniform_dist(low: f64, high: f64) -> Result<UniformDist<f64>> {
    if !low.is_finite() || !high.is_finite() {
        return Err(Error::invalid_parameter(
            "min/max",
            format!("bounds must be finite, got [{low}, {high}]"),
        ));
    }
    if low > high {
        return Err(Error::invalid_parameter(
            "min/max",
            format!("min {low} is greater than max {high}"),
        ));
    }
    Ok(UniformDist::new_inclusive(low, high))
}

/// All elements set to one value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantFiller {
    pub value: f64,
}

impl<T: Dtype> Filler<T> for ConstantFiller {
    fn fill(&self, blob: &mut Blob<T>) -> Result<()> {
        let v = T::from_f64(self.value);
        blob.host_data_mut()?.fill(v);
        Ok(())
    }
}

/// U(min, max), both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformFiller {
    pub min: f64,
    pub max: f64,
    pub seed: Option<u64>,
}

impl<T: Dtype> Filler<T> for UniformFiller {
    fn fill(&self, blob: &mut Blob<T>) -> Result<()> {
        let dist = uniform_dist(self.min, self.max)?;
        sample_into(&dist, self.seed, blob.host_data_mut()?);
        Ok(())
    }
}

/// N(mean, std).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianFiller {
    pub mean: f64,
    pub std: f64,
    pub seed: Option<u64>,
}

impl<T: Dtype> Filler<T> for GaussianFiller {
    fn fill(&self, blob: &mut Blob<T>) -> Result<()> {
        if !self.mean.is_finite() || !self.std.is_finite() || self.std < 0.0 {
            return Err(Error::invalid_parameter(
                "std",
                format!("need finite mean and std >= 0, got N({}, {})", self.mean, self.std),
            ));
        }
        let dist = Normal::new(self.mean, self.std)
            .map_err(|e| Error::invalid_parameter("std", e.to_string()))?;
        sample_into(&dist, self.seed, blob.host_data_mut()?);
        Ok(())
    }
}

/// Non-negative rows that each sum to one.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositiveUnitballFiller {
    pub seed: Option<u64>,
}

impl<T: Dtype> Filler<T> for PositiveUnitballFiller {
    fn fill(&self, blob: &mut Blob<T>) -> Result<()> {
        let num = blob.num();
        let count = blob.count();
        if count == 0 {
            return Ok(());
        }
        let dim = count / num;
        let dist = uniform_dist(0.0, 1.0)?;
        let data = blob.host_data_mut()?;
        sample_into(&dist, self.seed, data);
        for row in data.chunks_mut(dim) {
            let sum = row.iter().fold(T::zero(), |acc, &v| acc + v);
            if sum > T::zero() {
                for v in row.iter_mut() {
                    *v = *v / sum;
                }
            } else {
                // all zeros drawn; fall back to the uniform row
                let share = T::from_f64(1.0 / dim as f64);
                row.fill(share);
            }
        }
        Ok(())
    }
}

/// Glorot uniform with fan_in = count / num.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct XavierFiller {
    pub seed: Option<u64>,
}

impl XavierFiller {
    /// Half-width of the sampling interval for a blob.
    pub fn scale<T: Dtype>(blob: &Blob<T>) -> Option<f64> {
        if blob.count() == 0 {
            return None;
        }
        let fan_in = (blob.count() / blob.num()) as f64;
        Some((3.0 / fan_in).sqrt())
    }
}

impl<T: Dtype> Filler<T> for XavierFiller {
    fn fill(&self, blob: &mut Blob<T>) -> Result<()> {
        let Some(scale) = Self::scale(blob) else {
            return Ok(());
        };
        let dist = uniform_dist(-scale, scale)?;
        sample_into(&dist, self.seed, blob.host_data_mut()?);
        Ok(())
    }
}

/// Build the filler described by `param`.
pub fn get_filler<T: Dtype>(param: &FillerParameter) -> Box<dyn Filler<T>> {
    match param.kind {
        FillerKind::Constant => Box::new(ConstantFiller { value: param.value }),
        FillerKind::Uniform => Box::new(UniformFiller {
            min: param.min,
            max: param.max,
            seed: param.seed,
        }),
        FillerKind::Gaussian => Box::new(GaussianFiller {
            mean: param.mean,
            std: param.std,
            seed: param.seed,
        }),
        FillerKind::PositiveUnitball => Box::new(PositiveUnitballFiller { seed: param.seed }),
        FillerKind::Xavier => Box::new(XavierFiller { seed: param.seed }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled<T: Dtype>(param: &FillerParameter, shape: (usize, usize, usize, usize)) -> Vec<T> {
        let mut blob = Blob::<T>::new(shape);
        get_filler::<T>(param).fill(&mut blob).unwrap();
        blob.host_data().unwrap().to_vec()
    }

    #[test]
    fn test_constant() {
        let mut p = FillerParameter::new(FillerKind::Constant);
        p.value = 2.5;
        let v = filled::<f32>(&p, (2, 3, 4, 5));
        assert_eq!(v.len(), 120);
        assert!(v.iter().all(|&x| x == 2.5));
    }

    #[test]
    fn test_uniform_bounds() {
        let mut p = FillerParameter::new(FillerKind::Uniform).with_seed(7);
        p.min = -0.5;
        p.max = 1.5;
        let v = filled::<f64>(&p, (2, 3, 4, 5));
        assert!(v.iter().all(|&x| (-0.5..=1.5).contains(&x)));
        // not degenerate
        assert!(v.iter().any(|&x| x != v[0]));
    }

    #[test]
    fn test_uniform_rejects_inverted_range() {
        let mut p = FillerParameter::new(FillerKind::Uniform);
        p.min = 1.0;
        p.max = 0.0;
        let mut blob = Blob::<f32>::new((1, 1, 1, 4));
        let err = get_filler::<f32>(&p).fill(&mut blob).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
    }

    #[test]
    fn test_gaussian_is_seeded() {
        let p = FillerParameter::new(FillerKind::Gaussian).with_seed(42);
        let a = filled::<f32>(&p, (2, 3, 4, 5));
        let b = filled::<f32>(&p, (2, 3, 4, 5));
        assert_eq!(a, b);
        let mean = a.iter().map(|&x| x as f64).sum::<f64>() / a.len() as f64;
        assert!(mean.abs() < 0.5, "mean {mean}");
        assert!(a.iter().any(|&x| x < 0.0));
        assert!(a.iter().any(|&x| x > 0.0));
    }

    #[test]
    fn test_gaussian_rejects_negative_std() {
        let mut p = FillerParameter::new(FillerKind::Gaussian);
        p.std = -1.0;
        let mut blob = Blob::<f64>::new((1, 1, 1, 1));
        assert!(get_filler::<f64>(&p).fill(&mut blob).is_err());
    }

    #[test]
    fn test_positive_unitball_rows_sum_to_one() {
        let p = FillerParameter::new(FillerKind::PositiveUnitball).with_seed(3);
        let v = filled::<f64>(&p, (2, 3, 4, 5));
        for row in v.chunks(60) {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "row sum {sum}");
            assert!(row.iter().all(|&x| x >= 0.0));
        }
    }

    #[test]
    fn test_xavier_scale() {
        let p = FillerParameter::new(FillerKind::Xavier).with_seed(11);
        let v = filled::<f32>(&p, (2, 3, 4, 5));
        let scale = (3.0f32 / 60.0).sqrt();
        assert!(v.iter().all(|&x| x.abs() <= scale + 1e-6));
    }

    #[test]
    fn test_empty_blob_is_fine() {
        for kind in [
            FillerKind::Constant,
            FillerKind::Uniform,
            FillerKind::Gaussian,
            FillerKind::PositiveUnitball,
            FillerKind::Xavier,
        ] {
            let v = filled::<f32>(&FillerParameter::new(kind), (0, 3, 4, 5));
            assert!(v.is_empty());
        }
    }
}
