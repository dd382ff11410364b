//! Distance math shared by every prompt
//!
//! All functions work on the trailing (feature) axis and broadcast the
//! leading axes, so a single target can be compared against a batch of
//! candidates.

use candle_core::{CpuStorage, CustomOp1, Device, Layout, Result, Shape, Tensor, D};

/// Lower bound for vector norms when normalizing
const NORM_EPS: f64 = 1e-12;

/// Added under the square root of the chord length so that identical
/// vectors have a finite (zero) gradient instead of NaN.
const CHORD_EPS: f64 = 1e-12;

/// Lower bound for `1 - x²` in the arcsine derivative, keeping the slope
/// finite at `x = ±1` (antipodal vectors).
const ARCSIN_SLOPE_EPS: f64 = 1e-12;

/// Scale each vector along the last axis to unit length.
pub fn normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    let norm = norm.maximum(&full_like(&norm, NORM_EPS)?)?;
    x.broadcast_div(&norm)
}

/// Squared great-circle distance between the directions of `x` and `y`:
/// `2 * arcsin(clamp(|x̂ - ŷ| / 2, 0, 1))²`, reduced over the last axis.
///
/// The result ranges from 0 (parallel) to π²/2 (antipodal).
pub fn spherical_distance(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let diff = normalize(x)?.broadcast_sub(&normalize(y)?)?;
    let chord = diff
        .sqr()?
        .sum(D::Minus1)?
        .affine(1.0, CHORD_EPS)?
        .sqrt()?;
    let half = chord.affine(0.5, 0.0)?;
    let half = half
        .maximum(&full_like(&half, 0.0)?)?
        .minimum(&full_like(&half, 1.0)?)?;
    arcsin(&half)?.sqr()?.affine(2.0, 0.0)
}

/// Use the value of `forward` while routing gradients into `backward`.
///
/// The two tensors must share a shape.
pub fn replace_grad(forward: &Tensor, backward: &Tensor) -> Result<Tensor> {
    let offset = forward.sub(backward)?.detach();
    backward.add(&offset)
}

/// Elementwise arcsine with a backward pass.
pub fn arcsin(x: &Tensor) -> Result<Tensor> {
    if x.device().is_cpu() {
        return x.contiguous()?.apply_op1(Arcsin);
    }
    // Only a CPU kernel exists; the device hops are differentiable.
    let device = x.device().clone();
    x.to_device(&Device::Cpu)?
        .contiguous()?
        .apply_op1(Arcsin)?
        .to_device(&device)
}

/// A tensor shaped like `t`, filled with `value`, in `t`'s dtype.
pub(crate) fn full_like(t: &Tensor, value: f64) -> Result<Tensor> {
    Tensor::full(value, t.dims(), t.device())?.to_dtype(t.dtype())
}

struct Arcsin;

impl CustomOp1 for Arcsin {
    fn name(&self) -> &'static str {
        "arcsin"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let (start, end) = layout
            .contiguous_offsets()
            .ok_or_else(|| candle_core::Error::Msg("arcsin: input is not contiguous".into()))?;

        let out = match storage {
            CpuStorage::F32(values) => {
                CpuStorage::F32(values[start..end].iter().map(|v| v.asin()).collect())
            }
            CpuStorage::F64(values) => {
                CpuStorage::F64(values[start..end].iter().map(|v| v.asin()).collect())
            }
            _ => {
                return Err(candle_core::Error::Msg(
                    "arcsin: only f32 and f64 tensors are supported".into(),
                ))
            }
        };

        Ok((out, layout.shape().clone()))
    }

    fn bwd(&self, arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        // d/dx arcsin(x) = 1 / sqrt(1 - x²)
        let rest = arg.sqr()?.affine(-1.0, 1.0)?;
        let rest = rest.maximum(&full_like(&rest, ARCSIN_SLOPE_EPS)?)?;
        let slope = rest.sqrt()?.recip()?;
        Ok(Some(grad_res.mul(&slope)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;
    use std::f32::consts::PI;

    fn scalar(t: &Tensor) -> f32 {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_normalize_unit_length() {
        let x = Tensor::new(&[[3f32, 4.0], [0.0, 2.0]], &Device::Cpu).unwrap();
        let n = normalize(&x).unwrap().to_vec2::<f32>().unwrap();
        assert!((n[0][0] - 0.6).abs() < 1e-6);
        assert!((n[0][1] - 0.8).abs() < 1e-6);
        assert!((n[1][1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector_stays_finite() {
        let x = Tensor::zeros((1, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let n = normalize(&x).unwrap().to_vec2::<f32>().unwrap();
        assert!(n[0].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_spherical_distance_landmarks() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1f32, 0.0], [1.0, 0.0], [1.0, 0.0]], &device).unwrap();
        let y = Tensor::new(&[[2f32, 0.0], [0.0, 5.0], [-1.0, 0.0]], &device).unwrap();
        let d = spherical_distance(&x, &y).unwrap().to_vec1::<f32>().unwrap();

        // parallel, orthogonal, antipodal
        assert!(d[0].abs() < 1e-6);
        assert!((d[1] - 2.0 * (PI / 4.0).powi(2)).abs() < 1e-4);
        assert!((d[2] - 2.0 * (PI / 2.0).powi(2)).abs() < 1e-4);
    }

    #[test]
    fn test_spherical_distance_broadcasts_leading_axes() {
        let device = Device::Cpu;
        let target = Tensor::new(&[[[1f32, 0.0, 0.0]]], &device).unwrap();
        let batch = Tensor::new(&[[[1f32, 0.0, 0.0]], [[0.0, 1.0, 0.0]]], &device).unwrap();
        let d = spherical_distance(&batch, &target).unwrap();
        assert_eq!(d.dims(), &[2, 1]);
    }

    #[test]
    fn test_arcsin_gradient() {
        let x = Var::new(&[0.5f32], &Device::Cpu).unwrap();
        let y = arcsin(&x).unwrap().sum_all().unwrap();
        assert!((scalar(&y) - 0.5f32.asin()).abs() < 1e-6);

        let grads = y.backward().unwrap();
        let g = scalar(grads.get(&x).unwrap());
        let expected = 1.0 / (1.0 - 0.25f32).sqrt();
        assert!((g - expected).abs() < 1e-5, "gradient {} != {}", g, expected);
    }

    #[test]
    fn test_arcsin_gradient_finite_at_one() {
        let x = Var::new(&[1f32, -1.0], &Device::Cpu).unwrap();
        let y = arcsin(&x).unwrap().sum_all().unwrap();
        let grads = y.backward().unwrap();
        let g = grads.get(&x).unwrap().to_vec1::<f32>().unwrap();
        assert!(g.iter().all(|v| v.is_finite()), "gradient {:?}", g);
    }

    #[test]
    fn test_antipodal_vectors_have_finite_gradient() {
        let device = Device::Cpu;
        let x = Var::new(&[[-1f32, 0.0]], &device).unwrap();
        let y = Tensor::new(&[[1f32, 0.0]], &device).unwrap();
        let d = spherical_distance(&x, &y).unwrap().sum_all().unwrap();
        assert!((scalar(&d) - 2.0 * (PI / 2.0).powi(2)).abs() < 1e-4);

        let grads = d.backward().unwrap();
        let g = grads.get(&x).unwrap().to_vec2::<f32>().unwrap();
        assert!(g[0].iter().all(|v| v.is_finite()), "gradient {:?}", g);
    }

    #[test]
    fn test_replace_grad_value_and_gradient() {
        let device = Device::Cpu;
        let x = Var::new(&[2f32], &device).unwrap();
        let forward = x.affine(3.0, 0.0).unwrap();
        let backward = x.affine(5.0, 0.0).unwrap();

        let out = replace_grad(&forward, &backward).unwrap();
        assert!((scalar(&out) - 6.0).abs() < 1e-6);

        let grads = out.sum_all().unwrap().backward().unwrap();
        let g = scalar(grads.get(&x).unwrap());
        assert!((g - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_identical_vectors_have_zero_gradient() {
        let device = Device::Cpu;
        let x = Var::new(&[[0.3f32, -0.2, 0.9]], &device).unwrap();
        let y = Tensor::new(&[[0.3f32, -0.2, 0.9]], &device).unwrap();
        let d = spherical_distance(&x, &y).unwrap().sum_all().unwrap();
        assert!(scalar(&d).abs() < 1e-6);

        let grads = d.backward().unwrap();
        let g = grads.get(&x).unwrap().to_vec2::<f32>().unwrap();
        assert!(g[0].iter().all(|v| v.is_finite() && v.abs() < 1e-3));
    }
}
