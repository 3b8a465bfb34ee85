//! Seeded Gaussian noise generation with PyTorch parity.
//!
//! Initial latents are drawn from an MT19937 + Box-Muller generator that
//! reproduces `torch.randn()` bit-for-bit, so a seed produces the same
//! image here as in the reference pipeline. PyTorch switches algorithm on
//! tensor size: below 16 elements it draws 53-bit double uniforms with a
//! one-value cache, at 16 and above it batches 24-bit float uniforms in
//! chunks of 16.

use candle::{DType, Device, Tensor};
use rand_mt::Mt;

use crate::error::Result;

/// Deterministic N(0, 1) generator matching `torch.randn()`.
#[derive(Debug, Clone)]
pub struct GaussianRng {
    mt: Mt,
    /// Second Box-Muller output held over for the next scalar draw.
    spare: Option<f32>,
}

impl GaussianRng {
    /// `torch.manual_seed` keeps only the lower 32 bits of the seed, so we
    /// truncate the same way.
    pub fn new(seed: u64) -> Self {
        Self {
            mt: Mt::new(seed as u32),
            spare: None,
        }
    }

    /// Two u32 draws combined into a 53-bit uniform in [0, 1).
    #[inline]
    fn uniform_f64(lo: u32, hi: u32) -> f64 {
        let bits = (((lo as u64) << 32) | (hi as u64)) & 0x001F_FFFF_FFFF_FFFF;
        bits as f64 / (1u64 << 53) as f64
    }

    /// One u32 draw reduced to a 24-bit uniform in [0, 1).
    #[inline]
    fn uniform_f32(v: u32) -> f32 {
        (v & 0x00FF_FFFF) as f32 / (1u32 << 24) as f32
    }

    /// Single normal draw via the double-precision scalar path.
    pub fn next_normal(&mut self) -> f32 {
        if let Some(v) = self.spare.take() {
            return v;
        }
        let (lo1, hi1) = (self.mt.next_u32(), self.mt.next_u32());
        let (lo2, hi2) = (self.mt.next_u32(), self.mt.next_u32());
        let u1 = Self::uniform_f64(lo1, hi1);
        let u2 = Self::uniform_f64(lo2, hi2);

        // log(1 - u2) rather than log(u2): u2 can be exactly 0.
        let r = (-2.0_f64 * (1.0_f64 - u2).ln()).sqrt();
        let theta = 2.0_f64 * std::f64::consts::PI * u1;

        self.spare = Some((r * theta.sin()) as f32);
        (r * theta.cos()) as f32
    }

    /// Fill a buffer via the vectorized path, 16 uniforms at a time.
    ///
    /// Within a chunk the first 8 uniforms become radii (after a 1-u
    /// flip), the last 8 become angles, and the outputs land as 8 cosine
    /// values followed by 8 sine values. A tail shorter than 16 falls
    /// back to the scalar path.
    fn fill_normal(&mut self, count: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count / 16 {
            let mut u = [0.0_f32; 16];
            for v in u.iter_mut() {
                *v = Self::uniform_f32(self.mt.next_u32());
            }
            let mut cos_half = [0.0_f32; 8];
            let mut sin_half = [0.0_f32; 8];
            for i in 0..8 {
                let r = (-2.0_f32 * (1.0_f32 - u[i]).ln()).sqrt();
                let theta = 2.0_f32 * std::f32::consts::PI * u[8 + i];
                cos_half[i] = r * theta.cos();
                sin_half[i] = r * theta.sin();
            }
            out.extend_from_slice(&cos_half);
            out.extend_from_slice(&sin_half);
        }
        for _ in 0..count % 16 {
            out.push(self.next_normal());
        }
        out
    }

    /// Draw a tensor of normal values, generated on the host and then
    /// moved to `device` so the stream is identical across backends.
    pub fn randn(&mut self, shape: &[usize], device: &Device, dtype: DType) -> Result<Tensor> {
        let count: usize = shape.iter().product();
        let data = if count >= 16 {
            self.fill_normal(count)
        } else {
            (0..count).map(|_| self.next_normal()).collect()
        };
        let t = Tensor::from_vec(data, shape, &Device::Cpu)?;
        let t = if matches!(device, Device::Cpu) {
            t
        } else {
            t.to_device(device)?
        };
        Ok(t.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = GaussianRng::new(42);
        let mut b = GaussianRng::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_normal(), b.next_normal());
        }
    }

    #[test]
    fn test_different_seed_different_stream() {
        let mut a = GaussianRng::new(42);
        let mut b = GaussianRng::new(43);
        let xs: Vec<f32> = (0..16).map(|_| a.next_normal()).collect();
        let ys: Vec<f32> = (0..16).map(|_| b.next_normal()).collect();
        assert_ne!(xs, ys);
    }

    #[test]
    fn test_torch_parity_vectorized() {
        // torch.manual_seed(42); torch.randn(16)
        let expected = [
            1.9269150495529175_f32,
            1.4872841835021973,
            0.9007171988487244,
            -2.1055214405059814,
            0.6784184575080872,
            -1.2345449924468994,
            -0.043067481368780136,
            -1.6046669483184814,
        ];
        let mut rng = GaussianRng::new(42);
        let values = rng.fill_normal(16);
        assert_eq!(values.len(), 16);
        for (i, (got, want)) in values.iter().zip(expected.iter()).enumerate() {
            assert!(
                (got - want).abs() < 1e-5,
                "index {i}: got {got}, want {want}"
            );
        }
    }

    #[test]
    fn test_randn_tensor_shape() {
        let mut rng = GaussianRng::new(0);
        let t = rng.randn(&[1, 4, 8, 8], &Device::Cpu, DType::F32).unwrap();
        assert_eq!(t.dims(), &[1, 4, 8, 8]);
        let sum = t.sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(sum.is_finite());
    }
}
