//! Tensor-side pre/post-processing shared by the pipelines.
//!
//! Image decoding and resizing live in the caller; everything here works
//! on raw RGB bytes or tensors so the library stays free of image codecs.

use candle::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Per-channel normalization constants of the CLIP image encoder.
pub const CLIP_IMAGE_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
pub const CLIP_IMAGE_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

fn check_rgb_dims(rgb: &[u8], width: usize, height: usize) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::invalid_input(format!(
            "image has zero-sized dimension ({width}x{height})"
        )));
    }
    if rgb.len() != width * height * 3 {
        return Err(Error::invalid_input(format!(
            "rgb buffer length {} does not match {width}x{height}x3",
            rgb.len()
        )));
    }
    Ok(())
}

/// Normalize a subject image for the vision encoder: HWC u8 to
/// [1, 3, size, size] f32 with CLIP mean/std. The caller resizes to
/// `size` (224) beforehand.
pub fn subject_image_to_tensor(
    rgb: &[u8],
    size: usize,
    device: &Device,
) -> Result<Tensor> {
    check_rgb_dims(rgb, size, size)?;
    let data: Vec<f32> = rgb.iter().map(|&v| v as f32 / 255.0).collect();
    let t = Tensor::from_vec(data, (size, size, 3), device)?.permute((2, 0, 1))?;
    let mean = Tensor::from_slice(&CLIP_IMAGE_MEAN, (3, 1, 1), device)?;
    let std = Tensor::from_slice(&CLIP_IMAGE_STD, (3, 1, 1), device)?;
    let t = t.broadcast_sub(&mean)?.broadcast_div(&std)?;
    Ok(t.unsqueeze(0)?)
}

/// Turn a conditioning image (e.g. an edge map) into the [1, 3, H, W]
/// tensor in [0, 1] consumed by the ControlNet embedder. Dimensions must
/// match the latent grid, i.e. be multiples of 8.
pub fn control_image_to_tensor(
    rgb: &[u8],
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    check_rgb_dims(rgb, width, height)?;
    if width % 8 != 0 || height % 8 != 0 {
        return Err(Error::invalid_input(format!(
            "conditioning image dimensions must be multiples of 8, got {width}x{height}"
        )));
    }
    let data: Vec<f32> = rgb.iter().map(|&v| v as f32 / 255.0).collect();
    let t = Tensor::from_vec(data, (height, width, 3), device)?.permute((2, 0, 1))?;
    Ok(t.unsqueeze(0)?)
}

/// Map a decoded [1, 3, H, W] image from [-1, 1] to a [3, H, W] u8
/// tensor ready for encoding to a file.
pub fn tensor_to_image(decoded: &Tensor) -> Result<Tensor> {
    let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    Ok(img.squeeze(0)?.to_dtype(DType::U8)?)
}

/// Amplify the subject in the prompt by prefixing the category and
/// repeating, the trick the released checkpoints were trained with.
/// `strength` in [0, 1] scales the repetition count down from `reps`.
pub fn amplify_prompt(prompt: &str, target_subject: &str, strength: f64, reps: usize) -> String {
    let line = format!("a {target_subject} {prompt}");
    let times = ((strength * reps as f64) as usize).max(1);
    vec![line; times].join(", ")
}

/// Classifier-free guidance: move the conditional prediction away from
/// the unconditional one.
pub fn apply_guidance(cond: &Tensor, uncond: &Tensor, scale: f64) -> Result<Tensor> {
    let diff = (cond - uncond)?;
    Ok((uncond + diff.affine(scale, 0.0)?)?)
}

/// Fail fast when the latent state picks up NaN or infinity, reporting
/// the step that produced it.
pub fn ensure_finite(latents: &Tensor, step: usize) -> Result<()> {
    let sum = latents
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    if sum.is_finite() {
        Ok(())
    } else {
        Err(Error::NumericInstability { step })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_image_shape_and_range() {
        let device = Device::Cpu;
        let rgb = vec![128u8; 8 * 8 * 3];
        let t = subject_image_to_tensor(&rgb, 8, &device).unwrap();
        assert_eq!(t.dims(), &[1, 3, 8, 8]);
        // 128/255 is close to the CLIP means, so values sit near zero.
        let v = t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(v.iter().all(|x| x.abs() < 1.0));
    }

    #[test]
    fn test_zero_sized_image_rejected() {
        let device = Device::Cpu;
        assert!(matches!(
            subject_image_to_tensor(&[], 0, &device),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            control_image_to_tensor(&[], 16, 0, &device),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_mismatched_buffer_rejected() {
        let device = Device::Cpu;
        let rgb = vec![0u8; 10];
        assert!(matches!(
            subject_image_to_tensor(&rgb, 8, &device),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_control_image_alignment() {
        let device = Device::Cpu;
        let rgb = vec![255u8; 12 * 12 * 3];
        assert!(matches!(
            control_image_to_tensor(&rgb, 12, 12, &device),
            Err(Error::InvalidInput(_))
        ));
        let rgb = vec![255u8; 16 * 16 * 3];
        let t = control_image_to_tensor(&rgb, 16, 16, &device).unwrap();
        assert_eq!(t.dims(), &[1, 3, 16, 16]);
        let max = t.max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((max - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tensor_to_image_clamps() {
        let device = Device::Cpu;
        let t = Tensor::full(3.0f32, (1, 3, 4, 4), &device).unwrap();
        let img = tensor_to_image(&t).unwrap();
        assert_eq!(img.dims(), &[3, 4, 4]);
        let v = img.flatten_all().unwrap().to_vec1::<u8>().unwrap();
        assert!(v.iter().all(|&x| x == 255));
    }

    #[test]
    fn test_amplify_prompt() {
        let p = amplify_prompt("swimming in the ocean", "dog", 1.0, 3);
        assert_eq!(
            p,
            "a dog swimming in the ocean, a dog swimming in the ocean, a dog swimming in the ocean"
        );
        // Strength scales the repetitions, never below one.
        let p = amplify_prompt("on a table", "cat", 0.0, 20);
        assert_eq!(p, "a cat on a table");
        let p = amplify_prompt("on a table", "cat", 0.5, 20);
        assert_eq!(p.matches("a cat on a table").count(), 10);
    }

    #[test]
    fn test_apply_guidance() {
        let device = Device::Cpu;
        let cond = Tensor::full(2.0f32, (1, 4), &device).unwrap();
        let uncond = Tensor::full(1.0f32, (1, 4), &device).unwrap();
        let out = apply_guidance(&cond, &uncond, 7.5).unwrap();
        let v = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(v.iter().all(|&x| (x - 8.5).abs() < 1e-6)); // 1 + 7.5 * (2 - 1)
    }

    #[test]
    fn test_ensure_finite_flags_nan() {
        let device = Device::Cpu;
        let good = Tensor::ones((1, 4), DType::F32, &device).unwrap();
        assert!(ensure_finite(&good, 3).is_ok());
        let bad = Tensor::full(f32::NAN, (1, 4), &device).unwrap();
        match ensure_finite(&bad, 7) {
            Err(Error::NumericInstability { step }) => assert_eq!(step, 7),
            other => panic!("expected NumericInstability, got {other:?}"),
        }
    }
}
