//! End-to-end generation pipelines.
//!
//! [`BlipDiffusionPipeline`] wires the subject encoder, the context
//! text encoder, the UNet, the autoencoder and the PNDM sampler into
//! one subject-driven text-to-image generator.
//! [`BlipDiffusionControlNetPipeline`] adds a ControlNet so a
//! conditioning image (edge map, depth map, ...) steers the layout.

use candle::{DType, Device, Tensor};
use tokenizers::Tokenizer;

use crate::blip2::SubjectEncoder;
use crate::clip::ContextClipTextModel;
use crate::config::SchedulerConfig;
use crate::controlnet::ControlNetModel;
use crate::error::{Error, Result};
use crate::processing::{amplify_prompt, apply_guidance, ensure_finite};
use crate::rng::GaussianRng;
use crate::scheduler::PndmScheduler;
use crate::unet::UNet2DConditionModel;
use crate::vae::AutoencoderKL;

/// Position at which the subject embedding is spliced into the token
/// sequence: right after `[BOS] "a"`, i.e. inside the "a <subject>"
/// prefix every amplified prompt starts with.
const CTX_BEGIN_POS: usize = 2;

/// Load a tokenizer file, mapping failures to [`Error::Resource`].
pub fn load_tokenizer(path: &std::path::Path) -> Result<Tokenizer> {
    if !path.is_file() {
        return Err(Error::Resource(format!(
            "tokenizer file not found at {}",
            path.display()
        )));
    }
    Tokenizer::from_file(path)
        .map_err(|e| Error::Resource(format!("tokenizer {}: {e}", path.display())))
}

/// Check that a weights file exists before handing it to the mmap
/// loader, mapping a missing path to [`Error::Resource`].
pub fn weights_file(path: impl Into<std::path::PathBuf>) -> Result<std::path::PathBuf> {
    let path = path.into();
    if path.is_file() {
        Ok(path)
    } else {
        Err(Error::Resource(format!(
            "weights file not found at {}",
            path.display()
        )))
    }
}

/// Knobs of one generation run.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    /// Scene description, without the subject prefix.
    pub prompt: String,
    /// Category of the subject shown in the reference image.
    pub source_subject: String,
    /// Category rendered in the output, usually equal to the source.
    pub target_subject: String,
    /// Prompt for the unconditional guidance branch.
    pub negative_prompt: String,
    pub height: usize,
    pub width: usize,
    /// Classifier-free guidance scale; values <= 1 disable guidance.
    pub guidance_scale: f64,
    pub num_inference_steps: usize,
    /// Scales the subject-repetition count in the amplified prompt.
    pub prompt_strength: f64,
    /// Base repetition count for prompt amplification.
    pub prompt_reps: usize,
    pub seed: u64,
}

impl GenerateParams {
    /// Validate the knobs against the autoencoder's spatial compression
    /// `ratio` before any model work happens.
    pub fn validate(&self, ratio: usize) -> Result<()> {
        if self.num_inference_steps == 0 {
            return Err(Error::invalid_input("num_inference_steps must be >= 1"));
        }
        if self.height == 0
            || self.width == 0
            || self.height % ratio != 0
            || self.width % ratio != 0
        {
            return Err(Error::invalid_input(format!(
                "output dimensions must be non-zero multiples of {ratio}, got {}x{}",
                self.width, self.height
            )));
        }
        if self.target_subject.trim().is_empty() {
            return Err(Error::invalid_input("target subject text is empty"));
        }
        Ok(())
    }
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            source_subject: String::new(),
            target_subject: String::new(),
            negative_prompt: String::new(),
            height: 512,
            width: 512,
            guidance_scale: 7.5,
            num_inference_steps: 50,
            prompt_strength: 1.0,
            prompt_reps: 20,
            seed: 42,
        }
    }
}

/// Subject-driven text-to-image pipeline.
pub struct BlipDiffusionPipeline {
    pub subject_encoder: SubjectEncoder,
    pub text_encoder: ContextClipTextModel,
    pub unet: UNet2DConditionModel,
    pub vae: AutoencoderKL,
    /// BPE tokenizer of the CLIP text encoder.
    pub clip_tokenizer: Tokenizer,
    /// WordPiece tokenizer for the Q-Former category text.
    pub qformer_tokenizer: Tokenizer,
    pub scheduler_config: SchedulerConfig,
    pub device: Device,
    pub dtype: DType,
}

impl BlipDiffusionPipeline {
    /// Encode the reference image and its category into the subject
    /// embedding, [1, num_query_tokens, hidden].
    pub fn encode_subject(&self, pixel_values: &Tensor, category: &str) -> Result<Tensor> {
        if category.trim().is_empty() {
            return Err(Error::invalid_input("subject category text is empty"));
        }
        let enc = self.qformer_tokenizer.encode(category, true)?;
        let ids = Tensor::new(enc.get_ids(), &self.device)?.unsqueeze(0)?;
        let mask = Tensor::new(enc.get_attention_mask(), &self.device)?.unsqueeze(0)?;
        let embedding = self.subject_encoder.forward(pixel_values, &ids, &mask)?;
        Ok(embedding.to_dtype(self.dtype)?)
    }

    /// Tokenize and encode a prompt; with a subject embedding the prompt
    /// is truncated so the spliced sequence still fits the encoder.
    pub fn encode_prompt(&self, prompt: &str, subject: Option<&Tensor>) -> Result<Tensor> {
        let reserved = if subject.is_some() {
            self.subject_encoder.num_query_tokens()
        } else {
            0
        };
        let max_len = self.text_encoder.max_positions() - reserved;
        let enc = self.clip_tokenizer.encode(prompt, true)?;
        let mut ids = enc.get_ids().to_vec();
        if ids.len() > max_len {
            ids.truncate(max_len);
        }
        let ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self
            .text_encoder
            .forward(&ids, subject, CTX_BEGIN_POS)?
            .to_dtype(self.dtype)?)
    }

    fn check_params(&self, params: &GenerateParams) -> Result<()> {
        params.validate(self.vae.spatial_compression_ratio())
    }

    /// Run the denoising loop and decode the result to a [1, 3, H, W]
    /// image in [-1, 1].
    fn denoise(
        &self,
        cond: &Tensor,
        uncond: Option<&Tensor>,
        params: &GenerateParams,
        control: Option<(&ControlNetModel, &Tensor, f64)>,
    ) -> Result<Tensor> {
        let mut scheduler = PndmScheduler::new(self.scheduler_config.clone());
        scheduler.set_timesteps(params.num_inference_steps)?;

        let ratio = self.vae.spatial_compression_ratio();
        let shape = [
            1,
            self.vae.latent_channels(),
            params.height / ratio,
            params.width / ratio,
        ];
        let mut rng = GaussianRng::new(params.seed);
        let mut latents = rng
            .randn(&shape, &self.device, self.dtype)?
            .affine(scheduler.init_noise_sigma(), 0.0)?;

        let timesteps = scheduler.timesteps().to_vec();
        for (step, &t) in timesteps.iter().enumerate() {
            let input = scheduler.scale_model_input(latents.clone());

            let forward_branch = |ctx: &Tensor| -> Result<Tensor> {
                let (down_res, mid_res) = match control {
                    Some((controlnet, cond_image, scale)) => {
                        let out = controlnet.forward(&input, t, ctx, cond_image, scale)?;
                        (Some(out.down_block_residuals), Some(out.mid_block_residual))
                    }
                    None => (None, None),
                };
                Ok(self
                    .unet
                    .forward(&input, t, ctx, down_res.as_deref(), mid_res.as_ref())?)
            };

            let noise_cond = forward_branch(cond)?;
            let noise = match uncond {
                Some(uncond) => {
                    apply_guidance(&noise_cond, &forward_branch(uncond)?, params.guidance_scale)?
                }
                None => noise_cond,
            };

            latents = scheduler.step(&noise, t, &latents)?;
            ensure_finite(&latents, step)?;
        }

        // The autoencoder always runs in f32 regardless of the UNet dtype.
        let latents = latents.to_dtype(DType::F32)?;
        let image = self
            .vae
            .decode(&self.vae.denormalize_latents(&latents)?)?;
        Ok(image)
    }

    /// Generate an image of the subject shown in `subject_pixels`
    /// (CLIP-normalized, [1, 3, 224, 224]) following the prompt.
    pub fn generate(&self, subject_pixels: &Tensor, params: &GenerateParams) -> Result<Tensor> {
        self.check_params(params)?;
        let subject = self.encode_subject(subject_pixels, &params.source_subject)?;
        let prompt = amplify_prompt(
            &params.prompt,
            &params.target_subject,
            params.prompt_strength,
            params.prompt_reps,
        );
        let cond = self.encode_prompt(&prompt, Some(&subject))?;
        let uncond = if params.guidance_scale > 1.0 {
            Some(self.encode_prompt(&params.negative_prompt, None)?)
        } else {
            None
        };
        self.denoise(&cond, uncond.as_ref(), params, None)
    }
}

/// The structure-conditioned variant.
pub struct BlipDiffusionControlNetPipeline {
    pub base: BlipDiffusionPipeline,
    pub controlnet: ControlNetModel,
}

impl BlipDiffusionControlNetPipeline {
    /// Like [`BlipDiffusionPipeline::generate`], additionally steered by
    /// `control_image` ([1, 3, H, W] in [0, 1], matching the output
    /// resolution). `conditioning_scale` weights the control residuals.
    pub fn generate(
        &self,
        subject_pixels: &Tensor,
        control_image: &Tensor,
        conditioning_scale: f64,
        params: &GenerateParams,
    ) -> Result<Tensor> {
        self.base.check_params(params)?;
        let (_, _, ch, cw) = control_image.dims4().map_err(Error::from)?;
        if ch != params.height || cw != params.width {
            return Err(Error::invalid_input(format!(
                "conditioning image is {cw}x{ch} but the output is {}x{}",
                params.width, params.height
            )));
        }
        let subject = self
            .base
            .encode_subject(subject_pixels, &params.source_subject)?;
        let prompt = amplify_prompt(
            &params.prompt,
            &params.target_subject,
            params.prompt_strength,
            params.prompt_reps,
        );
        let cond = self.base.encode_prompt(&prompt, Some(&subject))?;
        let uncond = if params.guidance_scale > 1.0 {
            Some(self.base.encode_prompt(&params.negative_prompt, None)?)
        } else {
            None
        };
        let control_image = control_image.to_dtype(self.base.dtype)?;
        self.base.denoise(
            &cond,
            uncond.as_ref(),
            params,
            Some((&self.controlnet, &control_image, conditioning_scale)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tokenizer_reports_resource_error() {
        let err = load_tokenizer(std::path::Path::new("/nonexistent/tokenizer.json")).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[test]
    fn test_missing_weights_report_resource_error() {
        let err = weights_file("/nonexistent/model.safetensors").unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[test]
    fn test_default_params() {
        let p = GenerateParams::default();
        assert_eq!(p.height, 512);
        assert_eq!(p.width, 512);
        assert_eq!(p.guidance_scale, 7.5);
        assert_eq!(p.num_inference_steps, 50);
        assert_eq!(p.prompt_reps, 20);
    }

    #[test]
    fn test_param_validation() {
        let good = GenerateParams {
            target_subject: "dog".to_string(),
            ..Default::default()
        };
        assert!(good.validate(8).is_ok());

        let zero_steps = GenerateParams {
            num_inference_steps: 0,
            ..good.clone()
        };
        assert!(matches!(zero_steps.validate(8), Err(Error::InvalidInput(_))));

        let misaligned = GenerateParams {
            height: 500,
            ..good.clone()
        };
        assert!(matches!(misaligned.validate(8), Err(Error::InvalidInput(_))));

        let zero_dim = GenerateParams { width: 0, ..good.clone() };
        assert!(matches!(zero_dim.validate(8), Err(Error::InvalidInput(_))));

        // The default target subject is empty and must be filled in.
        let no_target = GenerateParams::default();
        assert!(matches!(no_target.validate(8), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_ctx_begin_pos_is_after_prefix() {
        // The amplified prompt always starts with "a <subject>", so the
        // injection point sits right after [BOS] and "a".
        assert_eq!(CTX_BEGIN_POS, 2);
    }
}
