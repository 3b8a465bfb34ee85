//! Shared CLI plumbing: device/tracing setup, image IO and model
//! loading from the HuggingFace Hub or local paths.

use anyhow::{anyhow, Result};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tokenizers::Tokenizer;
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;

use blip_diffusion::config::{
    ClipTextConfig, ControlNetConfig, QFormerConfig, SchedulerConfig, UnetConfig, VaeConfig,
    VisionConfig,
};
use blip_diffusion::pipeline::{self, BlipDiffusionPipeline};
use blip_diffusion::{blip2, clip, controlnet, processing, unet, vae};

/// Default HuggingFace model IDs.
pub const DEFAULT_MODEL_ID: &str = "Salesforce/blipdiffusion";
pub const DEFAULT_CONTROLNET_MODEL_ID: &str = "Salesforce/blipdiffusion-controlnet";
/// The Q-Former consumes BERT WordPiece tokens.
pub const QFORMER_TOKENIZER_ID: &str = "bert-base-uncased";
/// The CLIP BPE tokenizer of the SD v1.5 text encoder.
pub const CLIP_TOKENIZER_ID: &str = "openai/clip-vit-base-patch32";

/// Side length the subject reference image is resized to.
pub const SUBJECT_IMAGE_SIZE: usize = 224;

/// Per-component weight overrides; every unset entry is fetched from the
/// Hub.
#[derive(Default)]
pub struct ModelPaths {
    pub model_id: Option<String>,
    pub qformer_path: Option<String>,
    pub text_encoder_path: Option<String>,
    pub unet_path: Option<String>,
    pub vae_path: Option<String>,
    pub tokenizer_path: Option<String>,
    pub qformer_tokenizer_path: Option<String>,
}

/// Initialize Chrome tracing if enabled.
///
/// Returns a guard that must be kept alive for the duration of tracing.
pub fn setup_tracing(enabled: bool) -> Option<tracing_chrome::FlushGuard> {
    if enabled {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    }
}

/// Pick the compute device and dtype.
///
/// CPU latent noise is always produced by the host-side generator, so
/// only accelerator devices need explicit seeding.
pub fn setup_device_and_dtype(cpu: bool, use_f32: bool, seed: Option<u64>) -> Result<(Device, DType)> {
    let device = if cpu {
        Device::Cpu
    } else if candle::utils::cuda_is_available() {
        Device::new_cuda(0)?
    } else if candle::utils::metal_is_available() {
        Device::new_metal(0)?
    } else {
        Device::Cpu
    };
    if let Some(seed) = seed {
        if !matches!(device, Device::Cpu) {
            device.set_seed(seed)?;
        }
    }
    let dtype = if use_f32 {
        DType::F32
    } else {
        device.bf16_default_to_f32()
    };
    Ok((device, dtype))
}

/// Load the subject reference image as a CLIP-normalized
/// [1, 3, 224, 224] tensor.
pub fn load_subject_image(path: &str, device: &Device) -> Result<Tensor> {
    let img = image::ImageReader::open(path)
        .map_err(|e| anyhow!("Failed to open image '{}': {}", path, e))?
        .decode()
        .map_err(|e| anyhow!("Failed to decode image '{}': {}", path, e))?;
    let img = img.resize_exact(
        SUBJECT_IMAGE_SIZE as u32,
        SUBJECT_IMAGE_SIZE as u32,
        image::imageops::FilterType::Lanczos3,
    );
    let rgb = img.to_rgb8().into_raw();
    Ok(processing::subject_image_to_tensor(
        &rgb,
        SUBJECT_IMAGE_SIZE,
        device,
    )?)
}

/// Load a conditioning image (edge/depth map) resized to the output
/// resolution, as a [1, 3, H, W] tensor in [0, 1].
pub fn load_control_image(
    path: &str,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    let img = image::ImageReader::open(path)
        .map_err(|e| anyhow!("Failed to open image '{}': {}", path, e))?
        .decode()
        .map_err(|e| anyhow!("Failed to decode image '{}': {}", path, e))?;
    let img = img.resize_exact(
        width as u32,
        height as u32,
        image::imageops::FilterType::Lanczos3,
    );
    let rgb = img.to_rgb8().into_raw();
    Ok(processing::control_image_to_tensor(
        &rgb, width, height, device,
    )?)
}

/// Write a [1, 3, H, W] tensor in [-1, 1] to an image file.
pub fn postprocess_and_save(image: &Tensor, output_path: &str) -> Result<()> {
    let image = processing::tensor_to_image(&image.to_dtype(DType::F32)?)?;
    let (channels, height, width) = image.dims3()?;
    if channels != 3 {
        anyhow::bail!("expected an rgb tensor, got {channels} channels")
    }
    let pixels = image.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    let buffer: image::ImageBuffer<image::Rgb<u8>, Vec<u8>> =
        image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
            .ok_or_else(|| anyhow!("invalid image buffer"))?;
    buffer.save(output_path)?;
    println!("Saved {output_path}");
    Ok(())
}

fn weight_file(
    local: Option<&str>,
    api: &hf_hub::api::sync::Api,
    model_id: &str,
    remote_name: &str,
) -> Result<std::path::PathBuf> {
    match local {
        Some(path) => Ok(pipeline::weights_file(path)?),
        None => {
            let repo = api.repo(hf_hub::Repo::model(model_id.to_string()));
            Ok(repo.get(remote_name)?)
        }
    }
}

fn load_tokenizer(
    local: Option<&str>,
    api: &hf_hub::api::sync::Api,
    model_id: &str,
) -> Result<Tokenizer> {
    let path = match local {
        Some(p) => std::path::PathBuf::from(p),
        None => {
            let repo = api.repo(hf_hub::Repo::model(model_id.to_string()));
            repo.get("tokenizer.json")?
        }
    };
    Ok(pipeline::load_tokenizer(&path)?)
}

/// Load every component of the base pipeline.
///
/// The subject encoder, text encoder and autoencoder always run in F32;
/// only the UNet uses the requested dtype.
pub fn load_pipeline(
    paths: &ModelPaths,
    api: &hf_hub::api::sync::Api,
    device: &Device,
    dtype: DType,
) -> Result<BlipDiffusionPipeline> {
    let model_id = paths.model_id.as_deref().unwrap_or(DEFAULT_MODEL_ID);

    let qformer_file = weight_file(
        paths.qformer_path.as_deref(),
        api,
        model_id,
        "qformer/model.safetensors",
    )?;
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[qformer_file], DType::F32, device)? };
    let subject_encoder = blip2::SubjectEncoder::new(
        &VisionConfig::blip_diffusion(),
        &QFormerConfig::blip_diffusion(),
        vb,
    )?;

    let text_encoder_file = weight_file(
        paths.text_encoder_path.as_deref(),
        api,
        model_id,
        "text_encoder/model.safetensors",
    )?;
    let vb =
        unsafe { VarBuilder::from_mmaped_safetensors(&[text_encoder_file], DType::F32, device)? };
    let text_encoder = clip::ContextClipTextModel::new(&ClipTextConfig::blip_diffusion(), vb)?;

    let unet_file = weight_file(
        paths.unet_path.as_deref(),
        api,
        model_id,
        "unet/diffusion_pytorch_model.safetensors",
    )?;
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[unet_file], dtype, device)? };
    let unet = unet::UNet2DConditionModel::new(&UnetConfig::stable_diffusion_v1_5(), vb)?;

    let vae_file = weight_file(
        paths.vae_path.as_deref(),
        api,
        model_id,
        "vae/diffusion_pytorch_model.safetensors",
    )?;
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[vae_file], DType::F32, device)? };
    let vae = vae::AutoencoderKL::new(&VaeConfig::stable_diffusion_v1_5(), vb)?;

    let clip_tokenizer =
        load_tokenizer(paths.tokenizer_path.as_deref(), api, CLIP_TOKENIZER_ID)?;
    let qformer_tokenizer = load_tokenizer(
        paths.qformer_tokenizer_path.as_deref(),
        api,
        QFORMER_TOKENIZER_ID,
    )?;

    Ok(BlipDiffusionPipeline {
        subject_encoder,
        text_encoder,
        unet,
        vae,
        clip_tokenizer,
        qformer_tokenizer,
        scheduler_config: SchedulerConfig::blip_diffusion(),
        device: device.clone(),
        dtype,
    })
}

/// Load the ControlNet adapter weights.
pub fn load_controlnet(
    controlnet_path: Option<&str>,
    model_id: &str,
    api: &hf_hub::api::sync::Api,
    device: &Device,
    dtype: DType,
) -> Result<controlnet::ControlNetModel> {
    let file = weight_file(
        controlnet_path,
        api,
        model_id,
        "controlnet/diffusion_pytorch_model.safetensors",
    )?;
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[file], dtype, device)? };
    Ok(controlnet::ControlNetModel::new(
        &ControlNetConfig::stable_diffusion_v1_5(),
        vb,
    )?)
}
