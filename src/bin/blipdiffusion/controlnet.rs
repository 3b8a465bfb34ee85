use anyhow::Result;
use candle::{DType, Device};

use blip_diffusion::BlipDiffusionControlNetPipeline;

use crate::common::{self, ModelPaths};
use crate::{generate, ControlnetArgs};

pub fn run(args: ControlnetArgs, paths: ModelPaths, device: &Device, dtype: DType) -> Result<()> {
    let api = hf_hub::api::sync::Api::new()?;
    println!("Loading model components...");
    let base = common::load_pipeline(&paths, &api, device, dtype)?;
    let controlnet_model_id = args
        .controlnet_model_id
        .as_deref()
        .unwrap_or(common::DEFAULT_CONTROLNET_MODEL_ID);
    let controlnet = common::load_controlnet(
        args.controlnet_path.as_deref(),
        controlnet_model_id,
        &api,
        device,
        dtype,
    )?;
    let pipeline = BlipDiffusionControlNetPipeline { base, controlnet };

    let subject = common::load_subject_image(&args.generate.subject_image, device)?;
    let params = generate::params_from_args(&args.generate);
    let control =
        common::load_control_image(&args.control_image, params.width, params.height, device)?;
    println!(
        "Generating {}x{} image over {} steps (conditioning scale {})...",
        params.width, params.height, params.num_inference_steps, args.conditioning_scale
    );
    let image = pipeline.generate(&subject, &control, args.conditioning_scale, &params)?;
    common::postprocess_and_save(&image, &args.generate.output)
}
