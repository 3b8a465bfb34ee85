use anyhow::Result;
use candle::{DType, Device};

use blip_diffusion::GenerateParams;

use crate::common::{self, ModelPaths};
use crate::GenerateArgs;

pub fn params_from_args(args: &GenerateArgs) -> GenerateParams {
    GenerateParams {
        prompt: args.prompt.clone(),
        source_subject: args.source_subject.clone(),
        target_subject: args.target_subject.clone(),
        negative_prompt: args.negative_prompt.clone(),
        height: args.height,
        width: args.width,
        guidance_scale: args.guidance_scale,
        num_inference_steps: args.num_inference_steps,
        prompt_strength: args.prompt_strength,
        prompt_reps: args.prompt_reps,
        seed: args.seed,
    }
}

pub fn run(args: GenerateArgs, paths: ModelPaths, device: &Device, dtype: DType) -> Result<()> {
    let api = hf_hub::api::sync::Api::new()?;
    println!("Loading model components...");
    let pipeline = common::load_pipeline(&paths, &api, device, dtype)?;

    let subject = common::load_subject_image(&args.subject_image, device)?;
    let params = params_from_args(&args);
    println!(
        "Generating {}x{} image over {} steps...",
        params.width, params.height, params.num_inference_steps
    );
    let image = pipeline.generate(&subject, &params)?;
    common::postprocess_and_save(&image, &args.output)
}
