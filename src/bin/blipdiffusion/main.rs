use anyhow::Result;
use clap::{Parser, Subcommand};

mod common;
mod controlnet;
mod generate;

#[derive(Parser)]
#[command(author, version, about = "Subject-driven text-to-image generation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Run on CPU rather than on GPU.
    #[arg(long, global = true)]
    cpu: bool,

    /// Use f32 computations rather than the device default.
    #[arg(long, global = true)]
    use_f32: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long, global = true)]
    tracing: bool,

    /// The model repository to use on the HuggingFace Hub.
    #[arg(long, global = true)]
    model_id: Option<String>,

    /// Local path to the BLIP-2 subject encoder weights.
    #[arg(long, global = true)]
    qformer_path: Option<String>,

    /// Local path to the CLIP text encoder weights.
    #[arg(long, global = true)]
    text_encoder_path: Option<String>,

    /// Local path to the UNet weights.
    #[arg(long, global = true)]
    unet_path: Option<String>,

    /// Local path to the autoencoder weights.
    #[arg(long, global = true)]
    vae_path: Option<String>,

    /// Local path to the CLIP tokenizer file.
    #[arg(long, global = true)]
    tokenizer_path: Option<String>,

    /// Local path to the Q-Former WordPiece tokenizer file.
    #[arg(long, global = true)]
    qformer_tokenizer_path: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an image of a subject following a text prompt.
    Generate(GenerateArgs),
    /// Generate with an additional structure-conditioning image.
    Controlnet(ControlnetArgs),
}

#[derive(clap::Args)]
pub struct GenerateArgs {
    /// The prompt describing the scene.
    #[arg(long)]
    prompt: String,

    /// Reference image of the subject.
    #[arg(long)]
    subject_image: String,

    /// Category of the subject in the reference image, e.g. "dog".
    #[arg(long)]
    source_subject: String,

    /// Category to render, usually the same as the source.
    #[arg(long)]
    target_subject: String,

    /// The prompt used for the unconditional guidance branch.
    #[arg(long, default_value = "")]
    negative_prompt: String,

    /// Output image height in pixels, must be a multiple of 8.
    #[arg(long, default_value_t = 512)]
    height: usize,

    /// Output image width in pixels, must be a multiple of 8.
    #[arg(long, default_value_t = 512)]
    width: usize,

    /// Number of denoising steps.
    #[arg(long, default_value_t = 50)]
    num_inference_steps: usize,

    /// Classifier-free guidance scale, values <= 1 disable guidance.
    #[arg(long, default_value_t = 7.5)]
    guidance_scale: f64,

    /// Strength of the subject amplification in the prompt.
    #[arg(long, default_value_t = 1.0)]
    prompt_strength: f64,

    /// Base repetition count for the subject amplification.
    #[arg(long, default_value_t = 20)]
    prompt_reps: usize,

    /// The seed driving the latent noise generator.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Where to save the generated image.
    #[arg(long, default_value = "out.jpg")]
    output: String,
}

#[derive(clap::Args)]
pub struct ControlnetArgs {
    #[command(flatten)]
    generate: GenerateArgs,

    /// Conditioning image (e.g. a canny edge map), resized to the
    /// output resolution.
    #[arg(long)]
    control_image: String,

    /// Weight applied to the ControlNet residuals.
    #[arg(long, default_value_t = 1.0)]
    conditioning_scale: f64,

    /// The ControlNet model repository on the HuggingFace Hub.
    #[arg(long)]
    controlnet_model_id: Option<String>,

    /// Local path to the ControlNet weights.
    #[arg(long)]
    controlnet_path: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = common::setup_tracing(cli.tracing);
    let seed = match &cli.command {
        Command::Generate(args) => args.seed,
        Command::Controlnet(args) => args.generate.seed,
    };
    let (device, dtype) = common::setup_device_and_dtype(cli.cpu, cli.use_f32, Some(seed))?;
    println!("Using device {device:?} with dtype {dtype:?}");

    let paths = common::ModelPaths {
        model_id: cli.model_id,
        qformer_path: cli.qformer_path,
        text_encoder_path: cli.text_encoder_path,
        unet_path: cli.unet_path,
        vae_path: cli.vae_path,
        tokenizer_path: cli.tokenizer_path,
        qformer_tokenizer_path: cli.qformer_tokenizer_path,
    };

    match cli.command {
        Command::Generate(args) => generate::run(args, paths, &device, dtype),
        Command::Controlnet(args) => controlnet::run(args, paths, &device, dtype),
    }
}
