//! Configuration structures for the BLIP-Diffusion model components.
//!
//! Each struct mirrors the `config.json` of the corresponding checkpoint
//! subfolder so the files can be deserialized directly, and each has a
//! preset constructor carrying the released model's values.

use serde::Deserialize;

/// Configuration for the BLIP-2 vision transformer backbone.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VisionConfig {
    /// Transformer width (default: 1024).
    #[serde(default = "default_vision_hidden_size")]
    pub hidden_size: usize,

    /// MLP expansion width (default: 4096).
    #[serde(default = "default_vision_intermediate_size")]
    pub intermediate_size: usize,

    /// Number of transformer layers (default: 24).
    #[serde(default = "default_vision_num_hidden_layers")]
    pub num_hidden_layers: usize,

    /// Number of attention heads (default: 16).
    #[serde(default = "default_vision_num_attention_heads")]
    pub num_attention_heads: usize,

    /// Expected input resolution in pixels (default: 224).
    #[serde(default = "default_image_size")]
    pub image_size: usize,

    /// Side length of a square patch (default: 14).
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,

    /// Epsilon for all layer norms (default: 1e-5).
    #[serde(default = "default_vision_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_vision_hidden_size() -> usize {
    1024
}
fn default_vision_intermediate_size() -> usize {
    4096
}
fn default_vision_num_hidden_layers() -> usize {
    24
}
fn default_vision_num_attention_heads() -> usize {
    16
}
fn default_image_size() -> usize {
    224
}
fn default_patch_size() -> usize {
    14
}
fn default_vision_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self::blip_diffusion()
    }
}

impl VisionConfig {
    /// ViT-L/14 configuration used by the released BLIP-Diffusion weights.
    pub fn blip_diffusion() -> Self {
        Self {
            hidden_size: 1024,
            intermediate_size: 4096,
            num_hidden_layers: 24,
            num_attention_heads: 16,
            image_size: 224,
            patch_size: 14,
            layer_norm_eps: 1e-5,
        }
    }

    /// Patches per side (224 / 14 = 16).
    pub fn num_patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Sequence length including the class token (16 * 16 + 1 = 257).
    pub fn seq_len(&self) -> usize {
        self.num_patches_per_side() * self.num_patches_per_side() + 1
    }
}

/// Configuration for the Q-Former that distills image features into a
/// fixed number of query embeddings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QFormerConfig {
    /// BERT-style vocabulary size (default: 30523, bert-base-uncased plus
    /// a decoder token).
    #[serde(default = "default_qformer_vocab_size")]
    pub vocab_size: usize,

    /// Transformer width (default: 768).
    #[serde(default = "default_qformer_hidden_size")]
    pub hidden_size: usize,

    /// Number of transformer layers (default: 12).
    #[serde(default = "default_qformer_num_hidden_layers")]
    pub num_hidden_layers: usize,

    /// Number of attention heads (default: 12).
    #[serde(default = "default_qformer_num_attention_heads")]
    pub num_attention_heads: usize,

    /// MLP expansion width (default: 3072).
    #[serde(default = "default_qformer_intermediate_size")]
    pub intermediate_size: usize,

    /// Maximum text positions (default: 512).
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// Width of the vision features attended to by cross-attention
    /// (default: 1024, matching [`VisionConfig::hidden_size`]).
    #[serde(default = "default_encoder_hidden_size")]
    pub encoder_hidden_size: usize,

    /// Every how many layers a cross-attention block is inserted
    /// (default: 1, every layer).
    #[serde(default = "default_cross_attention_frequency")]
    pub cross_attention_frequency: usize,

    /// Number of learned query tokens (default: 16).
    #[serde(default = "default_num_query_tokens")]
    pub num_query_tokens: usize,

    /// Epsilon for all layer norms (default: 1e-12, BERT convention).
    #[serde(default = "default_qformer_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_qformer_vocab_size() -> usize {
    30523
}
fn default_qformer_hidden_size() -> usize {
    768
}
fn default_qformer_num_hidden_layers() -> usize {
    12
}
fn default_qformer_num_attention_heads() -> usize {
    12
}
fn default_qformer_intermediate_size() -> usize {
    3072
}
fn default_max_position_embeddings() -> usize {
    512
}
fn default_encoder_hidden_size() -> usize {
    1024
}
fn default_cross_attention_frequency() -> usize {
    1
}
fn default_num_query_tokens() -> usize {
    16
}
fn default_qformer_layer_norm_eps() -> f64 {
    1e-12
}

impl Default for QFormerConfig {
    fn default() -> Self {
        Self::blip_diffusion()
    }
}

impl QFormerConfig {
    /// Q-Former configuration used by the released BLIP-Diffusion weights.
    pub fn blip_diffusion() -> Self {
        Self {
            vocab_size: 30523,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            max_position_embeddings: 512,
            encoder_hidden_size: 1024,
            cross_attention_frequency: 1,
            num_query_tokens: 16,
            layer_norm_eps: 1e-12,
        }
    }
}

/// Configuration for the CLIP text encoder that consumes both prompt
/// tokens and the injected subject embedding.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClipTextConfig {
    /// BPE vocabulary size (default: 49408).
    #[serde(default = "default_clip_vocab_size")]
    pub vocab_size: usize,

    /// Transformer width (default: 768).
    #[serde(default = "default_clip_hidden_size")]
    pub hidden_size: usize,

    /// MLP expansion width (default: 3072).
    #[serde(default = "default_clip_intermediate_size")]
    pub intermediate_size: usize,

    /// Number of transformer layers (default: 12).
    #[serde(default = "default_clip_num_hidden_layers")]
    pub num_hidden_layers: usize,

    /// Number of attention heads (default: 12).
    #[serde(default = "default_clip_num_attention_heads")]
    pub num_attention_heads: usize,

    /// Maximum sequence length, tokens plus injected context
    /// (default: 77).
    #[serde(default = "default_max_position_embeddings_clip")]
    pub max_position_embeddings: usize,

    /// Epsilon for all layer norms (default: 1e-5).
    #[serde(default = "default_clip_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_clip_vocab_size() -> usize {
    49408
}
fn default_clip_hidden_size() -> usize {
    768
}
fn default_clip_intermediate_size() -> usize {
    3072
}
fn default_clip_num_hidden_layers() -> usize {
    12
}
fn default_clip_num_attention_heads() -> usize {
    12
}
fn default_max_position_embeddings_clip() -> usize {
    77
}
fn default_clip_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for ClipTextConfig {
    fn default() -> Self {
        Self::blip_diffusion()
    }
}

impl ClipTextConfig {
    /// CLIP ViT-L/14 text tower, as shipped with Stable Diffusion v1.5.
    pub fn blip_diffusion() -> Self {
        Self {
            vocab_size: 49408,
            hidden_size: 768,
            intermediate_size: 3072,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            max_position_embeddings: 77,
            layer_norm_eps: 1e-5,
        }
    }
}

/// Configuration for the denoising UNet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UnetConfig {
    /// Latent channels consumed by `conv_in` (default: 4).
    #[serde(default = "default_unet_in_channels")]
    pub in_channels: usize,

    /// Latent channels produced by `conv_out` (default: 4).
    #[serde(default = "default_unet_out_channels")]
    pub out_channels: usize,

    /// Channel width of each resolution level (default: [320, 640, 1280, 1280]).
    #[serde(default = "default_block_out_channels")]
    pub block_out_channels: Vec<usize>,

    /// Residual blocks per down level; up levels use one more (default: 2).
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,

    /// Width of the text conditioning attended to by cross-attention
    /// (default: 768).
    #[serde(default = "default_cross_attention_dim")]
    pub cross_attention_dim: usize,

    /// Attention heads in every spatial transformer (default: 8).
    #[serde(default = "default_num_attention_heads_unet")]
    pub num_attention_heads: usize,

    /// Groups for all group norms (default: 32).
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,

    /// Which down levels carry cross-attention; the up path mirrors this
    /// in reverse (default: [true, true, true, false]).
    #[serde(default = "default_down_block_attention")]
    pub down_block_attention: Vec<bool>,
}

fn default_unet_in_channels() -> usize {
    4
}
fn default_unet_out_channels() -> usize {
    4
}
fn default_block_out_channels() -> Vec<usize> {
    vec![320, 640, 1280, 1280]
}
fn default_layers_per_block() -> usize {
    2
}
fn default_cross_attention_dim() -> usize {
    768
}
fn default_num_attention_heads_unet() -> usize {
    8
}
fn default_norm_num_groups() -> usize {
    32
}
fn default_down_block_attention() -> Vec<bool> {
    vec![true, true, true, false]
}

impl Default for UnetConfig {
    fn default() -> Self {
        Self::stable_diffusion_v1_5()
    }
}

impl UnetConfig {
    /// Stable Diffusion v1.5 UNet, the base model BLIP-Diffusion
    /// fine-tunes.
    pub fn stable_diffusion_v1_5() -> Self {
        Self {
            in_channels: 4,
            out_channels: 4,
            block_out_channels: vec![320, 640, 1280, 1280],
            layers_per_block: 2,
            cross_attention_dim: 768,
            num_attention_heads: 8,
            norm_num_groups: 32,
            down_block_attention: vec![true, true, true, false],
        }
    }

    /// Width of the time embedding MLP (4x the first level).
    pub fn time_embed_dim(&self) -> usize {
        self.block_out_channels[0] * 4
    }
}

/// Configuration for the KL autoencoder mapping images to latents.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VaeConfig {
    /// Image channels (default: 3).
    #[serde(default = "default_vae_in_channels")]
    pub in_channels: usize,

    /// Channel width of each resolution level (default: [128, 256, 512, 512]).
    #[serde(default = "default_vae_block_out_channels")]
    pub block_out_channels: Vec<usize>,

    /// Residual blocks per encoder level; decoder levels use one more
    /// (default: 2).
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,

    /// Latent channels (default: 4).
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,

    /// Groups for all group norms (default: 32).
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,

    /// Multiplier applied to encoded latents so they are roughly unit
    /// variance (default: 0.18215).
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: f64,
}

fn default_vae_in_channels() -> usize {
    3
}
fn default_vae_block_out_channels() -> Vec<usize> {
    vec![128, 256, 512, 512]
}
fn default_latent_channels() -> usize {
    4
}
fn default_scaling_factor() -> f64 {
    0.18215
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self::stable_diffusion_v1_5()
    }
}

impl VaeConfig {
    /// Stable Diffusion v1.5 autoencoder.
    pub fn stable_diffusion_v1_5() -> Self {
        Self {
            in_channels: 3,
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
            scaling_factor: 0.18215,
        }
    }

    /// Spatial compression ratio (2^(levels - 1) = 8).
    pub fn spatial_compression_ratio(&self) -> usize {
        1 << (self.block_out_channels.len() - 1)
    }
}

/// Configuration for the ControlNet conditioning adapter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlNetConfig {
    /// The UNet whose down/mid path the adapter copies.
    #[serde(default)]
    pub unet: UnetConfig,

    /// Channels of the conditioning image (default: 3).
    #[serde(default = "default_conditioning_channels")]
    pub conditioning_channels: usize,

    /// Channel progression of the conditioning embedder
    /// (default: [16, 32, 96, 256]).
    #[serde(default = "default_conditioning_embedding_out_channels")]
    pub conditioning_embedding_out_channels: Vec<usize>,
}

fn default_conditioning_channels() -> usize {
    3
}
fn default_conditioning_embedding_out_channels() -> Vec<usize> {
    vec![16, 32, 96, 256]
}

impl Default for ControlNetConfig {
    fn default() -> Self {
        Self::stable_diffusion_v1_5()
    }
}

impl ControlNetConfig {
    /// ControlNet matching the Stable Diffusion v1.5 UNet.
    pub fn stable_diffusion_v1_5() -> Self {
        Self {
            unet: UnetConfig::stable_diffusion_v1_5(),
            conditioning_channels: 3,
            conditioning_embedding_out_channels: vec![16, 32, 96, 256],
        }
    }
}

/// Beta schedule used to build the diffusion noise levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
}

/// Configuration for the PNDM sampler.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchedulerConfig {
    /// Number of training timesteps (default: 1000).
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    /// First beta of the schedule (default: 0.00085).
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,

    /// Last beta of the schedule (default: 0.012).
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,

    /// Shape of the beta ramp (default: scaled_linear).
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: BetaSchedule,

    /// Skip the Runge-Kutta warmup and run pure linear multistep
    /// (default: true). Only `true` is supported; the sampler rejects
    /// `false` in `set_timesteps`.
    #[serde(default = "default_skip_prk_steps")]
    pub skip_prk_steps: bool,

    /// Use alpha_bar = 1 for the final step instead of the first
    /// training alpha (default: false).
    #[serde(default)]
    pub set_alpha_to_one: bool,

    /// Constant added to every inference timestep (default: 1).
    #[serde(default = "default_steps_offset")]
    pub steps_offset: usize,
}

fn default_num_train_timesteps() -> usize {
    1000
}
fn default_beta_start() -> f64 {
    0.00085
}
fn default_beta_end() -> f64 {
    0.012
}
fn default_beta_schedule() -> BetaSchedule {
    BetaSchedule::ScaledLinear
}
fn default_skip_prk_steps() -> bool {
    true
}
fn default_steps_offset() -> usize {
    1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::blip_diffusion()
    }
}

impl SchedulerConfig {
    /// Scheduler configuration shipped with the released pipeline.
    pub fn blip_diffusion() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            skip_prk_steps: true,
            set_alpha_to_one: false,
            steps_offset: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vision_config_defaults() {
        let config = VisionConfig::blip_diffusion();
        assert_eq!(config.num_patches_per_side(), 16);
        assert_eq!(config.seq_len(), 257); // 16 * 16 + 1
    }

    #[test]
    fn test_unet_config_defaults() {
        let config = UnetConfig::stable_diffusion_v1_5();
        assert_eq!(config.time_embed_dim(), 1280); // 320 * 4
        assert_eq!(config.block_out_channels.len(), config.down_block_attention.len());
    }

    #[test]
    fn test_vae_config_defaults() {
        let config = VaeConfig::stable_diffusion_v1_5();
        assert_eq!(config.spatial_compression_ratio(), 8); // 2^3
    }

    #[test]
    fn test_scheduler_config_from_json() {
        let config: SchedulerConfig = serde_json::from_str(
            r#"{"beta_schedule": "scaled_linear", "set_alpha_to_one": false}"#,
        )
        .unwrap();
        assert_eq!(config.beta_schedule, BetaSchedule::ScaledLinear);
        assert!(!config.set_alpha_to_one);
        assert_eq!(config.num_train_timesteps, 1000);
    }
}
