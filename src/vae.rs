//! KL autoencoder bridging pixel space and the 8x-downsampled latent
//! space the diffusion runs in.

use candle::{Result, Tensor, D};
use candle_nn::{conv2d, group_norm, linear, Conv2d, Conv2dConfig, GroupNorm, Linear, Module, VarBuilder};

use crate::blocks::{ResnetBlock2D, Upsample2D};
use crate::config::VaeConfig;

/// Single-head attention over the flattened feature map, used in the
/// encoder and decoder bottlenecks.
#[derive(Debug)]
struct AttentionBlock {
    group_norm: GroupNorm,
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    scale: f64,
}

impl AttentionBlock {
    fn new(channels: usize, groups: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            group_norm: group_norm(groups, channels, 1e-6, vb.pp("group_norm"))?,
            to_q: linear(channels, channels, vb.pp("to_q"))?,
            to_k: linear(channels, channels, vb.pp("to_k"))?,
            to_v: linear(channels, channels, vb.pp("to_v"))?,
            to_out: linear(channels, channels, vb.pp("to_out.0"))?,
            scale: (channels as f64).powf(-0.5),
        })
    }
}

impl Module for AttentionBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = xs.dims4()?;
        let hidden = self
            .group_norm
            .forward(xs)?
            .reshape((b, c, h * w))?
            .transpose(1, 2)?
            .contiguous()?;
        let q = self.to_q.forward(&hidden)?;
        let k = self.to_k.forward(&hidden)?;
        let v = self.to_v.forward(&hidden)?;
        let attn = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = self.to_out.forward(&attn.matmul(&v)?)?;
        out.transpose(1, 2)?.reshape((b, c, h, w))? + xs
    }
}

/// Resnet / attention / resnet bottleneck without time conditioning.
#[derive(Debug)]
struct MidBlock {
    resnet1: ResnetBlock2D,
    attention: AttentionBlock,
    resnet2: ResnetBlock2D,
}

impl MidBlock {
    fn new(channels: usize, groups: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            resnet1: ResnetBlock2D::new(channels, channels, None, groups, 1e-6, vb.pp("resnets.0"))?,
            attention: AttentionBlock::new(channels, groups, vb.pp("attentions.0"))?,
            resnet2: ResnetBlock2D::new(channels, channels, None, groups, 1e-6, vb.pp("resnets.1"))?,
        })
    }
}

impl Module for MidBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.resnet1.forward(xs, None)?;
        let h = self.attention.forward(&h)?;
        self.resnet2.forward(&h, None)
    }
}

/// Encoder level: resnets plus an asymmetrically padded strided
/// downsampling convolution (pad right/bottom only, the SD convention).
#[derive(Debug)]
struct EncoderBlock {
    resnets: Vec<ResnetBlock2D>,
    downsample: Option<Conv2d>,
}

impl EncoderBlock {
    fn new(
        in_channels: usize,
        out_channels: usize,
        num_layers: usize,
        groups: usize,
        add_downsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut resnets = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let res_in = if i == 0 { in_channels } else { out_channels };
            resnets.push(ResnetBlock2D::new(
                res_in,
                out_channels,
                None,
                groups,
                1e-6,
                vb.pp(format!("resnets.{i}")),
            )?);
        }
        let downsample = if add_downsample {
            let cfg = Conv2dConfig {
                stride: 2,
                ..Default::default()
            };
            Some(conv2d(
                out_channels,
                out_channels,
                3,
                cfg,
                vb.pp("downsamplers.0.conv"),
            )?)
        } else {
            None
        };
        Ok(Self { resnets, downsample })
    }
}

impl Module for EncoderBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.clone();
        for resnet in &self.resnets {
            h = resnet.forward(&h, None)?;
        }
        if let Some(conv) = &self.downsample {
            let h_padded = h.pad_with_zeros(D::Minus1, 0, 1)?.pad_with_zeros(D::Minus2, 0, 1)?;
            h = conv.forward(&h_padded)?;
        }
        Ok(h)
    }
}

/// Decoder level: resnets plus nearest-neighbor upsampling.
#[derive(Debug)]
struct DecoderBlock {
    resnets: Vec<ResnetBlock2D>,
    upsample: Option<Upsample2D>,
}

impl DecoderBlock {
    fn new(
        in_channels: usize,
        out_channels: usize,
        num_layers: usize,
        groups: usize,
        add_upsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut resnets = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let res_in = if i == 0 { in_channels } else { out_channels };
            resnets.push(ResnetBlock2D::new(
                res_in,
                out_channels,
                None,
                groups,
                1e-6,
                vb.pp(format!("resnets.{i}")),
            )?);
        }
        let upsample = if add_upsample {
            Some(Upsample2D::new(out_channels, vb.pp("upsamplers.0"))?)
        } else {
            None
        };
        Ok(Self { resnets, upsample })
    }
}

impl Module for DecoderBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.clone();
        for resnet in &self.resnets {
            h = resnet.forward(&h, None)?;
        }
        match &self.upsample {
            Some(up) => up.forward(&h),
            None => Ok(h),
        }
    }
}

/// Gaussian posterior over latents produced by the encoder.
pub struct DiagonalGaussianDistribution {
    mean: Tensor,
    std: Tensor,
}

impl DiagonalGaussianDistribution {
    fn new(parameters: &Tensor) -> Result<Self> {
        let chunks = parameters.chunk(2, 1)?;
        let mean = chunks[0].clone();
        let logvar = chunks[1].clamp(-30f32, 20f32)?;
        let std = (logvar * 0.5)?.exp()?;
        Ok(Self { mean, std })
    }

    /// Reparameterized sample using caller-provided unit noise, so the
    /// caller controls determinism.
    pub fn sample(&self, noise: &Tensor) -> Result<Tensor> {
        &self.mean + noise.broadcast_mul(&self.std)?
    }

    /// Distribution mode, i.e. the mean.
    pub fn mode(&self) -> &Tensor {
        &self.mean
    }
}

#[derive(Debug)]
struct Encoder {
    conv_in: Conv2d,
    down_blocks: Vec<EncoderBlock>,
    mid_block: MidBlock,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Encoder {
    fn new(config: &VaeConfig, vb: VarBuilder) -> Result<Self> {
        let pad1 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let n_levels = config.block_out_channels.len();
        let conv_in = conv2d(
            config.in_channels,
            config.block_out_channels[0],
            3,
            pad1,
            vb.pp("conv_in"),
        )?;
        let mut down_blocks = Vec::with_capacity(n_levels);
        for i in 0..n_levels {
            let in_ch = if i == 0 {
                config.block_out_channels[0]
            } else {
                config.block_out_channels[i - 1]
            };
            down_blocks.push(EncoderBlock::new(
                in_ch,
                config.block_out_channels[i],
                config.layers_per_block,
                config.norm_num_groups,
                i != n_levels - 1,
                vb.pp(format!("down_blocks.{i}")),
            )?);
        }
        let last = config.block_out_channels[n_levels - 1];
        let mid_block = MidBlock::new(last, config.norm_num_groups, vb.pp("mid_block"))?;
        let conv_norm_out = group_norm(config.norm_num_groups, last, 1e-6, vb.pp("conv_norm_out"))?;
        let conv_out = conv2d(last, 2 * config.latent_channels, 3, pad1, vb.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            down_blocks,
            mid_block,
            conv_norm_out,
            conv_out,
        })
    }
}

impl Module for Encoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = self.conv_in.forward(xs)?;
        for block in &self.down_blocks {
            h = block.forward(&h)?;
        }
        let h = self.mid_block.forward(&h)?;
        self.conv_out
            .forward(&self.conv_norm_out.forward(&h)?.silu()?)
    }
}

#[derive(Debug)]
struct Decoder {
    conv_in: Conv2d,
    mid_block: MidBlock,
    up_blocks: Vec<DecoderBlock>,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Decoder {
    fn new(config: &VaeConfig, vb: VarBuilder) -> Result<Self> {
        let pad1 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let reversed: Vec<usize> = config.block_out_channels.iter().rev().copied().collect();
        let n_levels = reversed.len();
        let conv_in = conv2d(
            config.latent_channels,
            reversed[0],
            3,
            pad1,
            vb.pp("conv_in"),
        )?;
        let mid_block = MidBlock::new(reversed[0], config.norm_num_groups, vb.pp("mid_block"))?;
        let mut up_blocks = Vec::with_capacity(n_levels);
        for i in 0..n_levels {
            let in_ch = if i == 0 { reversed[0] } else { reversed[i - 1] };
            up_blocks.push(DecoderBlock::new(
                in_ch,
                reversed[i],
                config.layers_per_block + 1,
                config.norm_num_groups,
                i != n_levels - 1,
                vb.pp(format!("up_blocks.{i}")),
            )?);
        }
        let last = reversed[n_levels - 1];
        let conv_norm_out = group_norm(config.norm_num_groups, last, 1e-6, vb.pp("conv_norm_out"))?;
        let conv_out = conv2d(last, config.in_channels, 3, pad1, vb.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
        })
    }
}

impl Module for Decoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = self.mid_block.forward(&self.conv_in.forward(xs)?)?;
        for block in &self.up_blocks {
            h = block.forward(&h)?;
        }
        self.conv_out
            .forward(&self.conv_norm_out.forward(&h)?.silu()?)
    }
}

/// The full autoencoder.
#[derive(Debug)]
pub struct AutoencoderKL {
    encoder: Encoder,
    quant_conv: Conv2d,
    post_quant_conv: Conv2d,
    decoder: Decoder,
    config: VaeConfig,
    span: tracing::Span,
}

impl AutoencoderKL {
    pub fn new(config: &VaeConfig, vb: VarBuilder) -> Result<Self> {
        let encoder = Encoder::new(config, vb.pp("encoder"))?;
        let quant_conv = conv2d(
            2 * config.latent_channels,
            2 * config.latent_channels,
            1,
            Default::default(),
            vb.pp("quant_conv"),
        )?;
        let post_quant_conv = conv2d(
            config.latent_channels,
            config.latent_channels,
            1,
            Default::default(),
            vb.pp("post_quant_conv"),
        )?;
        let decoder = Decoder::new(config, vb.pp("decoder"))?;
        Ok(Self {
            encoder,
            quant_conv,
            post_quant_conv,
            decoder,
            config: config.clone(),
            span: tracing::span!(tracing::Level::TRACE, "vae"),
        })
    }

    pub fn latent_channels(&self) -> usize {
        self.config.latent_channels
    }

    /// Factor between pixel and latent resolution.
    pub fn spatial_compression_ratio(&self) -> usize {
        self.config.spatial_compression_ratio()
    }

    /// Encode a [B, 3, H, W] image in [-1, 1] into the latent posterior.
    pub fn encode(&self, xs: &Tensor) -> Result<DiagonalGaussianDistribution> {
        let _enter = self.span.enter();
        let params = self.quant_conv.forward(&self.encoder.forward(xs)?)?;
        DiagonalGaussianDistribution::new(&params)
    }

    /// Decode unscaled latents into a [B, 3, H, W] image in [-1, 1].
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.decoder
            .forward(&self.post_quant_conv.forward(latents)?)
    }

    /// Scale encoded latents to the unit-variance space the diffusion
    /// was trained in.
    pub fn normalize_latents(&self, latents: &Tensor) -> Result<Tensor> {
        latents.affine(self.config.scaling_factor, 0.0)
    }

    /// Undo [`Self::normalize_latents`] before decoding.
    pub fn denormalize_latents(&self, latents: &Tensor) -> Result<Tensor> {
        latents.affine(1.0 / self.config.scaling_factor, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    fn tiny_config() -> VaeConfig {
        VaeConfig {
            in_channels: 3,
            block_out_channels: vec![16, 32],
            layers_per_block: 1,
            latent_channels: 4,
            norm_num_groups: 8,
            scaling_factor: 0.18215,
        }
    }

    #[test]
    fn test_encode_halves_resolution_per_level() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let vae = AutoencoderKL::new(&tiny_config(), vb).unwrap();
        let img = Tensor::zeros((1, 3, 32, 32), DType::F32, &device).unwrap();
        let dist = vae.encode(&img).unwrap();
        // Two levels means one downsampling stage: 32 -> 16.
        assert_eq!(dist.mode().dims(), &[1, 4, 16, 16]);
    }

    #[test]
    fn test_decode_restores_resolution() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let vae = AutoencoderKL::new(&tiny_config(), vb).unwrap();
        let z = Tensor::zeros((1, 4, 16, 16), DType::F32, &device).unwrap();
        let img = vae.decode(&z).unwrap();
        assert_eq!(img.dims(), &[1, 3, 32, 32]);
    }

    #[test]
    fn test_latent_scaling_round_trips() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let vae = AutoencoderKL::new(&tiny_config(), vb).unwrap();
        let z = Tensor::full(2.0f32, (1, 4, 4, 4), &device).unwrap();
        let back = vae
            .denormalize_latents(&vae.normalize_latents(&z).unwrap())
            .unwrap();
        let diff = (back - &z)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_posterior_sample_uses_caller_noise() {
        let device = Device::Cpu;
        let params = Tensor::zeros((1, 8, 4, 4), DType::F32, &device).unwrap();
        let dist = DiagonalGaussianDistribution::new(&params).unwrap();
        let noise = Tensor::ones((1, 4, 4, 4), DType::F32, &device).unwrap();
        // Zero mean, zero logvar: sample = noise.
        let s = dist.sample(&noise).unwrap();
        let diff = (s - &noise)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
