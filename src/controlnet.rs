//! ControlNet conditioning adapter.
//!
//! A trainable copy of the UNet's down and mid path that consumes an
//! extra conditioning image (edge map, depth map, ...) and emits one
//! residual per UNet skip connection plus one for the bottleneck. All
//! output projections are zero convolutions, so an untrained adapter is
//! an exact no-op on the base model.

use candle::{Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder};

use crate::blocks::{timestep_embedding, TimestepEmbedding, ZeroConv2d};
use crate::config::ControlNetConfig;
use crate::unet::{DownBlock, MidBlock};

/// Residuals produced by one ControlNet evaluation.
pub struct ControlNetOutput {
    /// One residual per UNet skip connection, outermost first.
    pub down_block_residuals: Vec<Tensor>,
    /// Residual added to the UNet bottleneck activations.
    pub mid_block_residual: Tensor,
}

/// Small convolutional stack embedding the conditioning image into the
/// latent resolution and width of the first UNet level.
#[derive(Debug)]
struct ConditioningEmbedder {
    conv_in: Conv2d,
    blocks: Vec<Conv2d>,
    conv_out: ZeroConv2d,
}

impl ConditioningEmbedder {
    fn new(
        conditioning_channels: usize,
        channels: &[usize],
        out_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let pad1 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let strided = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv_in = conv2d(conditioning_channels, channels[0], 3, pad1, vb.pp("conv_in"))?;
        let mut blocks = Vec::with_capacity(2 * (channels.len() - 1));
        for i in 0..channels.len() - 1 {
            blocks.push(conv2d(
                channels[i],
                channels[i],
                3,
                pad1,
                vb.pp(format!("blocks.{}", 2 * i)),
            )?);
            // Each strided stage halves the resolution; three stages take
            // the image down to the latent grid.
            blocks.push(conv2d(
                channels[i],
                channels[i + 1],
                3,
                strided,
                vb.pp(format!("blocks.{}", 2 * i + 1)),
            )?);
        }
        let conv_out = ZeroConv2d::new(
            channels[channels.len() - 1],
            out_channels,
            vb.pp("conv_out"),
        )?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ConditioningEmbedder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = self.conv_in.forward(xs)?.silu()?;
        for block in &self.blocks {
            h = block.forward(&h)?.silu()?;
        }
        self.conv_out.forward(&h)
    }
}

/// The adapter itself: UNet encoder copy plus zero output projections.
#[derive(Debug)]
pub struct ControlNetModel {
    conv_in: Conv2d,
    time_embedding: TimestepEmbedding,
    cond_embedder: ConditioningEmbedder,
    down_blocks: Vec<DownBlock>,
    mid_block: MidBlock,
    controlnet_down_blocks: Vec<ZeroConv2d>,
    controlnet_mid_block: ZeroConv2d,
    config: ControlNetConfig,
    span: tracing::Span,
}

impl ControlNetModel {
    pub fn new(config: &ControlNetConfig, vb: VarBuilder) -> Result<Self> {
        let unet_cfg = &config.unet;
        let n_levels = unet_cfg.block_out_channels.len();
        let b0 = unet_cfg.block_out_channels[0];
        let temb_dim = unet_cfg.time_embed_dim();
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let conv_in = conv2d(unet_cfg.in_channels, b0, 3, conv_cfg, vb.pp("conv_in"))?;
        let time_embedding = TimestepEmbedding::new(b0, temb_dim, vb.pp("time_embedding"))?;
        let cond_embedder = ConditioningEmbedder::new(
            config.conditioning_channels,
            &config.conditioning_embedding_out_channels,
            b0,
            vb.pp("controlnet_cond_embedding"),
        )?;

        let mut down_blocks = Vec::with_capacity(n_levels);
        let mut controlnet_down_blocks = Vec::new();
        // Zero projection for the conv_in activations.
        controlnet_down_blocks.push(ZeroConv2d::new(
            b0,
            b0,
            vb.pp("controlnet_down_blocks.0"),
        )?);
        for i in 0..n_levels {
            let in_ch = if i == 0 {
                b0
            } else {
                unet_cfg.block_out_channels[i - 1]
            };
            let out_ch = unet_cfg.block_out_channels[i];
            let is_final = i == n_levels - 1;
            down_blocks.push(DownBlock::new(
                in_ch,
                out_ch,
                temb_dim,
                unet_cfg.layers_per_block,
                unet_cfg.down_block_attention[i],
                !is_final,
                unet_cfg,
                vb.pp(format!("down_blocks.{i}")),
            )?);
            let per_block = unet_cfg.layers_per_block + usize::from(!is_final);
            for _ in 0..per_block {
                let idx = controlnet_down_blocks.len();
                controlnet_down_blocks.push(ZeroConv2d::new(
                    out_ch,
                    out_ch,
                    vb.pp(format!("controlnet_down_blocks.{idx}")),
                )?);
            }
        }

        let mid_ch = unet_cfg.block_out_channels[n_levels - 1];
        let mid_block = MidBlock::new(mid_ch, temb_dim, unet_cfg, vb.pp("mid_block"))?;
        let controlnet_mid_block =
            ZeroConv2d::new(mid_ch, mid_ch, vb.pp("controlnet_mid_block"))?;

        Ok(Self {
            conv_in,
            time_embedding,
            cond_embedder,
            down_blocks,
            mid_block,
            controlnet_down_blocks,
            controlnet_mid_block,
            config: config.clone(),
            span: tracing::span!(tracing::Level::TRACE, "controlnet"),
        })
    }

    /// Evaluate the adapter.
    ///
    /// `conditioning` is a [B, 3, H, W] image in [0, 1] at the pixel
    /// resolution of the generation; `conditioning_scale` multiplies
    /// every residual (0 disables the adapter).
    pub fn forward(
        &self,
        sample: &Tensor,
        timestep: usize,
        encoder_hidden_states: &Tensor,
        conditioning: &Tensor,
        conditioning_scale: f64,
    ) -> Result<ControlNetOutput> {
        let _enter = self.span.enter();
        let (batch, _, _, _) = sample.dims4()?;
        let t = Tensor::full(timestep as f32, batch, sample.device())?;
        let emb = timestep_embedding(&t, self.config.unet.block_out_channels[0])?;
        let temb = self.time_embedding.forward(&emb.to_dtype(sample.dtype())?)?;

        let cond = self.cond_embedder.forward(conditioning)?;
        let mut hidden = (self.conv_in.forward(sample)? + cond)?;

        let mut skips: Vec<Tensor> = vec![hidden.clone()];
        for block in &self.down_blocks {
            let (h, s) = block.forward(&hidden, &temb, encoder_hidden_states)?;
            hidden = h;
            skips.extend(s);
        }
        hidden = self.mid_block.forward(&hidden, &temb, encoder_hidden_states)?;

        let mut down_block_residuals = Vec::with_capacity(skips.len());
        for (skip, zero_conv) in skips.iter().zip(self.controlnet_down_blocks.iter()) {
            down_block_residuals.push(zero_conv.forward(skip)?.affine(conditioning_scale, 0.0)?);
        }
        let mid_block_residual = self
            .controlnet_mid_block
            .forward(&hidden)?
            .affine(conditioning_scale, 0.0)?;

        Ok(ControlNetOutput {
            down_block_residuals,
            mid_block_residual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    use crate::config::UnetConfig;
    use crate::unet::UNet2DConditionModel;

    fn tiny_config() -> ControlNetConfig {
        ControlNetConfig {
            unet: UnetConfig {
                in_channels: 4,
                out_channels: 4,
                block_out_channels: vec![32, 64],
                layers_per_block: 1,
                cross_attention_dim: 32,
                num_attention_heads: 4,
                norm_num_groups: 8,
                down_block_attention: vec![true, false],
            },
            conditioning_channels: 3,
            conditioning_embedding_out_channels: vec![8, 16],
        }
    }

    #[test]
    fn test_residual_count_matches_unet_skips() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let cfg = tiny_config();
        let controlnet = ControlNetModel::new(&cfg, vb.pp("controlnet")).unwrap();
        let unet = UNet2DConditionModel::new(&cfg.unet, vb.pp("unet")).unwrap();

        let sample = Tensor::zeros((1, 4, 16, 16), DType::F32, &device).unwrap();
        let ctx = Tensor::zeros((1, 7, 32), DType::F32, &device).unwrap();
        // One strided embedder stage halves 32 down to the 16 latent grid.
        let cond = Tensor::zeros((1, 3, 32, 32), DType::F32, &device).unwrap();

        let out = controlnet.forward(&sample, 500, &ctx, &cond, 1.0).unwrap();
        assert_eq!(out.down_block_residuals.len(), unet.num_skip_connections());

        // And the UNet accepts them.
        let pred = unet
            .forward(
                &sample,
                500,
                &ctx,
                Some(&out.down_block_residuals),
                Some(&out.mid_block_residual),
            )
            .unwrap();
        assert_eq!(pred.dims(), sample.dims());
    }

    #[test]
    fn test_zero_initialized_adapter_is_silent() {
        // VarBuilder::zeros mimics a freshly attached adapter: every
        // output projection is a zero conv, so all residuals vanish.
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let controlnet = ControlNetModel::new(&tiny_config(), vb).unwrap();
        let sample = Tensor::ones((1, 4, 16, 16), DType::F32, &device).unwrap();
        let ctx = Tensor::ones((1, 7, 32), DType::F32, &device).unwrap();
        let cond = Tensor::ones((1, 3, 32, 32), DType::F32, &device).unwrap();

        let out = controlnet.forward(&sample, 500, &ctx, &cond, 1.0).unwrap();
        for r in out
            .down_block_residuals
            .iter()
            .chain(std::iter::once(&out.mid_block_residual))
        {
            let max = r.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
            assert_eq!(max, 0.0);
        }
    }

    #[test]
    fn test_residuals_scale_linearly() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let controlnet = ControlNetModel::new(&tiny_config(), vb).unwrap();
        let sample = Tensor::ones((1, 4, 16, 16), DType::F32, &device).unwrap();
        let ctx = Tensor::ones((1, 7, 32), DType::F32, &device).unwrap();
        let cond = Tensor::ones((1, 3, 32, 32), DType::F32, &device).unwrap();

        let full = controlnet.forward(&sample, 500, &ctx, &cond, 1.0).unwrap();
        let off = controlnet.forward(&sample, 500, &ctx, &cond, 0.0).unwrap();
        for (a, b) in full
            .down_block_residuals
            .iter()
            .zip(off.down_block_residuals.iter())
        {
            assert_eq!(a.dims(), b.dims());
            let max = b.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
            assert_eq!(max, 0.0);
        }
    }
}
