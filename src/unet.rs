//! Denoising UNet with cross-attention text conditioning, matching the
//! Stable Diffusion v1.x layout so released checkpoints load directly.
//!
//! The forward pass optionally accepts per-skip residuals produced by a
//! ControlNet; they are added to the stored skip activations before the
//! up path consumes them.

use candle::{Result, Tensor};
use candle_nn::{conv2d, group_norm, Conv2d, Conv2dConfig, GroupNorm, Module, VarBuilder};

use crate::blocks::{
    timestep_embedding, Downsample2D, ResnetBlock2D, SpatialTransformer, TimestepEmbedding,
    Upsample2D,
};
use crate::config::UnetConfig;

/// One resolution level of the encoder path.
#[derive(Debug)]
pub struct DownBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<SpatialTransformer>,
    downsampler: Option<Downsample2D>,
}

impl DownBlock {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        in_channels: usize,
        out_channels: usize,
        temb_channels: usize,
        num_layers: usize,
        has_attention: bool,
        add_downsample: bool,
        cfg: &UnetConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut resnets = Vec::with_capacity(num_layers);
        let mut attentions = Vec::new();
        for i in 0..num_layers {
            let res_in = if i == 0 { in_channels } else { out_channels };
            resnets.push(ResnetBlock2D::new(
                res_in,
                out_channels,
                Some(temb_channels),
                cfg.norm_num_groups,
                1e-5,
                vb.pp(format!("resnets.{i}")),
            )?);
            if has_attention {
                attentions.push(SpatialTransformer::new(
                    out_channels,
                    cfg.cross_attention_dim,
                    cfg.num_attention_heads,
                    cfg.norm_num_groups,
                    vb.pp(format!("attentions.{i}")),
                )?);
            }
        }
        let downsampler = if add_downsample {
            Some(Downsample2D::new(out_channels, vb.pp("downsamplers.0"))?)
        } else {
            None
        };
        Ok(Self {
            resnets,
            attentions,
            downsampler,
        })
    }

    /// Returns the transformed activations plus one skip tensor per
    /// resnet (and one more after downsampling).
    pub(crate) fn forward(
        &self,
        xs: &Tensor,
        temb: &Tensor,
        context: &Tensor,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let mut hidden = xs.clone();
        let mut skips = Vec::with_capacity(self.resnets.len() + 1);
        for (i, resnet) in self.resnets.iter().enumerate() {
            hidden = resnet.forward(&hidden, Some(temb))?;
            if let Some(attn) = self.attentions.get(i) {
                hidden = attn.forward(&hidden, context)?;
            }
            skips.push(hidden.clone());
        }
        if let Some(down) = &self.downsampler {
            hidden = down.forward(&hidden)?;
            skips.push(hidden.clone());
        }
        Ok((hidden, skips))
    }
}

/// Bottleneck: resnet, spatial transformer, resnet.
#[derive(Debug)]
pub struct MidBlock {
    resnet1: ResnetBlock2D,
    attention: SpatialTransformer,
    resnet2: ResnetBlock2D,
}

impl MidBlock {
    pub(crate) fn new(channels: usize, temb_channels: usize, cfg: &UnetConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            resnet1: ResnetBlock2D::new(
                channels,
                channels,
                Some(temb_channels),
                cfg.norm_num_groups,
                1e-5,
                vb.pp("resnets.0"),
            )?,
            attention: SpatialTransformer::new(
                channels,
                cfg.cross_attention_dim,
                cfg.num_attention_heads,
                cfg.norm_num_groups,
                vb.pp("attentions.0"),
            )?,
            resnet2: ResnetBlock2D::new(
                channels,
                channels,
                Some(temb_channels),
                cfg.norm_num_groups,
                1e-5,
                vb.pp("resnets.1"),
            )?,
        })
    }

    pub(crate) fn forward(&self, xs: &Tensor, temb: &Tensor, context: &Tensor) -> Result<Tensor> {
        let h = self.resnet1.forward(xs, Some(temb))?;
        let h = self.attention.forward(&h, context)?;
        self.resnet2.forward(&h, Some(temb))
    }
}

/// One resolution level of the decoder path. Each resnet concatenates a
/// stored skip tensor onto its input.
#[derive(Debug)]
struct UpBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<SpatialTransformer>,
    upsampler: Option<Upsample2D>,
}

impl UpBlock {
    #[allow(clippy::too_many_arguments)]
    fn new(
        skip_channels: usize,
        prev_output_channels: usize,
        out_channels: usize,
        temb_channels: usize,
        num_layers: usize,
        has_attention: bool,
        add_upsample: bool,
        cfg: &UnetConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut resnets = Vec::with_capacity(num_layers);
        let mut attentions = Vec::new();
        for i in 0..num_layers {
            // The last resnet of the level consumes the skip produced at
            // the previous (wider) resolution.
            let res_skip = if i == num_layers - 1 {
                skip_channels
            } else {
                out_channels
            };
            let res_in = if i == 0 {
                prev_output_channels
            } else {
                out_channels
            };
            resnets.push(ResnetBlock2D::new(
                res_in + res_skip,
                out_channels,
                Some(temb_channels),
                cfg.norm_num_groups,
                1e-5,
                vb.pp(format!("resnets.{i}")),
            )?);
            if has_attention {
                attentions.push(SpatialTransformer::new(
                    out_channels,
                    cfg.cross_attention_dim,
                    cfg.num_attention_heads,
                    cfg.norm_num_groups,
                    vb.pp(format!("attentions.{i}")),
                )?);
            }
        }
        let upsampler = if add_upsample {
            Some(Upsample2D::new(out_channels, vb.pp("upsamplers.0"))?)
        } else {
            None
        };
        Ok(Self {
            resnets,
            attentions,
            upsampler,
        })
    }

    /// Consumes `skips` from the back, one per resnet.
    fn forward(
        &self,
        xs: &Tensor,
        skips: &mut Vec<Tensor>,
        temb: &Tensor,
        context: &Tensor,
    ) -> Result<Tensor> {
        let mut hidden = xs.clone();
        for (i, resnet) in self.resnets.iter().enumerate() {
            let skip = skips
                .pop()
                .ok_or_else(|| candle::Error::Msg("missing skip activation".to_string()))?;
            hidden = Tensor::cat(&[&hidden, &skip], 1)?;
            hidden = resnet.forward(&hidden, Some(temb))?;
            if let Some(attn) = self.attentions.get(i) {
                hidden = attn.forward(&hidden, context)?;
            }
        }
        match &self.upsampler {
            Some(up) => up.forward(&hidden),
            None => Ok(hidden),
        }
    }
}

/// UNet predicting the noise residual of a latent given a timestep and
/// the text conditioning.
#[derive(Debug)]
pub struct UNet2DConditionModel {
    conv_in: Conv2d,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: MidBlock,
    up_blocks: Vec<UpBlock>,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
    config: UnetConfig,
    span: tracing::Span,
}

impl UNet2DConditionModel {
    pub fn new(config: &UnetConfig, vb: VarBuilder) -> Result<Self> {
        let n_levels = config.block_out_channels.len();
        let b0 = config.block_out_channels[0];
        let temb_dim = config.time_embed_dim();
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let conv_in = conv2d(config.in_channels, b0, 3, conv_cfg, vb.pp("conv_in"))?;
        let time_embedding = TimestepEmbedding::new(b0, temb_dim, vb.pp("time_embedding"))?;

        let mut down_blocks = Vec::with_capacity(n_levels);
        for i in 0..n_levels {
            let in_ch = if i == 0 {
                b0
            } else {
                config.block_out_channels[i - 1]
            };
            down_blocks.push(DownBlock::new(
                in_ch,
                config.block_out_channels[i],
                temb_dim,
                config.layers_per_block,
                config.down_block_attention[i],
                i != n_levels - 1,
                config,
                vb.pp(format!("down_blocks.{i}")),
            )?);
        }

        let mid_block = MidBlock::new(
            config.block_out_channels[n_levels - 1],
            temb_dim,
            config,
            vb.pp("mid_block"),
        )?;

        let reversed: Vec<usize> = config.block_out_channels.iter().rev().copied().collect();
        let reversed_attn: Vec<bool> = config.down_block_attention.iter().rev().copied().collect();
        let mut up_blocks = Vec::with_capacity(n_levels);
        let mut prev_out = reversed[0];
        for i in 0..n_levels {
            let out_ch = reversed[i];
            let skip_ch = reversed[usize::min(i + 1, n_levels - 1)];
            up_blocks.push(UpBlock::new(
                skip_ch,
                prev_out,
                out_ch,
                temb_dim,
                config.layers_per_block + 1,
                reversed_attn[i],
                i != n_levels - 1,
                config,
                vb.pp(format!("up_blocks.{i}")),
            )?);
            prev_out = out_ch;
        }

        let conv_norm_out = group_norm(config.norm_num_groups, b0, 1e-5, vb.pp("conv_norm_out"))?;
        let conv_out = conv2d(b0, config.out_channels, 3, conv_cfg, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            config: config.clone(),
            span: tracing::span!(tracing::Level::TRACE, "unet2d"),
        })
    }

    /// Number of skip activations produced by the down path, which is
    /// also the number of residuals a ControlNet must supply.
    pub fn num_skip_connections(&self) -> usize {
        1 + self
            .down_blocks
            .iter()
            .map(|b| b.resnets.len() + usize::from(b.downsampler.is_some()))
            .sum::<usize>()
    }

    /// Embed a scalar diffusion timestep for a batch of size `batch`.
    fn embed_timestep(&self, timestep: usize, batch: usize, sample: &Tensor) -> Result<Tensor> {
        let t = Tensor::full(timestep as f32, batch, sample.device())?;
        let emb = timestep_embedding(&t, self.config.block_out_channels[0])?;
        self.time_embedding.forward(&emb.to_dtype(sample.dtype())?)
    }

    /// Predict the noise residual.
    ///
    /// `down_residuals` / `mid_residual` are the ControlNet outputs; pass
    /// `None` for the plain model.
    pub fn forward(
        &self,
        sample: &Tensor,
        timestep: usize,
        encoder_hidden_states: &Tensor,
        down_residuals: Option<&[Tensor]>,
        mid_residual: Option<&Tensor>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (batch, _, _, _) = sample.dims4()?;
        let temb = self.embed_timestep(timestep, batch, sample)?;

        let mut hidden = self.conv_in.forward(sample)?;
        let mut skips: Vec<Tensor> = vec![hidden.clone()];
        for block in &self.down_blocks {
            let (h, s) = block.forward(&hidden, &temb, encoder_hidden_states)?;
            hidden = h;
            skips.extend(s);
        }

        if let Some(extra) = down_residuals {
            if extra.len() != skips.len() {
                candle::bail!(
                    "expected {} control residuals, got {}",
                    skips.len(),
                    extra.len()
                )
            }
            for (skip, res) in skips.iter_mut().zip(extra.iter()) {
                *skip = (&*skip + res)?;
            }
        }

        hidden = self.mid_block.forward(&hidden, &temb, encoder_hidden_states)?;
        if let Some(res) = mid_residual {
            hidden = (hidden + res)?;
        }

        for block in &self.up_blocks {
            hidden = block.forward(&hidden, &mut skips, &temb, encoder_hidden_states)?;
        }

        self.conv_out
            .forward(&self.conv_norm_out.forward(&hidden)?.silu()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    fn tiny_config() -> UnetConfig {
        UnetConfig {
            in_channels: 4,
            out_channels: 4,
            block_out_channels: vec![32, 64],
            layers_per_block: 1,
            cross_attention_dim: 32,
            num_attention_heads: 4,
            norm_num_groups: 8,
            down_block_attention: vec![true, false],
        }
    }

    #[test]
    fn test_forward_preserves_latent_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let unet = UNet2DConditionModel::new(&tiny_config(), vb).unwrap();
        let sample = Tensor::zeros((1, 4, 16, 16), DType::F32, &device).unwrap();
        let ctx = Tensor::zeros((1, 7, 32), DType::F32, &device).unwrap();
        let out = unet.forward(&sample, 500, &ctx, None, None).unwrap();
        assert_eq!(out.dims(), sample.dims());
    }

    #[test]
    fn test_skip_connection_count() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let unet = UNet2DConditionModel::new(&tiny_config(), vb).unwrap();
        // conv_in + (1 resnet + downsample) + (1 resnet, final level).
        assert_eq!(unet.num_skip_connections(), 4);
    }

    #[test]
    fn test_mismatched_residual_count_rejected() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let unet = UNet2DConditionModel::new(&tiny_config(), vb).unwrap();
        let sample = Tensor::zeros((1, 4, 16, 16), DType::F32, &device).unwrap();
        let ctx = Tensor::zeros((1, 7, 32), DType::F32, &device).unwrap();
        let bogus = vec![sample.clone()];
        assert!(unet.forward(&sample, 500, &ctx, Some(&bogus), None).is_err());
    }
}
