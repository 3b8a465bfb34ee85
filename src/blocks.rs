//! Building blocks shared by the UNet, the ControlNet and (partly) the
//! autoencoder: residual blocks, spatial transformers, resampling layers
//! and the sinusoidal time embedding.

use candle::{Result, Tensor, D};
use candle_nn::{
    conv2d, group_norm, layer_norm, linear, linear_no_bias, Conv2d, Conv2dConfig, GroupNorm,
    LayerNorm, Linear, Module, VarBuilder,
};

/// The x * sigmoid(1.702 x) GELU approximation used by the CLIP family.
pub(crate) fn quick_gelu(xs: &Tensor) -> Result<Tensor> {
    xs * candle_nn::ops::sigmoid(&(xs * 1.702)?)?
}

/// Sinusoidal embedding of diffusion timesteps, cosine half first.
///
/// `timesteps` is a f32 vector of shape [B]; the result is [B, dim].
pub fn timestep_embedding(timesteps: &Tensor, dim: usize) -> Result<Tensor> {
    let half = dim / 2;
    let exponents: Vec<f32> = (0..half)
        .map(|i| (-(10000f32.ln()) * i as f32 / half as f32).exp())
        .collect();
    let freqs = Tensor::from_vec(exponents, (1, half), timesteps.device())?;
    let args = timesteps.unsqueeze(1)?.broadcast_mul(&freqs)?;
    Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)
}

/// Two-layer MLP lifting the sinusoidal embedding to the width consumed
/// by the residual blocks.
#[derive(Debug)]
pub struct TimestepEmbedding {
    linear_1: Linear,
    linear_2: Linear,
}

impl TimestepEmbedding {
    pub fn new(in_dim: usize, time_embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        let linear_1 = linear(in_dim, time_embed_dim, vb.pp("linear_1"))?;
        let linear_2 = linear(time_embed_dim, time_embed_dim, vb.pp("linear_2"))?;
        Ok(Self { linear_1, linear_2 })
    }
}

impl Module for TimestepEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.linear_2.forward(&self.linear_1.forward(xs)?.silu()?)
    }
}

/// GroupNorm/SiLU/conv residual block with an additive time conditioning
/// term between the two convolutions.
#[derive(Debug)]
pub struct ResnetBlock2D {
    norm1: GroupNorm,
    conv1: Conv2d,
    time_emb_proj: Option<Linear>,
    norm2: GroupNorm,
    conv2: Conv2d,
    conv_shortcut: Option<Conv2d>,
}

impl ResnetBlock2D {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        temb_channels: Option<usize>,
        groups: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let norm1 = group_norm(groups, in_channels, eps, vb.pp("norm1"))?;
        let conv1 = conv2d(in_channels, out_channels, 3, conv_cfg, vb.pp("conv1"))?;
        let time_emb_proj = match temb_channels {
            Some(temb) => Some(linear(temb, out_channels, vb.pp("time_emb_proj"))?),
            None => None,
        };
        let norm2 = group_norm(groups, out_channels, eps, vb.pp("norm2"))?;
        let conv2 = conv2d(out_channels, out_channels, 3, conv_cfg, vb.pp("conv2"))?;
        let conv_shortcut = if in_channels != out_channels {
            Some(conv2d(
                in_channels,
                out_channels,
                1,
                Default::default(),
                vb.pp("conv_shortcut"),
            )?)
        } else {
            None
        };
        Ok(Self {
            norm1,
            conv1,
            time_emb_proj,
            norm2,
            conv2,
            conv_shortcut,
        })
    }

    pub fn forward(&self, xs: &Tensor, temb: Option<&Tensor>) -> Result<Tensor> {
        let mut h = self.conv1.forward(&self.norm1.forward(xs)?.silu()?)?;
        if let (Some(proj), Some(temb)) = (&self.time_emb_proj, temb) {
            let temb = proj.forward(&temb.silu()?)?;
            h = h.broadcast_add(&temb.unsqueeze(D::Minus1)?.unsqueeze(D::Minus1)?)?;
        }
        let h = self.conv2.forward(&self.norm2.forward(&h)?.silu()?)?;
        let shortcut = match &self.conv_shortcut {
            Some(conv) => conv.forward(xs)?,
            None => xs.clone(),
        };
        shortcut + h
    }
}

/// Multi-head attention over token sequences. Self-attention when no
/// context is given, cross-attention to the text conditioning otherwise.
#[derive(Debug)]
pub struct CrossAttention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    heads: usize,
    scale: f64,
}

impl CrossAttention {
    pub fn new(
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let kv_dim = context_dim.unwrap_or(query_dim);
        let to_q = linear_no_bias(query_dim, query_dim, vb.pp("to_q"))?;
        let to_k = linear_no_bias(kv_dim, query_dim, vb.pp("to_k"))?;
        let to_v = linear_no_bias(kv_dim, query_dim, vb.pp("to_v"))?;
        let to_out = linear(query_dim, query_dim, vb.pp("to_out.0"))?;
        let head_dim = query_dim / heads;
        Ok(Self {
            to_q,
            to_k,
            to_v,
            to_out,
            heads,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, seq, dim) = xs.dims3()?;
        xs.reshape((b, seq, self.heads, dim / self.heads))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(&self, xs: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let (b, seq, dim) = xs.dims3()?;
        let context = context.unwrap_or(xs);
        let q = self.split_heads(&self.to_q.forward(xs)?)?;
        let k = self.split_heads(&self.to_k.forward(context)?)?;
        let v = self.split_heads(&self.to_v.forward(context)?)?;

        let attn = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq, dim))?;
        self.to_out.forward(&out)
    }
}

/// GEGLU feed-forward: project to twice the hidden width, gate one half
/// with GELU of the other.
#[derive(Debug)]
struct FeedForward {
    proj_in: Linear,
    proj_out: Linear,
}

impl FeedForward {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let inner = dim * 4;
        let proj_in = linear(dim, inner * 2, vb.pp("net.0.proj"))?;
        let proj_out = linear(inner, dim, vb.pp("net.2"))?;
        Ok(Self { proj_in, proj_out })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let chunks = self.proj_in.forward(xs)?.chunk(2, D::Minus1)?;
        self.proj_out
            .forward(&(&chunks[0] * chunks[1].gelu_erf()?)?)
    }
}

/// Pre-norm transformer block: self-attention, cross-attention to the
/// text conditioning, GEGLU feed-forward.
#[derive(Debug)]
pub struct BasicTransformerBlock {
    norm1: LayerNorm,
    attn1: CrossAttention,
    norm2: LayerNorm,
    attn2: CrossAttention,
    norm3: LayerNorm,
    ff: FeedForward,
}

impl BasicTransformerBlock {
    pub fn new(dim: usize, context_dim: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: layer_norm(dim, 1e-5, vb.pp("norm1"))?,
            attn1: CrossAttention::new(dim, None, heads, vb.pp("attn1"))?,
            norm2: layer_norm(dim, 1e-5, vb.pp("norm2"))?,
            attn2: CrossAttention::new(dim, Some(context_dim), heads, vb.pp("attn2"))?,
            norm3: layer_norm(dim, 1e-5, vb.pp("norm3"))?,
            ff: FeedForward::new(dim, vb.pp("ff"))?,
        })
    }

    pub fn forward(&self, xs: &Tensor, context: &Tensor) -> Result<Tensor> {
        let xs = (self.attn1.forward(&self.norm1.forward(xs)?, None)? + xs)?;
        let xs = (self.attn2.forward(&self.norm2.forward(&xs)?, Some(context))? + xs)?;
        self.ff.forward(&self.norm3.forward(&xs)?)? + xs
    }
}

/// Spatial transformer: flatten the feature map to tokens, run
/// transformer blocks against the text conditioning, fold back and add
/// the residual.
#[derive(Debug)]
pub struct SpatialTransformer {
    norm: GroupNorm,
    proj_in: Conv2d,
    blocks: Vec<BasicTransformerBlock>,
    proj_out: Conv2d,
}

impl SpatialTransformer {
    pub fn new(
        channels: usize,
        context_dim: usize,
        heads: usize,
        groups: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm = group_norm(groups, channels, 1e-6, vb.pp("norm"))?;
        let proj_in = conv2d(channels, channels, 1, Default::default(), vb.pp("proj_in"))?;
        // Depth one everywhere in the SD v1.x family.
        let blocks = vec![BasicTransformerBlock::new(
            channels,
            context_dim,
            heads,
            vb.pp("transformer_blocks.0"),
        )?];
        let proj_out = conv2d(channels, channels, 1, Default::default(), vb.pp("proj_out"))?;
        Ok(Self {
            norm,
            proj_in,
            blocks,
            proj_out,
        })
    }

    pub fn forward(&self, xs: &Tensor, context: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = xs.dims4()?;
        let residual = xs;
        let mut hidden = self
            .proj_in
            .forward(&self.norm.forward(xs)?)?
            .reshape((b, c, h * w))?
            .transpose(1, 2)?
            .contiguous()?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, context)?;
        }
        let hidden = hidden
            .transpose(1, 2)?
            .reshape((b, c, h, w))?
            .contiguous()?;
        self.proj_out.forward(&hidden)? + residual
    }
}

/// Strided 3x3 convolution halving the spatial resolution.
#[derive(Debug)]
pub struct Downsample2D {
    conv: Conv2d,
}

impl Downsample2D {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d(channels, channels, 3, cfg, vb.pp("conv"))?,
        })
    }
}

impl Module for Downsample2D {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)
    }
}

/// Nearest-neighbor upsampling followed by a 3x3 convolution.
#[derive(Debug)]
pub struct Upsample2D {
    conv: Conv2d,
}

impl Upsample2D {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d(channels, channels, 3, cfg, vb.pp("conv"))?,
        })
    }
}

impl Module for Upsample2D {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        self.conv.forward(&xs.upsample_nearest2d(h * 2, w * 2)?)
    }
}

/// Zero-initialized 1x1 convolution. Outputs nothing at initialization
/// so a freshly attached ControlNet leaves the base model untouched.
#[derive(Debug)]
pub struct ZeroConv2d {
    conv: Conv2d,
}

impl ZeroConv2d {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: conv2d(in_channels, out_channels, 1, Default::default(), vb)?,
        })
    }
}

impl Module for ZeroConv2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device, IndexOp};

    #[test]
    fn test_timestep_embedding_shape() {
        let device = Device::Cpu;
        let t = Tensor::new(&[0f32, 500., 999.], &device).unwrap();
        let emb = timestep_embedding(&t, 320).unwrap();
        assert_eq!(emb.dims(), &[3, 320]);
        // At t = 0 every cosine is 1 and every sine is 0.
        let row = emb.i(0).unwrap().to_vec1::<f32>().unwrap();
        assert!(row[..160].iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(row[160..].iter().all(|&v| v.abs() < 1e-6));
    }

    #[test]
    fn test_resnet_block_shapes() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let block = ResnetBlock2D::new(64, 128, Some(256), 32, 1e-5, vb).unwrap();
        let xs = Tensor::zeros((1, 64, 8, 8), DType::F32, &device).unwrap();
        let temb = Tensor::zeros((1, 256), DType::F32, &device).unwrap();
        let out = block.forward(&xs, Some(&temb)).unwrap();
        assert_eq!(out.dims(), &[1, 128, 8, 8]);
    }

    #[test]
    fn test_cross_attention_shapes() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let attn = CrossAttention::new(64, Some(96), 4, vb).unwrap();
        let xs = Tensor::zeros((2, 16, 64), DType::F32, &device).unwrap();
        let ctx = Tensor::zeros((2, 7, 96), DType::F32, &device).unwrap();
        let out = attn.forward(&xs, Some(&ctx)).unwrap();
        assert_eq!(out.dims(), &[2, 16, 64]);
    }

    #[test]
    fn test_spatial_transformer_shapes() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let st = SpatialTransformer::new(64, 96, 4, 32, vb).unwrap();
        let xs = Tensor::zeros((1, 64, 8, 8), DType::F32, &device).unwrap();
        let ctx = Tensor::zeros((1, 7, 96), DType::F32, &device).unwrap();
        let out = st.forward(&xs, &ctx).unwrap();
        assert_eq!(out.dims(), &[1, 64, 8, 8]);
    }

    #[test]
    fn test_resampling_shapes() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let down = Downsample2D::new(32, vb.pp("down")).unwrap();
        let up = Upsample2D::new(32, vb.pp("up")).unwrap();
        let xs = Tensor::zeros((1, 32, 16, 16), DType::F32, &device).unwrap();
        assert_eq!(down.forward(&xs).unwrap().dims(), &[1, 32, 8, 8]);
        assert_eq!(up.forward(&xs).unwrap().dims(), &[1, 32, 32, 32]);
    }
}
