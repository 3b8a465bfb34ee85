//! CLIP text encoder extended with subject-context injection.
//!
//! The subject embedding produced by the Q-Former is spliced into the
//! token embedding sequence right after the "a <category>" prefix, then
//! the standard causally-masked CLIP transformer runs over the combined
//! sequence. This is the only change relative to the stock text tower;
//! the weights are the Stable Diffusion v1.5 ones.

use candle::{DType, Result, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, Module, VarBuilder};

use crate::blocks::quick_gelu;
use crate::config::ClipTextConfig;

#[derive(Debug)]
struct TextEmbeddings {
    token_embedding: Embedding,
    position_embedding: Embedding,
    max_positions: usize,
}

impl TextEmbeddings {
    fn new(config: &ClipTextConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            token_embedding: embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("token_embedding"),
            )?,
            position_embedding: embedding(
                config.max_position_embeddings,
                config.hidden_size,
                vb.pp("position_embedding"),
            )?,
            max_positions: config.max_position_embeddings,
        })
    }

    /// Embed the tokens, splicing `ctx_embeddings` in at
    /// `ctx_begin_pos` when present.
    fn forward(
        &self,
        input_ids: &Tensor,
        ctx_embeddings: Option<&Tensor>,
        ctx_begin_pos: usize,
    ) -> Result<Tensor> {
        let (_, seq) = input_ids.dims2()?;
        let tokens = self.token_embedding.forward(input_ids)?;
        let embeds = match ctx_embeddings {
            Some(ctx) => {
                if ctx_begin_pos > seq {
                    candle::bail!(
                        "context injection position {ctx_begin_pos} is past the {seq} prompt tokens"
                    )
                }
                let prefix = tokens.narrow(1, 0, ctx_begin_pos)?;
                let suffix = tokens.narrow(1, ctx_begin_pos, seq - ctx_begin_pos)?;
                Tensor::cat(&[&prefix, ctx, &suffix], 1)?
            }
            None => tokens,
        };
        let full_seq = embeds.dim(1)?;
        if full_seq > self.max_positions {
            candle::bail!(
                "prompt plus subject context is {full_seq} positions, the encoder supports {}",
                self.max_positions
            )
        }
        let positions = Tensor::arange(0u32, full_seq as u32, input_ids.device())?.unsqueeze(0)?;
        embeds.broadcast_add(&self.position_embedding.forward(&positions)?)
    }
}

#[derive(Debug)]
struct TextAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    heads: usize,
    scale: f64,
}

impl TextAttention {
    fn new(config: &ClipTextConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.hidden_size;
        Ok(Self {
            q_proj: linear(dim, dim, vb.pp("q_proj"))?,
            k_proj: linear(dim, dim, vb.pp("k_proj"))?,
            v_proj: linear(dim, dim, vb.pp("v_proj"))?,
            out_proj: linear(dim, dim, vb.pp("out_proj"))?,
            heads: config.num_attention_heads,
            scale: ((dim / config.num_attention_heads) as f64).powf(-0.5),
        })
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Result<Tensor> {
        let (b, seq, dim) = xs.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            t.reshape((b, seq, self.heads, dim / self.heads))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(self.q_proj.forward(xs)?)?;
        let k = split(self.k_proj.forward(xs)?)?;
        let v = split(self.v_proj.forward(xs)?)?;
        let attn = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn.broadcast_add(causal_mask)?)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq, dim))?;
        self.out_proj.forward(&out)
    }
}

#[derive(Debug)]
struct EncoderLayer {
    layer_norm1: LayerNorm,
    self_attn: TextAttention,
    layer_norm2: LayerNorm,
    fc1: Linear,
    fc2: Linear,
}

impl EncoderLayer {
    fn new(config: &ClipTextConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            layer_norm1: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("layer_norm1"))?,
            self_attn: TextAttention::new(config, vb.pp("self_attn"))?,
            layer_norm2: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("layer_norm2"))?,
            fc1: linear(config.hidden_size, config.intermediate_size, vb.pp("mlp.fc1"))?,
            fc2: linear(config.intermediate_size, config.hidden_size, vb.pp("mlp.fc2"))?,
        })
    }

    fn forward(&self, xs: &Tensor, causal_mask: &Tensor) -> Result<Tensor> {
        let xs = (self
            .self_attn
            .forward(&self.layer_norm1.forward(xs)?, causal_mask)?
            + xs)?;
        let h = quick_gelu(&self.fc1.forward(&self.layer_norm2.forward(&xs)?)?)?;
        self.fc2.forward(&h)? + xs
    }
}

/// Text encoder producing the conditioning sequence for the UNet.
#[derive(Debug)]
pub struct ContextClipTextModel {
    embeddings: TextEmbeddings,
    layers: Vec<EncoderLayer>,
    final_layer_norm: LayerNorm,
    span: tracing::Span,
}

impl ContextClipTextModel {
    pub fn new(config: &ClipTextConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("text_model");
        let embeddings = TextEmbeddings::new(config, vb.pp("embeddings"))?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(EncoderLayer::new(config, vb.pp(format!("encoder.layers.{i}")))?);
        }
        let final_layer_norm = layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("final_layer_norm"),
        )?;
        Ok(Self {
            embeddings,
            layers,
            final_layer_norm,
            span: tracing::span!(tracing::Level::TRACE, "ctx-clip"),
        })
    }

    /// Longest supported sequence, prompt tokens plus injected context.
    pub fn max_positions(&self) -> usize {
        self.embeddings.max_positions
    }

    fn causal_mask(seq: usize, device: &candle::Device) -> Result<Tensor> {
        let mut data = vec![0f32; seq * seq];
        for i in 0..seq {
            for j in i + 1..seq {
                data[i * seq + j] = f32::MIN;
            }
        }
        Tensor::from_vec(data, (1, 1, seq, seq), device)
    }

    /// Encode a tokenized prompt; `ctx_embeddings` is the subject
    /// embedding spliced in at `ctx_begin_pos`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        ctx_embeddings: Option<&Tensor>,
        ctx_begin_pos: usize,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut hidden = self
            .embeddings
            .forward(input_ids, ctx_embeddings, ctx_begin_pos)?;
        let seq = hidden.dim(1)?;
        let mask = Self::causal_mask(seq, input_ids.device())?.to_dtype(hidden.dtype())?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &mask)?;
        }
        self.final_layer_norm.forward(&hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{Device, IndexOp};
    use candle_nn::VarBuilder;

    fn tiny_config() -> ClipTextConfig {
        ClipTextConfig {
            vocab_size: 100,
            hidden_size: 16,
            intermediate_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            max_position_embeddings: 24,
            layer_norm_eps: 1e-5,
        }
    }

    #[test]
    fn test_context_extends_sequence() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = ContextClipTextModel::new(&tiny_config(), vb).unwrap();
        let ids = Tensor::zeros((1, 8), DType::U32, &device).unwrap();

        let plain = model.forward(&ids, None, 0).unwrap();
        assert_eq!(plain.dims(), &[1, 8, 16]);

        let ctx = Tensor::zeros((1, 4, 16), DType::F32, &device).unwrap();
        let with_ctx = model.forward(&ids, Some(&ctx), 2).unwrap();
        assert_eq!(with_ctx.dims(), &[1, 12, 16]);
    }

    #[test]
    fn test_overlong_sequence_rejected() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = ContextClipTextModel::new(&tiny_config(), vb).unwrap();
        let ids = Tensor::zeros((1, 22), DType::U32, &device).unwrap();
        let ctx = Tensor::zeros((1, 4, 16), DType::F32, &device).unwrap();
        assert!(model.forward(&ids, Some(&ctx), 2).is_err());
    }

    #[test]
    fn test_causal_mask_is_lower_triangular() {
        let device = Device::Cpu;
        let mask = ContextClipTextModel::causal_mask(4, &device).unwrap();
        let row = mask.i((0, 0, 1)).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(row[0], 0.0);
        assert_eq!(row[1], 0.0);
        assert!(row[2] < -1e30);
        assert!(row[3] < -1e30);
    }
}
