//! BLIP-2 multimodal subject encoder.
//!
//! A ViT backbone turns the reference image into patch features; a
//! Q-Former then lets a small set of learned query tokens attend to
//! those features while sharing self-attention with the tokenized
//! subject category text. The first `num_query_tokens` output positions,
//! pushed through a residual projection MLP, form the subject embedding
//! injected into the text encoder.

use candle::{IndexOp, Result, Tensor, D};
use candle_nn::{
    conv2d_no_bias, embedding, layer_norm, linear, Conv2d, Conv2dConfig, Embedding, LayerNorm,
    Linear, Module, VarBuilder,
};

use crate::blocks::quick_gelu;
use crate::config::{QFormerConfig, VisionConfig};

/// Patch + class token embedding with learned positions.
#[derive(Debug)]
struct VisionEmbeddings {
    class_embedding: Tensor,
    patch_embedding: Conv2d,
    position_embedding: Tensor,
}

impl VisionEmbeddings {
    fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let class_embedding = vb.get((1, 1, config.hidden_size), "class_embedding")?;
        let conv_cfg = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let patch_embedding = conv2d_no_bias(
            3,
            config.hidden_size,
            config.patch_size,
            conv_cfg,
            vb.pp("patch_embedding"),
        )?;
        let position_embedding =
            vb.get((1, config.seq_len(), config.hidden_size), "position_embedding")?;
        Ok(Self {
            class_embedding,
            patch_embedding,
            position_embedding,
        })
    }

    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let (b, _, _, _) = pixel_values.dims4()?;
        let patches = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let dim = self.class_embedding.dim(2)?;
        let class_token = self.class_embedding.expand((b, 1, dim))?;
        let embeddings = Tensor::cat(&[&class_token, &patches], 1)?;
        let seq = embeddings.dim(1)?;
        embeddings.broadcast_add(&self.position_embedding.narrow(1, 0, seq)?)
    }
}

/// ViT attention with a fused qkv projection. The key projection
/// carries no bias; query and value biases are stored separately.
#[derive(Debug)]
struct VisionAttention {
    qkv: Linear,
    projection: Linear,
    heads: usize,
    scale: f64,
}

impl VisionAttention {
    fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.hidden_size;
        let qkv_weight = vb.get((3 * dim, dim), "qkv.weight")?;
        let q_bias = vb.get(dim, "q_bias")?;
        let v_bias = vb.get(dim, "v_bias")?;
        let k_bias = q_bias.zeros_like()?;
        let qkv_bias = Tensor::cat(&[&q_bias, &k_bias, &v_bias], 0)?;
        let qkv = Linear::new(qkv_weight, Some(qkv_bias));
        let projection = linear(dim, dim, vb.pp("projection"))?;
        let head_dim = dim / config.num_attention_heads;
        Ok(Self {
            qkv,
            projection,
            heads: config.num_attention_heads,
            scale: (head_dim as f64).powf(-0.5),
        })
    }
}

impl Module for VisionAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, seq, dim) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, seq, 3, self.heads, dim / self.heads))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.i(0)?.contiguous()?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;
        let attn = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq, dim))?;
        self.projection.forward(&out)
    }
}

#[derive(Debug)]
struct VisionLayer {
    layer_norm1: LayerNorm,
    self_attn: VisionAttention,
    layer_norm2: LayerNorm,
    fc1: Linear,
    fc2: Linear,
}

impl VisionLayer {
    fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            layer_norm1: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("layer_norm1"))?,
            self_attn: VisionAttention::new(config, vb.pp("self_attn"))?,
            layer_norm2: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("layer_norm2"))?,
            fc1: linear(config.hidden_size, config.intermediate_size, vb.pp("mlp.fc1"))?,
            fc2: linear(config.intermediate_size, config.hidden_size, vb.pp("mlp.fc2"))?,
        })
    }
}

impl Module for VisionLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = (self.self_attn.forward(&self.layer_norm1.forward(xs)?)? + xs)?;
        let h = quick_gelu(&self.fc1.forward(&self.layer_norm2.forward(&xs)?)?)?;
        self.fc2.forward(&h)? + xs
    }
}

/// The ViT backbone producing per-patch features for the Q-Former.
#[derive(Debug)]
struct VisionModel {
    embeddings: VisionEmbeddings,
    pre_layernorm: LayerNorm,
    layers: Vec<VisionLayer>,
    post_layernorm: LayerNorm,
    image_size: usize,
}

impl VisionModel {
    fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = VisionEmbeddings::new(config, vb.pp("embeddings"))?;
        let pre_layernorm =
            layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("pre_layernorm"))?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(VisionLayer::new(config, vb.pp(format!("encoder.layers.{i}")))?);
        }
        let post_layernorm =
            layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("post_layernorm"))?;
        Ok(Self {
            embeddings,
            pre_layernorm,
            layers,
            post_layernorm,
            image_size: config.image_size,
        })
    }
}

impl Module for VisionModel {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let (_, c, h, w) = pixel_values.dims4()?;
        if c != 3 || h != self.image_size || w != self.image_size {
            candle::bail!(
                "vision encoder expects [b, 3, {s}, {s}] input, got [{c}, {h}, {w}]",
                s = self.image_size
            )
        }
        let mut hidden = self.pre_layernorm.forward(&self.embeddings.forward(pixel_values)?)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden)?;
        }
        self.post_layernorm.forward(&hidden)
    }
}

/// Word + position embeddings for the category text, concatenated after
/// the learned query tokens.
#[derive(Debug)]
struct TextEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl TextEmbeddings {
    fn new(config: &QFormerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            word_embeddings: embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("word_embeddings"),
            )?,
            position_embeddings: embedding(
                config.max_position_embeddings,
                config.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor, query_tokens: &Tensor) -> Result<Tensor> {
        let (b, seq) = input_ids.dims2()?;
        let positions = Tensor::arange(0u32, seq as u32, input_ids.device())?.unsqueeze(0)?;
        let text = self
            .word_embeddings
            .forward(input_ids)?
            .broadcast_add(&self.position_embeddings.forward(&positions)?)?;
        let (_, nq, dim) = query_tokens.dims3()?;
        let queries = query_tokens.expand((b, nq, dim))?;
        self.layer_norm.forward(&Tensor::cat(&[&queries, &text], 1)?)
    }
}

/// BERT-style attention with post-norm residual. Keys and values come
/// from `kv` when given (cross-attention to the image features).
#[derive(Debug)]
struct QFormerAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output_dense: Linear,
    output_norm: LayerNorm,
    heads: usize,
    scale: f64,
}

impl QFormerAttention {
    fn new(config: &QFormerConfig, kv_dim: usize, vb: VarBuilder) -> Result<Self> {
        let dim = config.hidden_size;
        Ok(Self {
            query: linear(dim, dim, vb.pp("attention.query"))?,
            key: linear(kv_dim, dim, vb.pp("attention.key"))?,
            value: linear(kv_dim, dim, vb.pp("attention.value"))?,
            output_dense: linear(dim, dim, vb.pp("output.dense"))?,
            output_norm: layer_norm(dim, config.layer_norm_eps, vb.pp("output.LayerNorm"))?,
            heads: config.num_attention_heads,
            scale: ((dim / config.num_attention_heads) as f64).powf(-0.5),
        })
    }

    fn forward(&self, xs: &Tensor, kv: Option<&Tensor>, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, seq, dim) = xs.dims3()?;
        let kv = kv.unwrap_or(xs);
        let split = |t: &Tensor| -> Result<Tensor> {
            let (b, s, _) = t.dims3()?;
            t.reshape((b, s, self.heads, dim / self.heads))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(&self.query.forward(xs)?)?;
        let k = split(&self.key.forward(kv)?)?;
        let v = split(&self.value.forward(kv)?)?;
        let mut attn = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
        if let Some(mask) = mask {
            attn = attn.broadcast_add(mask)?;
        }
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq, dim))?;
        self.output_norm
            .forward(&(self.output_dense.forward(&out)? + xs)?)
    }
}

/// BERT feed-forward with post-norm residual.
#[derive(Debug)]
struct QFormerFeedForward {
    intermediate: Linear,
    output_dense: Linear,
    output_norm: LayerNorm,
}

impl QFormerFeedForward {
    fn new(config: &QFormerConfig, intermediate_name: &str, output_name: &str, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            intermediate: linear(
                config.hidden_size,
                config.intermediate_size,
                vb.pp(format!("{intermediate_name}.dense")),
            )?,
            output_dense: linear(
                config.intermediate_size,
                config.hidden_size,
                vb.pp(format!("{output_name}.dense")),
            )?,
            output_norm: layer_norm(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp(format!("{output_name}.LayerNorm")),
            )?,
        })
    }
}

impl Module for QFormerFeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.intermediate.forward(xs)?.gelu_erf()?;
        self.output_norm.forward(&(self.output_dense.forward(&h)? + xs)?)
    }
}

/// One Q-Former layer. Query tokens and text tokens share
/// self-attention; only the query part cross-attends to the image and
/// the two parts use separate feed-forward weights.
#[derive(Debug)]
struct QFormerLayer {
    attention: QFormerAttention,
    cross_attention: Option<QFormerAttention>,
    query_ff: QFormerFeedForward,
    text_ff: QFormerFeedForward,
}

impl QFormerLayer {
    fn new(config: &QFormerConfig, has_cross_attention: bool, vb: VarBuilder) -> Result<Self> {
        let cross_attention = if has_cross_attention {
            Some(QFormerAttention::new(
                config,
                config.encoder_hidden_size,
                vb.pp("crossattention"),
            )?)
        } else {
            None
        };
        Ok(Self {
            attention: QFormerAttention::new(config, config.hidden_size, vb.pp("attention"))?,
            cross_attention,
            query_ff: QFormerFeedForward::new(config, "intermediate_query", "output_query", vb.clone())?,
            text_ff: QFormerFeedForward::new(config, "intermediate", "output", vb)?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        image_embeds: &Tensor,
        mask: &Tensor,
        query_len: usize,
    ) -> Result<Tensor> {
        let hidden = self.attention.forward(xs, None, Some(mask))?;
        let seq = hidden.dim(1)?;
        let mut query = hidden.narrow(1, 0, query_len)?;
        if let Some(cross) = &self.cross_attention {
            query = cross.forward(&query.contiguous()?, Some(image_embeds), None)?;
        }
        let query = self.query_ff.forward(&query)?;
        if seq == query_len {
            return Ok(query);
        }
        let text = self
            .text_ff
            .forward(&hidden.narrow(1, query_len, seq - query_len)?.contiguous()?)?;
        Tensor::cat(&[&query, &text], 1)
    }
}

/// Residual projection from Q-Former width to the text encoder's
/// context width.
#[derive(Debug)]
struct ProjLayer {
    dense1: Linear,
    dense2: Linear,
    layer_norm: LayerNorm,
}

impl ProjLayer {
    fn new(config: &QFormerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense1: linear(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("dense1"),
            )?,
            dense2: linear(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("dense2"),
            )?,
            layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }
}

impl Module for ProjLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.layer_norm.forward(xs)?;
        self.dense2.forward(&self.dense1.forward(&h)?.gelu_erf()?)? + xs
    }
}

/// The full subject encoder: image plus category text in, one subject
/// embedding of shape [B, num_query_tokens, hidden_size] out.
#[derive(Debug)]
pub struct SubjectEncoder {
    visual_encoder: VisionModel,
    query_tokens: Tensor,
    embeddings: TextEmbeddings,
    layers: Vec<QFormerLayer>,
    proj_layer: ProjLayer,
    num_query_tokens: usize,
    span: tracing::Span,
}

impl SubjectEncoder {
    pub fn new(
        vision_config: &VisionConfig,
        config: &QFormerConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let visual_encoder = VisionModel::new(vision_config, vb.pp("visual_encoder"))?;
        let query_tokens = vb.get(
            (1, config.num_query_tokens, config.hidden_size),
            "query_tokens",
        )?;
        let embeddings = TextEmbeddings::new(config, vb.pp("embeddings"))?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let has_cross = i % config.cross_attention_frequency == 0;
            layers.push(QFormerLayer::new(
                config,
                has_cross,
                vb.pp(format!("encoder.layer.{i}")),
            )?);
        }
        let proj_layer = ProjLayer::new(config, vb.pp("proj_layer"))?;
        Ok(Self {
            visual_encoder,
            query_tokens,
            embeddings,
            layers,
            proj_layer,
            num_query_tokens: config.num_query_tokens,
            span: tracing::span!(tracing::Level::TRACE, "subject-encoder"),
        })
    }

    pub fn num_query_tokens(&self) -> usize {
        self.num_query_tokens
    }

    /// Additive mask over the concatenated query + text sequence. Query
    /// positions always attend; masked text positions get a large
    /// negative bias.
    fn extended_mask(&self, attention_mask: &Tensor) -> Result<Tensor> {
        let (b, seq) = attention_mask.dims2()?;
        let queries = Tensor::ones((b, self.num_query_tokens), attention_mask.dtype(), attention_mask.device())?;
        let full = Tensor::cat(&[&queries, attention_mask], 1)?.to_dtype(candle::DType::F32)?;
        let mask = ((full * -1.0)? + 1.0)?.affine(-1e4, 0.0)?;
        mask.reshape((b, 1, 1, seq + self.num_query_tokens))
    }

    /// Encode one subject.
    ///
    /// `pixel_values` is the CLIP-normalized reference image
    /// [B, 3, 224, 224]; `input_ids` / `attention_mask` are the
    /// tokenized subject category.
    pub fn forward(
        &self,
        pixel_values: &Tensor,
        input_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let image_embeds = self.visual_encoder.forward(pixel_values)?;
        let mask = self.extended_mask(attention_mask)?;
        let mut hidden = self.embeddings.forward(input_ids, &self.query_tokens)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &image_embeds, &mask, self.num_query_tokens)?;
        }
        let query_output = hidden.narrow(1, 0, self.num_query_tokens)?;
        self.proj_layer.forward(&query_output.contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    fn tiny_configs() -> (VisionConfig, QFormerConfig) {
        let vision = VisionConfig {
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            image_size: 28,
            patch_size: 14,
            layer_norm_eps: 1e-5,
        };
        let qformer = QFormerConfig {
            vocab_size: 100,
            hidden_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 32,
            max_position_embeddings: 32,
            encoder_hidden_size: 32,
            cross_attention_frequency: 1,
            num_query_tokens: 8,
            layer_norm_eps: 1e-12,
        };
        (vision, qformer)
    }

    #[test]
    fn test_subject_embedding_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let (vision, qformer) = tiny_configs();
        let encoder = SubjectEncoder::new(&vision, &qformer, vb).unwrap();

        let image = Tensor::zeros((1, 3, 28, 28), DType::F32, &device).unwrap();
        let ids = Tensor::zeros((1, 3), DType::U32, &device).unwrap();
        let mask = Tensor::ones((1, 3), DType::U32, &device).unwrap();
        let out = encoder.forward(&image, &ids, &mask).unwrap();
        // One embedding row per query token, independent of text length.
        assert_eq!(out.dims(), &[1, 8, 16]);
    }

    #[test]
    fn test_wrong_image_size_rejected() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let (vision, qformer) = tiny_configs();
        let encoder = SubjectEncoder::new(&vision, &qformer, vb).unwrap();

        let image = Tensor::zeros((1, 3, 32, 32), DType::F32, &device).unwrap();
        let ids = Tensor::zeros((1, 3), DType::U32, &device).unwrap();
        let mask = Tensor::ones((1, 3), DType::U32, &device).unwrap();
        assert!(encoder.forward(&image, &ids, &mask).is_err());
    }

    #[test]
    fn test_cross_attention_frequency() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let (vision, mut qformer) = tiny_configs();
        qformer.cross_attention_frequency = 2;
        let encoder = SubjectEncoder::new(&vision, &qformer, vb).unwrap();
        let with_cross = encoder
            .layers
            .iter()
            .filter(|l| l.cross_attention.is_some())
            .count();
        // Layers 0 and 2, 4, ... carry cross-attention; of 2 layers only
        // the first does.
        assert_eq!(with_cross, 1);
    }
}
