//! Synthetic decoder-only language model graph.
//!
//! Builds a small, deterministic transformer decoder in the graph IR with the
//! conventional stateful-LLM interface:
//!
//! - inputs: `input_ids`, `attention_mask`, `position_ids` (all `[batch, seq]` i64)
//!   and `past_key_values.{i}.key` / `past_key_values.{i}.value`
//!   (`[batch, heads, past_len, head_dim]` f32)
//! - outputs: `logits` (`[batch, seq, vocab]`) and `present.{i}.key` /
//!   `present.{i}.value` (past concatenated with the new entries)
//!
//! Attention is expressed as a fused [`Op::ScaledDotProductAttention`] with an
//! explicit boolean keep-mask combining padding and a causal window aligned to the
//! end of the key sequence, so the same graph serves full prompts and single-token
//! steps. Weights come from a seeded [`XorShiftRng`].

use tracing::debug;

use crate::config::derive::GROUP_SIZE_RT_INFO;
use crate::engine::sampler::XorShiftRng;
use crate::error::InferenceError;
use crate::graph::{ComputeGraph, Dim, NodeId, Op, PartialShape};
use crate::tensor::{ElementType, Tensor};

/// Raw zero point of the compressed head; only its low nibble is meaningful.
pub const HEAD_ZERO_POINT: u8 = 0xF8;

/// Shape and initialisation parameters of the synthetic decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    pub hidden: usize,
    pub heads: usize,
    pub head_dim: usize,
    pub layers: usize,
    /// Rows of the learned position table; must cover the KV cache capacity.
    pub max_positions: usize,
    pub seed: u64,
    /// Store the LM head as u4 weights with a scalar zero point.
    pub u4_head: bool,
    /// Weight-compression group size recorded in the graph metadata.
    pub group_size: Option<i64>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32,
            hidden: 16,
            heads: 2,
            head_dim: 8,
            layers: 1,
            max_positions: 2048,
            seed: 42,
            u4_head: false,
            group_size: None,
        }
    }
}

struct Builder<'a> {
    graph: ComputeGraph,
    rng: XorShiftRng,
    cfg: &'a DecoderConfig,
}

impl Builder<'_> {
    fn weight(&mut self, name: &str, shape: &[usize], scale: f32) -> NodeId {
        let n: usize = shape.iter().product();
        let data = (0..n)
            .map(|_| (self.rng.next_f32() - 0.5) * 2.0 * scale)
            .collect();
        self.graph.add_constant(name, Tensor::new(shape.to_vec(), data))
    }

    /// `[B, L, H*E]` projection split into heads: `[B, H, L, E]`.
    fn heads_of(&mut self, prefix: &str, x: NodeId) -> Result<NodeId, InferenceError> {
        let (hidden, heads, head_dim) = (self.cfg.hidden, self.cfg.heads, self.cfg.head_dim);
        let scale = 1.0 / (hidden as f32).sqrt();
        let w = self.weight(&format!("{prefix}.weight"), &[hidden, heads * head_dim], scale);
        let proj = self.graph.add_op(
            &format!("{prefix}/matmul"),
            Op::MatMul {
                transpose_a: false,
                transpose_b: false,
            },
            &[x, w],
        )?;
        let split = self.graph.add_op(
            &format!("{prefix}/reshape"),
            Op::Reshape {
                pattern: vec![0, 0, heads as i64, head_dim as i64],
            },
            &[proj],
        )?;
        self.graph.add_op(
            &format!("{prefix}/transpose"),
            Op::Transpose {
                order: vec![0, 2, 1, 3],
            },
            &[split],
        )
    }

    /// Keep-mask `[B, 1, L, T]`: key `j` is visible to query `i` when the mask
    /// allows it and `j <= i + (T - L)`.
    fn attention_mask(
        &mut self,
        input_ids: NodeId,
        attention_mask: NodeId,
    ) -> Result<NodeId, InferenceError> {
        let g = &mut self.graph;
        let zero = g.add_constant("mask/zero", Tensor::scalar_i64(0));
        let len_q = g.add_op("mask/len_q", Op::DimOf { axis: 1 }, &[input_ids])?;
        let len_kv = g.add_op("mask/len_kv", Op::DimOf { axis: 1 }, &[attention_mask])?;
        let rows = g.add_op("mask/rows", Op::Range, &[zero, len_q])?;
        let offset = g.add_op("mask/offset", Op::Subtract, &[len_kv, len_q])?;
        let shifted = g.add_op("mask/shifted_rows", Op::Add, &[rows, offset])?;
        let rows_col = g.add_op("mask/rows_col", Op::Unsqueeze { axis: 1 }, &[shifted])?;
        let cols = g.add_op("mask/cols", Op::Range, &[zero, len_kv])?;
        let causal = g.add_op("mask/causal", Op::GreaterEqual, &[rows_col, cols])?;

        let keep = g.add_op(
            "mask/keep",
            Op::Convert {
                to: ElementType::Bool,
            },
            &[attention_mask],
        )?;
        let keep = g.add_op("mask/keep_heads", Op::Unsqueeze { axis: 1 }, &[keep])?;
        let keep = g.add_op("mask/keep_rows", Op::Unsqueeze { axis: 1 }, &[keep])?;
        let never = g.add_constant("mask/false", Tensor::from_bool(vec![], vec![false]));
        g.add_op("mask/combined", Op::Select, &[causal, keep, never])
    }

    fn layer(&mut self, i: usize, x: NodeId, mask: NodeId) -> Result<NodeId, InferenceError> {
        let (heads, head_dim) = (self.cfg.heads, self.cfg.head_dim);
        let prefix = format!("layers.{i}");
        let q = self.heads_of(&format!("{prefix}.q"), x)?;
        let k = self.heads_of(&format!("{prefix}.k"), x)?;
        let v = self.heads_of(&format!("{prefix}.v"), x)?;

        let cache_shape = PartialShape(vec![
            Dim::Dynamic,
            Dim::Static(heads),
            Dim::Dynamic,
            Dim::Static(head_dim),
        ]);
        let past_k = self.graph.add_parameter(
            &format!("past_key_values.{i}.key"),
            ElementType::F32,
            cache_shape.clone(),
        );
        let past_v = self.graph.add_parameter(
            &format!("past_key_values.{i}.value"),
            ElementType::F32,
            cache_shape,
        );
        let keys = self
            .graph
            .add_op(&format!("{prefix}/keys"), Op::Concat { axis: 2 }, &[past_k, k])?;
        let values = self
            .graph
            .add_op(&format!("{prefix}/values"), Op::Concat { axis: 2 }, &[past_v, v])?;
        self.graph.add_result(&format!("present.{i}.key"), keys)?;
        self.graph.add_result(&format!("present.{i}.value"), values)?;

        let attn = self.graph.add_op(
            &format!("{prefix}/attention"),
            Op::ScaledDotProductAttention { causal: false },
            &[q, keys, values, mask],
        )?;
        let merged = self.graph.add_op(
            &format!("{prefix}/merge_transpose"),
            Op::Transpose {
                order: vec![0, 2, 1, 3],
            },
            &[attn],
        )?;
        let merged = self.graph.add_op(
            &format!("{prefix}/merge_reshape"),
            Op::Reshape {
                pattern: vec![0, 0, (heads * head_dim) as i64],
            },
            &[merged],
        )?;
        let scale = 1.0 / ((heads * head_dim) as f32).sqrt();
        let wo = self.weight(&format!("{prefix}.o.weight"), &[heads * head_dim, self.cfg.hidden], scale);
        let out = self.graph.add_op(
            &format!("{prefix}/o"),
            Op::MatMul {
                transpose_a: false,
                transpose_b: false,
            },
            &[merged, wo],
        )?;
        self.graph.add_op(&format!("{prefix}/residual"), Op::Add, &[x, out])
    }

    fn lm_head(&mut self) -> Result<NodeId, InferenceError> {
        let (hidden, vocab) = (self.cfg.hidden, self.cfg.vocab_size);
        if !self.cfg.u4_head {
            return Ok(self.weight("lm_head.weight", &[hidden, vocab], 1.0));
        }
        let nibbles = (0..hidden * vocab)
            .map(|_| (self.rng.next_u64() & 0x0F) as u8)
            .collect();
        let g = &mut self.graph;
        let packed = g.add_constant("lm_head.weight", Tensor::from_u4(vec![hidden, vocab], nibbles));
        let zp = g.add_constant("lm_head.zero_point", Tensor::from_u4(vec![], vec![HEAD_ZERO_POINT]));
        let scale = g.add_constant("lm_head.scale", Tensor::scalar_f32(0.125));
        let to_f32 = Op::Convert {
            to: ElementType::F32,
        };
        let w = g.add_op("lm_head/convert", to_f32.clone(), &[packed])?;
        let zp = g.add_op("lm_head/zp_convert", to_f32, &[zp])?;
        let centered = g.add_op("lm_head/subtract_zp", Op::Subtract, &[w, zp])?;
        g.add_op("lm_head/scale", Op::Multiply, &[centered, scale])
    }
}

/// Build the decoder graph for `cfg`.
pub fn build_decoder(cfg: &DecoderConfig) -> Result<ComputeGraph, InferenceError> {
    if cfg.layers == 0 || cfg.heads == 0 || cfg.head_dim == 0 || cfg.vocab_size == 0 {
        return Err(InferenceError::Config(format!(
            "decoder dimensions must be non-zero: {:?}",
            cfg
        )));
    }
    let mut b = Builder {
        graph: ComputeGraph::new(),
        rng: XorShiftRng::new(cfg.seed),
        cfg,
    };

    let tokens = PartialShape::dynamic(2);
    let input_ids = b.graph.add_parameter("input_ids", ElementType::I64, tokens.clone());
    let attention_mask = b.graph.add_parameter("attention_mask", ElementType::I64, tokens.clone());
    let position_ids = b.graph.add_parameter("position_ids", ElementType::I64, tokens);

    let tok_table = b.weight("embed_tokens.weight", &[cfg.vocab_size, cfg.hidden], 1.0);
    let pos_table = b.weight("embed_positions.weight", &[cfg.max_positions, cfg.hidden], 0.1);
    let tok = b.graph.add_op("embed_tokens", Op::Gather { axis: 0 }, &[tok_table, input_ids])?;
    let pos = b.graph.add_op("embed_positions", Op::Gather { axis: 0 }, &[pos_table, position_ids])?;
    let mut x = b.graph.add_op("embed", Op::Add, &[tok, pos])?;

    let mask = b.attention_mask(input_ids, attention_mask)?;
    for i in 0..cfg.layers {
        x = b.layer(i, x, mask)?;
    }

    let head = b.lm_head()?;
    let logits = b.graph.add_op(
        "lm_head",
        Op::MatMul {
            transpose_a: false,
            transpose_b: false,
        },
        &[x, head],
    )?;
    b.graph.add_result("logits", logits)?;

    if let Some(group_size) = cfg.group_size {
        b.graph.set_rt_info(GROUP_SIZE_RT_INFO, &group_size.to_string());
    }
    b.graph.validate()?;
    debug!(
        layers = cfg.layers,
        nodes = b.graph.node_count(),
        "Built synthetic decoder"
    );
    Ok(b.graph)
}
