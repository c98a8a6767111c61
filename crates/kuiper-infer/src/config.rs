use serde::Deserialize;

use crate::error::{EngineError, EngineResult};

/// Decoder hyperparameters, fixed at model-load time.
///
/// Field names follow the runtime's own vocabulary; the common HuggingFace
/// `config.json` spellings are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransformerConfig {
    // --- Core Architecture ---
    #[serde(alias = "hidden_size")]
    pub dim: usize,
    #[serde(alias = "intermediate_size")]
    pub hidden_dim: usize,
    #[serde(alias = "num_hidden_layers")]
    pub layer_num: usize,
    #[serde(alias = "num_attention_heads")]
    pub head_num: usize,
    #[serde(alias = "num_key_value_heads")]
    pub kv_head_num: usize,
    /// Zero means "derive from dim / head_num".
    #[serde(default, alias = "head_dim")]
    pub head_size: usize,
    pub vocab_size: usize,
    #[serde(alias = "max_position_embeddings")]
    pub seq_len: usize,

    // --- Weight Sharing ---
    #[serde(default)]
    pub tie_word_embeddings: bool,

    // --- Normalization & RoPE ---
    #[serde(default = "default_norm_eps", alias = "rms_norm_eps")]
    pub norm_eps: f32,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    /// Per-head RMSNorm on query/key before RoPE (Qwen3 style).
    #[serde(default)]
    pub qk_norm: bool,
}

fn default_norm_eps() -> f32 {
    1e-5
}

fn default_rope_theta() -> f32 {
    10000.0
}

impl TransformerConfig {
    /// Builds a config with default eps/theta and no weight tying.
    pub fn new(
        dim: usize,
        hidden_dim: usize,
        layer_num: usize,
        head_num: usize,
        kv_head_num: usize,
        vocab_size: usize,
        seq_len: usize,
    ) -> Self {
        Self {
            dim,
            hidden_dim,
            layer_num,
            head_num,
            kv_head_num,
            head_size: if head_num > 0 { dim / head_num } else { 0 },
            vocab_size,
            seq_len,
            tie_word_embeddings: false,
            norm_eps: default_norm_eps(),
            rope_theta: default_rope_theta(),
            qk_norm: false,
        }
    }

    pub fn from_json(json: &str) -> EngineResult<Self> {
        let mut config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidConfig(format!("failed to parse config: {e}")))?;
        if config.head_size == 0 && config.head_num > 0 {
            config.head_size = config.dim / config.head_num;
        }
        config.validate()?;
        Ok(config)
    }

    /// Width of the key/value projections (`kv_head_num * head_size`).
    pub fn kv_dim(&self) -> usize {
        self.kv_head_num * self.head_size
    }

    /// Number of query heads sharing one key/value head.
    pub fn kv_mul(&self) -> usize {
        self.head_num / self.kv_head_num
    }

    pub fn validate(&self) -> EngineResult<()> {
        let sizes = [
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("layer_num", self.layer_num),
            ("head_num", self.head_num),
            ("kv_head_num", self.kv_head_num),
            ("head_size", self.head_size),
            ("vocab_size", self.vocab_size),
            ("seq_len", self.seq_len),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(EngineError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.head_num * self.head_size != self.dim {
            return Err(EngineError::InvalidConfig(format!(
                "head_num ({}) * head_size ({}) must equal dim ({})",
                self.head_num, self.head_size, self.dim
            )));
        }
        if self.head_num % self.kv_head_num != 0 {
            return Err(EngineError::InvalidConfig(format!(
                "head_num ({}) must be a multiple of kv_head_num ({})",
                self.head_num, self.kv_head_num
            )));
        }
        if self.head_size % 2 != 0 {
            return Err(EngineError::InvalidConfig(format!(
                "head_size ({}) must be even for rotary embeddings",
                self.head_size
            )));
        }
        if self.norm_eps.is_nan() || self.norm_eps <= 0.0 {
            return Err(EngineError::InvalidConfig("norm_eps must be positive".into()));
        }
        Ok(())
    }
}
