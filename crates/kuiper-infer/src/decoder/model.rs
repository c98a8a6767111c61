//! The model orchestrator.
//!
//! Owns the configuration, weights, layers, scratch and KV cache of one
//! session and drives the fixed operator sequence of a decoder forward pass.
//! Operators are issued strictly in order; on the GPU they are queue-ordered,
//! so the only synchronization point is the logits readback in
//! `post_processing`.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use crate::attention::MultiHeadAttention;
use crate::cache::KvCache;
use crate::common::{ArgmaxSampler, Sampler};
use crate::config::TransformerConfig;
use crate::decoder::block::{DecoderBlock, SharedLayers};
use crate::decoder::buffers::{ScratchBuffers, StepBuffers};
use crate::decoder::EmbeddingOutput;
use crate::embeddings::EmbeddingLayer;
use crate::error::{EngineError, EngineResult};
use crate::feedforward::SwiGluLayer;
use crate::gpu_ops::WgpuContext;
use crate::kernels::{read_position, KernelRegistry};
use crate::linear_layer::LinearLayer;
use crate::normalization::RmsNormLayer;
use crate::ops::AddLayer;
use crate::rope::RopeLayer;
use crate::tensor::{DType, Tensor};
use crate::traits::{Device, Layer, LayerIo, Model};
use crate::weights::TransformerWeights;

/// Everything `init` builds.
struct ModelState {
    device: Device,
    context: Option<Arc<WgpuContext>>,
    embedding: EmbeddingLayer,
    blocks: Vec<DecoderBlock>,
    shared: SharedLayers,
    final_norm: RmsNormLayer,
    classifier: LinearLayer,
    buffers: ScratchBuffers,
    cache: KvCache,
}

/// Decoder-only transformer session.
///
/// Calls take `&self` but share one set of scratch buffers and one KV cache,
/// so the type is `Send` but not `Sync`:
///
/// ```compile_fail
/// fn shared_across_threads<T: Sync>() {}
/// shared_across_threads::<kuiper_infer::TransformerModel>();
/// ```
pub struct TransformerModel {
    config: TransformerConfig,
    weights: Option<TransformerWeights>,
    registry: Option<KernelRegistry>,
    sampler: Box<dyn Sampler>,
    state: Option<ModelState>,
    _session: PhantomData<Cell<()>>,
}

impl TransformerModel {
    /// Takes the materialized weights; nothing is validated or allocated
    /// until [`Model::init`].
    pub fn new(config: TransformerConfig, weights: TransformerWeights) -> Self {
        Self {
            config,
            weights: Some(weights),
            registry: None,
            sampler: Box::new(ArgmaxSampler),
            state: None,
            _session: PhantomData,
        }
    }

    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    /// Uses `registry` instead of the default kernel table at `init`.
    pub fn with_registry(mut self, registry: KernelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    fn state(&self) -> EngineResult<&ModelState> {
        self.state.as_ref().ok_or(EngineError::NotInitialized)
    }

    pub fn device(&self) -> EngineResult<Device> {
        Ok(self.state()?.device)
    }

    pub fn kv_cache(&self) -> EngineResult<&KvCache> {
        Ok(&self.state()?.cache)
    }

    /// Activation scratch of the last call, for inspection.
    pub fn scratch(&self) -> EngineResult<&ScratchBuffers> {
        Ok(&self.state()?.buffers)
    }

    /// Host copy of the last forward call's logits. Synchronizes the queue.
    pub fn logits(&self) -> EngineResult<Vec<f32>> {
        self.state()?.buffers.logits.to_vec_f32()
    }

    /// Greedy or sampled continuation of `prompt`, starting at position 0.
    ///
    /// The prompt is prefilled in one call, then each predicted token is fed
    /// back one row at a time. Generation stops early when the cache is full.
    pub fn generate(&self, prompt: &[u32], steps: usize) -> EngineResult<Vec<u32>> {
        let seq_len = self.config.seq_len;
        let mut generated = Vec::with_capacity(steps);
        if steps == 0 {
            return Ok(generated);
        }

        let prompt_embeds = self.embedding(prompt)?;
        let mut next = self.predict(&prompt_embeds.embeddings, &Tensor::scalar_u32(0), true)?;
        let mut pos = prompt.len();
        generated.push(next);

        while generated.len() < steps {
            if pos >= seq_len {
                log::warn!("generation stopped at position {pos}: kv cache is full");
                break;
            }
            let embeds = self.embedding(&[next])?;
            next = self.predict(&embeds.embeddings, &Tensor::scalar_u32(pos as u32), false)?;
            generated.push(next);
            pos += 1;
        }
        Ok(generated)
    }

    fn build_state(
        &self,
        weights: TransformerWeights,
        device: Device,
        context: Option<Arc<WgpuContext>>,
    ) -> EngineResult<ModelState> {
        let config = &self.config;
        let registry = match &self.registry {
            Some(registry) => {
                if registry.is_empty() {
                    log::warn!("supplied kernel registry is empty; layer construction will fail");
                }
                registry.clone()
            }
            None => KernelRegistry::with_defaults(context.as_ref()),
        };
        let ctx = context.as_ref();

        let weights = place_weights(&weights, device, ctx)?;
        let classifier_weight = weights.classifier_or_embedding().clone();
        if weights.classifier.is_none() {
            log::debug!("classifier tied to the embedding table");
        }

        let embedding = EmbeddingLayer::new(device, &registry, weights.embedding)?;
        let blocks = weights
            .blocks
            .into_iter()
            .enumerate()
            .map(|(i, block)| DecoderBlock::new(i, config, block, device, &registry))
            .collect::<EngineResult<Vec<_>>>()?;
        let final_norm =
            RmsNormLayer::new("final_norm", device, &registry, weights.final_norm, config.norm_eps)?;
        let classifier = LinearLayer::new("classifier", device, &registry, classifier_weight)?;

        let shared = SharedLayers {
            add: AddLayer::new(device, &registry)?,
            rope: RopeLayer::new(
                device,
                &registry,
                ctx,
                config.head_size,
                config.seq_len,
                config.rope_theta,
            )?,
            swiglu: SwiGluLayer::new(device, &registry)?,
            mha: MultiHeadAttention::new(
                device,
                &registry,
                config.head_num,
                config.kv_head_num,
                config.head_size,
            )?,
        };

        let buffers = ScratchBuffers::new(config, device, ctx)?;
        let cache = KvCache::new(config.layer_num, config.seq_len, config.kv_dim(), device, ctx)?;

        Ok(ModelState {
            device,
            context,
            embedding,
            blocks,
            shared,
            final_norm,
            classifier,
            buffers,
            cache,
        })
    }
}

/// Moves weights onto `device`, sharing tensors that already live there.
fn place_weights(
    weights: &TransformerWeights,
    device: Device,
    context: Option<&Arc<WgpuContext>>,
) -> EngineResult<TransformerWeights> {
    let resident = |t: &Tensor| {
        t.device() == device
            && match (t.context(), context) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, _) => device.is_cpu(),
                _ => false,
            }
    };
    if resident(&weights.embedding) {
        Ok(weights.clone())
    } else {
        weights.to_device(device, context)
    }
}

impl Model for TransformerModel {
    fn init(&mut self, device: Device, context: Option<Arc<WgpuContext>>) -> EngineResult<()> {
        if self.state.is_some() {
            return Err(EngineError::InvalidConfig("model is already initialized".into()));
        }
        self.config.validate()?;
        let weights = self.weights.as_ref().ok_or(EngineError::NotInitialized)?;
        weights.validate(&self.config)?;
        if device.is_gpu() && context.is_none() {
            return Err(EngineError::DeviceUnavailable(
                "gpu model initialized without an execution context".into(),
            ));
        }

        let t_start = Instant::now();
        let state = self.build_state(weights.clone(), device, context)?;
        if let Some(context) = &state.context {
            context.print_memory_usage();
        }
        self.state = Some(state);
        // Layers hold the only device copy now.
        self.weights = None;

        log::info!(
            "model initialized on {device:?}: {} blocks, dim {}, vocab {} in {:?}",
            self.config.layer_num,
            self.config.dim,
            self.config.vocab_size,
            t_start.elapsed()
        );
        Ok(())
    }

    fn embedding(&self, tokens: &[u32]) -> EngineResult<EmbeddingOutput> {
        let state = self.state()?;
        let token_num = tokens.len();
        if token_num == 0 || token_num > self.config.seq_len {
            return Err(EngineError::invalid_argument(
                state.embedding.name(),
                "input",
                format!("{token_num} tokens; expected 1..={}", self.config.seq_len),
            ));
        }
        let token_tensor = Tensor::from_vec_u32(&[token_num], tokens.to_vec())?;
        let embeddings = state.buffers.residual.rows(token_num)?;
        state
            .embedding
            .forward(&LayerIo::new(&[&token_tensor], &[&embeddings]))?;
        Ok(EmbeddingOutput {
            tokens: token_tensor,
            embeddings,
            token_num,
        })
    }

    fn forward(&self, input: &Tensor, pos: &Tensor) -> EngineResult<()> {
        let state = self.state()?;
        let dim = self.config.dim;
        if input.dtype() != DType::F32 || input.dim(-1) != dim || input.rank() > 2 {
            return Err(EngineError::invalid_argument(
                "model",
                "input",
                format!("has shape {:?}, expected [n, {dim}]", input.shape()),
            ));
        }
        if !pos.device().is_cpu() || pos.dtype() != DType::U32 {
            return Err(EngineError::invalid_argument("model", "pos", "must be a host u32 scalar"));
        }
        let n = input.num_elements() / dim;
        if n == 0 {
            return Err(EngineError::invalid_argument("model", "input", "has no rows"));
        }
        let start = read_position(pos)?;
        if start + n > self.config.seq_len {
            return Err(EngineError::CacheOverflow {
                position: start,
                tokens: n,
                capacity: self.config.seq_len,
            });
        }

        let t_start = Instant::now();
        let x = input.reshape(&[n, dim])?;
        let step = StepBuffers::new(&state.buffers, n)?;
        for block in &state.blocks {
            block.forward(&x, pos, start, &state.shared, &step, &state.cache)?;
        }

        // Only the last row feeds the classifier.
        let last = x.view((n - 1) * dim, &[dim])?;
        state
            .final_norm
            .forward(&LayerIo::new(&[&last], &[&state.buffers.final_norm]))?;
        state.classifier.forward(&LayerIo::new(
            &[&state.buffers.final_norm],
            &[&state.buffers.logits],
        ))?;

        log::debug!(
            "forward: {n} rows at position {start} issued in {:?}",
            t_start.elapsed()
        );
        Ok(())
    }

    fn predict(&self, input: &Tensor, pos: &Tensor, is_prompt: bool) -> EngineResult<u32> {
        self.forward(input, pos)?;
        self.post_processing(pos, is_prompt)
    }

    fn post_processing(&self, pos: &Tensor, is_prompt: bool) -> EngineResult<u32> {
        let logits = self.logits()?;
        let position = read_position(pos)?;
        let token = self.sampler.sample(&logits, position, is_prompt)?;
        log::trace!("post_processing: position {position} -> token {token}");
        Ok(token)
    }
}

