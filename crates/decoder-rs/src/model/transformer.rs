use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::block::DecoderBlock;
use super::config::ModelConfig;
use super::registry::LayerRegistry;
use crate::backend::spec::PortableBackend;
use crate::error::ModelError;
use crate::io::tensor_archive::TensorArchive;
use crate::module::{self, Module, ParamVisitor, ParamVisitorMut, TensorRole};
use crate::nn::layers::{
    Embedding, EmbeddingConfig, Layer, LayerRecord, Linear, LinearConfig, TableHandle,
    TiedEmbeddingsConfig, TiedEmbeddingsTransposed,
};
use crate::ops::functional::{self, ForwardContext, Phase};
use crate::params::{scoped, ParamFetch};
use crate::tensor::{DeviceTensor, DeviceTensorOps, Tensor};

/// Token ids (and optional position ids) for a batch of equal-length sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    pub token_ids: Vec<Vec<usize>>,
    /// Defaults to `0..seq_len` for every row.
    pub position_ids: Option<Vec<Vec<usize>>>,
}

impl TokenBatch {
    pub fn new(token_ids: Vec<Vec<usize>>) -> Self {
        Self {
            token_ids,
            position_ids: None,
        }
    }

    pub fn with_positions(token_ids: Vec<Vec<usize>>, position_ids: Vec<Vec<usize>>) -> Self {
        Self {
            token_ids,
            position_ids: Some(position_ids),
        }
    }

    /// Single full-length sequence `i % vocab_size` at positions `0..max_len`.
    ///
    /// Debug-mode models are compared on this fixed input, so every backend sees the same ids.
    pub fn debug_probe(config: &ModelConfig) -> Self {
        let vocab = config.vocab_size.max(1);
        Self::new(vec![(0..config.max_len).map(|i| i % vocab).collect()])
    }

    pub fn batch_size(&self) -> usize {
        self.token_ids.len()
    }

    pub fn seq_len(&self) -> usize {
        self.token_ids.first().map_or(0, Vec::len)
    }

    /// Returns `(batch, seq_len)` or [`ModelError::InvalidInput`].
    pub fn validate(&self, config: &ModelConfig) -> Result<(usize, usize)> {
        let batch = self.batch_size();
        let seq_len = self.seq_len();
        if batch == 0 || seq_len == 0 {
            return Err(ModelError::invalid_input("token batch must not be empty").into());
        }
        if seq_len > config.max_len {
            return Err(ModelError::invalid_input(format!(
                "sequence length {seq_len} exceeds max_len {}",
                config.max_len
            ))
            .into());
        }
        for (row, ids) in self.token_ids.iter().enumerate() {
            check_row("token", row, ids, seq_len, config.vocab_size)?;
        }
        if let Some(positions) = &self.position_ids {
            if positions.len() != batch {
                return Err(ModelError::invalid_input(format!(
                    "position ids have {} rows but the batch has {batch}",
                    positions.len()
                ))
                .into());
            }
            for (row, ids) in positions.iter().enumerate() {
                check_row("position", row, ids, seq_len, config.max_len)?;
            }
        }
        Ok((batch, seq_len))
    }

    fn flat_token_ids(&self) -> Vec<usize> {
        self.token_ids.iter().flatten().copied().collect()
    }

    fn flat_position_ids(&self, seq_len: usize) -> Vec<usize> {
        match &self.position_ids {
            Some(positions) => positions.iter().flatten().copied().collect(),
            None => (0..self.batch_size()).flat_map(|_| 0..seq_len).collect(),
        }
    }
}

fn check_row(kind: &str, row: usize, ids: &[usize], seq_len: usize, limit: usize) -> Result<()> {
    if ids.len() != seq_len {
        return Err(ModelError::invalid_input(format!(
            "{kind} row {row} has length {} but the batch uses {seq_len}",
            ids.len()
        ))
        .into());
    }
    if let Some((col, id)) = ids.iter().enumerate().find(|&(_, &id)| id >= limit) {
        return Err(ModelError::invalid_input(format!(
            "{kind} id {id} at ({row}, {col}) must be below {limit}"
        ))
        .into());
    }
    Ok(())
}

/// Host copies of the two model outputs.
#[derive(Debug, Clone)]
pub struct ModelOutputs {
    /// `(batch, seq, embedding_dim)` output of the last block.
    pub hidden: Tensor,
    /// `(batch, seq, vocab_size)`.
    pub logits: Tensor,
}

/// Output projection onto the vocabulary.
pub enum OutputHead<B: PortableBackend + ?Sized + 'static> {
    Tied(TiedEmbeddingsTransposed<B>),
    Untied(Linear<B>),
}

impl<B: PortableBackend + ?Sized + 'static> OutputHead<B> {
    fn record(&self) -> Result<LayerRecord> {
        match self {
            OutputHead::Tied(head) => head.record(),
            OutputHead::Untied(head) => head.record(),
        }
    }

    fn units(&self) -> usize {
        match self {
            OutputHead::Tied(head) => head.units(),
            OutputHead::Untied(head) => head.out_features(),
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> Clone for OutputHead<B> {
    fn clone(&self) -> Self {
        match self {
            OutputHead::Tied(head) => OutputHead::Tied(head.clone()),
            OutputHead::Untied(head) => OutputHead::Untied(head.clone()),
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> fmt::Debug for OutputHead<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputHead::Tied(head) => f.debug_tuple("Tied").field(head).finish(),
            OutputHead::Untied(head) => f.debug_tuple("Untied").field(head).finish(),
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> Module<B> for OutputHead<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        match self {
            OutputHead::Tied(head) => head.visit_params(v),
            OutputHead::Untied(head) => head.visit_params(v),
        }
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        match self {
            OutputHead::Tied(head) => head.visit_params_mut(v),
            OutputHead::Untied(head) => head.visit_params_mut(v),
        }
    }
}

/// One top-level layer of the model and the dotted path its parameters live under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    #[serde(flatten)]
    pub layer: LayerRecord,
}

/// Decoder-only Transformer: embeddings, a stack of post-norm blocks, and an output head.
pub struct TransformerModel<B: PortableBackend + ?Sized + 'static> {
    backend: Arc<B>,
    config: ModelConfig,
    pub tok_embeddings: Embedding<B>,
    pub pos_embeddings: Embedding<B>,
    pub blocks: Vec<DecoderBlock<B>>,
    pub head: OutputHead<B>,
}

impl<B: PortableBackend + ?Sized + 'static> TransformerModel<B> {
    /// Checks that the parts agree with `config` before assembling them.
    pub fn assemble(
        backend: Arc<B>,
        config: ModelConfig,
        tok_embeddings: Embedding<B>,
        pos_embeddings: Embedding<B>,
        blocks: Vec<DecoderBlock<B>>,
        head: OutputHead<B>,
    ) -> Result<Self> {
        config.validate()?;
        let d = config.embedding_dim;
        let expect = |parameter: &str, expected: &[usize], actual: &[usize]| -> Result<()> {
            if expected != actual {
                return Err(ModelError::shape_mismatch(parameter, expected, actual).into());
            }
            Ok(())
        };
        expect(
            "tok_embeddings.weight",
            &[config.vocab_size, d],
            tok_embeddings.weight.shape().dims(),
        )?;
        expect(
            "pos_embeddings.weight",
            &[config.max_len, d],
            pos_embeddings.weight.shape().dims(),
        )?;
        if blocks.len() != config.num_layers {
            return Err(ModelError::configuration(format!(
                "expected {} decoder blocks, got {}",
                config.num_layers,
                blocks.len()
            ))
            .into());
        }
        for (i, block) in blocks.iter().enumerate() {
            let attention = &block.attention.config;
            if attention.embedding_dim != d
                || attention.num_heads != config.num_heads
                || attention.ignore_mask != config.ignore_mask
                || block.feed_forward.d_hid() != config.d_hid
            {
                return Err(ModelError::configuration(format!(
                    "decoder block {i} does not match the model configuration"
                ))
                .into());
            }
        }
        let tied = matches!(head, OutputHead::Tied(_));
        if tied != config.use_tied_decoder || head.units() != config.vocab_size {
            return Err(ModelError::configuration(format!(
                "output head (tied: {tied}, units: {}) does not match the model configuration",
                head.units()
            ))
            .into());
        }
        Ok(Self {
            backend,
            config,
            tok_embeddings,
            pos_embeddings,
            blocks,
            head,
        })
    }

    /// Draws every parameter from `rng` in a fixed order: token table, position table, blocks,
    /// then the untied head.
    pub fn random(backend: Arc<B>, config: ModelConfig, rng: &mut impl Rng) -> Result<Self> {
        config.validate()?;
        let d = config.embedding_dim;
        let tok_embeddings = Embedding::random(
            Arc::clone(&backend),
            EmbeddingConfig {
                num_embeddings: config.vocab_size,
                embedding_dim: d,
            },
            rng,
        )?;
        let pos_embeddings = Embedding::random(
            Arc::clone(&backend),
            EmbeddingConfig {
                num_embeddings: config.max_len,
                embedding_dim: d,
            },
            rng,
        )?;
        let mut blocks = Vec::with_capacity(config.num_layers);
        for _ in 0..config.num_layers {
            blocks.push(DecoderBlock::random(
                Arc::clone(&backend),
                config.attention_config(),
                config.d_hid,
                config.layer_norm_epsilon,
                config.residual_dropout,
                rng,
            )?);
        }
        let head = build_head(&backend, &config, rng)?;
        Self::assemble(backend, config, tok_embeddings, pos_embeddings, blocks, head)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub fn is_tied(&self) -> bool {
        matches!(self.head, OutputHead::Tied(_))
    }

    /// Looks up the table a tied head refers to.
    pub fn resolve_table(&self, handle: TableHandle) -> &DeviceTensor<B> {
        match handle {
            TableHandle::TokenEmbeddings => &self.tok_embeddings.weight,
        }
    }

    /// Inference-phase forward pass.
    pub fn forward(&self, batch: &TokenBatch) -> Result<ModelOutputs> {
        self.forward_with_context(batch, &mut ForwardContext::inference())
    }

    pub fn forward_with_phase(&self, batch: &TokenBatch, phase: Phase) -> Result<ModelOutputs> {
        self.forward_with_context(batch, &mut ForwardContext::for_phase(phase))
    }

    pub fn forward_with_context(
        &self,
        batch: &TokenBatch,
        ctx: &mut ForwardContext,
    ) -> Result<ModelOutputs> {
        let (batch_size, seq_len) = batch.validate(&self.config)?;
        let hidden = self.forward_hidden(batch, batch_size, seq_len, ctx)?;
        let logits = self.project(&hidden)?;
        Ok(ModelOutputs {
            hidden: hidden.to_host()?,
            logits: logits.to_host()?,
        })
    }

    fn forward_hidden(
        &self,
        batch: &TokenBatch,
        batch_size: usize,
        seq_len: usize,
        ctx: &mut ForwardContext,
    ) -> Result<DeviceTensor<B>> {
        let backend = self.backend.as_ref();
        let leading = [batch_size, seq_len];
        let tokens = self
            .tok_embeddings
            .forward(&batch.flat_token_ids(), &leading)?;
        let positions = self
            .pos_embeddings
            .forward(&batch.flat_position_ids(seq_len), &leading)?;

        let rate = self.config.embedding_dropout;
        let mut x = if self.config.use_one_embedding_dropout {
            functional::dropout(backend, &tokens.add(&positions)?, rate, ctx)?
        } else {
            let tokens = functional::dropout(backend, &tokens, rate, ctx)?;
            let positions = functional::dropout(backend, &positions, rate, ctx)?;
            tokens.add(&positions)?
        };
        for block in &self.blocks {
            x = block.forward_with_context(&x, ctx)?;
        }
        Ok(x)
    }

    /// Hidden states `(.., d)` to logits `(.., vocab)`.
    pub fn project(&self, hidden: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        match &self.head {
            OutputHead::Tied(head) => head.forward(hidden, self.resolve_table(head.tied_to())),
            OutputHead::Untied(head) => head.forward(hidden),
        }
    }

    pub fn named_parameters(&self) -> Result<Vec<(String, Tensor)>> {
        module::named_parameters(self)
    }

    pub fn parameter_count(&self) -> Result<usize> {
        module::parameter_count(self)
    }

    /// Overwrites one parameter. The new value must keep the parameter's shape.
    pub fn assign_parameter(&mut self, name: &str, tensor: Tensor) -> Result<()> {
        let mut tensors = HashMap::from([(name.to_string(), tensor)]);
        let mut found = false;
        let mut assign = |path: &str, _role: TensorRole, slot: &mut DeviceTensor<B>| -> Result<()> {
            if let Some(tensor) = tensors.remove(path) {
                found = true;
                slot.replace(path, tensor)?;
            }
            Ok(())
        };
        let mut visitor = ParamVisitorMut::new(&mut assign);
        self.visit_params_mut(&mut visitor)?;
        if !found {
            return Err(ModelError::UnexpectedParameter(name.to_string()).into());
        }
        Ok(())
    }

    /// Replaces every parameter at once.
    ///
    /// `tensors` must name exactly the model's parameters with matching shapes. Nothing is
    /// written unless the whole set validates.
    pub fn assign_parameters(&mut self, mut tensors: HashMap<String, Tensor>) -> Result<()> {
        let current = self.named_parameters()?;
        for (name, value) in &current {
            let incoming = tensors
                .get(name)
                .ok_or_else(|| ModelError::MissingParameter(name.clone()))?;
            if incoming.shape() != value.shape() {
                return Err(ModelError::shape_mismatch(
                    name.as_str(),
                    value.shape().dims(),
                    incoming.shape().dims(),
                )
                .into());
            }
        }
        let mut extra: Vec<&String> = tensors
            .keys()
            .filter(|key| !current.iter().any(|(name, _)| name == *key))
            .collect();
        extra.sort();
        if let Some(name) = extra.first() {
            return Err(ModelError::UnexpectedParameter((*name).clone()).into());
        }

        let mut assign = |path: &str, _role: TensorRole, slot: &mut DeviceTensor<B>| -> Result<()> {
            match tensors.remove(path) {
                Some(tensor) => slot.replace(path, tensor),
                None => Err(ModelError::MissingParameter(path.to_string()).into()),
            }
        };
        let mut visitor = ParamVisitorMut::new(&mut assign);
        self.visit_params_mut(&mut visitor)
    }

    /// Writes every parameter to a tensor archive.
    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tensors: HashMap<String, Tensor> = self.named_parameters()?.into_iter().collect();
        TensorArchive::save(path, &tensors)
            .with_context(|| format!("failed to save weights to {}", path.display()))?;
        log::info!("saved {} weight tensors to {}", tensors.len(), path.display());
        Ok(())
    }

    /// Reads a tensor archive written by [`TransformerModel::save_weights`] for a model of the
    /// same architecture.
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tensors = TensorArchive::load(path)
            .with_context(|| format!("failed to read weights from {}", path.display()))?;
        let count = tensors.len();
        self.assign_parameters(tensors)?;
        log::info!("loaded {count} weight tensors from {}", path.display());
        Ok(())
    }

    /// Top-level layers in construction order.
    pub fn layer_manifest(&self) -> Result<Vec<ManifestEntry>> {
        let mut manifest = Vec::with_capacity(self.blocks.len() + 3);
        manifest.push(ManifestEntry {
            path: "tok_embeddings".to_string(),
            layer: self.tok_embeddings.record()?,
        });
        manifest.push(ManifestEntry {
            path: "pos_embeddings".to_string(),
            layer: self.pos_embeddings.record()?,
        });
        for (i, block) in self.blocks.iter().enumerate() {
            manifest.push(ManifestEntry {
                path: format!("blocks.{i}"),
                layer: block.record()?,
            });
        }
        manifest.push(ManifestEntry {
            path: "head".to_string(),
            layer: self.head.record()?,
        });
        Ok(manifest)
    }

    /// Rebuilds a model from its manifest, resolving every class through `registry`.
    pub fn from_manifest(
        registry: &LayerRegistry<B>,
        backend: Arc<B>,
        config: ModelConfig,
        manifest: &[ManifestEntry],
        params: &mut dyn ParamFetch,
    ) -> Result<Self> {
        config.validate()?;
        let find = |path: &str| manifest_record(manifest, path);

        let tok_embeddings: Embedding<B> = registry.build_as(
            find("tok_embeddings")?,
            Arc::clone(&backend),
            &mut scoped(params, "tok_embeddings"),
        )?;
        let pos_embeddings: Embedding<B> = registry.build_as(
            find("pos_embeddings")?,
            Arc::clone(&backend),
            &mut scoped(params, "pos_embeddings"),
        )?;
        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let path = format!("blocks.{i}");
            let block: DecoderBlock<B> =
                registry.build_as(find(&path)?, Arc::clone(&backend), &mut scoped(params, &path))?;
            blocks.push(block);
        }
        let head_record = find("head")?;
        let mut head_params = scoped(params, "head");
        let head = if config.use_tied_decoder {
            OutputHead::Tied(registry.build_as(head_record, Arc::clone(&backend), &mut head_params)?)
        } else {
            OutputHead::Untied(registry.build_as(
                head_record,
                Arc::clone(&backend),
                &mut head_params,
            )?)
        };
        Self::assemble(backend, config, tok_embeddings, pos_embeddings, blocks, head)
    }
}

fn manifest_record<'m>(manifest: &'m [ManifestEntry], path: &str) -> Result<&'m LayerRecord> {
    manifest
        .iter()
        .find(|entry| entry.path == path)
        .map(|entry| &entry.layer)
        .ok_or_else(|| {
            ModelError::configuration(format!("layer manifest has no entry for '{path}'")).into()
        })
}

fn build_head<B: PortableBackend + ?Sized + 'static>(
    backend: &Arc<B>,
    config: &ModelConfig,
    rng: &mut impl Rng,
) -> Result<OutputHead<B>> {
    if config.use_tied_decoder {
        let head = TiedEmbeddingsTransposed::from_config(
            Arc::clone(backend),
            TiedEmbeddingsConfig {
                tied_to: TableHandle::TokenEmbeddings,
                units: config.vocab_size,
                use_bias: config.use_decoder_bias,
            },
        )?;
        return Ok(OutputHead::Tied(head));
    }
    let head = Linear::random(
        Arc::clone(backend),
        LinearConfig {
            in_features: config.embedding_dim,
            out_features: config.vocab_size,
            use_bias: config.use_decoder_bias,
        },
        rng,
    )?;
    Ok(OutputHead::Untied(head))
}

impl<B: PortableBackend + ?Sized + 'static> Clone for TransformerModel<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
            tok_embeddings: self.tok_embeddings.clone(),
            pos_embeddings: self.pos_embeddings.clone(),
            blocks: self.blocks.clone(),
            head: self.head.clone(),
        }
    }
}

impl<B: PortableBackend + ?Sized + 'static> fmt::Debug for TransformerModel<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformerModel")
            .field("backend", &self.backend.backend_name())
            .field("config", &self.config)
            .field("blocks", &self.blocks.len())
            .field("head", &self.head)
            .finish()
    }
}

impl<B: PortableBackend + ?Sized + 'static> Module<B> for TransformerModel<B> {
    fn visit_params(&self, v: &mut ParamVisitor<'_, B>) -> Result<()> {
        v.scoped("tok_embeddings", |v| self.tok_embeddings.visit_params(v))?;
        v.scoped("pos_embeddings", |v| self.pos_embeddings.visit_params(v))?;
        v.scoped("blocks", |v| {
            for (i, block) in self.blocks.iter().enumerate() {
                let idx = i.to_string();
                v.scoped(&idx, |v| block.visit_params(v))?;
            }
            Ok(())
        })?;
        v.scoped("head", |v| self.head.visit_params(v))
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_, B>) -> Result<()> {
        v.scoped("tok_embeddings", |v| self.tok_embeddings.visit_params_mut(v))?;
        v.scoped("pos_embeddings", |v| self.pos_embeddings.visit_params_mut(v))?;
        v.scoped("blocks", |v| {
            for (i, block) in self.blocks.iter_mut().enumerate() {
                let idx = i.to_string();
                v.scoped(&idx, |v| block.visit_params_mut(v))?;
            }
            Ok(())
        })?;
        v.scoped("head", |v| self.head.visit_params_mut(v))
    }
}

/// Builds a randomly initialized model.
///
/// Seeded from [`ModelConfig::init_seed`] when the config pins one, otherwise from OS entropy.
pub fn create_model<B: PortableBackend + ?Sized + 'static>(
    backend: Arc<B>,
    config: &ModelConfig,
) -> Result<TransformerModel<B>> {
    config.validate()?;
    let mut rng = match config.init_seed() {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let model = TransformerModel::random(backend, config.clone(), &mut rng)?;
    log::debug!(
        "created model on '{}': {} blocks, d={}, vocab={}, tied={}",
        model.backend.backend_name(),
        model.blocks.len(),
        config.embedding_dim,
        config.vocab_size,
        model.is_tied()
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            vocab_size: 37,
            num_heads: 3,
            num_layers: 2,
            embedding_dim: 12,
            d_hid: 13,
            max_len: 24,
            ..ModelConfig::default()
        }
    }

    fn invalid(batch: &TokenBatch) -> bool {
        let err = batch.validate(&config()).unwrap_err();
        matches!(
            err.downcast_ref::<ModelError>(),
            Some(ModelError::InvalidInput(_))
        )
    }

    #[test]
    fn batches_report_their_dimensions() {
        let batch = TokenBatch::new(vec![vec![1, 2, 3], vec![4, 5, 6]]);
        assert_eq!(batch.validate(&config()).unwrap(), (2, 3));
        assert_eq!(batch.flat_position_ids(3), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn malformed_batches_are_invalid_input() {
        assert!(invalid(&TokenBatch::new(vec![])));
        assert!(invalid(&TokenBatch::new(vec![vec![]])));
        assert!(invalid(&TokenBatch::new(vec![vec![1, 2], vec![3]])));
        assert!(invalid(&TokenBatch::new(vec![vec![37]])));
        assert!(invalid(&TokenBatch::new(vec![vec![0; 25]])));
        assert!(invalid(&TokenBatch::with_positions(
            vec![vec![1, 2]],
            vec![vec![0, 24]]
        )));
        assert!(invalid(&TokenBatch::with_positions(
            vec![vec![1, 2]],
            vec![vec![0, 1], vec![0, 1]]
        )));
    }

    #[test]
    fn debug_probe_spans_the_context() {
        let batch = TokenBatch::debug_probe(&config());
        assert_eq!(batch.validate(&config()).unwrap(), (1, 24));
        assert_eq!(batch.token_ids[0][12], 12);
    }

    #[test]
    fn manifest_entries_flatten_the_layer_record() {
        let entry = ManifestEntry {
            path: "blocks.0".into(),
            layer: LayerRecord {
                class_name: "DecoderBlock".into(),
                config: serde_json::json!({"residual_dropout": 0.1}),
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["path"], "blocks.0");
        assert_eq!(json["class_name"], "DecoderBlock");
        let back: ManifestEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}
