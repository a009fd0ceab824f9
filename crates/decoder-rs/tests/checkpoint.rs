use std::path::PathBuf;
use std::sync::Arc;

use decoder_rs::checkpoint::{CheckpointLoader, CheckpointReader, CheckpointSaver};
use decoder_rs::model::LayerRegistry;
use decoder_rs::nn::layers::{Embedding, Gelu, LayerNormalization, Linear};
use decoder_rs::{create_model, ModelConfig, ModelError, TokenBatch, TransformerModel};
use decoder_rs_backend_ref_cpu::CpuPortableBackend;

fn cpu_backend() -> Arc<CpuPortableBackend> {
    Arc::new(CpuPortableBackend::new())
}

fn small_config(ignore_mask: bool, use_tied_decoder: bool) -> ModelConfig {
    ModelConfig {
        vocab_size: 37,
        num_heads: 3,
        num_layers: 2,
        embedding_dim: 12,
        d_hid: 13,
        max_len: 24,
        ignore_mask,
        use_tied_decoder,
        ..ModelConfig::default()
    }
}

fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("decoder-rs-test-{tag}-{}.bin", std::process::id()))
}

fn assert_same_parameters(
    a: &TransformerModel<CpuPortableBackend>,
    b: &TransformerModel<CpuPortableBackend>,
) {
    let a = a.named_parameters().unwrap();
    let b = b.named_parameters().unwrap();
    assert_eq!(a.len(), b.len());
    for ((name_a, tensor_a), (name_b, tensor_b)) in a.iter().zip(b.iter()) {
        assert_eq!(name_a, name_b);
        assert!(tensor_a.bitwise_eq(tensor_b), "{name_a} differs");
    }
}

#[test]
fn full_checkpoint_roundtrip() {
    let registry = LayerRegistry::with_builtin_layers();
    for ignore_mask in [true, false] {
        for tied in [true, false] {
            let config = small_config(ignore_mask, tied);
            let model = create_model(cpu_backend(), &config).unwrap();
            let path = temp_path(&format!("full-{ignore_mask}-{tied}"));
            CheckpointSaver::save(&path, &model).unwrap();
            let restored = CheckpointLoader::load(&path, cpu_backend(), &registry).unwrap();
            std::fs::remove_file(&path).unwrap();

            assert_eq!(restored.config(), model.config());
            assert_eq!(restored.is_tied(), tied);
            assert_same_parameters(&model, &restored);
            let batch = TokenBatch::debug_probe(&config);
            assert!(model
                .forward(&batch)
                .unwrap()
                .logits
                .bitwise_eq(&restored.forward(&batch).unwrap().logits));
        }
    }
}

#[test]
fn checkpoint_header_lists_layer_classes() {
    let model = create_model(cpu_backend(), &small_config(false, false)).unwrap();
    let path = temp_path("header");
    CheckpointSaver::save(&path, &model).unwrap();
    let reader = CheckpointReader::open(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let classes: Vec<(&str, &str)> = reader
        .header()
        .layers
        .iter()
        .map(|entry| (entry.path.as_str(), entry.layer.class_name.as_str()))
        .collect();
    assert_eq!(
        classes,
        vec![
            ("tok_embeddings", "Embedding"),
            ("pos_embeddings", "Embedding"),
            ("blocks.0", "DecoderBlock"),
            ("blocks.1", "DecoderBlock"),
            ("head", "Linear"),
        ]
    );
    assert_eq!(
        reader.entries().len(),
        model.named_parameters().unwrap().len()
    );
}

#[test]
fn unknown_layer_class_is_reported() {
    let model = create_model(cpu_backend(), &small_config(false, true)).unwrap();
    let path = temp_path("unknown-layer");
    CheckpointSaver::save(&path, &model).unwrap();

    let mut registry = LayerRegistry::<CpuPortableBackend>::empty();
    registry.register_layer::<Embedding<CpuPortableBackend>>();
    registry.register_layer::<LayerNormalization<CpuPortableBackend>>();
    registry.register_layer::<Linear<CpuPortableBackend>>();
    registry.register_layer::<Gelu<CpuPortableBackend>>();
    let err = CheckpointLoader::load(&path, cpu_backend(), &registry).unwrap_err();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(
        err.downcast_ref::<ModelError>(),
        Some(&ModelError::UnknownLayer("DecoderBlock".into()))
    );
}

#[test]
fn builtin_registry_knows_every_layer() {
    let registry = LayerRegistry::<CpuPortableBackend>::with_builtin_layers();
    assert_eq!(
        registry.class_names(),
        vec![
            "DecoderBlock",
            "Embedding",
            "FeedForward",
            "Gelu",
            "LayerNormalization",
            "Linear",
            "SelfAttention",
            "TiedEmbeddingsTransposed",
        ]
    );
}

#[test]
fn weights_roundtrip_into_a_fresh_model() {
    for ignore_mask in [true, false] {
        let config = small_config(ignore_mask, false);
        let model = create_model(cpu_backend(), &config).unwrap();
        let path = temp_path(&format!("weights-{ignore_mask}"));
        model.save_weights(&path).unwrap();

        let mut fresh = create_model(cpu_backend(), &config).unwrap();
        fresh.load_weights(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_same_parameters(&model, &fresh);
    }
}

#[test]
fn weights_from_another_architecture_are_rejected() {
    let source = create_model(cpu_backend(), &small_config(false, false)).unwrap();
    let path = temp_path("weights-mismatch");
    source.save_weights(&path).unwrap();

    let mut tied = create_model(cpu_backend(), &small_config(false, true)).unwrap();
    let before = tied.named_parameters().unwrap();
    let err = tied.load_weights(&path).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ModelError>(),
        Some(&ModelError::UnexpectedParameter("head.weight".into()))
    );

    let wider = ModelConfig {
        d_hid: 14,
        ..small_config(false, false)
    };
    let mut wider = create_model(cpu_backend(), &wider).unwrap();
    let err = wider.load_weights(&path).unwrap_err();
    std::fs::remove_file(&path).unwrap();
    assert!(matches!(
        err.downcast_ref::<ModelError>(),
        Some(ModelError::ShapeMismatch { .. })
    ));

    for ((name, old), (_, new)) in before.iter().zip(tied.named_parameters().unwrap().iter()) {
        assert!(old.bitwise_eq(new), "{name} was partially overwritten");
    }
}

#[test]
fn foreign_files_are_not_checkpoints() {
    let path = temp_path("foreign");
    std::fs::write(&path, b"definitely not a checkpoint").unwrap();
    let registry = LayerRegistry::with_builtin_layers();
    let result = CheckpointLoader::load(&path, cpu_backend(), &registry);
    std::fs::remove_file(&path).unwrap();
    assert!(result.is_err());
}

#[test]
fn corrupt_lengths_fail_without_allocating() {
    let path = temp_path("corrupt");
    let model = create_model(cpu_backend(), &small_config(false, true)).unwrap();
    CheckpointSaver::save(&path, &model).unwrap();
    let bytes = std::fs::read(&path).unwrap();

    // Header length field sits after the magic and version.
    let mut huge_header = bytes.clone();
    huge_header[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
    std::fs::write(&path, &huge_header).unwrap();
    let header_result = CheckpointReader::open(&path);

    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
    let truncated_result = CheckpointReader::open(&path);
    std::fs::remove_file(&path).unwrap();

    let err = header_result.err().expect("oversized header length accepted");
    assert!(format!("{err:#}").contains("truncated"), "{err:#}");
    assert!(truncated_result.is_err());
}
