use std::collections::HashMap;
use std::sync::Arc;

use decoder_rs::backend::spec::MatmulSpec;
use decoder_rs::ops::functional::{self, Phase};
use decoder_rs::tensor::{DeviceTensor, Tensor};
use decoder_rs::{create_model, ModelConfig, ModelError, TokenBatch, TransformerModel};
use decoder_rs_backend_ref_cpu::CpuPortableBackend;

fn cpu_backend() -> Arc<CpuPortableBackend> {
    Arc::new(CpuPortableBackend::new())
}

fn small_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 37,
        num_heads: 3,
        num_layers: 2,
        embedding_dim: 12,
        d_hid: 13,
        max_len: 24,
        debug: true,
        ..ModelConfig::default()
    }
}

fn model_error(err: &anyhow::Error) -> ModelError {
    err.downcast_ref::<ModelError>()
        .cloned()
        .unwrap_or_else(|| panic!("expected a ModelError, got {err:#}"))
}

fn small_model(config: &ModelConfig) -> TransformerModel<CpuPortableBackend> {
    create_model(cpu_backend(), config).unwrap()
}

#[test]
fn outputs_follow_batch_and_sequence_shape() {
    let model = small_model(&small_config());
    for (batch, seq) in [(1, 1), (3, 7), (2, 24)] {
        let rows = (0..batch)
            .map(|b| (0..seq).map(|s| (b * 5 + s) % 37).collect())
            .collect();
        let outputs = model.forward(&TokenBatch::new(rows)).unwrap();
        assert_eq!(outputs.hidden.shape().dims(), &[batch, seq, 12]);
        assert_eq!(outputs.logits.shape().dims(), &[batch, seq, 37]);
    }
}

#[test]
fn batch_rows_are_independent() {
    let model = small_model(&small_config());
    let a = vec![3, 1, 4, 1, 5];
    let b = vec![9, 2, 6, 5, 3];
    let pair = model
        .forward(&TokenBatch::new(vec![a.clone(), b]))
        .unwrap();
    let single = model.forward(&TokenBatch::new(vec![a])).unwrap();
    assert_eq!(&pair.logits.data()[..5 * 37], single.logits.data());
}

#[test]
fn debug_models_are_reproducible() {
    let config = small_config();
    let batch = TokenBatch::debug_probe(&config);
    let first = small_model(&config).forward(&batch).unwrap();
    let second = small_model(&config).forward(&batch).unwrap();
    assert!(first.logits.bitwise_eq(&second.logits));

    let reseeded = ModelConfig {
        seed: Some(1234),
        ..config
    };
    let third = small_model(&reseeded).forward(&batch).unwrap();
    assert!(!first.logits.bitwise_eq(&third.logits));
}

#[test]
fn explicit_seed_pins_initialization_without_debug() {
    let config = ModelConfig {
        debug: false,
        seed: Some(77),
        ..small_config()
    };
    let batch = TokenBatch::new(vec![vec![3, 1, 4, 1, 5]]);
    let first = small_model(&config).forward(&batch).unwrap();
    let second = small_model(&config).forward(&batch).unwrap();
    assert!(first.logits.bitwise_eq(&second.logits));
}

#[test]
fn ignore_mask_lets_early_positions_see_later_tokens() {
    let masked = small_config();
    let unmasked = ModelConfig {
        ignore_mask: true,
        ..small_config()
    };
    for (config, prefix_stable) in [(masked, true), (unmasked, false)] {
        let model = small_model(&config);
        let short = model.forward(&TokenBatch::new(vec![vec![7, 8]])).unwrap();
        let long = model.forward(&TokenBatch::new(vec![vec![7, 8, 30, 2]])).unwrap();
        let diff = short.hidden.data()[..12]
            .iter()
            .zip(&long.hidden.data()[..12])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert_eq!(diff < 1e-6, prefix_stable, "ignore_mask={}", config.ignore_mask);
    }
}

#[test]
fn tied_head_projects_onto_token_table() {
    let model = small_model(&small_config());
    assert!(model.is_tied());
    let outputs = model.forward(&TokenBatch::new(vec![vec![0, 1, 2]])).unwrap();

    let backend = model.backend();
    let hidden = DeviceTensor::from_host(Arc::clone(&backend), outputs.hidden.reshape([3, 12]).unwrap())
        .unwrap();
    let expected = functional::matmul(
        backend.as_ref(),
        &hidden,
        &model.tok_embeddings.weight,
        MatmulSpec::transposed_rhs(),
    )
    .unwrap();
    assert_eq!(expected.host().data(), outputs.logits.data());

    let names: Vec<String> = model
        .named_parameters()
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert!(!names.iter().any(|name| name.starts_with("head")));
}

#[test]
fn tied_head_follows_token_table_updates() {
    let mut model = small_model(&small_config());
    let batch = TokenBatch::new(vec![vec![4, 0, 9, 36]]);
    let before = model.forward(&batch).unwrap();

    let table: Vec<f32> = (0..37 * 12).map(|i| (i % 7) as f32 * 0.01 - 0.03).collect();
    model
        .assign_parameter("tok_embeddings.weight", Tensor::from_vec([37, 12], table).unwrap())
        .unwrap();
    let after = model.forward(&batch).unwrap();
    assert_ne!(before.logits.data(), after.logits.data());

    let backend = model.backend();
    let hidden = DeviceTensor::from_host(Arc::clone(&backend), after.hidden.reshape([4, 12]).unwrap())
        .unwrap();
    let expected = functional::matmul(
        backend.as_ref(),
        &hidden,
        &model.tok_embeddings.weight,
        MatmulSpec::transposed_rhs(),
    )
    .unwrap();
    assert_eq!(expected.host().data(), after.logits.data());
}

#[test]
fn parameter_counts_match_architecture() {
    let tied = small_model(&small_config());
    assert_eq!(tied.parameter_count().unwrap(), 2750);
    let untied = small_model(&ModelConfig {
        use_tied_decoder: false,
        ..small_config()
    });
    assert_eq!(untied.parameter_count().unwrap(), 2750 + 12 * 37);
    let biased = small_model(&ModelConfig {
        use_decoder_bias: true,
        ..small_config()
    });
    assert_eq!(biased.parameter_count().unwrap(), 2750 + 37);
}

#[test]
fn parameter_names_are_hierarchical() {
    let model = small_model(&ModelConfig {
        use_tied_decoder: false,
        ..small_config()
    });
    let names: Vec<String> = model
        .named_parameters()
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    for expected in [
        "tok_embeddings.weight",
        "pos_embeddings.weight",
        "blocks.0.attention.c_attn.weight",
        "blocks.0.attention.c_proj.bias",
        "blocks.1.ln_1.gain",
        "blocks.1.feed_forward.c_fc.weight",
        "blocks.1.ln_2.bias",
        "head.weight",
    ] {
        assert!(names.iter().any(|name| name == expected), "missing {expected}");
    }
}

#[test]
fn training_phase_is_seeded_and_differs_from_inference() {
    let model = small_model(&small_config());
    let batch = TokenBatch::debug_probe(model.config());
    let inference = model.forward(&batch).unwrap();
    let a = model
        .forward_with_phase(&batch, Phase::Training { seed: 5 })
        .unwrap();
    let b = model
        .forward_with_phase(&batch, Phase::Training { seed: 5 })
        .unwrap();
    assert!(a.logits.bitwise_eq(&b.logits));
    assert!(!a.logits.bitwise_eq(&inference.logits));
}

#[test]
fn invalid_configs_are_configuration_errors() {
    for config in [
        ModelConfig {
            num_heads: 5,
            ..small_config()
        },
        ModelConfig {
            vocab_size: 0,
            ..small_config()
        },
        ModelConfig {
            embedding_dropout: 1.5,
            ..small_config()
        },
    ] {
        let err = create_model(cpu_backend(), &config).unwrap_err();
        assert!(matches!(model_error(&err), ModelError::Configuration(_)));
    }
}

#[test]
fn malformed_batches_are_invalid_input() {
    let model = small_model(&small_config());
    for batch in [
        TokenBatch::new(vec![]),
        TokenBatch::new(vec![vec![1, 2], vec![1]]),
        TokenBatch::new(vec![vec![37]]),
        TokenBatch::new(vec![vec![0; 25]]),
    ] {
        let err = model.forward(&batch).unwrap_err();
        assert!(matches!(model_error(&err), ModelError::InvalidInput(_)));
    }
}

#[test]
fn explicit_positions_are_honored() {
    let model = small_model(&small_config());
    let implicit = model.forward(&TokenBatch::new(vec![vec![5, 6, 7]])).unwrap();
    let explicit = model
        .forward(&TokenBatch::with_positions(
            vec![vec![5, 6, 7]],
            vec![vec![0, 1, 2]],
        ))
        .unwrap();
    assert!(implicit.logits.bitwise_eq(&explicit.logits));
    let shifted = model
        .forward(&TokenBatch::with_positions(
            vec![vec![5, 6, 7]],
            vec![vec![10, 11, 12]],
        ))
        .unwrap();
    assert!(!implicit.logits.bitwise_eq(&shifted.logits));
}

#[test]
fn parameter_assignment_checks_names_and_shapes() {
    let mut model = small_model(&small_config());
    let err = model
        .assign_parameter("blocks.0.ln_1.gain", Tensor::ones([13]))
        .unwrap_err();
    match model_error(&err) {
        ModelError::ShapeMismatch {
            parameter,
            expected,
            actual,
        } => {
            assert_eq!(parameter, "blocks.0.ln_1.gain");
            assert_eq!(expected, vec![12]);
            assert_eq!(actual, vec![13]);
        }
        other => panic!("unexpected {other:?}"),
    }
    let err = model
        .assign_parameter("blocks.9.ln_1.gain", Tensor::ones([12]))
        .unwrap_err();
    assert!(matches!(model_error(&err), ModelError::UnexpectedParameter(_)));

    model
        .assign_parameter("blocks.0.ln_1.gain", Tensor::full([12], 2.0))
        .unwrap();
    let gains: HashMap<String, Tensor> = model.named_parameters().unwrap().into_iter().collect();
    assert!(gains["blocks.0.ln_1.gain"].bitwise_eq(&Tensor::full([12], 2.0)));
}

#[test]
fn bulk_assignment_is_all_or_nothing() {
    let mut model = small_model(&small_config());
    let before: HashMap<String, Tensor> = model.named_parameters().unwrap().into_iter().collect();

    let mut missing = before.clone();
    missing.remove("pos_embeddings.weight");
    let err = model.assign_parameters(missing).unwrap_err();
    assert_eq!(
        model_error(&err),
        ModelError::MissingParameter("pos_embeddings.weight".into())
    );

    let mut extra: HashMap<String, Tensor> = before
        .iter()
        .map(|(name, tensor)| (name.clone(), Tensor::zeros(tensor.shape().clone())))
        .collect();
    extra.insert("head.weight".into(), Tensor::zeros([12, 37]));
    let err = model.assign_parameters(extra).unwrap_err();
    assert_eq!(
        model_error(&err),
        ModelError::UnexpectedParameter("head.weight".into())
    );

    let after: HashMap<String, Tensor> = model.named_parameters().unwrap().into_iter().collect();
    for (name, tensor) in &before {
        assert!(after[name].bitwise_eq(tensor), "{name} changed");
    }
}
