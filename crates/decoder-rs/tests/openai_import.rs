use std::sync::Arc;

use decoder_rs::model::{
    load_openai_model_with_config, openai_tensor_names, OpenAiCheckpoint, OpenAiConfig,
    OpenAiLoadOptions, PretrainedSource,
};
use decoder_rs::tensor::Tensor;
use decoder_rs::{ModelError, TokenBatch};
use decoder_rs_backend_ref_cpu::CpuPortableBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn cpu_backend() -> Arc<CpuPortableBackend> {
    Arc::new(CpuPortableBackend::new())
}

fn small_openai() -> OpenAiConfig {
    OpenAiConfig {
        n_vocab: 34,
        n_special: 3,
        n_ctx: 24,
        n_embd: 12,
        n_head: 3,
        n_layer: 2,
        d_hid: 13,
        ..OpenAiConfig::default()
    }
}

fn array_shape(name: &str) -> Vec<usize> {
    match name.rsplit('/').take(3).collect::<Vec<_>>().as_slice() {
        ["pos_emb", ..] => vec![24, 12],
        ["tok_emb", ..] => vec![34, 12],
        ["w", "c_attn", ..] => vec![1, 12, 36],
        ["b", "c_attn", ..] => vec![36],
        ["w", "c_fc", ..] => vec![1, 12, 13],
        ["b", "c_fc", ..] => vec![13],
        ["w", "c_proj", "mlp"] => vec![1, 13, 12],
        ["w", "c_proj", ..] => vec![1, 12, 12],
        _ => vec![12],
    }
}

fn checkpoint(seed: u64) -> OpenAiCheckpoint {
    let config = small_openai();
    let mut rng = StdRng::seed_from_u64(seed);
    let arrays = openai_tensor_names(&config)
        .iter()
        .map(|name| Tensor::randn(array_shape(name), 0.1, &mut rng))
        .collect();
    OpenAiCheckpoint::from_ordered(&config, arrays).unwrap()
}

fn debug_options() -> OpenAiLoadOptions {
    OpenAiLoadOptions {
        debug: true,
        ..OpenAiLoadOptions::default()
    }
}

fn load_error(source: &mut OpenAiCheckpoint) -> ModelError {
    let err = load_openai_model_with_config(cpu_backend(), source, &small_openai(), debug_options())
        .unwrap_err();
    err.downcast_ref::<ModelError>()
        .cloned()
        .unwrap_or_else(|| panic!("expected a ModelError, got {err:#}"))
}

#[test]
fn published_arrays_land_in_the_right_parameters() {
    let mut source = checkpoint(1);
    let model = load_openai_model_with_config(
        cpu_backend(),
        &mut source,
        &small_openai(),
        debug_options(),
    )
    .unwrap();
    let params: std::collections::HashMap<String, Tensor> =
        model.named_parameters().unwrap().into_iter().collect();

    let tok = source.fetch("model/tok_emb").unwrap();
    let table = &params["tok_embeddings.weight"];
    assert_eq!(table.shape().dims(), &[37, 12]);
    assert_eq!(&table.data()[..34 * 12], tok.data());

    let pos = source.fetch("model/pos_emb").unwrap();
    assert!(params["pos_embeddings.weight"].bitwise_eq(&pos));

    let c_attn = source.fetch("model/h1/attn/c_attn/w").unwrap();
    let weight = &params["blocks.1.attention.c_attn.weight"];
    assert_eq!(weight.shape().dims(), &[12, 36]);
    assert_eq!(weight.data(), c_attn.data());

    let c_proj = source.fetch("model/h0/mlp/c_proj/b").unwrap();
    assert!(params["blocks.0.feed_forward.c_proj.bias"].bitwise_eq(&c_proj));
    let gain = source.fetch("model/h1/ln_2/g").unwrap();
    assert!(params["blocks.1.ln_2.gain"].bitwise_eq(&gain));

    assert!(model.is_tied());
    assert!(model.config().use_one_embedding_dropout);
}

#[test]
fn debug_import_is_reproducible() {
    let batch = TokenBatch::new(vec![vec![0, 35, 36, 12]]);
    let run = || {
        let model = load_openai_model_with_config(
            cpu_backend(),
            &mut checkpoint(4),
            &small_openai(),
            debug_options(),
        )
        .unwrap();
        model.forward(&batch).unwrap()
    };
    assert!(run().logits.bitwise_eq(&run().logits));
}

#[test]
fn wrong_shape_names_the_array() {
    let mut source = checkpoint(2);
    source.insert("model/h1/ln_1/g", Tensor::ones([13]));
    assert_eq!(
        load_error(&mut source),
        ModelError::ShapeMismatch {
            parameter: "model/h1/ln_1/g".into(),
            expected: vec![12],
            actual: vec![13],
        }
    );
}

#[test]
fn missing_array_is_reported() {
    let config = small_openai();
    let mut rng = StdRng::seed_from_u64(3);
    let mut source = OpenAiCheckpoint::new();
    for name in openai_tensor_names(&config) {
        if name != "model/h0/mlp/c_fc/b" {
            source.insert(name.clone(), Tensor::randn(array_shape(&name), 0.1, &mut rng));
        }
    }
    assert_eq!(
        load_error(&mut source),
        ModelError::MissingParameter("model/h0/mlp/c_fc/b".into())
    );
}

#[test]
fn untied_import_adds_a_fresh_head() {
    let config = OpenAiConfig {
        use_tied_decoder: false,
        ..small_openai()
    };
    let model =
        load_openai_model_with_config(cpu_backend(), &mut checkpoint(5), &config, debug_options())
            .unwrap();
    assert!(!model.is_tied());
    let outputs = model.forward(&TokenBatch::new(vec![vec![1, 2, 3]])).unwrap();
    assert_eq!(outputs.logits.shape().dims(), &[1, 3, 37]);
}

#[test]
fn config_json_overrides_defaults() {
    let config = OpenAiConfig::from_json_str(r#"{"n_layer": 2, "n_ctx": 24}"#).unwrap();
    assert_eq!(config.n_layer, 2);
    assert_eq!(config.n_ctx, 24);
    assert_eq!(config.n_embd, 768);
    assert!(OpenAiConfig::from_json_str(r#"{"n_layer": "two"}"#).is_err());
}
