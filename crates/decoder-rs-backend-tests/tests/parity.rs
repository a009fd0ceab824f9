//! Every backend must produce bit-identical outputs for the same seeded model.

use anyhow::Result;
use decoder_rs::backend::registry;
use decoder_rs::backend::session;
use decoder_rs::backend::spec::PortableBackend;
use decoder_rs::model::{load_openai_model_with_config, OpenAiLoadOptions};
use decoder_rs::{create_model, ModelOutputs, TokenBatch};
use decoder_rs_backend_rayon::{RayonPortableBackend, RayonRows};
use decoder_rs_backend_tests::fixtures::{
    small_config, small_openai_config, synthetic_openai_checkpoint,
};

const EAGER_RAYON: &str = "rayon-eager";

fn backends() -> Vec<&'static str> {
    decoder_rs_backend_ref_cpu::register_cpu_backend();
    decoder_rs_backend_rayon::register_rayon_backend();
    registry::register_portable_backend(EAGER_RAYON, || {
        RayonPortableBackend::with_executor(RayonRows::with_threshold(0))
    });
    vec!["cpu", "rayon", EAGER_RAYON]
}

fn assert_all_equal(results: &[(&str, ModelOutputs)]) {
    let (first_name, first) = &results[0];
    for (name, outputs) in &results[1..] {
        assert!(
            first.hidden.bitwise_eq(&outputs.hidden),
            "hidden states differ between {first_name} and {name}"
        );
        assert!(
            first.logits.bitwise_eq(&outputs.logits),
            "logits differ between {first_name} and {name}"
        );
    }
}

#[test]
fn random_models_agree_across_backends() {
    for ignore_mask in [true, false] {
        let config = small_config(ignore_mask);
        let batch = TokenBatch::debug_probe(&config);
        let results: Vec<(&str, ModelOutputs)> = backends()
            .into_iter()
            .map(|name| {
                let outputs = session::with_backend(name, |backend| {
                    create_model(backend, &config)?.forward(&batch)
                })
                .unwrap();
                (name, outputs)
            })
            .collect();
        assert_all_equal(&results);
    }
}

#[test]
fn imported_models_agree_across_backends() {
    let openai = small_openai_config();
    for ignore_mask in [true, false] {
        for use_one_embedding_dropout in [true, false] {
            let options = OpenAiLoadOptions {
                ignore_mask,
                use_one_embedding_dropout,
                debug: true,
            };
            let config = openai.model_config(&options);
            let batch = TokenBatch::debug_probe(&config);
            let results: Vec<(&str, ModelOutputs)> = backends()
                .into_iter()
                .map(|name| {
                    let outputs = session::with_backend(name, |backend| -> Result<ModelOutputs> {
                        let mut checkpoint = synthetic_openai_checkpoint(&openai, 29)?;
                        let model = load_openai_model_with_config(
                            backend,
                            &mut checkpoint,
                            &openai,
                            options,
                        )?;
                        model.forward(&batch)
                    })
                    .unwrap();
                    (name, outputs)
                })
                .collect();
            assert_all_equal(&results);
        }
    }
}

#[test]
fn unknown_backend_is_reported_with_alternatives() {
    backends();
    let err = session::with_backend("tpu", |_| Ok(())).unwrap_err();
    match err.downcast_ref::<decoder_rs::ModelError>() {
        Some(decoder_rs::ModelError::BackendUnavailable { name, available }) => {
            assert_eq!(name, "tpu");
            assert!(available.iter().any(|b| b == "cpu"));
            assert!(available.iter().any(|b| b == "rayon"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn session_runs_on_the_requested_backend() {
    backends();
    let name = session::with_backend("rayon", |backend| {
        Ok(backend.backend_name().to_string())
    })
    .unwrap();
    assert_eq!(name, "rayon");
}
