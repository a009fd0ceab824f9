//! Conformance checks every backend must pass. Each function panics on failure.

use std::path::PathBuf;
use std::sync::Arc;

use decoder_rs::backend::spec::{
    BackendError, ElementwiseBinaryOp, ElementwiseUnaryOp, MatmulSpec, PortableBackend,
    ReduceKind,
};
use decoder_rs::checkpoint::{CheckpointLoader, CheckpointSaver};
use decoder_rs::model::{load_openai_model_with_config, LayerRegistry, OpenAiLoadOptions};
use decoder_rs::ops::functional;
use decoder_rs::tensor::{DeviceTensor, Shape, Tensor};
use decoder_rs::{create_model, TokenBatch};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::fixtures::{small_config, small_openai_config, synthetic_openai_checkpoint};

fn device<B: PortableBackend + 'static>(backend: &Arc<B>, tensor: Tensor) -> DeviceTensor<B> {
    DeviceTensor::from_host(Arc::clone(backend), tensor).unwrap()
}

fn scratch_path<B: PortableBackend + 'static>(backend: &Arc<B>, tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "decoder-rs-{}-{tag}-{}.bin",
        backend.backend_name(),
        std::process::id()
    ))
}

pub fn matmul_matches_expected<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let a = Tensor::from_vec(Shape::new([2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let b = Tensor::from_vec(Shape::new([2, 2]), vec![5.0, 6.0, 7.0, 8.0]).unwrap();

    let result = functional::matmul(
        backend.as_ref(),
        &device(backend, a),
        &device(backend, b),
        MatmulSpec::default(),
    )
    .unwrap();
    assert_eq!(result.host().data(), &[19.0, 22.0, 43.0, 50.0]);
}

pub fn batched_matmul_matches_per_batch<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let mut rng = StdRng::seed_from_u64(3);
    let lhs = Tensor::randn([2, 3, 5], 1.0, &mut rng);
    let rhs = Tensor::randn([2, 4, 5], 1.0, &mut rng);
    let batched = backend
        .batched_matmul(&lhs, &rhs, MatmulSpec::transposed_rhs())
        .unwrap();
    assert_eq!(batched.shape().dims(), &[2, 3, 4]);

    for batch in 0..2 {
        let a = Tensor::from_vec([3, 5], lhs.data()[batch * 15..(batch + 1) * 15].to_vec()).unwrap();
        let b = Tensor::from_vec([4, 5], rhs.data()[batch * 20..(batch + 1) * 20].to_vec()).unwrap();
        let single = backend.matmul(&a, &b, MatmulSpec::transposed_rhs()).unwrap();
        assert_eq!(single.data(), &batched.data()[batch * 12..(batch + 1) * 12]);
    }
}

pub fn kernels_reject_bad_operands<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let a = Tensor::zeros([2, 3]);
    let b = Tensor::zeros([3, 2]);
    let shape_error = |result: Result<Tensor, BackendError>| {
        matches!(result, Err(BackendError::Shape { .. }))
    };
    assert!(shape_error(backend.elementwise_binary(ElementwiseBinaryOp::Add, &a, &b)));
    assert!(shape_error(backend.matmul(&a, &a, MatmulSpec::default())));
    assert!(shape_error(backend.permute(&a, &[0])));
    assert!(shape_error(backend.slice_last_axis(&a, 2, 2)));
    assert!(shape_error(backend.gather_rows(&a, &[2])));
}

pub fn elementwise_ops_apply_per_element<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let lhs = Tensor::from_vec([2, 3], vec![0.25, 1.0, 4.0, 2.25, 0.0, 9.0]).unwrap();
    let rhs = Tensor::from_vec([2, 3], vec![0.5, -1.0, 2.0, 3.0, 7.0, -0.5]).unwrap();

    for op in [
        ElementwiseUnaryOp::Neg,
        ElementwiseUnaryOp::Exp,
        ElementwiseUnaryOp::Tanh,
        ElementwiseUnaryOp::Sqrt,
    ] {
        let out = backend.elementwise_unary(op, &lhs).unwrap();
        assert_eq!(out.shape(), lhs.shape());
        for (&x, &y) in lhs.data().iter().zip(out.data()) {
            assert_eq!(y.to_bits(), op.apply(x).to_bits(), "{op:?}({x})");
        }
    }
    let exp = backend.elementwise_unary(ElementwiseUnaryOp::Exp, &lhs).unwrap();
    assert_eq!(exp.data()[4], 1.0);

    for op in [
        ElementwiseBinaryOp::Add,
        ElementwiseBinaryOp::Sub,
        ElementwiseBinaryOp::Mul,
        ElementwiseBinaryOp::Div,
    ] {
        let out = backend.elementwise_binary(op, &lhs, &rhs).unwrap();
        for ((&a, &b), &y) in lhs.data().iter().zip(rhs.data()).zip(out.data()) {
            assert_eq!(y.to_bits(), op.apply(a, b).to_bits(), "{op:?}({a}, {b})");
        }
    }
}

pub fn softmax_and_layer_norm_normalize_rows<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let mut rng = StdRng::seed_from_u64(5);
    let x = device(backend, Tensor::randn([4, 7], 3.0, &mut rng));

    let probs = functional::softmax_last_dim(backend.as_ref(), &x).unwrap();
    let sums = functional::reduce_last_axis(backend.as_ref(), ReduceKind::Sum, &probs).unwrap();
    assert_eq!(sums.shape().dims(), &[4, 1]);
    for &s in sums.host().data() {
        assert!((s - 1.0).abs() < 1e-5, "softmax row sums to {s}");
    }

    let gain = device(backend, Tensor::ones([7]));
    let bias = device(backend, Tensor::zeros([7]));
    let normed = functional::layer_norm(backend.as_ref(), &x, &gain, &bias, 1e-5).unwrap();
    for row in normed.host().data().chunks(7) {
        let mean = row.iter().sum::<f32>() / 7.0;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 7.0;
        assert!(mean.abs() < 1e-5, "row mean {mean}");
        assert!((var - 1.0).abs() < 1e-3, "row variance {var}");
    }
}

pub fn gelu_matches_closed_form<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let inputs = vec![-3.0f32, -1.0, -0.25, 0.0, 0.5, 1.0, 2.5];
    let x = device(backend, Tensor::from_vec([7], inputs.clone()).unwrap());
    let y = functional::gelu(backend.as_ref(), &x).unwrap();
    for (&v, &g) in inputs.iter().zip(y.host().data()) {
        let inner = (2.0f32 / std::f32::consts::PI).sqrt() * (v + 0.044715 * v * v * v);
        let expected = 0.5 * v * (1.0 + inner.tanh());
        assert!((g - expected).abs() < 1e-6, "gelu({v}) = {g}, expected {expected}");
    }
}

pub fn model_forward_shapes<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let config = small_config(false);
    let model = create_model(Arc::clone(backend), &config).unwrap();
    let batch = TokenBatch::new(vec![vec![1, 2, 3, 4, 5], vec![36, 0, 7, 7, 2]]);
    let outputs = model.forward(&batch).unwrap();
    assert_eq!(outputs.hidden.shape().dims(), &[2, 5, 12]);
    assert_eq!(outputs.logits.shape().dims(), &[2, 5, 37]);
    assert!(outputs.logits.data().iter().all(|v| v.is_finite()));
}

/// With the causal mask on, appending tokens never changes earlier positions.
pub fn causal_prefix_is_stable<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let config = small_config(false);
    let model = create_model(Arc::clone(backend), &config).unwrap();
    let full = model
        .forward(&TokenBatch::new(vec![vec![4, 8, 15, 16, 23]]))
        .unwrap();
    let prefix = model.forward(&TokenBatch::new(vec![vec![4, 8, 15]])).unwrap();
    let head = &full.logits.data()[..3 * 37];
    for (a, b) in head.iter().zip(prefix.logits.data()) {
        assert!((a - b).abs() < 1e-6);
    }
}

pub fn checkpoint_roundtrip_is_bitwise<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let mut config = small_config(true);
    config.use_tied_decoder = false;
    let model = create_model(Arc::clone(backend), &config).unwrap();
    let path = scratch_path(backend, "smoke-checkpoint");
    CheckpointSaver::save(&path, &model).unwrap();
    let registry = LayerRegistry::with_builtin_layers();
    let restored = CheckpointLoader::load(&path, Arc::clone(backend), &registry).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(restored.config(), model.config());
    let batch = TokenBatch::debug_probe(&config);
    let before = model.forward(&batch).unwrap();
    let after = restored.forward(&batch).unwrap();
    assert!(before.hidden.bitwise_eq(&after.hidden));
    assert!(before.logits.bitwise_eq(&after.logits));
}

pub fn openai_import_keeps_published_rows<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let openai = small_openai_config();
    let mut checkpoint = synthetic_openai_checkpoint(&openai, 17).unwrap();
    let published = decoder_rs::model::PretrainedSource::fetch(&mut checkpoint, "model/tok_emb").unwrap();
    let options = OpenAiLoadOptions {
        debug: true,
        ..OpenAiLoadOptions::default()
    };
    let model =
        load_openai_model_with_config(Arc::clone(backend), &mut checkpoint, &openai, options)
            .unwrap();

    let table = model.tok_embeddings.weight.host();
    assert_eq!(table.shape().dims(), &[37, 12]);
    assert_eq!(&table.data()[..34 * 12], published.data());

    let outputs = model.forward(&TokenBatch::new(vec![vec![0, 33, 36]])).unwrap();
    assert_eq!(outputs.logits.shape().dims(), &[1, 3, 37]);
}
