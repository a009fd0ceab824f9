use std::sync::Arc;

use decoder_rs::backend::spec::{ElementwiseBinaryOp, MatmulSpec};
use decoder_rs::ops::functional::{
    self, AttentionConfig, CausalMask, ForwardContext,
};
use decoder_rs::tensor::{DeviceTensor, Tensor};
use decoder_rs::ModelError;
use decoder_rs_backend_ref_cpu::CpuPortableBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn cpu_backend() -> Arc<CpuPortableBackend> {
    Arc::new(CpuPortableBackend::new())
}

fn device(backend: &Arc<CpuPortableBackend>, tensor: Tensor) -> DeviceTensor<CpuPortableBackend> {
    DeviceTensor::from_host(Arc::clone(backend), tensor).unwrap()
}

#[test]
fn causal_attention_weights_are_lower_triangular() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(1);
    let qkv = device(&backend, Tensor::randn([2, 5, 18], 1.0, &mut rng));
    let config = AttentionConfig {
        num_heads: 3,
        ignore_mask: false,
        dropout: 0.0,
    };
    let out = functional::attention(backend.as_ref(), &qkv, &config, &mut ForwardContext::inference())
        .unwrap();
    assert_eq!(out.output.shape().dims(), &[2, 5, 6]);
    assert_eq!(out.weights.shape().dims(), &[2, 3, 5, 5]);
    for row in out.weights.host().data().chunks(5).enumerate() {
        let (idx, weights) = row;
        let query = idx % 5;
        assert!(weights[query + 1..].iter().all(|&w| w == 0.0));
        let total: f32 = weights.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
    }
}

#[test]
fn unmasked_attention_sees_future_keys() {
    let backend = cpu_backend();
    let mut rng = StdRng::seed_from_u64(2);
    let qkv = device(&backend, Tensor::randn([1, 4, 6], 1.0, &mut rng));
    let config = AttentionConfig {
        num_heads: 1,
        ignore_mask: true,
        dropout: 0.0,
    };
    let out = functional::attention(backend.as_ref(), &qkv, &config, &mut ForwardContext::inference())
        .unwrap();
    let first_row = &out.weights.host().data()[..4];
    assert!(first_row[1..].iter().all(|&w| w > 0.0));
}

#[test]
fn causal_mask_keeps_past_and_penalizes_future() {
    let backend = cpu_backend();
    let mask = CausalMask::new(Arc::clone(&backend), 3).unwrap();
    let scores = device(&backend, Tensor::full([1, 3, 3], 2.0));
    let masked = mask.apply(backend.as_ref(), &scores).unwrap();
    assert_eq!(
        masked.host().data(),
        &[2.0, -1e9, -1e9, 2.0, 2.0, -1e9, 2.0, 2.0, 2.0]
    );
}

#[test]
fn head_split_and_merge_are_inverse() {
    let backend = cpu_backend();
    let values: Vec<f32> = (0..2 * 3 * 8).map(|v| v as f32).collect();
    let x = device(&backend, Tensor::from_vec([2, 3, 8], values.clone()).unwrap());
    let heads = functional::split_heads(backend.as_ref(), &x, 4).unwrap();
    assert_eq!(heads.shape().dims(), &[2, 4, 3, 2]);
    // head 1 of batch 0, position 0 holds features 2..4
    assert_eq!(&heads.host().data()[6..8], &[2.0, 3.0]);
    let merged = functional::merge_heads(backend.as_ref(), &heads).unwrap();
    assert_eq!(merged.host().data(), values.as_slice());
}

#[test]
fn dropout_is_identity_at_inference_and_seeded_in_training() {
    let backend = cpu_backend();
    let x = device(&backend, Tensor::ones([64, 16]));
    let same = functional::dropout(backend.as_ref(), &x, 0.5, &mut ForwardContext::inference())
        .unwrap();
    assert!(same.host().bitwise_eq(x.host()));

    let a = functional::dropout(backend.as_ref(), &x, 0.5, &mut ForwardContext::training(9)).unwrap();
    let b = functional::dropout(backend.as_ref(), &x, 0.5, &mut ForwardContext::training(9)).unwrap();
    assert!(a.host().bitwise_eq(b.host()));
    assert!(a.host().data().iter().all(|&v| v == 0.0 || v == 2.0));
    let kept = a.host().data().iter().filter(|&&v| v != 0.0).count();
    assert!(kept > 300 && kept < 724, "kept {kept} of 1024");

    assert!(functional::dropout(backend.as_ref(), &x, 1.0, &mut ForwardContext::inference()).is_err());
}

#[test]
fn embedding_lookup_rejects_out_of_range_ids() {
    let backend = cpu_backend();
    let table = device(&backend, Tensor::from_vec([3, 2], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap());
    let rows = functional::embedding_lookup(backend.as_ref(), &table, &[2, 1], &[1, 2]).unwrap();
    assert_eq!(rows.shape().dims(), &[1, 2, 2]);
    assert_eq!(rows.host().data(), &[4.0, 5.0, 2.0, 3.0]);

    let err = functional::embedding_lookup(backend.as_ref(), &table, &[3], &[1]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ModelError>(),
        Some(ModelError::InvalidInput(_))
    ));
}

#[test]
fn bias_and_matmul_validate_operands() {
    let backend = cpu_backend();
    let x = device(&backend, Tensor::ones([2, 3]));
    let bias = device(&backend, Tensor::from_vec([3], vec![1.0, 2.0, 3.0]).unwrap());
    let biased = functional::add_bias(backend.as_ref(), &x, &bias).unwrap();
    assert_eq!(biased.host().data(), &[2.0, 3.0, 4.0, 2.0, 3.0, 4.0]);

    let wrong = device(&backend, Tensor::ones([2]));
    assert!(functional::add_bias(backend.as_ref(), &x, &wrong).is_err());
    assert!(functional::matmul(backend.as_ref(), &x, &x, MatmulSpec::default()).is_err());
    let gram = functional::matmul(backend.as_ref(), &x, &x, MatmulSpec::transposed_rhs()).unwrap();
    assert_eq!(gram.host().data(), &[3.0, 3.0, 3.0, 3.0]);

    let halved = functional::scalar(backend.as_ref(), ElementwiseBinaryOp::Div, &biased, 2.0).unwrap();
    assert_eq!(halved.host().data()[0], 1.0);
}

#[test]
fn tensors_from_different_backend_instances_do_not_mix() {
    let a = device(&cpu_backend(), Tensor::ones([2, 2]));
    let b = device(&cpu_backend(), Tensor::ones([2, 2]));
    assert!(!a.same_backend(&b));
    let backend = a.backend();
    assert!(functional::matmul(backend.as_ref(), &a, &b, MatmulSpec::default()).is_err());
}

#[test]
fn reshape_copies_values_into_the_new_shape() {
    let backend = cpu_backend();
    let x = device(&backend, Tensor::from_vec([2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap());
    let y = x.reshape([3, 2]).unwrap();
    assert_eq!(y.shape().dims(), &[3, 2]);
    assert_eq!(y.host().data(), x.host().data());
    assert!(y.same_backend(&x));
    assert_eq!(x.shape().dims(), &[2, 3]);
    assert!(x.reshape([4, 2]).is_err());
}
