//! Shared conformance suite for decoder-rs backends.
//!
//! Backend crates instantiate the suite from an integration test:
//!
//! ```ignore
//! decoder_rs_backend_tests::define_backend_tests!(cpu_backend, || {
//!     std::sync::Arc::new(decoder_rs_backend_ref_cpu::CpuPortableBackend::new())
//! });
//! ```

pub mod fixtures;
pub mod smoke;

#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            #[allow(unused_imports)]
            use std::sync::Arc;

            use $crate::smoke;

            macro_rules! smoke_test {
                ($name:ident) => {
                    #[test]
                    fn $name() {
                        let backend = ($backend_ctor)();
                        smoke::$name(&backend);
                    }
                };
            }

            smoke_test!(matmul_matches_expected);
            smoke_test!(batched_matmul_matches_per_batch);
            smoke_test!(kernels_reject_bad_operands);
            smoke_test!(elementwise_ops_apply_per_element);
            smoke_test!(softmax_and_layer_norm_normalize_rows);
            smoke_test!(gelu_matches_closed_form);
            smoke_test!(model_forward_shapes);
            smoke_test!(causal_prefix_is_stable);
            smoke_test!(checkpoint_roundtrip_is_bitwise);
            smoke_test!(openai_import_keeps_published_rows);
        }
    };
}
