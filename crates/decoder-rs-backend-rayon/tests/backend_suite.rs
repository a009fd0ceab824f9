use decoder_rs_backend_rayon::{RayonPortableBackend, RayonRows};

// Threshold 0 so even the small suite tensors go through the thread pool.
decoder_rs_backend_tests::define_backend_tests!(rayon_backend, || Arc::new(
    RayonPortableBackend::with_executor(RayonRows::with_threshold(0))
));

#[test]
fn linking_registers_rayon_backend() {
    decoder_rs_backend_rayon::register_rayon_backend();
    let backend = decoder_rs::backend::registry::create_backend("rayon").unwrap();
    assert_eq!(backend.backend_name(), "rayon");
}
