//! Backend capability trait, name-based registry, and process-wide session.

pub mod registry;
pub mod session;
pub mod spec;

pub use registry::DynBackend;
pub use spec::{BackendError, BackendResult, PortableBackend};
