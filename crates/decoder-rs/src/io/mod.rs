pub mod tensor_archive;

pub use tensor_archive::{TensorArchive, TensorArchiveEntry, TensorArchiveReader};
