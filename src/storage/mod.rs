pub mod reference_store;

pub use reference_store::{FilesystemReferenceStore, ReferenceStore};
