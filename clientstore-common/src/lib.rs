pub mod backend;
pub mod error;
pub mod keys;

pub use backend::{list_all, ListOptions, ListingEntry, StorageBackend, UploadSource};
pub use error::{ErrorKind, StorageError};
