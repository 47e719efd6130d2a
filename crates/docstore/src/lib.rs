// vellum-docstore: authoritative document storage and cold-doc archival.
//
// The updater flushes durable snapshots through [`Docstore`] and loads
// them back on cache misses. [`archive::ArchiveBridge`] offloads cold
// document content to an object store and restores it on demand.

pub mod archive;
pub mod error;
pub mod objstore;
pub mod store;

pub use archive::{ArchiveBridge, ArchiveLimits};
pub use error::DocstoreError;
pub use objstore::{FsObjectStore, MemoryObjectStore, ObjectStore, ObjectStoreError};
pub use store::{Docstore, FlushedDoc, UpsertDoc};
