//! Store adapters: an embedded ordered key-value store and remote
//! partitioned document stores.

pub mod embedded;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod remote;

pub use embedded::{EmbeddedDatabase, EmbeddedRegistry, Table};
pub use memory::MemoryDocumentStore;
pub use remote::{catalog, DocumentStore, RemoteTable, RemoteTables};
