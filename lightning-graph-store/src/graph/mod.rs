//! Read-through, write-back coordination of the embedded cache, the remote
//! cache and the authoritative source.
//!
//! Lookups try the embedded cache, then the remote cache, then the source,
//! stopping at the first tier with a complete answer. Writes go to every
//! configured cache, each one conditioned on what was read from it.

mod channels;
mod edges;
mod nodes;

use std::sync::Arc;

use log::*;

use crate::config::StoreConfig;
use crate::database::embedded::EmbeddedDatabase;
use crate::database::remote::{DocumentStore, RemoteTables};
use crate::keys::Network;
use crate::source::GraphSource;
use crate::value::Item;
use crate::write::{Change, Changes};
use crate::Error;

/// The channel graph store
pub struct GraphStore {
    embedded: Option<Arc<EmbeddedDatabase>>,
    remote: Option<RemoteTables>,
    source: Option<Arc<dyn GraphSource>>,
    config: StoreConfig,
}

impl GraphStore {
    /// A store with no backends, add them with the `with_*` methods
    pub fn new(config: StoreConfig) -> Self {
        GraphStore { embedded: None, remote: None, source: None, config }
    }

    pub fn with_embedded(mut self, db: Arc<EmbeddedDatabase>) -> Self {
        self.embedded = Some(db);
        self
    }

    /// Use a remote document store, with tables named after the configured prefix
    pub fn with_remote(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.remote = Some(RemoteTables::new(store, &self.config.table_prefix));
        self
    }

    pub fn with_source(mut self, source: Arc<dyn GraphSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn network(&self) -> Network {
        self.config.network
    }

    fn require_cache(&self) -> Result<(), Error> {
        if self.embedded.is_none() && self.remote.is_none() {
            return Err(Error::NotConfigured("embedded or remote cache"));
        }
        Ok(())
    }

    fn require_embedded(&self) -> Result<&Arc<EmbeddedDatabase>, Error> {
        self.embedded.as_ref().ok_or(Error::NotConfigured("embedded cache"))
    }

    fn require_source(&self) -> Result<&Arc<dyn GraphSource>, Error> {
        self.source.as_ref().ok_or(Error::NotConfigured("graph source"))
    }
}

/// `Set` changes for every attribute of an item, except the key attributes
fn set_all(item: &Item, keys: &[&str]) -> Changes {
    item.iter()
        .filter(|(attr, _)| !keys.contains(&attr.as_str()))
        .map(|(attr, value)| (attr.clone(), Change::Set(value.clone())))
        .collect()
}

/// Treat a lost race as a no-op
fn ignore_conflict<T>(res: Result<T, Error>, what: &str) -> Result<Option<T>, Error> {
    match res {
        Ok(value) => Ok(Some(value)),
        Err(Error::Conflict(e)) => {
            debug!("{}: {}", what, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Cache maintenance that must not fail the read it happens in
fn log_failure<T>(res: Result<T, Error>, what: &str) {
    if let Err(e) = res {
        warn!("{} failed: {}", what, e);
    }
}
