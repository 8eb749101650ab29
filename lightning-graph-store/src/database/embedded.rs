use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use log::*;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};

use crate::query::ScanPlan;
use crate::value::{decode_embedded, encode_embedded, Item};
use crate::write::{apply_changes, check_expect, check_fresh, Changes, Expect};
use crate::Error;

const REDB_FILE_NAME: &str = "graph.redb";

const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
const CHANNELS: TableDefinition<&str, &[u8]> = TableDefinition::new("channels");
const NODE_CHANNELS: TableDefinition<&str, &[u8]> = TableDefinition::new("node_channels");
const EDGE_ACTIVITY: TableDefinition<&str, &[u8]> = TableDefinition::new("edge_activity");
const CHANNEL_UPDATES: TableDefinition<&str, &[u8]> = TableDefinition::new("channel_updates");

/// Embedded database errors
#[derive(Debug, thiserror::Error)]
pub enum RedbError {
    #[error("transaction error: {0}")]
    RedbTransaction(#[from] ::redb::TransactionError),
    #[error("storage error: {0}")]
    RedbStorage(#[from] ::redb::StorageError),
    #[error("database error: {0}")]
    RedbDatabase(#[from] ::redb::DatabaseError),
    #[error("database error: {0}")]
    RedbTable(#[from] ::redb::TableError),
    #[error("database error: {0}")]
    RedbCommit(#[from] ::redb::CommitError),
}

impl From<::redb::TransactionError> for Error {
    fn from(e: ::redb::TransactionError) -> Self {
        Error::Redb(e.into())
    }
}

impl From<::redb::StorageError> for Error {
    fn from(e: ::redb::StorageError) -> Self {
        Error::Redb(e.into())
    }
}

impl From<::redb::DatabaseError> for Error {
    fn from(e: ::redb::DatabaseError) -> Self {
        Error::Redb(e.into())
    }
}

impl From<::redb::TableError> for Error {
    fn from(e: ::redb::TableError) -> Self {
        Error::Redb(e.into())
    }
}

impl From<::redb::CommitError> for Error {
    fn from(e: ::redb::CommitError) -> Self {
        Error::Redb(e.into())
    }
}

/// One named table per entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Nodes,
    Channels,
    NodeChannels,
    EdgeActivity,
    ChannelUpdates,
}

impl Table {
    pub const ALL: [Table; 5] =
        [Table::Nodes, Table::Channels, Table::NodeChannels, Table::EdgeActivity, Table::ChannelUpdates];

    fn definition(&self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Table::Nodes => NODES,
            Table::Channels => CHANNELS,
            Table::NodeChannels => NODE_CHANNELS,
            Table::EdgeActivity => EDGE_ACTIVITY,
            Table::ChannelUpdates => CHANNEL_UPDATES,
        }
    }
}

type RedbTable<'txn> = redb::Table<'txn, &'static str, &'static [u8]>;

/// An ordered key-value store of items, backed by redb.
///
/// Every mutation is a single write transaction that reads the current row,
/// checks its preconditions and writes the result, or aborts.
pub struct EmbeddedDatabase {
    db: Database,
    path: PathBuf,
}

impl EmbeddedDatabase {
    /// Open or create a database in the given directory.
    ///
    /// Prefer [`EmbeddedRegistry::open`], which shares one handle per path.
    pub fn open<P: AsRef<Path>>(dir: P, cache_size: usize) -> Result<Self, Error> {
        let path = dir.as_ref().join(REDB_FILE_NAME);
        let mut db = Database::builder().set_cache_size(cache_size).create(&path)?;
        if !db.check_integrity()? {
            warn!("database was repaired");
        }

        // create the tables if they don't exist
        let tx = db.begin_write()?;
        for table in Table::ALL {
            tx.open_table(table.definition())?;
        }
        tx.commit()?;
        info!("opened embedded graph database at {}", path.display());
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write<T>(
        &self,
        table: Table,
        f: impl FnOnce(&mut RedbTable<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let tx = self.db.begin_write()?;
        let result = {
            let mut table = tx.open_table(table.definition())?;
            f(&mut table)
        };
        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.abort()?;
                Err(e)
            }
        }
    }

    pub fn get(&self, table: Table, key: &str) -> Result<Option<Item>, Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(table.definition())?;
        let res = match table.get(key)? {
            Some(value) => Some(decode_embedded(value.value())?),
            None => None,
        };
        Ok(res)
    }

    /// Write an item, unless one of the `fresh` attributes is already present
    /// at the key.
    pub fn put(&self, table: Table, key: &str, item: &Item, fresh: &[&str]) -> Result<(), Error> {
        let value = encode_embedded(item)?;
        self.write(table, |t| {
            if !fresh.is_empty() {
                let existing = match t.get(key)? {
                    Some(existing) => Some(decode_embedded(existing.value())?),
                    None => None,
                };
                check_fresh(existing.as_ref(), fresh)?;
            }
            t.insert(key, value.as_slice())?;
            Ok(())
        })
    }

    /// Apply changes to an existing item if the expected values match.
    ///
    /// A missing row or a failed expectation is a [`Error::Conflict`].
    pub fn update(
        &self,
        table: Table,
        key: &str,
        changes: &Changes,
        expect: &Expect,
    ) -> Result<Item, Error> {
        self.modify(table, key, None, changes, expect)
    }

    /// Like [`EmbeddedDatabase::update`], but a missing row starts out as
    /// `initial`
    pub fn upsert(
        &self,
        table: Table,
        key: &str,
        initial: &Item,
        changes: &Changes,
        expect: &Expect,
    ) -> Result<Item, Error> {
        self.modify(table, key, Some(initial), changes, expect)
    }

    fn modify(
        &self,
        table: Table,
        key: &str,
        initial: Option<&Item>,
        changes: &Changes,
        expect: &Expect,
    ) -> Result<Item, Error> {
        self.write(table, |t| {
            let mut item = match (t.get(key)?, initial) {
                (Some(existing), _) => decode_embedded(existing.value())?,
                (None, Some(initial)) => initial.clone(),
                (None, None) => return Err(Error::Conflict(format!("no row to update at {}", key))),
            };
            check_expect(&item, expect)?;
            apply_changes(&mut item, changes)?;
            let value = encode_embedded(&item)?;
            t.insert(key, value.as_slice())?;
            Ok(item)
        })
    }

    /// Forward cursor scan from the plan's prefix
    pub fn scan(&self, table: Table, plan: &ScanPlan) -> Result<Vec<(String, Item)>, Error> {
        let mut res = Vec::new();
        if plan.is_full(0) {
            return Ok(res);
        }

        let tx = self.db.begin_read()?;
        let table = tx.open_table(table.definition())?;

        for entry in table.range(plan.start()..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !plan.in_range(key) {
                break;
            }
            let item = decode_embedded(value.value())?;
            if plan.accepts(&item) {
                res.push((key.to_string(), item));
                if plan.is_full(res.len()) {
                    break;
                }
            }
        }
        Ok(res)
    }
}

/// Hands out one shared [`EmbeddedDatabase`] per directory
#[derive(Default)]
pub struct EmbeddedRegistry {
    open: Mutex<HashMap<PathBuf, Weak<EmbeddedDatabase>>>,
}

impl EmbeddedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the database in `dir`, or return the live handle if it is
    /// already open.
    pub fn open<P: AsRef<Path>>(&self, dir: P, cache_size: usize) -> Result<Arc<EmbeddedDatabase>, Error> {
        fs::create_dir_all(dir.as_ref())?;
        let dir = fs::canonicalize(dir.as_ref())?;
        let mut open = self.open.lock();
        if let Some(db) = open.get(&dir).and_then(Weak::upgrade) {
            return Ok(db);
        }
        let db = Arc::new(EmbeddedDatabase::open(&dir, cache_size)?);
        open.insert(dir, Arc::downgrade(&db));
        Ok(db)
    }
}
