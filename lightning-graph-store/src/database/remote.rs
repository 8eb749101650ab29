use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::*;

use crate::expression::{parse_conditions, Condition, Op};
use crate::query::{RemoteQuery, Where};
use crate::value::{from_row, to_row, Item, Row};
use crate::write::{put_condition, update_expression, Changes, Expect, UpdateExpression};
use crate::Error;

/// Secondary indexes of the channels table, one per policy side
pub const NODE1_CHANNELS_INDEX: &str = "node1_public_key-key-index";
pub const NODE2_CHANNELS_INDEX: &str = "node2_public_key-key-index";

#[derive(Debug, Clone, PartialEq)]
pub struct PutRequest {
    pub table: String,
    pub item: Row,
    pub condition_expression: Option<String>,
    pub attribute_names: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub table: String,
    pub key: Row,
    pub update: UpdateExpression,
}

/// A remote, partitioned document store.
///
/// Requests carry the store's native expressions. Updates of a missing row
/// create it, subject to the condition expression.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_item(&self, table: &str, key: &Row) -> Result<Option<Row>, Error>;

    /// Put a row, failing with [`Error::Conflict`] if the condition does not hold
    async fn put_item(&self, request: &PutRequest) -> Result<(), Error>;

    /// Update a row, failing with [`Error::Conflict`] if the condition does not hold
    async fn update_item(&self, request: &UpdateRequest) -> Result<(), Error>;

    async fn query(&self, query: &RemoteQuery) -> Result<Vec<Row>, Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSchema {
    pub name: String,
    pub partition_key: String,
    pub sort_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub partition_key: String,
    pub sort_key: Option<String>,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    fn new(name: String, partition_key: &str, sort_key: Option<&str>) -> Self {
        TableSchema {
            name,
            partition_key: partition_key.to_string(),
            sort_key: sort_key.map(str::to_string),
            indexes: Vec::new(),
        }
    }

    fn with_index(mut self, name: &str, partition_key: &str, sort_key: Option<&str>) -> Self {
        self.indexes.push(IndexSchema {
            name: name.to_string(),
            partition_key: partition_key.to_string(),
            sort_key: sort_key.map(str::to_string),
        });
        self
    }

    /// Partition and sort key attribute names of the table or one of its indexes
    pub fn key_attributes(&self, index: Option<&str>) -> Result<(&str, Option<&str>), Error> {
        match index {
            None => Ok((&self.partition_key, self.sort_key.as_deref())),
            Some(name) => self
                .indexes
                .iter()
                .find(|i| i.name == name)
                .map(|i| (i.partition_key.as_str(), i.sort_key.as_deref()))
                .ok_or_else(|| Error::InvalidExpression(format!("unknown index {}", name))),
        }
    }

    /// The primary key of a row, with an empty sort key for tables without one
    pub fn primary_key(&self, row: &Row) -> Result<(String, String), Error> {
        let part = |attr: &str| {
            row.get(attr)
                .and_then(|v| v.key_string())
                .ok_or_else(|| Error::MissingAttribute(format!("{} in {}", attr, self.name)))
        };
        let pk = part(&self.partition_key)?;
        let sk = match &self.sort_key {
            Some(sort_key) => part(sort_key)?,
            None => String::new(),
        };
        Ok((pk, sk))
    }

    /// The key attributes of a row
    pub fn key_of(&self, row: &Row) -> Row {
        row.iter()
            .filter(|(k, _)| **k == self.partition_key || Some(k.as_str()) == self.sort_key.as_deref())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Evaluate a query over candidate rows of its table: key conditions, index
/// order, direction and limit.
pub fn select_rows(schema: &TableSchema, rows: Vec<Row>, query: &RemoteQuery) -> Result<Vec<Row>, Error> {
    let conditions = parse_conditions(
        &query.key_condition_expression,
        &query.attribute_names,
        &query.attribute_values,
    )?;
    let (partition_key, sort_key) = schema.key_attributes(query.index_name.as_deref())?;
    let has_partition = conditions.iter().any(|c| {
        matches!(c, Condition::Compare { attr, op: Op::Eq, .. } if attr == partition_key)
    });
    if !has_partition {
        return Err(Error::InvalidExpression(format!(
            "query on {} needs equality on {}",
            schema.name, partition_key
        )));
    }

    let mut selected = Vec::new();
    for row in rows {
        let item = from_row(&row)?;
        if conditions.iter().all(|c| c.holds(Some(&item))) {
            let order = sort_key.and_then(|k| row.get(k)).and_then(|v| v.key_string());
            selected.push((order, row));
        }
    }
    selected.sort_by(|a, b| a.0.cmp(&b.0));
    if !query.scan_index_forward {
        selected.reverse();
    }
    let limit = query.limit.unwrap_or(usize::MAX);
    Ok(selected.into_iter().take(limit).map(|(_, row)| row).collect())
}

/// The remote tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTable {
    Nodes,
    Channels,
    ChannelUpdates,
    EdgeActivity,
}

impl RemoteTable {
    pub const ALL: [RemoteTable; 4] =
        [RemoteTable::Nodes, RemoteTable::Channels, RemoteTable::ChannelUpdates, RemoteTable::EdgeActivity];

    fn suffix(&self) -> &'static str {
        match self {
            RemoteTable::Nodes => "nodes",
            RemoteTable::Channels => "channels",
            RemoteTable::ChannelUpdates => "channel_updates",
            RemoteTable::EdgeActivity => "edge_activity",
        }
    }

    pub fn name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.suffix())
    }

    pub fn schema(&self, prefix: &str) -> TableSchema {
        let name = self.name(prefix);
        match self {
            RemoteTable::Nodes => TableSchema::new(name, "public_key", None),
            RemoteTable::Channels => TableSchema::new(name, "key", None)
                .with_index(NODE1_CHANNELS_INDEX, "node1_public_key", Some("key"))
                .with_index(NODE2_CHANNELS_INDEX, "node2_public_key", Some("key")),
            RemoteTable::ChannelUpdates => TableSchema::new(name, "key", Some("updated_at")),
            RemoteTable::EdgeActivity => TableSchema::new(name, "edge", Some("attempted_at")),
        }
    }
}

/// Schemas of every remote table under a prefix
pub fn catalog(prefix: &str) -> Vec<TableSchema> {
    RemoteTable::ALL.iter().map(|t| t.schema(prefix)).collect()
}

/// Item level access to the remote tables. Rows are marshalled here and
/// nowhere else.
#[derive(Clone)]
pub struct RemoteTables {
    store: Arc<dyn DocumentStore>,
    prefix: String,
}

impl RemoteTables {
    pub fn new(store: Arc<dyn DocumentStore>, prefix: &str) -> Self {
        RemoteTables { store, prefix: prefix.to_string() }
    }

    pub async fn get(&self, table: RemoteTable, key: &Item) -> Result<Option<Item>, Error> {
        let row = self.store.get_item(&table.name(&self.prefix), &to_row(key)).await?;
        row.map(|row| from_row(&row)).transpose()
    }

    /// Put an item, failing with a conflict if any `fresh` attribute exists
    pub async fn put(&self, table: RemoteTable, item: &Item, fresh: &[&str]) -> Result<(), Error> {
        let (condition_expression, attribute_names) = match put_condition(fresh) {
            Some((condition, names)) => (Some(condition), names),
            None => (None, BTreeMap::new()),
        };
        let request = PutRequest {
            table: table.name(&self.prefix),
            item: to_row(item),
            condition_expression,
            attribute_names,
        };
        self.store.put_item(&request).await
    }

    pub async fn update(
        &self,
        table: RemoteTable,
        key: &Item,
        changes: &Changes,
        expect: &Expect,
    ) -> Result<(), Error> {
        if changes.is_empty() {
            debug!("no changes for {:?} {:?}", table, key);
            return Ok(());
        }
        let request = UpdateRequest {
            table: table.name(&self.prefix),
            key: to_row(key),
            update: update_expression(changes, expect),
        };
        self.store.update_item(&request).await
    }

    pub async fn query(
        &self,
        table: RemoteTable,
        filter: &Where,
        index: Option<&str>,
        is_descending: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Item>, Error> {
        let mut query =
            RemoteQuery::new(&table.name(&self.prefix), filter).descending(is_descending).limit(limit);
        if let Some(index) = index {
            query = query.index(index);
        }
        let rows = self.store.query(&query).await?;
        rows.iter().map(from_row).collect()
    }
}
