use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::remote::{select_rows, DocumentStore, PutRequest, TableSchema, UpdateRequest};
use crate::expression::{check_condition, parse_update};
use crate::query::RemoteQuery;
use crate::value::{from_row, to_row, Row};
use crate::write::apply_changes;
use crate::Error;

type Rows = BTreeMap<(String, String), Row>;

/// An in-memory document store, evaluating requests the way the remote
/// store does
pub struct MemoryDocumentStore {
    schemas: HashMap<String, TableSchema>,
    tables: Mutex<HashMap<String, Rows>>,
}

impl MemoryDocumentStore {
    pub fn new(schemas: Vec<TableSchema>) -> Self {
        let tables = schemas.iter().map(|s| (s.name.clone(), Rows::new())).collect();
        let schemas = schemas.into_iter().map(|s| (s.name.clone(), s)).collect();
        MemoryDocumentStore { schemas, tables: Mutex::new(tables) }
    }

    fn schema(&self, table: &str) -> Result<&TableSchema, Error> {
        self.schemas.get(table).ok_or_else(|| Error::InvalidExpression(format!("unknown table {}", table)))
    }

    /// Number of rows in a table
    pub fn len(&self, table: &str) -> usize {
        self.tables.lock().get(table).map(|rows| rows.len()).unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_item(&self, table: &str, key: &Row) -> Result<Option<Row>, Error> {
        let key = self.schema(table)?.primary_key(key)?;
        let tables = self.tables.lock();
        Ok(tables.get(table).and_then(|rows| rows.get(&key)).cloned())
    }

    async fn put_item(&self, request: &PutRequest) -> Result<(), Error> {
        let key = self.schema(&request.table)?.primary_key(&request.item)?;
        let mut tables = self.tables.lock();
        let rows = tables.entry(request.table.clone()).or_default();
        let existing = rows.get(&key).map(from_row).transpose()?;
        check_condition(
            request.condition_expression.as_deref(),
            &request.attribute_names,
            &Row::new(),
            existing.as_ref(),
        )?;
        rows.insert(key, request.item.clone());
        Ok(())
    }

    async fn update_item(&self, request: &UpdateRequest) -> Result<(), Error> {
        let schema = self.schema(&request.table)?;
        let key = schema.primary_key(&request.key)?;
        let update = &request.update;
        let changes =
            parse_update(&update.update_expression, &update.attribute_names, &update.attribute_values)?;

        let mut tables = self.tables.lock();
        let rows = tables.entry(request.table.clone()).or_default();
        let existing = rows.get(&key).map(from_row).transpose()?;
        check_condition(
            update.condition_expression.as_deref(),
            &update.attribute_names,
            &update.attribute_values,
            existing.as_ref(),
        )?;
        let mut item = match existing {
            Some(item) => item,
            None => from_row(&schema.key_of(&request.key))?,
        };
        apply_changes(&mut item, &changes)?;
        rows.insert(key, to_row(&item));
        Ok(())
    }

    async fn query(&self, query: &RemoteQuery) -> Result<Vec<Row>, Error> {
        let schema = self.schema(&query.table)?;
        let candidates: Vec<Row> = {
            let tables = self.tables.lock();
            tables.get(&query.table).map(|rows| rows.values().cloned().collect()).unwrap_or_default()
        };
        select_rows(schema, candidates, query)
    }
}
