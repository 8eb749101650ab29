use std::collections::HashMap;

use async_trait::async_trait;
use deadpool_postgres::RecyclingMethod;
use log::*;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::Type;
pub use tokio_postgres::Error as PgError;
use tokio_postgres::{IsolationLevel, NoTls};

use super::remote::{select_rows, DocumentStore, PutRequest, TableSchema, UpdateRequest};
use crate::expression::{check_condition, parse_update};
use crate::query::RemoteQuery;
use crate::value::{from_row, row_from_json, row_to_json, to_row, Row};
use crate::write::apply_changes;
use crate::Error;

/// Create the store for the given tables and remove all their rows
pub async fn new_and_clear(schemas: Vec<TableSchema>) -> Result<PostgresDocumentStore, Error> {
    let store = new(schemas).await?;
    let client = store.client().await?;
    client.execute("TRUNCATE documents", &[]).await?;
    Ok(store)
}

/// Connect using the `PG_*` environment variables and create the documents
/// table if needed
pub async fn new(schemas: Vec<TableSchema>) -> Result<PostgresDocumentStore, Error> {
    let mut cfg = deadpool_postgres::Config::new();
    let host = std::env::var("PG_HOST").ok().unwrap_or("/var/run/postgresql".to_string());
    let user = std::env::var("PG_USER").ok().unwrap_or("dev".to_string());
    let pass = std::env::var("PG_PASS").ok();
    let db = std::env::var("PG_DB").ok().unwrap_or("dev".to_string());
    let port = match std::env::var("PG_PORT") {
        Ok(port) => Some(port.parse().map_err(|_| Error::Pool(format!("invalid PG_PORT {}", port)))?),
        Err(_) => None,
    };
    cfg.host = Some(host);
    cfg.port = port;
    cfg.dbname = Some(db);
    cfg.user = Some(user);
    cfg.password = pass;
    cfg.manager =
        Some(deadpool_postgres::ManagerConfig { recycling_method: RecyclingMethod::Fast });
    let pool = cfg
        .create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
        .map_err(|e| Error::Pool(e.to_string()))?;

    let store = PostgresDocumentStore {
        pool,
        schemas: schemas.into_iter().map(|s| (s.name.clone(), s)).collect(),
    };
    {
        let client = store.client().await?;
        migrate_database(&client).await?;
    }
    Ok(store)
}

async fn migrate_database(client: &tokio_postgres::Client) -> Result<(), Error> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS documents (tbl varchar, pk varchar, sk varchar, doc text, primary key (tbl, pk, sk))",
        )
        .await?;
    Ok(())
}

// serialization failures under repeatable read are reported like throttling,
// the caller re-reads and retries
fn classify(e: PgError) -> Error {
    if e.code() == Some(&SqlState::T_R_SERIALIZATION_FAILURE) {
        Error::Throughput(e.to_string())
    } else {
        Error::Postgres(e)
    }
}

/// A [`DocumentStore`] keeping each row as a JSON document in PostgreSQL.
///
/// Conditions are evaluated against the row read `FOR UPDATE` in the same
/// repeatable read transaction as the write.
pub struct PostgresDocumentStore {
    pool: deadpool_postgres::Pool,
    schemas: HashMap<String, TableSchema>,
}

impl PostgresDocumentStore {
    async fn client(&self) -> Result<deadpool_postgres::Object, Error> {
        self.pool.get().await.map_err(|e| Error::Pool(e.to_string()))
    }

    fn schema(&self, table: &str) -> Result<&TableSchema, Error> {
        self.schemas.get(table).ok_or_else(|| Error::InvalidExpression(format!("unknown table {}", table)))
    }

    /// Read the existing row, let `f` compute the new one, and write it
    async fn read_modify_write(
        &self,
        table: &str,
        key: (String, String),
        f: impl FnOnce(Option<Row>) -> Result<Row, Error> + Send,
    ) -> Result<(), Error> {
        let mut client = self.client().await?;
        let select = client
            .prepare_typed(
                "SELECT doc FROM documents WHERE tbl = $1 AND pk = $2 AND sk = $3 FOR UPDATE",
                &[Type::VARCHAR, Type::VARCHAR, Type::VARCHAR],
            )
            .await?;
        let upsert = client
            .prepare_typed(
                "INSERT INTO documents (tbl, pk, sk, doc) VALUES ($1, $2, $3, $4) ON CONFLICT (tbl, pk, sk) DO UPDATE SET doc = excluded.doc",
                &[Type::VARCHAR, Type::VARCHAR, Type::VARCHAR, Type::TEXT],
            )
            .await?;

        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .start()
            .await
            .map_err(classify)?;
        let (pk, sk) = key;
        let existing = match tx.query_opt(&select, &[&table, &pk, &sk]).await.map_err(classify)? {
            Some(row) => Some(row_from_json(row.get::<_, &str>(0))?),
            None => None,
        };
        // dropping the transaction on error rolls it back
        let row = f(existing)?;
        let doc = row_to_json(&row)?;
        tx.execute(&upsert, &[&table, &pk, &sk, &doc]).await.map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn get_item(&self, table: &str, key: &Row) -> Result<Option<Row>, Error> {
        let (pk, sk) = self.schema(table)?.primary_key(key)?;
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT doc FROM documents WHERE tbl = $1 AND pk = $2 AND sk = $3", &[&table, &pk, &sk])
            .await?;
        row.map(|row| row_from_json(row.get::<_, &str>(0))).transpose()
    }

    async fn put_item(&self, request: &PutRequest) -> Result<(), Error> {
        let key = self.schema(&request.table)?.primary_key(&request.item)?;
        self.read_modify_write(&request.table, key, |existing| {
            let existing = existing.as_ref().map(from_row).transpose()?;
            check_condition(
                request.condition_expression.as_deref(),
                &request.attribute_names,
                &Row::new(),
                existing.as_ref(),
            )?;
            Ok(request.item.clone())
        })
        .await
    }

    async fn update_item(&self, request: &UpdateRequest) -> Result<(), Error> {
        let schema = self.schema(&request.table)?;
        let key = schema.primary_key(&request.key)?;
        let update = &request.update;
        let changes =
            parse_update(&update.update_expression, &update.attribute_names, &update.attribute_values)?;
        self.read_modify_write(&request.table, key, |existing| {
            let existing = existing.as_ref().map(from_row).transpose()?;
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
            Ok(to_row(&item))
        })
        .await
    }

    async fn query(&self, query: &RemoteQuery) -> Result<Vec<Row>, Error> {
        let schema = self.schema(&query.table)?;
        let client = self.client().await?;
        let docs = client.query("SELECT doc FROM documents WHERE tbl = $1", &[&query.table]).await?;
        debug!("query {} scanned {} documents", query.table, docs.len());
        let rows = docs
            .iter()
            .map(|row| row_from_json(row.get::<_, &str>(0)))
            .collect::<Result<Vec<_>, _>>()?;
        select_rows(schema, rows, query)
    }
}
