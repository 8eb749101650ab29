use std::sync::Arc;

use log::*;

use super::{ignore_conflict, log_failure, GraphStore};
use crate::database::embedded::{EmbeddedDatabase, Table};
use crate::database::remote::{RemoteTable, RemoteTables};
use crate::keys::{validate_public_key, Network};
use crate::model::{number, Node, NodeUpdate};
use crate::query::ScanPlan;
use crate::reconcile::node_changes;
use crate::retry::with_retry;
use crate::value::Item;
use crate::write::Expect;
use crate::Error;

fn node_key_item(public_key: &str) -> Item {
    Item::from([("public_key".to_string(), public_key.into())])
}

fn rev_expect(node: &Node) -> Expect {
    Expect::from([("rev".to_string(), Some(number(node.rev)))])
}

/// Apply an announcement to the embedded node row, returning the new rev
fn update_embedded_node(db: &EmbeddedDatabase, network: Network, update: &NodeUpdate) -> Result<Option<u64>, Error> {
    let Some(item) = db.get(Table::Nodes, &update.public_key)? else {
        let node = update.to_node(network);
        db.put(Table::Nodes, &update.public_key, &node.to_item()?, &["public_key"])?;
        return Ok(Some(node.rev));
    };
    let existing = Node::from_item(&item)?;
    let Some(changes) = node_changes(&existing, update, network)? else {
        return Ok(None);
    };
    db.update(Table::Nodes, &update.public_key, &changes, &rev_expect(&existing))?;
    Ok(Some(existing.rev + 1))
}

async fn update_remote_node(
    remote: &RemoteTables,
    network: Network,
    update: &NodeUpdate,
) -> Result<Option<u64>, Error> {
    let key = node_key_item(&update.public_key);
    let Some(item) = remote.get(RemoteTable::Nodes, &key).await? else {
        let node = update.to_node(network);
        remote.put(RemoteTable::Nodes, &node.to_item()?, &["public_key"]).await?;
        return Ok(Some(node.rev));
    };
    let existing = Node::from_item(&item)?;
    let Some(changes) = node_changes(&existing, update, network)? else {
        return Ok(None);
    };
    remote.update(RemoteTable::Nodes, &key, &changes, &rev_expect(&existing)).await?;
    Ok(Some(existing.rev + 1))
}

impl GraphStore {
    /// Look up a node, reading through the caches to the source
    pub async fn get_node(&self, public_key: &str) -> Result<Option<Node>, Error> {
        validate_public_key(public_key)?;

        if let Some(db) = &self.embedded {
            if let Some(item) = db.get(Table::Nodes, public_key)? {
                return Node::from_item(&item).map(Some);
            }
        }

        if let Some(remote) = &self.remote {
            if let Some(item) = remote.get(RemoteTable::Nodes, &node_key_item(public_key)).await? {
                let node = Node::from_item(&item)?;
                self.backfill_node(&item);
                return Ok(Some(node));
            }
        }

        let Some(source) = &self.source else {
            debug!("node {} is not cached and there is no source", public_key);
            return Ok(None);
        };
        let Some(update) = source.get_node(public_key).await? else {
            return Ok(None);
        };
        if self.embedded.is_some() || self.remote.is_some() {
            log_failure(self.update_node(&update).await, "node write-back");
        }
        Ok(Some(update.to_node(self.network())))
    }

    fn backfill_node(&self, item: &Item) {
        let Some(db) = &self.embedded else {
            return;
        };
        let db = Arc::clone(db);
        let item = item.clone();
        tokio::task::spawn_blocking(move || {
            // keep a row written meanwhile
            let res = match item.get("public_key").and_then(|k| k.as_str()) {
                Some(key) => ignore_conflict(db.put(Table::Nodes, key, &item, &["public_key"]), "node back-fill"),
                None => Err(Error::MissingAttribute("public_key".to_string())),
            };
            log_failure(res, "node back-fill");
        });
    }

    /// Record a node announcement in every configured cache.
    ///
    /// Returns the new revision, or `None` if the announcement was stale or
    /// changed nothing.
    pub async fn update_node(&self, update: &NodeUpdate) -> Result<Option<u64>, Error> {
        update.validate()?;
        self.require_cache()?;
        let network = self.network();
        with_retry(&self.config, "node update", move || async move {
            let mut rev = None;
            if let Some(remote) = &self.remote {
                rev = update_remote_node(remote, network, update).await?;
            }
            if let Some(db) = &self.embedded {
                let embedded = update_embedded_node(db, network, update)?;
                rev = rev.or(embedded);
            }
            if let Some(rev) = rev {
                debug!("node {} now at rev {}", update.public_key, rev);
            }
            Ok(rev)
        })
        .await
    }

    /// Nodes in the embedded cache seen on the configured network
    pub fn get_all_nodes(&self) -> Result<Vec<Node>, Error> {
        let db = self.require_embedded()?;
        let network = self.network();
        let mut nodes = Vec::new();
        for (_, item) in db.scan(Table::Nodes, &ScanPlan::default())? {
            let node = Node::from_item(&item)?;
            if node.is_on(network) {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }
}
