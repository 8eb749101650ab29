//! Deciding whether incoming announcements are newer than cached state, and
//! what actually changed.

use crate::dates::to_iso;
use crate::keys::Network;
use crate::model::{Node, NodeUpdate, Side, POLICY_ATTRIBUTES};
use crate::value::{Item, Value};
use crate::write::{Change, Changes};
use crate::Error;

/// Result of merging a policy announcement into a cached channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMerge {
    /// policy attributes of the merged channel
    pub updated: Item,
    /// attributes whose value changed
    pub updates: Item,
}

fn is_timestamp(attr: &str) -> bool {
    attr.ends_with("_updated_at")
}

/// Merge incoming policy attributes into an existing channel item.
///
/// Each side is taken from `incoming` only if its `node{n}_updated_at` is
/// later than the existing one. Returns `None` if nothing but timestamps
/// would change.
pub fn channel_with_updates(existing: &Item, incoming: &Item) -> Option<ChannelMerge> {
    let mut updated = Item::new();
    let mut updates = Item::new();
    for side in Side::ALL {
        let date = side.attr("updated_at");
        let incoming_date = incoming.get(&date).and_then(Value::as_str);
        let existing_date = existing.get(&date).and_then(Value::as_str);
        if incoming_date <= existing_date {
            continue;
        }
        for attr in POLICY_ATTRIBUTES.iter().map(|a| side.attr(a)) {
            let theirs = incoming.get(&attr);
            let ours = existing.get(&attr);
            if let Some(value) = theirs {
                if ours != theirs {
                    updates.insert(attr.clone(), value.clone());
                }
            }
            if let Some(value) = theirs.or(ours) {
                updated.insert(attr, value.clone());
            }
        }
    }

    if updates.keys().all(|attr| is_timestamp(attr)) {
        return None;
    }
    Some(ChannelMerge { updated, updates })
}

/// Changes that bring a cached node up to date with an announcement, or
/// `None` if the announcement is stale or changes nothing.
///
/// Any change also bumps `rev` and sets `updated_at`.
pub fn node_changes(existing: &Node, update: &NodeUpdate, network: Network) -> Result<Option<Changes>, Error> {
    if update.updated_at <= existing.updated_at {
        return Ok(None);
    }

    let mut changes = Changes::new();
    if update.alias.is_empty() {
        if existing.alias.is_some() {
            changes.insert("alias".to_string(), Change::Remove);
        }
    } else if existing.alias.as_deref() != Some(update.alias.as_str()) {
        changes.insert("alias".to_string(), Change::Set(update.alias.as_str().into()));
    }

    if !existing.is_on(network) {
        changes.insert("chains".to_string(), Change::Add(network.chain_tag().into()));
    }

    if existing.color.as_deref() != Some(update.color.as_str()) {
        changes.insert("color".to_string(), Change::Set(update.color.as_str().into()));
    }

    let mut ours = existing.sockets.clone();
    ours.sort();
    let mut theirs = update.sockets.clone();
    theirs.sort();
    theirs.dedup();
    if ours != theirs {
        let change = if theirs.is_empty() { Change::Remove } else { Change::Set(theirs.into()) };
        changes.insert("sockets".to_string(), change);
    }

    if changes.is_empty() {
        return Ok(None);
    }
    changes.insert("rev".to_string(), Change::Add(Value::Number(1)));
    changes.insert("updated_at".to_string(), Change::Set(to_iso(&update.updated_at)?.into()));
    Ok(Some(changes))
}
