use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use log::*;
use rand::seq::SliceRandom;
use time::OffsetDateTime;

use super::{ignore_conflict, log_failure, set_all, GraphStore};
use crate::database::embedded::{EmbeddedDatabase, Table};
use crate::database::remote::{RemoteTable, RemoteTables, NODE1_CHANNELS_INDEX, NODE2_CHANNELS_INDEX};
use crate::dates::{self, is_within, to_iso};
use crate::keys::{
    channel_id_of_node_channel_key, channel_key, channel_update_key, node_channel_key,
    node_channels_prefix, validate_public_key, ChannelId, Network,
};
use crate::model::{number, Channel, ChannelUpdate, PolicyUpdate, Side, POLICY_ATTRIBUTES};
use crate::query::{Comparator, ScanPlan, Where};
use crate::reconcile::{channel_with_updates, ChannelMerge};
use crate::retry::with_retry;
use crate::source::SourceChannel;
use crate::value::{Item, Value};
use crate::write::{Change, Changes, Expect};
use crate::Error;

/// What one cache tier knows about a channel
enum Cached {
    Complete(Channel),
    /// closed, or recently reported unknown by the source
    Absent,
    Miss,
}

fn key_item(key: &str) -> Item {
    Item::from([("key".to_string(), key.into())])
}

/// Whether an incoming ISO timestamp supersedes a cached one
fn is_newer(incoming: Option<&Value>, cached: Option<&Value>) -> bool {
    match (incoming.and_then(Value::as_str), cached.and_then(Value::as_str)) {
        (_, None) => true,
        (Some(incoming), Some(cached)) => incoming > cached,
        (None, Some(_)) => false,
    }
}

/// Changes writing a channel over a cached row without losing newer state.
///
/// A side's policy only replaces an older one and a cached close height is
/// kept. The returned expectation holds the gating attributes as read.
fn overwrite_changes(existing: Option<&Item>, incoming: &Item) -> (Changes, Expect) {
    let empty = Item::new();
    let existing = existing.unwrap_or(&empty);
    let mut changes = set_all(incoming, &["key"]);
    let mut gates = vec!["updated_at".to_string(), "close_height".to_string()];
    for side in Side::ALL {
        let date = side.attr("updated_at");
        if !is_newer(incoming.get(&date), existing.get(&date)) {
            for attr in POLICY_ATTRIBUTES {
                changes.remove(&side.attr(attr));
            }
        }
        gates.push(date);
    }
    if !is_newer(incoming.get("updated_at"), existing.get("updated_at")) {
        changes.remove("updated_at");
    }
    if existing.contains_key("close_height") {
        changes.remove("close_height");
    }
    let expect = gates.into_iter().map(|attr| {
        let value = existing.get(&attr).cloned();
        (attr, value)
    });
    (changes, expect.collect())
}

/// Merge a channel into the cached row and link its nodes
fn store_embedded_channel(db: &EmbeddedDatabase, network: Network, channel: &Channel) -> Result<(), Error> {
    let key = channel_key(network, &channel.id);
    let existing = db.get(Table::Channels, &key)?;
    let (mut changes, expect) = overwrite_changes(existing.as_ref(), &channel.to_item(network)?);
    if channel.unknown_at.is_none() {
        changes.insert("unknown_at".to_string(), Change::Remove);
    }
    db.upsert(Table::Channels, &key, &key_item(&key), &changes, &expect)?;
    link_nodes(db, network, &channel.id, channel.public_keys())
}

fn link_nodes<'a>(
    db: &EmbeddedDatabase,
    network: Network,
    id: &ChannelId,
    public_keys: impl Iterator<Item = &'a str>,
) -> Result<(), Error> {
    for public_key in public_keys {
        db.put(Table::NodeChannels, &node_channel_key(public_key, network, id), &Item::new(), &[])?;
    }
    Ok(())
}

fn new_public_keys(merge: &ChannelMerge) -> impl Iterator<Item = &str> {
    Side::ALL
        .into_iter()
        .filter_map(move |side| merge.updates.get(&side.attr("public_key")).and_then(Value::as_str))
}

/// Row of a channel first seen in this announcement
fn new_channel_item(key: &str, update: &PolicyUpdate, merge: &ChannelMerge) -> Result<Item, Error> {
    let mut item = merge.updated.clone();
    item.insert("key".to_string(), key.into());
    item.insert("capacity".to_string(), number(update.capacity));
    item.insert("transaction_id".to_string(), update.transaction_id.as_str().into());
    item.insert("transaction_vout".to_string(), update.transaction_vout.into());
    item.insert("updated_at".to_string(), to_iso(&update.updated_at)?.into());
    Ok(item)
}

/// Changes applying a merge to an existing row, and the precondition that
/// the row was not written since it was read
fn merge_changes(
    update: &PolicyUpdate,
    existing: &Item,
    merge: &ChannelMerge,
) -> Result<(Changes, Expect), Error> {
    let mut changes = set_all(&merge.updates, &[]);
    changes.insert("updated_at".to_string(), Change::Set(to_iso(&dates::now())?.into()));
    if existing.contains_key("unknown_at") {
        changes.insert("unknown_at".to_string(), Change::Remove);
    }
    // rows created by a close or an unknown marker lack the funding details
    if !existing.contains_key("capacity") {
        changes.insert("capacity".to_string(), Change::Set(number(update.capacity)));
        changes.insert("transaction_id".to_string(), Change::Set(update.transaction_id.as_str().into()));
        changes.insert("transaction_vout".to_string(), Change::Set(update.transaction_vout.into()));
    }
    let expect = Expect::from([("updated_at".to_string(), existing.get("updated_at").cloned())]);
    Ok((changes, expect))
}

fn history_row(key: &str, updated_at: &OffsetDateTime, merge: &ChannelMerge) -> Result<Item, Error> {
    let mut row = merge.updates.clone();
    row.insert("key".to_string(), key.into());
    row.insert("updated_at".to_string(), to_iso(updated_at)?.into());
    Ok(row)
}

impl GraphStore {
    fn classify(&self, channel: Option<Channel>, now: &OffsetDateTime) -> Cached {
        match channel {
            None => Cached::Miss,
            Some(channel) if channel.is_closed() => Cached::Absent,
            Some(channel)
                if channel
                    .unknown_at
                    .map(|at| is_within(&at, now, self.config.unknown_ttl))
                    .unwrap_or(false) =>
            {
                Cached::Absent
            }
            Some(channel) if channel.is_complete() => Cached::Complete(channel),
            Some(_) => Cached::Miss,
        }
    }

    /// Look up a channel, reading through the caches to the source.
    ///
    /// `None` if the channel is closed, unknown to the source, or, without a
    /// source, not cached. Policies carry the alias and color of their nodes
    /// where those are known.
    pub async fn get_channel(&self, id: &ChannelId) -> Result<Option<Channel>, Error> {
        if self.embedded.is_none() && self.remote.is_none() && self.source.is_none() {
            return Err(Error::NotConfigured("cache or graph source"));
        }
        let key = channel_key(self.network(), id);
        let now = dates::now();

        let mut found = None;
        if let Some(db) = &self.embedded {
            let cached = db.get(Table::Channels, &key)?.map(|item| Channel::from_item(&item)).transpose()?;
            match self.classify(cached, &now) {
                Cached::Complete(channel) => found = Some(channel),
                Cached::Absent => return Ok(None),
                Cached::Miss => {}
            }
        }
        if found.is_none() {
            if let Some(remote) = &self.remote {
                let cached = remote
                    .get(RemoteTable::Channels, &key_item(&key))
                    .await?
                    .map(|item| Channel::from_item(&item))
                    .transpose()?;
                match self.classify(cached, &now) {
                    Cached::Complete(channel) => {
                        self.backfill_channel(&channel);
                        found = Some(channel);
                    }
                    Cached::Absent => return Ok(None),
                    Cached::Miss => {}
                }
            }
        }
        let channel = match found {
            Some(channel) => channel,
            None => match self.get_source_channel(id).await? {
                Some(channel) => channel,
                None => return Ok(None),
            },
        };
        self.enrich(channel).await.map(Some)
    }

    /// Copy a remote hit into the embedded cache, off the read path
    fn backfill_channel(&self, channel: &Channel) {
        let Some(db) = &self.embedded else {
            return;
        };
        let db = Arc::clone(db);
        let network = self.network();
        let channel = channel.clone();
        tokio::task::spawn_blocking(move || {
            let res = ignore_conflict(store_embedded_channel(&db, network, &channel), "channel back-fill");
            log_failure(res, "channel back-fill");
        });
    }

    async fn get_source_channel(&self, id: &ChannelId) -> Result<Option<Channel>, Error> {
        let Some(source) = &self.source else {
            debug!("channel {} is not cached and there is no source", id);
            return Ok(None);
        };
        match source.get_channel(id).await? {
            SourceChannel::Open(mut channel) => {
                channel.id = *id;
                channel.unknown_at = None;
                channel.updated_at = Some(dates::now());
                self.write_back_channel(&channel).await;
                Ok(Some(channel))
            }
            SourceChannel::Closed { close_height } => {
                log_failure(self.close_channel(id, close_height).await, "caching closed channel");
                Ok(None)
            }
            SourceChannel::NotFound => {
                log_failure(self.mark_unknown(id).await, "caching unknown channel");
                Ok(None)
            }
        }
    }

    async fn write_back_channel(&self, channel: &Channel) {
        if let Some(db) = &self.embedded {
            let res = ignore_conflict(store_embedded_channel(db, self.network(), channel), "write-back");
            log_failure(res, "embedded channel write-back");
        }
        if let Some(remote) = &self.remote {
            let res = async {
                let key = key_item(&channel_key(self.network(), &channel.id));
                let existing = remote.get(RemoteTable::Channels, &key).await?;
                let (mut changes, expect) = overwrite_changes(existing.as_ref(), &channel.to_item(self.network())?);
                changes.insert("unknown_at".to_string(), Change::Remove);
                ignore_conflict(remote.update(RemoteTable::Channels, &key, &changes, &expect).await, "write-back")
            };
            log_failure(res.await, "remote channel write-back");
        }
    }

    /// Fill in each policy's node alias and color
    async fn enrich(&self, mut channel: Channel) -> Result<Channel, Error> {
        let lookups: Vec<(Side, String)> = Side::ALL
            .into_iter()
            .filter_map(|side| {
                let policy = channel.policy(side);
                if policy.alias.is_some() && policy.color.is_some() {
                    return None;
                }
                policy.public_key.clone().filter(|_| policy.has_public_key()).map(|key| (side, key))
            })
            .collect();
        let nodes: Vec<_> = stream::iter(lookups)
            .map(|(side, public_key)| async move { self.get_node(&public_key).await.map(|n| (side, n)) })
            .buffer_unordered(self.config.enrichment_concurrency.max(1))
            .try_collect()
            .await?;

        let mut changes = Changes::new();
        for (side, node) in nodes {
            let Some(node) = node else {
                debug!("no node for side {:?} of channel {}", side, channel.id);
                continue;
            };
            let policy = &mut channel.policies[side.index()];
            if node.alias.is_some() && node.alias != policy.alias {
                policy.alias = node.alias.clone();
                changes.insert(side.attr("alias"), Change::Set(node.alias.unwrap_or_default().into()));
            }
            if node.color.is_some() && node.color != policy.color {
                policy.color = node.color.clone();
                changes.insert(side.attr("color"), Change::Set(node.color.unwrap_or_default().into()));
            }
        }
        if !changes.is_empty() {
            self.update_channel_metadata(&channel.id, &changes).await;
        }
        Ok(channel)
    }

    async fn update_channel_metadata(&self, id: &ChannelId, changes: &Changes) {
        let key = channel_key(self.network(), id);
        if let Some(db) = &self.embedded {
            let res = ignore_conflict(db.update(Table::Channels, &key, changes, &Expect::new()), "metadata");
            log_failure(res, "embedded channel metadata update");
        }
        if let Some(remote) = &self.remote {
            let res = remote.update(RemoteTable::Channels, &key_item(&key), changes, &Expect::new()).await;
            log_failure(res, "remote channel metadata update");
        }
    }

    /// Open channels of a node, with stale ones re-verified and incomplete
    /// ones resolved through [`GraphStore::get_channel`]
    pub async fn get_channels_for_node(&self, public_key: &str) -> Result<Vec<Channel>, Error> {
        validate_public_key(public_key)?;
        self.require_cache()?;
        let now = dates::now();

        let mut channels = match &self.remote {
            Some(remote) => self.remote_channels_for_node(remote, public_key).await?,
            None => self.embedded_channels_for_node(public_key)?,
        };
        if self.source.is_some() {
            self.check_stale_channels(&mut channels, &now).await?;
        }

        let resolved: Vec<Option<Channel>> = stream::iter(channels)
            .map(|channel| async move {
                let id = channel.id;
                // without a source an incomplete record is the best answer
                let fallback = self.source.is_none().then(|| channel.clone());
                match self.classify(Some(channel), &now) {
                    Cached::Absent => Ok(None),
                    Cached::Complete(channel) if channel.policies.iter().all(|p| p.color.is_some()) => {
                        Ok(Some(channel))
                    }
                    Cached::Complete(_) => self.get_channel(&id).await,
                    Cached::Miss => Ok(self.get_channel(&id).await?.or(fallback)),
                }
            })
            .buffer_unordered(self.config.enrichment_concurrency.max(1))
            .try_collect()
            .await?;
        let mut channels: Vec<Channel> = resolved.into_iter().flatten().collect();
        channels.sort_by_key(|channel| channel.id);
        Ok(channels)
    }

    async fn remote_channels_for_node(
        &self,
        remote: &RemoteTables,
        public_key: &str,
    ) -> Result<Vec<Channel>, Error> {
        let mut channels: Vec<Channel> = Vec::new();
        for (side, index) in [(Side::Node1, NODE1_CHANNELS_INDEX), (Side::Node2, NODE2_CHANNELS_INDEX)] {
            let filter = Where::from([
                (side.attr("public_key"), Comparator::Eq(public_key.into())),
                ("key".to_string(), Comparator::StartsWith(self.network().chain_tag().to_string())),
            ]);
            for item in remote.query(RemoteTable::Channels, &filter, Some(index), false, None).await? {
                let channel = Channel::from_item(&item)?;
                if !channels.iter().any(|c| c.id == channel.id) {
                    channels.push(channel);
                }
            }
        }
        Ok(channels)
    }

    fn embedded_channels_for_node(&self, public_key: &str) -> Result<Vec<Channel>, Error> {
        let db = self.require_embedded()?;
        let plan = ScanPlan::prefix(node_channels_prefix(public_key, self.network()));
        let mut channels = Vec::new();
        for (link, _) in db.scan(Table::NodeChannels, &plan)? {
            let id = channel_id_of_node_channel_key(&link)?;
            let channel = match db.get(Table::Channels, &channel_key(self.network(), &id))? {
                Some(item) => Channel::from_item(&item)?,
                None => Channel::new(id),
            };
            channels.push(channel);
        }
        Ok(channels)
    }
}

impl GraphStore {
    /// Record a policy announcement in every configured cache.
    ///
    /// Returns the changed attributes, or `None` if the announcement was
    /// stale or changed nothing. Lost races are retried.
    pub async fn update_channel(&self, update: &PolicyUpdate) -> Result<Option<Item>, Error> {
        update.validate()?;
        self.require_cache()?;
        with_retry(&self.config, "channel update", move || self.register_channel_update(update)).await
    }

    async fn register_channel_update(&self, update: &PolicyUpdate) -> Result<Option<Item>, Error> {
        let incoming = update.policy_item()?;
        let mut changed = None;
        if let Some(remote) = &self.remote {
            changed = self.register_remote_channel_update(remote, update, &incoming).await?;
        }
        if let Some(db) = &self.embedded {
            let embedded = self.register_embedded_channel_update(db, update, &incoming)?;
            changed = changed.or(embedded);
        }
        Ok(changed)
    }

    async fn register_remote_channel_update(
        &self,
        remote: &RemoteTables,
        update: &PolicyUpdate,
        incoming: &Item,
    ) -> Result<Option<Item>, Error> {
        let key = channel_key(self.network(), &update.id);
        let existing = remote.get(RemoteTable::Channels, &key_item(&key)).await?;
        let Some(merge) = channel_with_updates(existing.as_ref().unwrap_or(&Item::new()), incoming) else {
            return Ok(None);
        };

        let history = history_row(&key, &update.updated_at, &merge)?;
        let history_key = Item::from([
            ("key".to_string(), key.as_str().into()),
            ("updated_at".to_string(), history["updated_at"].clone()),
        ]);
        if remote.get(RemoteTable::ChannelUpdates, &history_key).await?.is_none() {
            remote.put(RemoteTable::ChannelUpdates, &history, &[]).await?;
        }

        match existing {
            None => {
                let item = new_channel_item(&key, update, &merge)?;
                remote.put(RemoteTable::Channels, &item, &["key"]).await?;
            }
            Some(existing) => {
                let (changes, expect) = merge_changes(update, &existing, &merge)?;
                remote.update(RemoteTable::Channels, &key_item(&key), &changes, &expect).await?;
            }
        }
        debug!("channel {} updated remotely: {:?}", update.id, merge.updates.keys());
        Ok(Some(merge.updates))
    }

    fn register_embedded_channel_update(
        &self,
        db: &EmbeddedDatabase,
        update: &PolicyUpdate,
        incoming: &Item,
    ) -> Result<Option<Item>, Error> {
        let network = self.network();
        let key = channel_key(network, &update.id);
        let existing = db.get(Table::Channels, &key)?;
        let Some(merge) = channel_with_updates(existing.as_ref().unwrap_or(&Item::new()), incoming) else {
            return Ok(None);
        };

        let history_key = channel_update_key(network, &update.id, &update.updated_at)?;
        if db.get(Table::ChannelUpdates, &history_key)?.is_none() {
            db.put(Table::ChannelUpdates, &history_key, &history_row(&key, &update.updated_at, &merge)?, &[])?;
        }

        match existing {
            None => db.put(Table::Channels, &key, &new_channel_item(&key, update, &merge)?, &["key"])?,
            Some(existing) => {
                let (changes, expect) = merge_changes(update, &existing, &merge)?;
                db.update(Table::Channels, &key, &changes, &expect)?;
            }
        }
        link_nodes(db, network, &update.id, new_public_keys(&merge))?;
        debug!("channel {} updated in embedded cache: {:?}", update.id, merge.updates.keys());
        Ok(Some(merge.updates))
    }

    /// Record that a channel closed. A close height, once cached, is never
    /// changed.
    pub async fn close_channel(&self, id: &ChannelId, close_height: u32) -> Result<(), Error> {
        self.require_cache()?;
        let key = channel_key(self.network(), id);
        let changes = Changes::from([("close_height".to_string(), Change::Set(close_height.into()))]);
        let expect = Expect::from([("close_height".to_string(), None)]);
        if let Some(db) = &self.embedded {
            ignore_conflict(db.upsert(Table::Channels, &key, &key_item(&key), &changes, &expect), "close")?;
        }
        if let Some(remote) = &self.remote {
            let res = remote.update(RemoteTable::Channels, &key_item(&key), &changes, &expect).await;
            ignore_conflict(res, "close")?;
        }
        info!("channel {} closed at {}", id, close_height);
        Ok(())
    }

    async fn mark_unknown(&self, id: &ChannelId) -> Result<(), Error> {
        let key = channel_key(self.network(), id);
        let now = to_iso(&dates::now())?;
        let changes = Changes::from([("unknown_at".to_string(), Change::Set(now.into()))]);
        if let Some(db) = &self.embedded {
            db.upsert(Table::Channels, &key, &key_item(&key), &changes, &Expect::new())?;
        }
        if let Some(remote) = &self.remote {
            remote.update(RemoteTable::Channels, &key_item(&key), &changes, &Expect::new()).await?;
        }
        debug!("channel {} is unknown to the source", id);
        Ok(())
    }

    async fn mark_channel_updated(&self, id: &ChannelId, at: &OffsetDateTime) -> Result<(), Error> {
        let key = channel_key(self.network(), id);
        let changes = Changes::from([("updated_at".to_string(), Change::Set(to_iso(at)?.into()))]);
        if let Some(db) = &self.embedded {
            ignore_conflict(db.update(Table::Channels, &key, &changes, &Expect::new()), "mark updated")?;
        }
        if let Some(remote) = &self.remote {
            remote.update(RemoteTable::Channels, &key_item(&key), &changes, &Expect::new()).await?;
        }
        Ok(())
    }

    /// Ask the source whether a channel is still open and cache the answer
    pub async fn check_channel_closed(&self, id: &ChannelId) -> Result<SourceChannel, Error> {
        let source = self.require_source()?;
        let result = source.get_channel(id).await?;
        match &result {
            SourceChannel::Open(_) => self.mark_channel_updated(id, &dates::now()).await?,
            SourceChannel::Closed { close_height } => self.close_channel(id, *close_height).await?,
            SourceChannel::NotFound => self.mark_unknown(id).await?,
        }
        Ok(result)
    }

    /// Re-verify a random sample of channels not updated within the update
    /// window, applying the answers to `channels`
    async fn check_stale_channels(&self, channels: &mut [Channel], now: &OffsetDateTime) -> Result<(), Error> {
        let window = self.config.update_window;
        let mut stale: Vec<ChannelId> = channels
            .iter()
            .filter(|c| !c.is_closed())
            .filter(|c| !c.updated_at.map(|at| is_within(&at, now, window)).unwrap_or(false))
            .map(|c| c.id)
            .collect();
        stale.shuffle(&mut rand::thread_rng());
        stale.truncate(self.config.check_limit);

        let checks: Vec<(ChannelId, SourceChannel)> = stream::iter(stale)
            .map(|id| async move { self.check_channel_closed(&id).await.map(|res| (id, res)) })
            .buffer_unordered(self.config.check_limit.max(1))
            .try_collect()
            .await?;
        for (id, result) in checks {
            let Some(channel) = channels.iter_mut().find(|c| c.id == id) else {
                continue;
            };
            match result {
                SourceChannel::Open(_) => channel.updated_at = Some(*now),
                SourceChannel::Closed { close_height } => channel.close_height = Some(close_height),
                SourceChannel::NotFound => channel.unknown_at = Some(*now),
            }
        }
        Ok(())
    }

    /// Recorded policy changes of a channel, most recent first
    pub async fn get_channel_updates(
        &self,
        id: &ChannelId,
        limit: Option<usize>,
    ) -> Result<Vec<ChannelUpdate>, Error> {
        self.require_cache()?;
        let key = channel_key(self.network(), id);
        let limit = Some(limit.unwrap_or(self.config.history_limit));
        let items = match &self.remote {
            Some(remote) => {
                let filter = Where::from([("key".to_string(), Comparator::Eq(key.as_str().into()))]);
                remote.query(RemoteTable::ChannelUpdates, &filter, None, true, limit).await?
            }
            None => {
                let db = self.require_embedded()?;
                let plan = ScanPlan::prefix(key).limit(limit);
                db.scan(Table::ChannelUpdates, &plan)?.into_iter().map(|(_, item)| item).collect()
            }
        };
        items.iter().map(|item| ChannelUpdate::from_item(*id, item)).collect()
    }

    /// Channels in the embedded cache with at least `min_capacity`.
    ///
    /// With `is_active`, only open channels that neither side disabled.
    pub fn get_all_channels(&self, min_capacity: Option<u64>, is_active: bool) -> Result<Vec<Channel>, Error> {
        let db = self.require_embedded()?;
        let mut filter = Where::new();
        if let Some(min_capacity) = min_capacity {
            let bound = i64::try_from(min_capacity).unwrap_or(i64::MAX) - 1;
            filter.insert("capacity".to_string(), Comparator::Gt(Value::Number(bound)));
        }
        let plan = ScanPlan::prefix(self.network().chain_tag()).filter(filter);
        let mut channels = Vec::new();
        for (_, item) in db.scan(Table::Channels, &plan)? {
            let channel = Channel::from_item(&item)?;
            let is_disabled = channel.policies.iter().any(|p| p.is_disabled == Some(true));
            if is_active && (channel.is_closed() || is_disabled) {
                continue;
            }
            channels.push(channel);
        }
        Ok(channels)
    }

    /// Write a channel into the embedded cache and link it to its nodes.
    ///
    /// Policies older than the cached ones and a change of a cached close
    /// height are not applied.
    pub fn set_channel_record(&self, channel: &Channel) -> Result<(), Error> {
        let db = self.require_embedded()?;
        store_embedded_channel(db, self.network(), channel)
    }
}
