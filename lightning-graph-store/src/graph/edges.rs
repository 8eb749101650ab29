use log::*;
use time::{Duration, OffsetDateTime};

use super::GraphStore;
use crate::database::embedded::{EmbeddedDatabase, Table};
use crate::database::remote::{RemoteTable, RemoteTables};
use crate::dates::{date_for_decrementing_number, parse_iso, to_iso, DECREMENTING_NUMBER_LEN};
use crate::keys::{channel_key, edge_activity_key, edge_key, validate_public_key, ChannelId, Network};
use crate::model::{get_string, get_u64, number, ActivityType, Channel, EdgeActivity, LastAttempt, Side};
use crate::query::{Comparator, ScanPlan, Where};
use crate::value::Item;
use crate::write::{Change, Changes, Expect};
use crate::Error;

fn activity_type(item: &Item) -> Result<ActivityType, Error> {
    get_string(item, "type").ok_or_else(|| Error::MissingAttribute("type".to_string()))?.parse()
}

fn embedded_edge_history(
    db: &EmbeddedDatabase,
    network: Network,
    to_public_key: &str,
    channel: &ChannelId,
    after: Option<&OffsetDateTime>,
    limit: Option<usize>,
) -> Result<Vec<EdgeActivity>, Error> {
    // keys sort newest first, so `after` bounds the scan from above
    let before = after.map(|at| edge_activity_key(to_public_key, network, channel, at)).transpose()?;
    let plan = ScanPlan::prefix(edge_key(to_public_key, network, channel)).before(before).limit(limit);
    let mut attempts = Vec::new();
    for (key, item) in db.scan(Table::EdgeActivity, &plan)? {
        let suffix = key
            .len()
            .checked_sub(DECREMENTING_NUMBER_LEN)
            .and_then(|at| key.get(at..))
            .ok_or_else(|| Error::Codec(format!("edge activity key {}", key)))?;
        attempts.push(EdgeActivity {
            to_public_key: to_public_key.to_string(),
            channel: *channel,
            attempted_at: date_for_decrementing_number(suffix)?,
            tokens: get_u64(&item, "tokens")?.unwrap_or(0),
            activity: activity_type(&item)?,
        });
    }
    Ok(attempts)
}

async fn remote_edge_history(
    remote: &RemoteTables,
    network: Network,
    to_public_key: &str,
    channel: &ChannelId,
    after: Option<&OffsetDateTime>,
    limit: Option<usize>,
) -> Result<Vec<EdgeActivity>, Error> {
    let mut filter = Where::from([(
        "edge".to_string(),
        Comparator::Eq(edge_key(to_public_key, network, channel).into()),
    )]);
    if let Some(after) = after {
        // sort key conditions are strict, step back to include `after` itself
        let bound = to_iso(&(*after - Duration::milliseconds(1)))?;
        filter.insert("attempted_at".to_string(), Comparator::Gt(bound.into()));
    }
    let items = remote.query(RemoteTable::EdgeActivity, &filter, None, true, limit).await?;
    items
        .iter()
        .map(|item| {
            let attempted_at = get_string(item, "attempted_at")
                .ok_or_else(|| Error::MissingAttribute("attempted_at".to_string()))?;
            Ok(EdgeActivity {
                to_public_key: to_public_key.to_string(),
                channel: *channel,
                attempted_at: parse_iso(&attempted_at)?,
                tokens: get_u64(item, "tokens")?.unwrap_or(0),
                activity: activity_type(item)?,
            })
        })
        .collect()
}

impl GraphStore {
    /// Record a routing attempt over a directed edge
    pub async fn record_edge_activity(&self, activity: &EdgeActivity) -> Result<(), Error> {
        validate_public_key(&activity.to_public_key)?;
        self.require_cache()?;
        let network = self.network();
        let edge = edge_key(&activity.to_public_key, network, &activity.channel);
        let attempted_at = to_iso(&activity.attempted_at)?;

        if let Some(remote) = &self.remote {
            let item = Item::from([
                ("edge".to_string(), edge.as_str().into()),
                ("attempted_at".to_string(), attempted_at.as_str().into()),
                ("tokens".to_string(), number(activity.tokens)),
                ("type".to_string(), activity.activity.as_str().into()),
            ]);
            remote.put(RemoteTable::EdgeActivity, &item, &[]).await?;
            self.stamp_attempt(remote, activity, &attempted_at).await?;
        }

        if let Some(db) = &self.embedded {
            let key = edge_activity_key(&activity.to_public_key, network, &activity.channel, &activity.attempted_at)?;
            let item = Item::from([
                ("tokens".to_string(), number(activity.tokens)),
                ("type".to_string(), activity.activity.as_str().into()),
            ]);
            db.put(Table::EdgeActivity, &key, &item, &[])?;
        }
        debug!("{} towards {} over {}", activity.activity, activity.to_public_key, activity.channel);
        Ok(())
    }

    /// Note the latest attempt on the forwarding side of the remote channel row
    async fn stamp_attempt(
        &self,
        remote: &RemoteTables,
        activity: &EdgeActivity,
        attempted_at: &str,
    ) -> Result<(), Error> {
        let key = Item::from([("key".to_string(), channel_key(self.network(), &activity.channel).into())]);
        let Some(item) = remote.get(RemoteTable::Channels, &key).await? else {
            debug!("no remote channel {} to note the attempt on", activity.channel);
            return Ok(());
        };
        let channel = Channel::from_item(&item)?;
        let Some(destination) = channel.side_of(&activity.to_public_key) else {
            return Ok(());
        };
        let side = destination.other();
        let changes = Changes::from([
            (side.attr("attempted"), Change::Set(activity.activity.as_str().into())),
            (side.attr("attempted_at"), Change::Set(attempted_at.into())),
            (side.attr("attempted_tokens"), Change::Set(number(activity.tokens))),
        ]);
        remote.update(RemoteTable::Channels, &key, &changes, &Expect::new()).await
    }

    /// Attempts over a directed edge since `after`, most recent first
    pub async fn get_edge_history(
        &self,
        to_public_key: &str,
        channel: &ChannelId,
        after: Option<OffsetDateTime>,
        limit: Option<usize>,
    ) -> Result<Vec<EdgeActivity>, Error> {
        validate_public_key(to_public_key)?;
        self.require_cache()?;
        let network = self.network();

        let mut attempts = Vec::new();
        if let Some(remote) = &self.remote {
            attempts = remote_edge_history(remote, network, to_public_key, channel, after.as_ref(), limit).await?;
        }
        if let Some(db) = &self.embedded {
            let embedded = embedded_edge_history(db, network, to_public_key, channel, after.as_ref(), limit)?;
            for attempt in embedded {
                if !attempts.iter().any(|a| a.attempted_at == attempt.attempted_at) {
                    attempts.push(attempt);
                }
            }
        }
        attempts.sort_by(|a, b| b.attempted_at.cmp(&a.attempted_at));
        if let Some(limit) = limit {
            attempts.truncate(limit);
        }
        Ok(attempts)
    }

    /// The latest attempt over each direction of every channel in the
    /// embedded cache with at least `min_capacity`
    pub fn get_last_attempts(
        &self,
        after: Option<OffsetDateTime>,
        min_capacity: Option<u64>,
    ) -> Result<Vec<LastAttempt>, Error> {
        let db = self.require_embedded()?;
        let network = self.network();
        let mut last = Vec::new();
        for channel in self.get_all_channels(min_capacity, false)? {
            for side in Side::ALL {
                let (Some(to), Some(from)) =
                    (&channel.policy(side).public_key, &channel.policy(side.other()).public_key)
                else {
                    continue;
                };
                if to.is_empty() || from.is_empty() {
                    continue;
                }
                let history = embedded_edge_history(db, network, to, &channel.id, after.as_ref(), Some(1))?;
                if let Some(attempt) = history.into_iter().next() {
                    last.push(LastAttempt {
                        activity: attempt.activity,
                        channel: channel.id,
                        from_public_key: from.clone(),
                        to_public_key: to.clone(),
                    });
                }
            }
        }
        Ok(last)
    }
}
