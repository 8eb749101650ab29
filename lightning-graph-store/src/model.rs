//! Typed graph records and their attribute layout in rows.
//!
//! A channel row carries both policies flattened as `node1_*` and `node2_*`
//! attributes, node1 being the side with the lexically smaller public key.

use core::fmt;
use core::str::FromStr;

use time::OffsetDateTime;

use crate::dates::{parse_iso, to_iso};
use crate::keys::{channel_key, parse_channel_key, validate_public_key, ChannelId, Network};
use crate::value::{compact, Item, Value};
use crate::Error;

/// Policy attributes that are replaced together when a side is updated
pub const POLICY_ATTRIBUTES: [&str; 7] = [
    "base_fee_mtokens",
    "cltv_delta",
    "fee_rate",
    "is_disabled",
    "min_htlc_mtokens",
    "public_key",
    "updated_at",
];

const COLOR_LEN: usize = 7;
const TRANSACTION_ID_HEX_LEN: usize = 64;

/// One side of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Node1,
    Node2,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Node1, Side::Node2];

    /// The side announced by `source`, for a channel between `source` and
    /// `target`
    pub fn for_keys(source: &str, target: &str) -> Side {
        if source < target {
            Side::Node1
        } else {
            Side::Node2
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Side::Node1 => 0,
            Side::Node2 => 1,
        }
    }

    pub fn other(&self) -> Side {
        match self {
            Side::Node1 => Side::Node2,
            Side::Node2 => Side::Node1,
        }
    }

    /// Row attribute name of a per-side attribute
    pub fn attr(&self, name: &str) -> String {
        format!("node{}_{}", self.index() + 1, name)
    }
}

/// Outcome of an edge activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    Attempt,
    Success,
    Failure,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Attempt => "attempt",
            ActivityType::Success => "success",
            ActivityType::Failure => "failure",
        }
    }
}

impl FromStr for ActivityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attempt" => Ok(ActivityType::Attempt),
            "success" => Ok(ActivityType::Success),
            "failure" => Ok(ActivityType::Failure),
            _ => Err(Error::InvalidActivityType(s.to_string())),
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn get_string(item: &Item, attr: &str) -> Option<String> {
    item.get(attr).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn get_u64(item: &Item, attr: &str) -> Result<Option<u64>, Error> {
    match item.get(attr) {
        None => Ok(None),
        Some(Value::Number(n)) => {
            u64::try_from(*n).map(Some).map_err(|_| Error::Codec(format!("negative {}: {}", attr, n)))
        }
        Some(other) => Err(Error::Codec(format!("{} is not a number: {:?}", attr, other))),
    }
}

fn get_u32(item: &Item, attr: &str) -> Result<Option<u32>, Error> {
    get_u64(item, attr)?
        .map(|n| u32::try_from(n).map_err(|_| Error::Codec(format!("{} out of range: {}", attr, n))))
        .transpose()
}

// millitoken amounts are kept as decimal strings
fn get_mtokens(item: &Item, attr: &str) -> Result<Option<u64>, Error> {
    get_string(item, attr)
        .map(|s| s.parse().map_err(|_| Error::Codec(format!("{} is not an amount: {}", attr, s))))
        .transpose()
}

pub(crate) fn get_date(item: &Item, attr: &str) -> Result<Option<OffsetDateTime>, Error> {
    get_string(item, attr).map(|s| parse_iso(&s)).transpose()
}

pub(crate) fn number(n: u64) -> Value {
    Value::Number(i64::try_from(n).unwrap_or(i64::MAX))
}

fn set<V: Into<Value>>(item: &mut Item, attr: String, value: Option<V>) {
    if let Some(value) = value {
        item.insert(attr, value.into());
    }
}

/// One side's forwarding terms, with cached node metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Policy {
    pub public_key: Option<String>,
    pub base_fee_mtokens: Option<u64>,
    pub cltv_delta: Option<u32>,
    pub fee_rate: Option<u32>,
    pub is_disabled: Option<bool>,
    pub min_htlc_mtokens: Option<u64>,
    pub updated_at: Option<OffsetDateTime>,
    pub alias: Option<String>,
    pub color: Option<String>,
    pub attempted: Option<ActivityType>,
    pub attempted_at: Option<OffsetDateTime>,
    pub attempted_tokens: Option<u64>,
}

impl Policy {
    pub fn from_item(item: &Item, side: Side) -> Result<Self, Error> {
        Ok(Policy {
            public_key: get_string(item, &side.attr("public_key")),
            base_fee_mtokens: get_mtokens(item, &side.attr("base_fee_mtokens"))?,
            cltv_delta: get_u32(item, &side.attr("cltv_delta"))?,
            fee_rate: get_u32(item, &side.attr("fee_rate"))?,
            is_disabled: item.get(&side.attr("is_disabled")).and_then(Value::as_bool),
            min_htlc_mtokens: get_mtokens(item, &side.attr("min_htlc_mtokens"))?,
            updated_at: get_date(item, &side.attr("updated_at"))?,
            alias: get_string(item, &side.attr("alias")),
            color: get_string(item, &side.attr("color")),
            attempted: get_string(item, &side.attr("attempted")).map(|s| s.parse()).transpose()?,
            attempted_at: get_date(item, &side.attr("attempted_at"))?,
            attempted_tokens: get_u64(item, &side.attr("attempted_tokens"))?,
        })
    }

    pub fn write_to(&self, item: &mut Item, side: Side) -> Result<(), Error> {
        set(item, side.attr("public_key"), self.public_key.clone());
        set(item, side.attr("base_fee_mtokens"), self.base_fee_mtokens.map(|n| n.to_string()));
        set(item, side.attr("cltv_delta"), self.cltv_delta);
        set(item, side.attr("fee_rate"), self.fee_rate);
        set(item, side.attr("is_disabled"), self.is_disabled);
        set(item, side.attr("min_htlc_mtokens"), self.min_htlc_mtokens.map(|n| n.to_string()));
        set(item, side.attr("updated_at"), self.updated_at.as_ref().map(to_iso).transpose()?);
        set(item, side.attr("alias"), self.alias.clone());
        set(item, side.attr("color"), self.color.clone());
        set(item, side.attr("attempted"), self.attempted.map(|a| a.as_str()));
        set(item, side.attr("attempted_at"), self.attempted_at.as_ref().map(to_iso).transpose()?);
        set(item, side.attr("attempted_tokens"), self.attempted_tokens.map(number));
        Ok(())
    }

    pub fn has_public_key(&self) -> bool {
        self.public_key.as_deref().map(|k| !k.is_empty()).unwrap_or(false)
    }
}

/// A payment channel as cached
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: ChannelId,
    pub capacity: Option<u64>,
    /// terminal once set
    pub close_height: Option<u32>,
    pub policies: [Policy; 2],
    pub transaction_id: Option<String>,
    pub transaction_vout: Option<u32>,
    pub updated_at: Option<OffsetDateTime>,
    /// set when the authoritative source did not know the channel
    pub unknown_at: Option<OffsetDateTime>,
}

impl Channel {
    pub fn new(id: ChannelId) -> Self {
        Channel {
            id,
            capacity: None,
            close_height: None,
            policies: Default::default(),
            transaction_id: None,
            transaction_vout: None,
            updated_at: None,
            unknown_at: None,
        }
    }

    pub fn from_item(item: &Item) -> Result<Self, Error> {
        let key = get_string(item, "key").ok_or_else(|| Error::MissingAttribute("key".to_string()))?;
        let (_, id) = parse_channel_key(&key)?;
        Ok(Channel {
            id,
            capacity: get_u64(item, "capacity")?,
            close_height: get_u32(item, "close_height")?,
            policies: [Policy::from_item(item, Side::Node1)?, Policy::from_item(item, Side::Node2)?],
            transaction_id: get_string(item, "transaction_id"),
            transaction_vout: get_u32(item, "transaction_vout")?,
            updated_at: get_date(item, "updated_at")?,
            unknown_at: get_date(item, "unknown_at")?,
        })
    }

    pub fn to_item(&self, network: Network) -> Result<Item, Error> {
        let mut item = Item::new();
        item.insert("key".to_string(), channel_key(network, &self.id).into());
        set(&mut item, "capacity".to_string(), self.capacity.map(number));
        set(&mut item, "close_height".to_string(), self.close_height);
        for side in Side::ALL {
            self.policies[side.index()].write_to(&mut item, side)?;
        }
        set(&mut item, "transaction_id".to_string(), self.transaction_id.clone());
        set(&mut item, "transaction_vout".to_string(), self.transaction_vout);
        set(&mut item, "updated_at".to_string(), self.updated_at.as_ref().map(to_iso).transpose()?);
        set(&mut item, "unknown_at".to_string(), self.unknown_at.as_ref().map(to_iso).transpose()?);
        Ok(compact(&item))
    }

    /// Whether the record can answer a lookup without asking a higher tier
    pub fn is_complete(&self) -> bool {
        self.capacity.is_some()
            && self.unknown_at.is_none()
            && self.policies.iter().all(Policy::has_public_key)
    }

    pub fn is_closed(&self) -> bool {
        self.close_height.is_some()
    }

    pub fn policy(&self, side: Side) -> &Policy {
        &self.policies[side.index()]
    }

    pub fn side_of(&self, public_key: &str) -> Option<Side> {
        Side::ALL.into_iter().find(|side| self.policy(*side).public_key.as_deref() == Some(public_key))
    }

    pub fn public_keys(&self) -> impl Iterator<Item = &str> {
        self.policies.iter().filter_map(|p| p.public_key.as_deref()).filter(|k| !k.is_empty())
    }
}

/// A network participant
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub public_key: String,
    pub alias: Option<String>,
    pub color: Option<String>,
    pub sockets: Vec<String>,
    /// chain tags of the networks the node was seen on
    pub chains: Vec<String>,
    pub created_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
    /// revision, the optimistic concurrency token of node rows
    pub rev: u64,
}

impl Node {
    pub fn from_item(item: &Item) -> Result<Self, Error> {
        let public_key = get_string(item, "public_key")
            .ok_or_else(|| Error::MissingAttribute("public_key".to_string()))?;
        let updated_at = get_date(item, "updated_at")?
            .ok_or_else(|| Error::MissingAttribute(format!("updated_at of node {}", public_key)))?;
        let strings = |attr: &str| item.get(attr).and_then(Value::as_strings).map(<[String]>::to_vec);
        Ok(Node {
            alias: get_string(item, "alias"),
            color: get_string(item, "color"),
            sockets: strings("sockets").unwrap_or_default(),
            chains: strings("chains").unwrap_or_default(),
            created_at: get_date(item, "created_at")?,
            updated_at,
            rev: get_u64(item, "rev")?.unwrap_or(0),
            public_key,
        })
    }

    pub fn to_item(&self) -> Result<Item, Error> {
        let mut item = Item::new();
        item.insert("public_key".to_string(), self.public_key.as_str().into());
        set(&mut item, "alias".to_string(), self.alias.clone());
        set(&mut item, "color".to_string(), self.color.clone());
        item.insert("sockets".to_string(), self.sockets.clone().into());
        item.insert("chains".to_string(), self.chains.clone().into());
        set(&mut item, "created_at".to_string(), self.created_at.as_ref().map(to_iso).transpose()?);
        item.insert("updated_at".to_string(), to_iso(&self.updated_at)?.into());
        item.insert("rev".to_string(), number(self.rev));
        Ok(compact(&item))
    }

    pub fn is_on(&self, network: Network) -> bool {
        self.chains.iter().any(|c| c == network.chain_tag())
    }
}

/// A node announcement
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub public_key: String,
    /// an empty alias removes the cached one
    pub alias: String,
    pub color: String,
    pub sockets: Vec<String>,
    pub updated_at: OffsetDateTime,
}

impl NodeUpdate {
    pub fn validate(&self) -> Result<(), Error> {
        validate_public_key(&self.public_key)?;
        if self.color.len() != COLOR_LEN || !self.color.starts_with('#') {
            return Err(Error::MissingAttribute(format!("color of node {}", self.public_key)));
        }
        Ok(())
    }

    /// The record of a node first seen in this announcement
    pub fn to_node(&self, network: Network) -> Node {
        let mut sockets = self.sockets.clone();
        sockets.sort();
        sockets.dedup();
        Node {
            public_key: self.public_key.clone(),
            alias: Some(self.alias.clone()).filter(|a| !a.is_empty()),
            color: Some(self.color.clone()),
            sockets,
            chains: vec![network.chain_tag().to_string()],
            created_at: Some(self.updated_at),
            updated_at: self.updated_at,
            rev: 1,
        }
    }
}

/// A channel policy announcement from one side
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyUpdate {
    pub id: ChannelId,
    pub capacity: u64,
    pub transaction_id: String,
    pub transaction_vout: u32,
    /// the announcing node
    pub source: String,
    /// the node at the other end of the channel
    pub target: String,
    pub base_fee_mtokens: u64,
    pub cltv_delta: u32,
    pub fee_rate: u32,
    pub is_disabled: bool,
    pub min_htlc_mtokens: u64,
    pub updated_at: OffsetDateTime,
}

impl PolicyUpdate {
    pub fn validate(&self) -> Result<(), Error> {
        validate_public_key(&self.source)?;
        validate_public_key(&self.target)?;
        if self.source == self.target {
            return Err(Error::InvalidPublicKey(format!("channel {} to itself", self.id)));
        }
        let is_txid = self.transaction_id.len() == TRANSACTION_ID_HEX_LEN
            && self.transaction_id.bytes().all(|b| b.is_ascii_hexdigit());
        if !is_txid {
            return Err(Error::MissingAttribute(format!("transaction id of channel {}", self.id)));
        }
        Ok(())
    }

    pub fn side(&self) -> Side {
        Side::for_keys(&self.source, &self.target)
    }

    /// The announced policy as `node{n}_*` attributes
    pub fn policy_item(&self) -> Result<Item, Error> {
        let policy = Policy {
            public_key: Some(self.source.clone()),
            base_fee_mtokens: Some(self.base_fee_mtokens),
            cltv_delta: Some(self.cltv_delta),
            fee_rate: Some(self.fee_rate),
            is_disabled: Some(self.is_disabled),
            min_htlc_mtokens: Some(self.min_htlc_mtokens),
            updated_at: Some(self.updated_at),
            ..Default::default()
        };
        let mut item = Item::new();
        policy.write_to(&mut item, self.side())?;
        Ok(item)
    }
}

/// A routing attempt over a directed edge
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeActivity {
    /// destination of the edge
    pub to_public_key: String,
    pub channel: ChannelId,
    pub attempted_at: OffsetDateTime,
    pub tokens: u64,
    pub activity: ActivityType,
}

/// A recorded change of channel policies
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUpdate {
    pub id: ChannelId,
    pub updated_at: OffsetDateTime,
    /// changed policy attributes, others are `None`
    pub policies: [Policy; 2],
}

impl ChannelUpdate {
    pub fn from_item(id: ChannelId, item: &Item) -> Result<Self, Error> {
        let updated_at = get_date(item, "updated_at")?
            .ok_or_else(|| Error::MissingAttribute(format!("updated_at of update to {}", id)))?;
        Ok(ChannelUpdate {
            id,
            updated_at,
            policies: [Policy::from_item(item, Side::Node1)?, Policy::from_item(item, Side::Node2)?],
        })
    }
}

/// The most recent activity over a directed edge
#[derive(Debug, Clone, PartialEq)]
pub struct LastAttempt {
    pub activity: ActivityType,
    pub channel: ChannelId,
    pub from_public_key: String,
    pub to_public_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dates::parse_iso;

    const A: &str = "02aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const B: &str = "03bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn update(source: &str, target: &str) -> PolicyUpdate {
        PolicyUpdate {
            id: "539268x845x1".parse().unwrap(),
            capacity: 1_000_000,
            transaction_id: "ab".repeat(32),
            transaction_vout: 1,
            source: source.to_string(),
            target: target.to_string(),
            base_fee_mtokens: 1000,
            cltv_delta: 40,
            fee_rate: 1,
            is_disabled: false,
            min_htlc_mtokens: 1000,
            updated_at: parse_iso("2019-01-01T00:00:00.000Z").unwrap(),
        }
    }

    #[test]
    fn sides_by_key_order() {
        assert_eq!(update(A, B).side(), Side::Node1);
        assert_eq!(update(B, A).side(), Side::Node2);
        let item = update(B, A).policy_item().unwrap();
        assert_eq!(item["node2_public_key"].as_str(), Some(B));
        assert_eq!(item["node2_base_fee_mtokens"].as_str(), Some("1000"));
        assert!(!item.contains_key("node1_public_key"));
    }

    #[test]
    fn channel_item_mapping() {
        let update = update(A, B);
        let mut item = update.policy_item().unwrap();
        item.insert("key".to_string(), channel_key(Network::Bitcoin, &update.id).into());
        item.insert("capacity".to_string(), number(update.capacity));

        let mut channel = Channel::from_item(&item).unwrap();
        assert_eq!(channel.id.to_string(), "539268x845x1");
        assert_eq!(channel.policy(Side::Node1).cltv_delta, Some(40));
        assert_eq!(channel.side_of(A), Some(Side::Node1));
        assert!(!channel.is_complete());

        channel.policies[1].public_key = Some(B.to_string());
        assert!(channel.is_complete());
        channel.unknown_at = Some(update.updated_at);
        assert!(!channel.is_complete());

        let again = Channel::from_item(&channel.to_item(Network::Bitcoin).unwrap()).unwrap();
        assert_eq!(again, channel);
    }

    #[test]
    fn activity_types() {
        assert_eq!("success".parse::<ActivityType>().unwrap(), ActivityType::Success);
        assert!(matches!("maybe".parse::<ActivityType>(), Err(Error::InvalidActivityType(_))));
    }

    #[test]
    fn invalid_updates() {
        assert!(update(A, A).validate().is_err());
        let mut bad = update(A, B);
        bad.transaction_id = "xyz".to_string();
        assert!(bad.validate().is_err());
        update(A, B).validate().unwrap();
    }
}
