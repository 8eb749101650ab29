//! Composite, lexically sortable keys.
//!
//! | entity | key |
//! |---|---|
//! | channel | `chain_tag ∥ raw_channel_id` |
//! | node to channel link | `public_key ∥ chain_tag ∥ raw_channel_id` |
//! | edge activity | `to_public_key ∥ chain_tag ∥ raw_channel_id ∥ decrementing_number(attempted_at)` |
//! | channel update | `chain_tag ∥ raw_channel_id ∥ decrementing_number(updated_at)` |

use core::fmt;
use core::str::FromStr;

use time::OffsetDateTime;

use crate::dates::decrementing_number;
use crate::Error;

/// Network names
pub const NETWORK_NAMES: [&str; 4] = ["bitcoin", "testnet", "regtest", "signet"];

/// Length of a hex encoded compressed public key
pub const PUBLIC_KEY_HEX_LEN: usize = 66;

/// Length of a hex encoded raw channel id
pub const CHANNEL_ID_HEX_LEN: usize = 16;

/// Length of a chain tag
pub const CHAIN_TAG_LEN: usize = 2;

const MAX_BLOCK_HEIGHT: u32 = 0xff_ffff;
const MAX_TX_INDEX: u32 = 0xff_ffff;

/// The network whose chain a channel is funded on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    #[default]
    Bitcoin,
    Testnet,
    Regtest,
    Signet,
}

impl Network {
    /// Short code prefixed to keys of entities on this network
    pub fn chain_tag(&self) -> &'static str {
        match self {
            Network::Bitcoin => "00",
            Network::Testnet => "01",
            Network::Regtest => "02",
            Network::Signet => "03",
        }
    }

    pub fn from_chain_tag(tag: &str) -> Result<Self, Error> {
        match tag {
            "00" => Ok(Network::Bitcoin),
            "01" => Ok(Network::Testnet),
            "02" => Ok(Network::Regtest),
            "03" => Ok(Network::Signet),
            _ => Err(Error::InvalidNetwork(format!("chain tag {}", tag))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Network::Bitcoin => NETWORK_NAMES[0],
            Network::Testnet => NETWORK_NAMES[1],
            Network::Regtest => NETWORK_NAMES[2],
            Network::Signet => NETWORK_NAMES[3],
        }
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" | "btc" | "mainnet" => Ok(Network::Bitcoin),
            "testnet" | "btctestnet" => Ok(Network::Testnet),
            "regtest" | "btcregtest" => Ok(Network::Regtest),
            "signet" => Ok(Network::Signet),
            _ => Err(Error::InvalidNetwork(s.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A short channel id, packing the funding block height (3 bytes), the
/// transaction index in the block (3 bytes) and the funding output index
/// (2 bytes) into 8 big-endian bytes.
///
/// Displayed as `HxIxO`, stored as 16 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn new(block_height: u32, tx_index: u32, output_index: u16) -> Result<Self, Error> {
        if block_height > MAX_BLOCK_HEIGHT {
            return Err(Error::InvalidChannelId(format!("block height {} too large", block_height)));
        }
        if tx_index > MAX_TX_INDEX {
            return Err(Error::InvalidChannelId(format!("tx index {} too large", tx_index)));
        }
        Ok(ChannelId(
            (u64::from(block_height) << 40) | (u64::from(tx_index) << 16) | u64::from(output_index),
        ))
    }

    pub fn from_raw(raw: u64) -> Self {
        ChannelId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn block_height(&self) -> u32 {
        (self.0 >> 40) as u32
    }

    pub fn tx_index(&self) -> u32 {
        ((self.0 >> 16) & u64::from(MAX_TX_INDEX)) as u32
    }

    pub fn output_index(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// The raw id as used inside keys
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, Error> {
        if s.len() != CHANNEL_ID_HEX_LEN {
            return Err(Error::InvalidChannelId(s.to_string()));
        }
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::InvalidChannelId(s.to_string()))?;
        Ok(ChannelId(u64::from_be_bytes(bytes)))
    }

    /// Accepts either the display form or the raw hex form
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s.contains('x') {
            s.parse()
        } else {
            Self::from_hex(s)
        }
    }
}

fn parse_component<T: FromStr>(s: &str, whole: &str) -> Result<T, Error> {
    let canonical = !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_digit())
        && (s == "0" || !s.starts_with('0'));
    if !canonical {
        return Err(Error::InvalidChannelId(whole.to_string()));
    }
    s.parse().map_err(|_| Error::InvalidChannelId(whole.to_string()))
}

impl FromStr for ChannelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('x').collect();
        if parts.len() != 3 {
            return Err(Error::InvalidChannelId(s.to_string()));
        }
        let block_height = parse_component(parts[0], s)?;
        let tx_index = parse_component(parts[1], s)?;
        let output_index = parse_component(parts[2], s)?;
        ChannelId::new(block_height, tx_index, output_index)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.block_height(), self.tx_index(), self.output_index())
    }
}

/// Compressed public keys are stored as lowercase hex
pub fn validate_public_key(public_key: &str) -> Result<(), Error> {
    let valid = public_key.len() == PUBLIC_KEY_HEX_LEN
        && public_key.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !valid {
        return Err(Error::InvalidPublicKey(public_key.to_string()));
    }
    Ok(())
}

pub fn channel_key(network: Network, id: &ChannelId) -> String {
    format!("{}{}", network.chain_tag(), id.to_hex())
}

/// Split a channel key back into its network and id
pub fn parse_channel_key(key: &str) -> Result<(Network, ChannelId), Error> {
    if key.len() != CHAIN_TAG_LEN + CHANNEL_ID_HEX_LEN || !key.is_ascii() {
        return Err(Error::InvalidChannelId(key.to_string()));
    }
    let (tag, id) = key.split_at(CHAIN_TAG_LEN);
    Ok((Network::from_chain_tag(tag)?, ChannelId::from_hex(id)?))
}

/// Prefix of all node to channel links of a node on a network
pub fn node_channels_prefix(public_key: &str, network: Network) -> String {
    format!("{}{}", public_key, network.chain_tag())
}

pub fn node_channel_key(public_key: &str, network: Network, id: &ChannelId) -> String {
    format!("{}{}", public_key, channel_key(network, id))
}

/// The channel id of a node to channel link key
pub fn channel_id_of_node_channel_key(key: &str) -> Result<ChannelId, Error> {
    let channel_key = key.get(PUBLIC_KEY_HEX_LEN..).ok_or_else(|| Error::InvalidChannelId(key.to_string()))?;
    Ok(parse_channel_key(channel_key)?.1)
}

/// A directed edge, the prefix of its activity keys
pub fn edge_key(to_public_key: &str, network: Network, id: &ChannelId) -> String {
    node_channel_key(to_public_key, network, id)
}

pub fn edge_activity_key(
    to_public_key: &str,
    network: Network,
    id: &ChannelId,
    attempted_at: &OffsetDateTime,
) -> Result<String, Error> {
    Ok(format!("{}{}", edge_key(to_public_key, network, id), decrementing_number(attempted_at)?))
}

pub fn channel_update_key(
    network: Network,
    id: &ChannelId,
    updated_at: &OffsetDateTime,
) -> Result<String, Error> {
    Ok(format!("{}{}", channel_key(network, id), decrementing_number(updated_at)?))
}
