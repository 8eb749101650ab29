use async_trait::async_trait;

use crate::keys::ChannelId;
use crate::model::{Channel, NodeUpdate};
use crate::Error;

/// What the authoritative source knows about a channel
#[derive(Debug, Clone, PartialEq)]
pub enum SourceChannel {
    /// an open channel with its capacity, funding outpoint and current policies
    Open(Channel),
    Closed { close_height: u32 },
    /// never existed, or not yet observed by the source
    NotFound,
}

/// The authoritative view of the graph, typically a Lightning node.
///
/// Never written to. Lookups are expensive, the store calls these only when
/// neither cache can answer.
#[async_trait]
pub trait GraphSource: Send + Sync {
    /// The node's current announcement, `None` if the source does not know it
    async fn get_node(&self, public_key: &str) -> Result<Option<NodeUpdate>, Error>;

    async fn get_channel(&self, id: &ChannelId) -> Result<SourceChannel, Error>;
}
