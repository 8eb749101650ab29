//! A read-through cache of the Lightning Network channel graph, kept in an
//! embedded ordered key-value store and a remote document store in front of
//! an authoritative source.

pub mod config;
pub mod database;
pub mod dates;
mod error;
pub mod expression;
mod graph;
pub mod keys;
pub mod model;
pub mod query;
pub mod reconcile;
pub mod retry;
pub mod source;
pub mod util;
pub mod value;
pub mod write;

pub use config::StoreConfig;
pub use error::Error;
pub use graph::GraphStore;
pub use keys::{ChannelId, Network};
pub use model::{ActivityType, Channel, ChannelUpdate, EdgeActivity, LastAttempt, Node, NodeUpdate, Policy, PolicyUpdate};
pub use source::{GraphSource, SourceChannel};
