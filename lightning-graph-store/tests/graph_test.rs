use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lightning_graph_store::database::remote::{PutRequest, UpdateRequest};
use lightning_graph_store::database::{catalog, DocumentStore, EmbeddedDatabase, MemoryDocumentStore, Table};
use lightning_graph_store::dates::parse_iso;
use lightning_graph_store::query::RemoteQuery;
use lightning_graph_store::value::{from_row, to_row, Item, Row, Value};
use lightning_graph_store::{
    ActivityType, Channel, ChannelId, EdgeActivity, Error, GraphSource, GraphStore, Node, NodeUpdate, Policy,
    PolicyUpdate, SourceChannel, StoreConfig,
};
use parking_lot::Mutex;
use tempfile::TempDir;

const A: &str = "02aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const B: &str = "03bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const C: &str = "03cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

#[derive(Default)]
struct TestSource {
    nodes: Mutex<HashMap<String, NodeUpdate>>,
    channels: Mutex<HashMap<ChannelId, SourceChannel>>,
    node_calls: AtomicUsize,
    channel_calls: AtomicUsize,
}

impl TestSource {
    fn channel_calls(&self) -> usize {
        self.channel_calls.load(Ordering::SeqCst)
    }

    fn node_calls(&self) -> usize {
        self.node_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphSource for TestSource {
    async fn get_node(&self, public_key: &str) -> Result<Option<NodeUpdate>, Error> {
        self.node_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.nodes.lock().get(public_key).cloned())
    }

    async fn get_channel(&self, id: &ChannelId) -> Result<SourceChannel, Error> {
        self.channel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.channels.lock().get(id).cloned().unwrap_or(SourceChannel::NotFound))
    }
}

/// Fails the first `failures` writes as throttled
struct ThrottledStore {
    inner: MemoryDocumentStore,
    failures: AtomicUsize,
    writes: AtomicUsize,
}

impl ThrottledStore {
    fn new(failures: usize) -> Self {
        ThrottledStore {
            inner: MemoryDocumentStore::new(catalog("graph")),
            failures: AtomicUsize::new(failures),
            writes: AtomicUsize::new(0),
        }
    }

    fn throttle(&self) -> Result<(), Error> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(Error::Throughput("slow down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for ThrottledStore {
    async fn get_item(&self, table: &str, key: &Row) -> Result<Option<Row>, Error> {
        self.inner.get_item(table, key).await
    }

    async fn put_item(&self, request: &PutRequest) -> Result<(), Error> {
        self.throttle()?;
        self.inner.put_item(request).await
    }

    async fn update_item(&self, request: &UpdateRequest) -> Result<(), Error> {
        self.throttle()?;
        self.inner.update_item(request).await
    }

    async fn query(&self, query: &RemoteQuery) -> Result<Vec<Row>, Error> {
        self.inner.query(query).await
    }
}

fn config() -> StoreConfig {
    StoreConfig { retry_initial_interval: Duration::from_millis(1), ..Default::default() }
}

fn embedded(dir: &TempDir) -> Arc<EmbeddedDatabase> {
    Arc::new(EmbeddedDatabase::open(dir.path(), 1024 * 1024).unwrap())
}

fn memory() -> Arc<MemoryDocumentStore> {
    Arc::new(MemoryDocumentStore::new(catalog("graph")))
}

/// Wait for a back-fill satisfying `done` to land in the embedded cache
async fn backfilled(db: &EmbeddedDatabase, table: Table, key: &str, done: impl Fn(&Item) -> bool) -> Item {
    for _ in 0..200 {
        if let Some(item) = db.get(table, key).unwrap() {
            if done(&item) {
                return item;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} was not back-filled", key);
}

fn channel_row_key(id: ChannelId) -> String {
    format!("00{}", id.to_hex())
}

fn id(tx_index: u32) -> ChannelId {
    ChannelId::new(600000, tx_index, 0).unwrap()
}

fn node_update(public_key: &str, alias: &str, color: &str, updated_at: &str) -> NodeUpdate {
    NodeUpdate {
        public_key: public_key.to_string(),
        alias: alias.to_string(),
        color: color.to_string(),
        sockets: vec!["127.0.0.1:9735".to_string()],
        updated_at: parse_iso(updated_at).unwrap(),
    }
}

fn policy_update(id: ChannelId, source: &str, target: &str, fee_rate: u32, updated_at: &str) -> PolicyUpdate {
    PolicyUpdate {
        id,
        capacity: 1_000_000,
        transaction_id: "ab".repeat(32),
        transaction_vout: 0,
        source: source.to_string(),
        target: target.to_string(),
        base_fee_mtokens: 1000,
        cltv_delta: 40,
        fee_rate,
        is_disabled: false,
        min_htlc_mtokens: 1000,
        updated_at: parse_iso(updated_at).unwrap(),
    }
}

fn open_channel(id: ChannelId, capacity: u64, node1: &str, node2: &str) -> Channel {
    let mut channel = Channel::new(id);
    channel.capacity = Some(capacity);
    channel.transaction_id = Some("ab".repeat(32));
    channel.transaction_vout = Some(0);
    channel.policies = [
        Policy { public_key: Some(node1.to_string()), fee_rate: Some(1), ..Default::default() },
        Policy { public_key: Some(node2.to_string()), fee_rate: Some(2), ..Default::default() },
    ];
    channel
}

#[tokio::test]
async fn node_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::new(config()).with_embedded(embedded(&dir)).with_remote(memory());

    let update = node_update(A, "A", "#000000", "2020-01-01T00:00:00.000Z");
    assert_eq!(store.update_node(&update).await.unwrap(), Some(1));

    let node = store.get_node(A).await.unwrap().unwrap();
    assert_eq!(node.public_key, A);
    assert_eq!(node.alias.as_deref(), Some("A"));
    assert_eq!(node.color.as_deref(), Some("#000000"));
    assert_eq!(node.sockets, vec!["127.0.0.1:9735".to_string()]);
    assert_eq!(node.rev, 1);
    assert_eq!(store.get_all_nodes().unwrap().len(), 1);
}

#[tokio::test]
async fn stale_node_update_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::new(config()).with_embedded(embedded(&dir)).with_remote(memory());

    store.update_node(&node_update(A, "A", "#000000", "2020-01-02T00:00:00.000Z")).await.unwrap();
    let same_time = node_update(A, "B", "#ffffff", "2020-01-02T00:00:00.000Z");
    assert_eq!(store.update_node(&same_time).await.unwrap(), None);
    let older = node_update(A, "B", "#ffffff", "2020-01-01T00:00:00.000Z");
    assert_eq!(store.update_node(&older).await.unwrap(), None);
    assert_eq!(store.get_node(A).await.unwrap().unwrap().alias.as_deref(), Some("A"));

    let newer = node_update(A, "", "#ffffff", "2020-01-03T00:00:00.000Z");
    assert_eq!(store.update_node(&newer).await.unwrap(), Some(2));
    let node = store.get_node(A).await.unwrap().unwrap();
    assert_eq!(node.alias, None);
    assert_eq!(node.color.as_deref(), Some("#ffffff"));
}

#[tokio::test]
async fn invalid_arguments_are_rejected_before_io() {
    let store = GraphStore::new(config());
    assert!(matches!(store.get_node("02ab").await, Err(Error::InvalidPublicKey(_))));
    let update = policy_update(id(1), A, A, 1, "2020-01-01T00:00:00.000Z");
    assert!(store.update_channel(&update).await.unwrap_err().is_validation());
    let update = policy_update(id(1), A, B, 1, "2020-01-01T00:00:00.000Z");
    assert!(matches!(store.update_channel(&update).await, Err(Error::NotConfigured(_))));
}

#[tokio::test]
async fn capacity_filter() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::new(config()).with_embedded(embedded(&dir));
    for (tx_index, capacity) in [(1, 500), (2, 1000), (3, 2000)] {
        store.set_channel_record(&open_channel(id(tx_index), capacity, A, B)).unwrap();
    }

    let channels = store.get_all_channels(Some(1000), false).unwrap();
    let capacities: Vec<_> = channels.iter().map(|c| c.capacity.unwrap()).collect();
    assert_eq!(capacities, vec![1000, 2000]);
    assert_eq!(store.get_all_channels(None, true).unwrap().len(), 3);
}

#[tokio::test]
async fn edge_history_is_most_recent_first() {
    let dir = tempfile::tempdir().unwrap();
    let remote = memory();
    let store = GraphStore::new(config()).with_embedded(embedded(&dir)).with_remote(remote.clone());
    let t1 = parse_iso("2020-01-01T00:00:00.000Z").unwrap();
    let t2 = parse_iso("2020-01-01T00:01:00.000Z").unwrap();

    store.update_channel(&policy_update(id(1), A, B, 1, "2019-12-01T00:00:00.000Z")).await.unwrap();
    store.update_channel(&policy_update(id(1), B, A, 2, "2019-12-01T00:00:00.000Z")).await.unwrap();
    for (attempted_at, activity) in [(t1, ActivityType::Failure), (t2, ActivityType::Success)] {
        let record = EdgeActivity { to_public_key: B.to_string(), channel: id(1), attempted_at, tokens: 100, activity };
        store.record_edge_activity(&record).await.unwrap();
    }
    assert_eq!(remote.len("graph-edge_activity"), 2);

    let history = store.get_edge_history(B, &id(1), None, None).await.unwrap();
    let dates: Vec<_> = history.iter().map(|a| a.attempted_at).collect();
    assert_eq!(dates, vec![t2, t1]);
    assert_eq!(history[0].activity, ActivityType::Success);
    assert_eq!(history[1].tokens, 100);

    let after = store.get_edge_history(B, &id(1), Some(t2), None).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].attempted_at, t2);

    // the forwarding side of the remote row notes the latest attempt
    let key = Item::from([("key".to_string(), channel_row_key(id(1)).into())]);
    let row = remote.get_item("graph-channels", &to_row(&key)).await.unwrap().unwrap();
    let row = from_row(&row).unwrap();
    assert_eq!(row["node1_attempted"], Value::from("success"));
    assert!(!row.contains_key("node2_attempted"));

    let last = store.get_last_attempts(None, None).unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].from_public_key, A);
    assert_eq!(last[0].to_public_key, B);
    assert_eq!(last[0].activity, ActivityType::Success);
}

#[tokio::test]
async fn close_height_is_never_changed() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::default());
    let store = GraphStore::new(config())
        .with_embedded(embedded(&dir))
        .with_remote(memory())
        .with_source(source.clone());

    store.close_channel(&id(1), 700000).await.unwrap();
    store.close_channel(&id(1), 700100).await.unwrap();

    let channels = store.get_all_channels(None, false).unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].close_height, Some(700000));
    assert!(store.get_all_channels(None, true).unwrap().is_empty());

    assert_eq!(store.get_channel(&id(1)).await.unwrap(), None);
    assert_eq!(source.channel_calls(), 0);
}

#[tokio::test]
async fn incomplete_channel_is_not_a_cache_hit() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::default());
    source.channels.lock().insert(id(1), SourceChannel::Open(open_channel(id(1), 1_000_000, A, B)));
    let store = GraphStore::new(config()).with_embedded(embedded(&dir)).with_source(source.clone());

    // only one side has been announced
    store.update_channel(&policy_update(id(1), A, B, 1, "2020-01-01T00:00:00.000Z")).await.unwrap();

    let channel = store.get_channel(&id(1)).await.unwrap().unwrap();
    assert_eq!(source.channel_calls(), 1);
    assert_eq!(channel.policies[1].public_key.as_deref(), Some(B));
    assert_eq!(channel.capacity, Some(1_000_000));

    // written back complete
    let channel = store.get_channel(&id(1)).await.unwrap().unwrap();
    assert_eq!(source.channel_calls(), 1);
    assert!(channel.is_complete());
}

#[tokio::test]
async fn channel_update_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::new(config()).with_embedded(embedded(&dir)).with_remote(memory());

    let update = policy_update(id(1), A, B, 1, "2020-01-01T00:00:00.000Z");
    let changed = store.update_channel(&update).await.unwrap().unwrap();
    assert_eq!(changed["node1_fee_rate"], Value::Number(1));
    assert_eq!(store.update_channel(&update).await.unwrap(), None);

    // same policy, later timestamp
    let later = policy_update(id(1), A, B, 1, "2020-01-02T00:00:00.000Z");
    assert_eq!(store.update_channel(&later).await.unwrap(), None);

    let fee_change = policy_update(id(1), A, B, 5, "2020-01-03T00:00:00.000Z");
    let changed = store.update_channel(&fee_change).await.unwrap().unwrap();
    assert_eq!(changed["node1_fee_rate"], Value::Number(5));

    let updates = store.get_channel_updates(&id(1), None).await.unwrap();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].updated_at, parse_iso("2020-01-03T00:00:00.000Z").unwrap());
    assert_eq!(updates[0].policies[0].fee_rate, Some(5));
}

#[tokio::test]
async fn unknown_channel_skips_the_source() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::default());
    let store = GraphStore::new(config()).with_embedded(embedded(&dir)).with_source(source.clone());

    assert_eq!(store.get_channel(&id(9)).await.unwrap(), None);
    assert_eq!(store.get_channel(&id(9)).await.unwrap(), None);
    assert_eq!(source.channel_calls(), 1);

    // an announcement clears the marker
    store.update_channel(&policy_update(id(9), A, B, 1, "2020-01-01T00:00:00.000Z")).await.unwrap();
    store.update_channel(&policy_update(id(9), B, A, 1, "2020-01-01T00:00:00.000Z")).await.unwrap();
    assert!(store.get_channel(&id(9)).await.unwrap().is_some());
    assert_eq!(source.channel_calls(), 1);
}

#[tokio::test]
async fn closed_channel_from_source_is_cached() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::default());
    source.channels.lock().insert(id(2), SourceChannel::Closed { close_height: 700000 });
    let store = GraphStore::new(config()).with_embedded(embedded(&dir)).with_source(source.clone());

    assert_eq!(store.get_channel(&id(2)).await.unwrap(), None);
    assert_eq!(store.get_channel(&id(2)).await.unwrap(), None);
    assert_eq!(source.channel_calls(), 1);
    assert_eq!(store.get_all_channels(None, false).unwrap()[0].close_height, Some(700000));
}

#[test_log::test(tokio::test)]
async fn policies_are_enriched_with_node_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::default());
    source.nodes.lock().insert(A.to_string(), node_update(A, "alice", "#ff0000", "2020-01-01T00:00:00.000Z"));
    source.channels.lock().insert(id(1), SourceChannel::Open(open_channel(id(1), 1_000_000, A, B)));
    let store = GraphStore::new(config())
        .with_embedded(embedded(&dir))
        .with_remote(memory())
        .with_source(source.clone());

    let channel = store.get_channel(&id(1)).await.unwrap().unwrap();
    assert_eq!(channel.policies[0].alias.as_deref(), Some("alice"));
    assert_eq!(channel.policies[0].color.as_deref(), Some("#ff0000"));
    assert_eq!(channel.policies[1].alias, None);
    assert_eq!(source.node_calls(), 2);

    // alice is cached now, B is still unknown
    let channel = store.get_channel(&id(1)).await.unwrap().unwrap();
    assert_eq!(channel.policies[0].alias.as_deref(), Some("alice"));
    assert_eq!(source.node_calls(), 3);
    assert_eq!(source.channel_calls(), 1);
}

#[tokio::test]
async fn channels_for_node() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::new(config()).with_embedded(embedded(&dir));
    for (tx_index, from, to) in [(3, A, C), (1, A, B), (2, B, C)] {
        store.update_channel(&policy_update(id(tx_index), from, to, 1, "2020-01-01T00:00:00.000Z")).await.unwrap();
        store.update_channel(&policy_update(id(tx_index), to, from, 1, "2020-01-01T00:00:00.000Z")).await.unwrap();
    }

    let channels = store.get_channels_for_node(A).await.unwrap();
    let ids: Vec<_> = channels.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![id(1), id(3)]);
}

#[tokio::test]
async fn stale_channels_are_verified() {
    let source = Arc::new(TestSource::default());
    source.channels.lock().insert(id(1), SourceChannel::Closed { close_height: 700000 });
    source.channels.lock().insert(id(2), SourceChannel::Open(open_channel(id(2), 1_000_000, A, B)));
    let store = GraphStore::new(config()).with_remote(memory()).with_source(source.clone());
    // announced long ago, by one side only
    for tx_index in [1, 2] {
        store.update_channel(&policy_update(id(tx_index), A, B, 1, "2020-01-01T00:00:00.000Z")).await.unwrap();
    }

    let channels = store.get_channels_for_node(A).await.unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].id, id(2));
    assert_eq!(channels[0].policies[1].public_key.as_deref(), Some(B));
    // two verifications and one lookup of the incomplete channel
    assert_eq!(source.channel_calls(), 3);

    // both answers are cached
    let channels = store.get_channels_for_node(A).await.unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(source.channel_calls(), 3);
}

#[tokio::test]
async fn throttled_writes_are_retried() {
    let remote = Arc::new(ThrottledStore::new(2));
    let store = GraphStore::new(config()).with_remote(remote.clone());
    let update = node_update(A, "A", "#000000", "2020-01-01T00:00:00.000Z");
    assert_eq!(store.update_node(&update).await.unwrap(), Some(1));
    assert_eq!(remote.writes.load(Ordering::SeqCst), 3);

    let remote = Arc::new(ThrottledStore::new(100));
    let config = StoreConfig { retry_attempts: 3, ..config() };
    let store = GraphStore::new(config).with_remote(remote.clone());
    assert!(matches!(store.update_node(&update).await, Err(Error::Throughput(_))));
    assert_eq!(remote.writes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn remote_hit_is_backfilled_without_losing_newer_policies() {
    let dir = tempfile::tempdir().unwrap();
    let db = embedded(&dir);
    let remote = memory();
    let local = GraphStore::new(config()).with_embedded(db.clone());
    let shared = GraphStore::new(config()).with_remote(remote.clone());
    let store = GraphStore::new(config()).with_embedded(db.clone()).with_remote(remote);

    // the embedded cache has a newer policy for one side only
    local.update_channel(&policy_update(id(1), A, B, 2, "2020-02-01T00:00:00.000Z")).await.unwrap();
    shared.update_channel(&policy_update(id(1), A, B, 1, "2020-01-01T00:00:00.000Z")).await.unwrap();
    shared.update_channel(&policy_update(id(1), B, A, 3, "2020-01-01T00:00:00.000Z")).await.unwrap();

    let channel = store.get_channel(&id(1)).await.unwrap().unwrap();
    assert_eq!(channel.policies[0].fee_rate, Some(1));
    assert_eq!(channel.policies[1].fee_rate, Some(3));

    let key = channel_row_key(id(1));
    let item = backfilled(&db, Table::Channels, &key, |item| item.contains_key("node2_public_key")).await;
    let cached = Channel::from_item(&item).unwrap();
    assert!(cached.is_complete());
    assert_eq!(cached.policies[0].fee_rate, Some(2));
    assert_eq!(cached.policies[0].updated_at, Some(parse_iso("2020-02-01T00:00:00.000Z").unwrap()));
    assert_eq!(cached.policies[1].public_key.as_deref(), Some(B));
    assert_eq!(cached.policies[1].fee_rate, Some(3));
}

#[tokio::test]
async fn incomplete_remote_row_falls_through_to_the_source() {
    let source = Arc::new(TestSource::default());
    source.channels.lock().insert(id(1), SourceChannel::Open(open_channel(id(1), 1_000_000, A, B)));
    let store = GraphStore::new(config()).with_remote(memory()).with_source(source.clone());

    store.update_channel(&policy_update(id(1), A, B, 7, "2020-01-01T00:00:00.000Z")).await.unwrap();
    let channel = store.get_channel(&id(1)).await.unwrap().unwrap();
    assert_eq!(source.channel_calls(), 1);
    assert!(channel.is_complete());

    // the write-back completed the row and kept the announced policy
    let channel = store.get_channel(&id(1)).await.unwrap().unwrap();
    assert_eq!(source.channel_calls(), 1);
    assert_eq!(channel.policies[0].fee_rate, Some(7));
    assert_eq!(channel.policies[1].public_key.as_deref(), Some(B));
    assert_eq!(channel.capacity, Some(1_000_000));
}

#[tokio::test]
async fn remote_node_is_backfilled() {
    let dir = tempfile::tempdir().unwrap();
    let db = embedded(&dir);
    let remote = memory();
    let shared = GraphStore::new(config()).with_remote(remote.clone());
    shared.update_node(&node_update(A, "A", "#000000", "2020-01-01T00:00:00.000Z")).await.unwrap();
    let renamed = node_update(A, "A2", "#000000", "2020-01-02T00:00:00.000Z");
    assert_eq!(shared.update_node(&renamed).await.unwrap(), Some(2));

    let store = GraphStore::new(config()).with_embedded(db.clone()).with_remote(remote);
    let node = store.get_node(A).await.unwrap().unwrap();
    assert_eq!(node.rev, 2);
    let item = backfilled(&db, Table::Nodes, A, |_| true).await;
    assert_eq!(Node::from_item(&item).unwrap(), node);

    // later announcements build on the back-filled row
    let newer = node_update(A, "A3", "#000000", "2020-01-03T00:00:00.000Z");
    let local = GraphStore::new(config()).with_embedded(db);
    assert_eq!(local.update_node(&newer).await.unwrap(), Some(3));
    let node = store.get_node(A).await.unwrap().unwrap();
    assert_eq!(node.alias.as_deref(), Some("A3"));
}

#[tokio::test]
async fn channel_record_keeps_cached_close_height_and_newer_policies() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::new(config()).with_embedded(embedded(&dir));

    store.close_channel(&id(1), 700000).await.unwrap();
    store.set_channel_record(&open_channel(id(1), 1_000_000, A, B)).unwrap();
    let channels = store.get_all_channels(None, false).unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].close_height, Some(700000));
    assert_eq!(channels[0].capacity, Some(1_000_000));
    assert!(store.get_all_channels(None, true).unwrap().is_empty());

    store.update_channel(&policy_update(id(2), A, B, 5, "2020-02-01T00:00:00.000Z")).await.unwrap();
    let mut older = open_channel(id(2), 1_000_000, A, B);
    older.policies[0].updated_at = Some(parse_iso("2020-01-01T00:00:00.000Z").unwrap());
    store.set_channel_record(&older).unwrap();
    let channels = store.get_all_channels(None, false).unwrap();
    let channel = channels.iter().find(|c| c.id == id(2)).unwrap();
    assert_eq!(channel.policies[0].fee_rate, Some(5));
    assert_eq!(channel.policies[1].fee_rate, Some(2));
    assert_eq!(channel.policies[1].public_key.as_deref(), Some(B));
}

#[tokio::test]
async fn enriched_policies_skip_node_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(TestSource::default());
    let store = GraphStore::new(config()).with_embedded(embedded(&dir)).with_source(source.clone());
    let mut channel = open_channel(id(1), 1_000_000, A, B);
    for policy in channel.policies.iter_mut() {
        policy.alias = Some("cached".to_string());
        policy.color = Some("#00ff00".to_string());
    }
    store.set_channel_record(&channel).unwrap();

    let found = store.get_channel(&id(1)).await.unwrap().unwrap();
    assert_eq!(found.policies[1].alias.as_deref(), Some("cached"));
    assert_eq!(source.node_calls(), 0);
    assert_eq!(source.channel_calls(), 0);
}
