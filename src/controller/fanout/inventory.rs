use std::{future::Future, net::Ipv4Addr, time::Duration};

use futures::future::{self, BoxFuture, FutureExt};
use hashbrown::HashMap;
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

use crate::controller::config::ControllerConfig;

use super::{error::Error, parse_ipv4, NodeId, TopicId};

/// A cluster node as the inventory reports it.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct RawNode {
    #[builder(setter(into))]
    pub name: String,
    /// The node's internal address, if it has been assigned one.
    #[builder(default, setter(strip_option, into))]
    pub internal_address: Option<String>,
}

/// A subscriber process as the inventory reports it. Everything except the
/// name may still be missing while the process is being scheduled.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct RawSubscriber {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default, setter(strip_option, into))]
    pub node_name: Option<String>,
    #[builder(default, setter(strip_option, into))]
    pub address: Option<String>,
    /// Unparsed topic label.
    #[builder(default, setter(strip_option, into))]
    pub topic: Option<String>,
    /// Unparsed configured delivery port.
    #[builder(default, setter(strip_option, into))]
    pub port: Option<String>,
}

/// Source of cluster topology. Implementations are handed to the reconciler
/// at construction so tests can substitute their own.
pub trait ClusterInventory: Send + Sync {
    fn list_nodes(&self) -> BoxFuture<'_, Result<Vec<RawNode>, Error>>;
    fn list_subscribers(&self) -> BoxFuture<'_, Result<Vec<RawSubscriber>, Error>>;
}

/// Fixed inventory contents, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    pub nodes: Vec<RawNode>,
    pub subscribers: Vec<RawSubscriber>,
}

impl StaticInventory {
    pub fn new(nodes: Vec<RawNode>, subscribers: Vec<RawSubscriber>) -> Self {
        Self { nodes, subscribers }
    }
}

impl ClusterInventory for StaticInventory {
    fn list_nodes(&self) -> BoxFuture<'_, Result<Vec<RawNode>, Error>> {
        future::ready(Ok(self.nodes.clone())).boxed()
    }

    fn list_subscribers(&self) -> BoxFuture<'_, Result<Vec<RawSubscriber>, Error>> {
        future::ready(Ok(self.subscribers.clone())).boxed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotNode {
    /// Position of the node's name in sorted order.
    pub id: NodeId,
    pub name: String,
    pub addr: Option<Ipv4Addr>,
}

/// A subscriber that is fully placed and can be delivered to this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub topic: TopicId,
    pub node: NodeId,
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Topology collected at the start of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Sorted by name; `nodes[i].id == i`.
    pub nodes: Vec<SnapshotNode>,
    pub endpoints: Vec<Endpoint>,
    /// Subscribers left out because they aren't placed yet.
    pub skipped: usize,
}

impl Snapshot {
    pub fn node(&self, id: NodeId) -> Option<&SnapshotNode> {
        self.nodes.get(id as usize)
    }
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| Error::InventoryTimeout(limit))?
}

/// Queries the inventory and normalises the answer into a [`Snapshot`].
///
/// Any inventory failure fails the whole collection; nothing from earlier
/// cycles is reused.
pub async fn collect_snapshot<I>(
    inventory: &I,
    config: &ControllerConfig,
) -> Result<Snapshot, Error>
where
    I: ClusterInventory + ?Sized,
{
    let raw_nodes = bounded(config.discovery_timeout, inventory.list_nodes()).await?;
    let raw_subs = bounded(config.discovery_timeout, inventory.list_subscribers()).await?;
    Ok(assemble(raw_nodes, raw_subs, config))
}

fn assemble(
    mut raw_nodes: Vec<RawNode>,
    raw_subs: Vec<RawSubscriber>,
    config: &ControllerConfig,
) -> Snapshot {
    raw_nodes.sort_by(|a, b| a.name.cmp(&b.name));
    raw_nodes.dedup_by(|a, b| a.name == b.name);

    let nodes: Vec<SnapshotNode> = raw_nodes
        .into_iter()
        .enumerate()
        .map(|(i, n)| SnapshotNode {
            id: i as NodeId,
            addr: parse_ipv4(n.internal_address.as_deref()),
            name: n.name,
        })
        .collect();

    let mut endpoints = Vec::with_capacity(raw_subs.len());
    let mut skipped = 0;
    {
        let by_name: HashMap<&str, NodeId> =
            nodes.iter().map(|n| (n.name.as_str(), n.id)).collect();

        for sub in raw_subs {
            let Some(addr) = parse_ipv4(sub.address.as_deref()) else {
                debug!(subscriber = %sub.name, "no address yet, skipping");
                skipped += 1;
                continue;
            };
            let Some(node_name) = sub.node_name.as_deref().filter(|n| !n.is_empty()) else {
                debug!(subscriber = %sub.name, "not scheduled yet, skipping");
                skipped += 1;
                continue;
            };
            let Some(&node) = by_name.get(node_name) else {
                warn!(
                    subscriber = %sub.name,
                    node = node_name,
                    "hosting node unknown to inventory, skipping"
                );
                skipped += 1;
                continue;
            };
            let topic = sub
                .topic
                .as_deref()
                .and_then(|t| t.trim().parse::<TopicId>().ok())
                .unwrap_or(config.default_topic);
            let port = sub
                .port
                .as_deref()
                .and_then(|p| p.trim().parse::<u16>().ok())
                .unwrap_or(config.default_port);
            endpoints.push(Endpoint {
                name: sub.name,
                topic,
                node,
                addr,
                port,
            });
        }
    }

    Snapshot {
        nodes,
        endpoints,
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, addr: &str) -> RawNode {
        RawNode::builder().name(name).internal_address(addr).build()
    }

    #[tokio::test]
    async fn indexes_nodes_by_sorted_name() {
        let inv = StaticInventory::new(
            vec![
                node("worker-c", "10.0.0.3"),
                node("worker-a", "10.0.0.1"),
                node("worker-b", "10.0.0.2"),
            ],
            vec![],
        );
        let snap = collect_snapshot(&inv, &ControllerConfig::default()).await.unwrap();
        let names: Vec<_> = snap.nodes.iter().map(|n| (n.id, n.name.as_str())).collect();
        assert_eq!(names, vec![(0, "worker-a"), (1, "worker-b"), (2, "worker-c")]);
        assert_eq!(snap.node(1).unwrap().addr, Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[tokio::test]
    async fn skips_unplaced_subscribers() {
        let inv = StaticInventory::new(
            vec![node("n0", "10.0.0.1")],
            vec![
                RawSubscriber::builder().name("no-addr").node_name("n0").build(),
                RawSubscriber::builder().name("no-node").address("10.244.0.9").build(),
                RawSubscriber::builder()
                    .name("lost")
                    .node_name("gone")
                    .address("10.244.0.8")
                    .build(),
                RawSubscriber::builder()
                    .name("ok")
                    .node_name("n0")
                    .address("10.244.0.7")
                    .build(),
            ],
        );
        let snap = collect_snapshot(&inv, &ControllerConfig::default()).await.unwrap();
        assert_eq!(snap.skipped, 3);
        assert_eq!(snap.endpoints.len(), 1);
        assert_eq!(snap.endpoints[0].name, "ok");
    }

    #[tokio::test]
    async fn applies_defaults() {
        let inv = StaticInventory::new(
            vec![node("n0", "10.0.0.1")],
            vec![
                RawSubscriber::builder()
                    .name("plain")
                    .node_name("n0")
                    .address("10.244.0.7")
                    .build(),
                RawSubscriber::builder()
                    .name("garbled")
                    .node_name("n0")
                    .address("10.244.0.8")
                    .topic("seven")
                    .port("99999")
                    .build(),
                RawSubscriber::builder()
                    .name("custom")
                    .node_name("n0")
                    .address("10.244.0.9")
                    .topic("7")
                    .port("40000")
                    .build(),
            ],
        );
        let snap = collect_snapshot(&inv, &ControllerConfig::default()).await.unwrap();
        let got: Vec<_> = snap.endpoints.iter().map(|e| (e.topic, e.port)).collect();
        assert_eq!(got, vec![(1, 31001), (1, 31001), (7, 40000)]);
    }

    struct Stalled;

    impl ClusterInventory for Stalled {
        fn list_nodes(&self) -> BoxFuture<'_, Result<Vec<RawNode>, Error>> {
            future::pending().boxed()
        }

        fn list_subscribers(&self) -> BoxFuture<'_, Result<Vec<RawSubscriber>, Error>> {
            future::pending().boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_inventory_times_out() {
        let config = ControllerConfig::builder()
            .discovery_timeout(Duration::from_secs(2))
            .build();
        let err = collect_snapshot(&Stalled, &config).await.unwrap_err();
        assert!(matches!(err, Error::InventoryTimeout(d) if d == Duration::from_secs(2)));
    }
}
