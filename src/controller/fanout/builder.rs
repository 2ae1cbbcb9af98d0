use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;
use tracing::warn;

use crate::controller::config::ControllerConfig;

use super::{
    inventory::{Endpoint, Snapshot},
    wire::{encode_u32, NodeDest, SubDest},
    NodeId, TopicId, MAX_FANOUT, MAX_LOCAL_SUB, MAX_NODES, MAX_TOPICS,
};

/// What the builder had to leave out, and how much it produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub topics: usize,
    pub nodes: usize,
    pub node_dests: usize,
    pub sub_dests: usize,
    /// Keys whose list hit capacity and lost entries.
    pub truncated_keys: usize,
    /// Entries dropped by truncation.
    pub dropped_entries: usize,
    /// Topic ids or node indices outside the outer tables' key space.
    pub rejected_keys: usize,
    /// Nodes hosting subscribers that have no address to send to.
    pub unaddressed_nodes: usize,
}

/// One generation's worth of tables, fully built in memory before anything
/// is written to storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutTables {
    pub topics: BTreeMap<TopicId, Vec<NodeDest>>,
    pub nodes: BTreeMap<NodeId, Vec<SubDest>>,
    pub stats: BuildStats,
}

impl FanoutTables {
    pub fn topic(&self, topic: TopicId) -> Option<&[NodeDest]> {
        self.topics.get(&topic).map(Vec::as_slice)
    }

    pub fn node(&self, node: NodeId) -> Option<&[SubDest]> {
        self.nodes.get(&node).map(Vec::as_slice)
    }

    /// Fingerprint of the tables' contents in their on-wire encoding. Two
    /// builds from the same topology have the same digest.
    pub fn digest(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"topics");
        for (topic, dests) in &self.topics {
            hasher.update(&encode_u32(*topic));
            hasher.update(&encode_u32(dests.len() as u32));
            for dest in dests {
                hasher.update(&dest.encode());
            }
        }
        hasher.update(b"nodes");
        for (node, dests) in &self.nodes {
            hasher.update(&encode_u32(*node));
            hasher.update(&encode_u32(dests.len() as u32));
            for dest in dests {
                hasher.update(&dest.encode());
            }
        }
        hasher.finalize()
    }
}

fn truncate<T>(kind: &str, key: u32, list: &mut Vec<T>, cap: usize, stats: &mut BuildStats) {
    if list.len() > cap {
        let dropped = list.len() - cap;
        warn!(kind, key, dropped, cap, "fanout list over capacity, truncating");
        list.truncate(cap);
        stats.truncated_keys += 1;
        stats.dropped_entries += dropped;
    }
}

/// Compiles a snapshot into topic → nodes and node → subscribers tables.
///
/// Node lists are ordered by node index and subscriber lists by subscriber
/// name, so capacity truncation always keeps the same entries for the same
/// topology.
pub fn build_tables(snapshot: &Snapshot, config: &ControllerConfig) -> FanoutTables {
    let mut stats = BuildStats::default();

    let mut hosting: HashMap<TopicId, BTreeSet<NodeId>> = HashMap::new();
    let mut local: HashMap<NodeId, Vec<&Endpoint>> = HashMap::new();
    for ep in &snapshot.endpoints {
        hosting.entry(ep.topic).or_default().insert(ep.node);
        local.entry(ep.node).or_default().push(ep);
    }

    let mut topics = BTreeMap::new();
    for (topic, node_ids) in hosting {
        if topic >= MAX_TOPICS {
            warn!(topic, max = MAX_TOPICS, "topic id outside table key space, rejecting");
            stats.rejected_keys += 1;
            continue;
        }
        let mut dests = Vec::with_capacity(node_ids.len());
        for id in node_ids {
            // counted once in `rejected_keys` by the node table pass below
            if id >= MAX_NODES {
                warn!(topic, node = id, "hosting node outside node table, leaving it out");
                continue;
            }
            match snapshot.node(id).and_then(|n| n.addr) {
                Some(addr) => dests.push(NodeDest {
                    node_id: id,
                    addr,
                    port: config.first_tier_port,
                }),
                None => {
                    warn!(topic, node = id, "hosting node has no address, leaving it out");
                    stats.unaddressed_nodes += 1;
                }
            }
        }
        truncate("topic", topic, &mut dests, MAX_FANOUT, &mut stats);
        stats.node_dests += dests.len();
        topics.insert(topic, dests);
    }

    let mut nodes = BTreeMap::new();
    for (node, mut eps) in local {
        if node >= MAX_NODES {
            warn!(node, max = MAX_NODES, "node index outside table key space, rejecting");
            stats.rejected_keys += 1;
            continue;
        }
        eps.sort_by(|a, b| a.name.cmp(&b.name).then(a.addr.cmp(&b.addr)));
        let mut dests: Vec<SubDest> = eps
            .into_iter()
            .map(|ep| SubDest {
                route_handle: config.local_route_ifindex,
                addr: ep.addr,
                port: ep.port,
            })
            .collect();
        truncate("node", node, &mut dests, MAX_LOCAL_SUB, &mut stats);
        stats.sub_dests += dests.len();
        nodes.insert(node, dests);
    }

    stats.topics = topics.len();
    stats.nodes = nodes.len();
    FanoutTables {
        topics,
        nodes,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::controller::fanout::inventory::SnapshotNode;

    fn snapshot(node_count: u32, endpoints: &[(&str, TopicId, NodeId, u16)]) -> Snapshot {
        Snapshot {
            nodes: (0..node_count)
                .map(|i| SnapshotNode {
                    id: i,
                    name: format!("n{i}"),
                    addr: Some(Ipv4Addr::from(0x0a00_0001 + i)),
                })
                .collect(),
            endpoints: endpoints
                .iter()
                .enumerate()
                .map(|(i, (name, topic, node, port))| Endpoint {
                    name: name.to_string(),
                    topic: *topic,
                    node: *node,
                    addr: Ipv4Addr::new(10, 244, *node as u8, (i as u8).wrapping_add(10)),
                    port: *port,
                })
                .collect(),
            skipped: 0,
        }
    }

    #[test]
    fn topic_lists_distinct_hosting_nodes() {
        let snap = snapshot(
            3,
            &[("a", 1, 0, 31001), ("b", 1, 1, 31001), ("c", 1, 1, 31002), ("d", 2, 2, 31001)],
        );
        let tables = build_tables(&snap, &ControllerConfig::default());
        assert_eq!(
            tables.topic(1).unwrap(),
            &[
                NodeDest {
                    node_id: 0,
                    addr: Ipv4Addr::new(10, 0, 0, 1),
                    port: 32000
                },
                NodeDest {
                    node_id: 1,
                    addr: Ipv4Addr::new(10, 0, 0, 2),
                    port: 32000
                },
            ]
        );
        assert_eq!(tables.topic(2).unwrap().len(), 1);
        assert_eq!(tables.topic(3), None);
        assert_eq!(tables.stats.node_dests, 3);
    }

    #[test]
    fn node_lists_every_local_subscriber() {
        let snap = snapshot(1, &[("s1", 1, 0, 31001), ("s2", 2, 0, 40000), ("s3", 1, 0, 31001)]);
        let config = ControllerConfig::builder().local_route_ifindex(7).build();
        let tables = build_tables(&snap, &config);
        let subs = tables.node(0).unwrap();
        assert_eq!(subs.len(), 3);
        assert_eq!(
            subs.iter().map(|s| s.port).collect::<Vec<_>>(),
            vec![31001, 40000, 31001]
        );
        assert!(subs.iter().all(|s| s.route_handle == 7));
        assert_eq!(tables.topic(1).unwrap().len(), 1);
    }

    #[test]
    fn truncates_over_capacity() {
        let names: Vec<String> = (0..MAX_LOCAL_SUB + 3).map(|i| format!("s{i:04}")).collect();
        let eps: Vec<_> = names.iter().map(|n| (n.as_str(), 1, 0, 31001)).collect();
        let tables = build_tables(&snapshot(1, &eps), &ControllerConfig::default());
        assert_eq!(tables.node(0).unwrap().len(), MAX_LOCAL_SUB);
        assert_eq!(tables.stats.truncated_keys, 1);
        assert_eq!(tables.stats.dropped_entries, 3);
    }

    #[test]
    fn truncates_topic_lists_at_fanout() {
        let mut dests: Vec<NodeDest> = (0..MAX_FANOUT as u32 + 5)
            .map(|i| NodeDest {
                node_id: i,
                addr: Ipv4Addr::from(0x0a00_0001 + i),
                port: 32000,
            })
            .collect();
        let mut stats = BuildStats::default();
        truncate("topic", 1, &mut dests, MAX_FANOUT, &mut stats);
        assert_eq!(dests.len(), MAX_FANOUT);
        assert_eq!(dests.last().unwrap().node_id, MAX_FANOUT as u32 - 1);
        assert_eq!((stats.truncated_keys, stats.dropped_entries), (1, 5));
    }

    #[test]
    fn full_topic_fits_without_truncation() {
        let names: Vec<String> = (0..MAX_FANOUT).map(|i| format!("s{i:03}")).collect();
        let eps: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), 1, i as NodeId, 31001))
            .collect();
        let tables = build_tables(&snapshot(MAX_FANOUT as u32, &eps), &ControllerConfig::default());
        assert_eq!(tables.topic(1).unwrap().len(), MAX_FANOUT);
        assert_eq!(tables.stats.truncated_keys, 0);
    }

    #[test]
    fn out_of_range_nodes_get_no_tier_one_traffic() {
        let extra = 10;
        let names: Vec<String> = (0..MAX_NODES + extra).map(|i| format!("s{i:03}")).collect();
        let eps: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), if i < 10 { 2 } else { 1 }, i as NodeId, 31001))
            .collect();
        let tables = build_tables(&snapshot(MAX_NODES + extra, &eps), &ControllerConfig::default());

        let topic = tables.topic(1).unwrap();
        assert!(topic.iter().all(|d| d.node_id < MAX_NODES));
        assert_eq!(topic.len(), MAX_NODES as usize - 10);
        for id in MAX_NODES..MAX_NODES + extra {
            assert_eq!(tables.node(id), None);
        }
        // every topic destination has a local subscriber table behind it
        for dests in tables.topics.values() {
            assert!(dests.iter().all(|d| tables.node(d.node_id).is_some()));
        }
        assert_eq!(tables.stats.rejected_keys, extra as usize);
        assert_eq!(tables.stats.truncated_keys, 0);
    }

    #[test]
    fn rejects_out_of_range_topics() {
        let snap = snapshot(1, &[("a", MAX_TOPICS, 0, 31001), ("b", 5, 0, 31001)]);
        let tables = build_tables(&snap, &ControllerConfig::default());
        assert_eq!(tables.topic(MAX_TOPICS), None);
        assert!(tables.topic(5).is_some());
        assert_eq!(tables.stats.rejected_keys, 1);
        // the subscriber is still local to its node
        assert_eq!(tables.node(0).unwrap().len(), 2);
    }

    #[test]
    fn unaddressed_node_left_out_of_topic() {
        let mut snap = snapshot(2, &[("a", 1, 0, 31001), ("b", 1, 1, 31001)]);
        snap.nodes[1].addr = None;
        let tables = build_tables(&snap, &ControllerConfig::default());
        assert_eq!(tables.topic(1).unwrap().len(), 1);
        assert_eq!(tables.stats.unaddressed_nodes, 1);
    }

    #[test]
    fn same_topology_same_digest() {
        let eps = [("a", 1, 0, 31001), ("b", 2, 1, 31001), ("c", 1, 1, 31005)];
        let first = build_tables(&snapshot(2, &eps), &ControllerConfig::default());
        let mut reordered = snapshot(2, &eps);
        reordered.endpoints.reverse();
        let second = build_tables(&reordered, &ControllerConfig::default());
        assert_eq!(first.topics, second.topics);
        assert_eq!(first.digest(), second.digest());

        let changed = build_tables(&snapshot(2, &eps[..2]), &ControllerConfig::default());
        assert_ne!(first.digest(), changed.digest());
    }
}
