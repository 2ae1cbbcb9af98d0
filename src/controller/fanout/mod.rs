use std::net::Ipv4Addr;

pub mod builder;
pub mod error;
pub mod generation;
pub mod inventory;
pub mod kube;
#[cfg(feature = "bpf")]
pub mod pinned;
pub mod reconcile;
pub mod wire;

/// Topic ids come from subscriber labels and index the outer topic table.
pub type TopicId = u32;

/// Dense node index, valid for one snapshot only.
pub type NodeId = u32;

/// Destination port on the receiving node for tier one (hop = 1) copies.
pub const FIRST_TIER_PORT: u16 = 32000;
/// Port a subscriber listens on when it doesn't configure one.
pub const DEFAULT_SUBSCRIBER_PORT: u16 = 31001;
/// Topic a subscriber belongs to when it isn't labelled.
pub const DEFAULT_TOPIC: TopicId = 1;

// These bounds mirror the forwarder's map definitions and can't change
// without rebuilding it.
pub const MAX_TOPICS: u32 = 4096;
pub const MAX_NODES: u32 = 256;
pub const MAX_FANOUT: usize = 256;
pub const MAX_LOCAL_SUB: usize = 512;

/// Parses an inventory address, accepting IPv4 only since the forwarder
/// rewrites IPv4 headers.
fn parse_ipv4(addr: Option<&str>) -> Option<Ipv4Addr> {
    addr.filter(|a| !a.is_empty())
        .and_then(|a| a.trim().parse::<Ipv4Addr>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_only_ipv4() {
        assert_eq!(
            parse_ipv4(Some("10.0.0.7")),
            Some(Ipv4Addr::new(10, 0, 0, 7))
        );
        assert_eq!(parse_ipv4(Some("")), None);
        assert_eq!(parse_ipv4(Some("fd00::1")), None);
        assert_eq!(parse_ipv4(None), None);
    }
}
