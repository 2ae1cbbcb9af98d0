pub mod config;
pub mod fanout;

// The controller is the control plane of the hierarchical fanout path. The
// data plane is a kernel-resident forwarder that replicates each published
// packet twice: once per node hosting the topic (tier one), then once per
// local subscriber on the receiving node (tier two). The forwarder never talks
// to us directly. It only reads the tables we leave behind for it.

// Those tables are double buffered. There are two complete generations of
// every table, and a single-word pointer names the one the forwarder reads.
// Each cycle we rebuild the other generation from scratch and then store the
// pointer. Nothing in the forwarder takes a lock, so the pointer store is the
// only thing that orders our writes against its reads: everything written
// before it must be complete, and nothing is written to the generation it
// names.

// A cycle that fails anywhere before the pointer store is abandoned whole. The
// daemon exits and is restarted by its supervisor, while the forwarder keeps
// serving the last generation that was published.

pub use config::ControllerConfig;
pub use fanout::{
    builder::{build_tables, BuildStats, FanoutTables},
    error::Error,
    generation::{DataPlaneView, FlipCoordinator, Generation, GenerationBuffer, TableStore},
    inventory::{
        collect_snapshot, ClusterInventory, RawNode, RawSubscriber, Snapshot, StaticInventory,
    },
    kube::KubeInventory,
    reconcile::{CycleReport, Reconciler},
    wire::{CfgRecord, NodeDest, SubDest},
};
