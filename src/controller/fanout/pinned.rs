// Table storage in the forwarder's pinned BPF maps. Each outer table maps a
// key to an inner array created fresh per write, so a generation is rebuilt
// by swapping inner maps rather than editing them in place.

use std::{
    mem,
    os::fd::{AsFd, AsRawFd},
    path::{Path, PathBuf},
};

use libbpf_rs::{ErrorKind, MapCore, MapFlags, MapHandle, MapType};
use tracing::{debug, trace};

use super::{
    error::Error,
    generation::{Generation, TableStore},
    wire::{decode_u32, encode_u32, CfgRecord, NodeDest, SubDest},
    NodeId, TopicId, MAX_FANOUT, MAX_LOCAL_SUB, MAX_NODES, MAX_TOPICS,
};

const ACTIVE_GEN: &str = "m_active_gen";
const CFG: &str = "m_cfg";

/// The four maps making up one generation.
struct GenerationMaps {
    topic_nodes: MapHandle,
    topic_counts: MapHandle,
    node_subs: MapHandle,
    node_counts: MapHandle,
}

impl GenerationMaps {
    fn open(root: &Path, generation: Generation) -> Result<Self, Error> {
        let g = generation.index();
        Ok(Self {
            topic_nodes: open_pinned(root, &format!("topic_to_node_set_gen{g}"))?,
            topic_counts: open_pinned(root, &format!("topic_fanout_cnt_gen{g}"))?,
            node_subs: open_pinned(root, &format!("node_to_local_sub_gen{g}"))?,
            node_counts: open_pinned(root, &format!("node_local_cnt_gen{g}"))?,
        })
    }
}

fn open_pinned(root: &Path, name: &str) -> Result<MapHandle, Error> {
    let path = root.join(name);
    MapHandle::from_pinned_path(&path)
        .map_err(|e| Error::TableRead(format!("open {}: {e}", path.display())))
}

/// Removes an outer entry, treating an already empty slot as success.
fn delete_outer(map: &MapHandle, key: u32) -> Result<(), Error> {
    match map.delete(&encode_u32(key)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::TableWrite(format!("delete key {key}: {e}"))),
    }
}

/// Builds a fresh inner array holding `records` and installs it under `key`
/// in `outer`, followed by the entry count.
fn install_inner<const N: usize>(
    name: &str,
    capacity: usize,
    records: impl ExactSizeIterator<Item = [u8; N]>,
    outer: &MapHandle,
    counts: &MapHandle,
    key: u32,
) -> Result<(), Error> {
    let count = records.len();
    if count > capacity {
        return Err(Error::TableWrite(format!(
            "{name}: {count} entries exceed capacity {capacity}"
        )));
    }
    let opts = libbpf_sys::bpf_map_create_opts {
        sz: mem::size_of::<libbpf_sys::bpf_map_create_opts>() as _,
        ..Default::default()
    };
    let inner = MapHandle::create(
        MapType::Array,
        Some(name),
        4,
        N as u32,
        capacity as u32,
        &opts,
    )?;
    for (i, record) in records.enumerate() {
        inner.update(&encode_u32(i as u32), &record, MapFlags::ANY)?;
    }
    let fd = inner.as_fd().as_raw_fd() as u32;
    outer.update(&encode_u32(key), &encode_u32(fd), MapFlags::ANY)?;
    counts.update(&encode_u32(key), &encode_u32(count as u32), MapFlags::ANY)?;
    trace!(name, key, count, "installed inner table");
    Ok(())
}

/// Both generations of the forwarder's tables plus the active pointer, as
/// pinned under one bpffs directory by the loader.
pub struct PinnedMaps {
    root: PathBuf,
    generations: [GenerationMaps; 2],
    active: MapHandle,
    cfg: MapHandle,
    /// The generation cleared for rebuilding and not yet published.
    building: Option<Generation>,
}

impl PinnedMaps {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        let generations = [
            GenerationMaps::open(&root, Generation::Zero)?,
            GenerationMaps::open(&root, Generation::One)?,
        ];
        let active = open_pinned(&root, ACTIVE_GEN)?;
        let cfg = open_pinned(&root, CFG)?;
        debug!(root = %root.display(), "opened pinned maps");
        Ok(Self {
            root,
            generations,
            active,
            cfg,
            building: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads the per-node configuration record the loader wrote.
    pub fn config(&self) -> Result<CfgRecord, Error> {
        let raw = self
            .cfg
            .lookup(&encode_u32(0), MapFlags::ANY)
            .map_err(|e| Error::TableRead(format!("{CFG}: {e}")))?
            .ok_or_else(|| Error::TableRead(format!("{CFG}: no entry")))?;
        CfgRecord::decode(&raw)
    }

    fn target(&self, generation: Generation) -> Result<&GenerationMaps, Error> {
        if self.building != Some(generation) {
            return Err(Error::ActiveGenerationWrite(generation));
        }
        Ok(&self.generations[generation.index()])
    }
}

impl TableStore for PinnedMaps {
    fn active_generation(&self) -> Result<Generation, Error> {
        let raw = self
            .active
            .lookup(&encode_u32(0), MapFlags::ANY)
            .map_err(|e| Error::TableRead(format!("{ACTIVE_GEN}: {e}")))?
            .ok_or_else(|| Error::TableRead(format!("{ACTIVE_GEN}: no entry")))?;
        Generation::try_from(decode_u32(&raw)?)
    }

    fn clear_generation(&mut self, generation: Generation) -> Result<(), Error> {
        if self.active_generation()? == generation {
            return Err(Error::ActiveGenerationWrite(generation));
        }
        let maps = &self.generations[generation.index()];
        // Counts go to zero before the inner tables disappear.
        for topic in 0..MAX_TOPICS {
            maps.topic_counts
                .update(&encode_u32(topic), &encode_u32(0), MapFlags::ANY)?;
            delete_outer(&maps.topic_nodes, topic)?;
        }
        for node in 0..MAX_NODES {
            maps.node_counts
                .update(&encode_u32(node), &encode_u32(0), MapFlags::ANY)?;
            delete_outer(&maps.node_subs, node)?;
        }
        self.building = Some(generation);
        debug!(%generation, "cleared generation");
        Ok(())
    }

    fn write_topic(
        &mut self,
        generation: Generation,
        topic: TopicId,
        dests: &[NodeDest],
    ) -> Result<(), Error> {
        let maps = self.target(generation)?;
        install_inner(
            &format!("tnodes_{topic}"),
            MAX_FANOUT,
            dests.iter().map(NodeDest::encode),
            &maps.topic_nodes,
            &maps.topic_counts,
            topic,
        )
    }

    fn write_node(
        &mut self,
        generation: Generation,
        node: NodeId,
        dests: &[SubDest],
    ) -> Result<(), Error> {
        let maps = self.target(generation)?;
        install_inner(
            &format!("lsubs_{node}"),
            MAX_LOCAL_SUB,
            dests.iter().map(SubDest::encode),
            &maps.node_subs,
            &maps.node_counts,
            node,
        )
    }

    fn set_active_generation(&mut self, generation: Generation) -> Result<(), Error> {
        self.active.update(
            &encode_u32(0),
            &encode_u32(generation.as_u32()),
            MapFlags::ANY,
        )?;
        self.building = None;
        Ok(())
    }
}
