use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use hashbrown::HashMap;
use tracing::{debug, debug_span, info};

use super::{
    builder::FanoutTables,
    error::Error,
    wire::{NodeDest, SubDest},
    NodeId, TopicId, MAX_FANOUT, MAX_LOCAL_SUB,
};

/// One of the two table instances. The pointer the forwarder reads holds
/// `0` or `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    Zero,
    One,
}

impl Generation {
    pub fn index(self) -> usize {
        match self {
            Generation::Zero => 0,
            Generation::One => 1,
        }
    }

    pub fn as_u32(self) -> u32 {
        self.index() as u32
    }

    /// The generation that isn't this one: next cycle's build target.
    pub fn other(self) -> Self {
        match self {
            Generation::Zero => Generation::One,
            Generation::One => Generation::Zero,
        }
    }
}

impl TryFrom<u32> for Generation {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Generation::Zero),
            1 => Ok(Generation::One),
            other => Err(Error::BadGenerationPointer(other)),
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Storage for both generations plus the active pointer.
///
/// Writers must only ever touch the generation the pointer does not name;
/// `set_active_generation` is the single point where a new generation
/// becomes visible and has to be one indivisible store.
pub trait TableStore {
    fn active_generation(&self) -> Result<Generation, Error>;
    /// Drops every topic and node entry of `generation`.
    fn clear_generation(&mut self, generation: Generation) -> Result<(), Error>;
    /// Installs `dests` for `topic` and then its count.
    fn write_topic(
        &mut self,
        generation: Generation,
        topic: TopicId,
        dests: &[NodeDest],
    ) -> Result<(), Error>;
    /// Installs `dests` for `node` and then its count.
    fn write_node(
        &mut self,
        generation: Generation,
        node: NodeId,
        dests: &[SubDest],
    ) -> Result<(), Error>;
    fn set_active_generation(&mut self, generation: Generation) -> Result<(), Error>;
}

/// The contents of one generation as the forwarder sees them: fixed-capacity
/// entry arrays and a separate count per key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationTables {
    topic_entries: HashMap<TopicId, Vec<NodeDest>>,
    topic_counts: HashMap<TopicId, u32>,
    node_entries: HashMap<NodeId, Vec<SubDest>>,
    node_counts: HashMap<NodeId, u32>,
}

impl GenerationTables {
    /// Valid destinations for `topic`: the first `count` populated entries.
    pub fn topic(&self, topic: TopicId) -> Option<&[NodeDest]> {
        let count = *self.topic_counts.get(&topic)? as usize;
        let entries = self.topic_entries.get(&topic)?;
        Some(&entries[..count.min(entries.len())])
    }

    pub fn node(&self, node: NodeId) -> Option<&[SubDest]> {
        let count = *self.node_counts.get(&node)? as usize;
        let entries = self.node_entries.get(&node)?;
        Some(&entries[..count.min(entries.len())])
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.node_counts.keys().copied()
    }
}

struct Shared {
    slots: [RwLock<GenerationTables>; 2],
    active: AtomicU32,
    /// Writes applied to each slot, for observing which side a cycle touched.
    writes: [AtomicU64; 2],
}

impl Shared {
    fn read(&self, generation: Generation) -> RwLockReadGuard<'_, GenerationTables> {
        self.slots[generation.index()]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, generation: Generation) -> RwLockWriteGuard<'_, GenerationTables> {
        self.writes[generation.index()].fetch_add(1, Ordering::Relaxed);
        self.slots[generation.index()]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> Generation {
        match self.active.load(Ordering::Acquire) {
            0 => Generation::Zero,
            _ => Generation::One,
        }
    }

    /// Locks the active generation for reading. A reader that loaded the
    /// pointer just before a flip may reach a generation the writer has
    /// since started rebuilding, so the pointer is checked again under the
    /// lock.
    fn read_active(&self) -> (Generation, RwLockReadGuard<'_, GenerationTables>) {
        loop {
            let generation = self.active();
            let guard = self.read(generation);
            if self.active() == generation {
                return (generation, guard);
            }
        }
    }
}

/// In-process generation buffer: an index-selected pair of table instances
/// and an atomic pointer. Readers obtain a [`DataPlaneView`].
#[derive(Clone)]
pub struct GenerationBuffer {
    shared: Arc<Shared>,
}

impl GenerationBuffer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: [
                    RwLock::new(GenerationTables::default()),
                    RwLock::new(GenerationTables::default()),
                ],
                active: AtomicU32::new(0),
                writes: [AtomicU64::new(0), AtomicU64::new(0)],
            }),
        }
    }

    pub fn view(&self) -> DataPlaneView {
        DataPlaneView {
            shared: self.shared.clone(),
        }
    }

    pub fn write_count(&self, generation: Generation) -> u64 {
        self.shared.writes[generation.index()].load(Ordering::Relaxed)
    }

    fn writable(
        &self,
        generation: Generation,
    ) -> Result<RwLockWriteGuard<'_, GenerationTables>, Error> {
        if generation == self.shared.active() {
            return Err(Error::ActiveGenerationWrite(generation));
        }
        Ok(self.shared.write(generation))
    }
}

impl Default for GenerationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GenerationBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationBuffer")
            .field("active", &self.shared.active())
            .finish_non_exhaustive()
    }
}

impl TableStore for GenerationBuffer {
    fn active_generation(&self) -> Result<Generation, Error> {
        Ok(self.shared.active())
    }

    fn clear_generation(&mut self, generation: Generation) -> Result<(), Error> {
        *self.writable(generation)? = GenerationTables::default();
        Ok(())
    }

    fn write_topic(
        &mut self,
        generation: Generation,
        topic: TopicId,
        dests: &[NodeDest],
    ) -> Result<(), Error> {
        if dests.len() > MAX_FANOUT {
            return Err(Error::TableWrite(format!(
                "topic {topic}: {} entries exceed capacity {MAX_FANOUT}",
                dests.len()
            )));
        }
        let mut tables = self.writable(generation)?;
        tables.topic_entries.insert(topic, dests.to_vec());
        tables.topic_counts.insert(topic, dests.len() as u32);
        Ok(())
    }

    fn write_node(
        &mut self,
        generation: Generation,
        node: NodeId,
        dests: &[SubDest],
    ) -> Result<(), Error> {
        if dests.len() > MAX_LOCAL_SUB {
            return Err(Error::TableWrite(format!(
                "node {node}: {} entries exceed capacity {MAX_LOCAL_SUB}",
                dests.len()
            )));
        }
        let mut tables = self.writable(generation)?;
        tables.node_entries.insert(node, dests.to_vec());
        tables.node_counts.insert(node, dests.len() as u32);
        Ok(())
    }

    fn set_active_generation(&mut self, generation: Generation) -> Result<(), Error> {
        self.shared
            .active
            .store(generation.as_u32(), Ordering::Release);
        Ok(())
    }
}

/// Read side of a [`GenerationBuffer`], modelling the forwarder's lookups:
/// load the pointer, then read only the generation it names.
#[derive(Clone)]
pub struct DataPlaneView {
    shared: Arc<Shared>,
}

impl DataPlaneView {
    pub fn active_generation(&self) -> Generation {
        self.shared.active()
    }

    pub fn topic(&self, topic: TopicId) -> Option<Vec<NodeDest>> {
        let (_, tables) = self.shared.read_active();
        tables.topic(topic).map(<[NodeDest]>::to_vec)
    }

    pub fn node(&self, node: NodeId) -> Option<Vec<SubDest>> {
        let (_, tables) = self.shared.read_active();
        tables.node(node).map(<[SubDest]>::to_vec)
    }

    /// Copies the whole active generation as of one pointer load.
    pub fn active_tables(&self) -> (Generation, GenerationTables) {
        let (generation, tables) = self.shared.read_active();
        (generation, tables.clone())
    }

    /// Copies a specific generation regardless of which one is active.
    pub fn tables(&self, generation: Generation) -> GenerationTables {
        self.shared.read(generation).clone()
    }
}

/// Writes built tables into the inactive generation and flips the pointer
/// once every entry is in place.
pub struct FlipCoordinator<S> {
    store: S,
}

impl<S: TableStore> FlipCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn current_active(&self) -> Result<Generation, Error> {
        self.store.active_generation()
    }

    /// Populates the inactive generation from `tables` and makes it active.
    ///
    /// Returns the generation that is now active. On error nothing has been
    /// published and the previous generation stays in service.
    pub fn commit(&mut self, tables: &FanoutTables) -> Result<Generation, Error> {
        let active = self.store.active_generation()?;
        let target = active.other();
        let span = debug_span!("commit", %active, %target);
        let _guard = span.enter();

        self.store.clear_generation(target)?;
        for (topic, dests) in &tables.topics {
            self.store.write_topic(target, *topic, dests)?;
        }
        for (node, dests) in &tables.nodes {
            self.store.write_node(target, *node, dests)?;
        }
        debug!(
            topics = tables.topics.len(),
            nodes = tables.nodes.len(),
            "generation populated"
        );

        self.store.set_active_generation(target)?;
        info!(generation = %target, "flipped active generation");
        Ok(target)
    }
}
