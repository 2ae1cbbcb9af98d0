use std::{
    convert::Infallible,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, Instrument};

use crate::controller::config::ControllerConfig;

use super::{
    builder::{build_tables, BuildStats},
    error::Error,
    generation::{FlipCoordinator, Generation, TableStore},
    inventory::{collect_snapshot, ClusterInventory},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    /// Collecting a snapshot and compiling it into tables.
    Building,
    /// Writing the inactive generation and storing the pointer.
    Flipping,
}

/// Outcome of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    /// The generation made active by this cycle.
    pub generation: Generation,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub nodes: usize,
    pub endpoints: usize,
    pub skipped: usize,
    pub stats: BuildStats,
    pub digest: blake3::Hash,
    /// False when the tables match the previous cycle's exactly.
    pub topology_changed: bool,
}

/// Drives collect → build → commit on a fixed period.
///
/// The inventory and the table store are owned here rather than reached
/// through globals, so either can be swapped for a fake.
pub struct Reconciler<I, S> {
    inventory: I,
    coordinator: FlipCoordinator<S>,
    config: ControllerConfig,
    state: CycleState,
    cycles: u64,
    last_digest: Option<blake3::Hash>,
    last_failure: Option<CycleState>,
}

impl<I, S> Reconciler<I, S>
where
    I: ClusterInventory,
    S: TableStore,
{
    pub fn new(inventory: I, store: S, config: ControllerConfig) -> Self {
        Self {
            inventory,
            coordinator: FlipCoordinator::new(store),
            config,
            state: CycleState::Idle,
            cycles: 0,
            last_digest: None,
            last_failure: None,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn coordinator(&self) -> &FlipCoordinator<S> {
        &self.coordinator
    }

    /// Stage the most recent failed cycle was in when it gave up, or `None`
    /// if no cycle has failed yet.
    pub fn last_failure(&self) -> Option<CycleState> {
        self.last_failure
    }

    /// Runs a single cycle. Either the new generation is published or the
    /// error is returned with the pointer untouched.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, Error> {
        self.cycles += 1;
        let span = info_span!("cycle", n = self.cycles);
        let result = self.cycle_inner().instrument(span).await;
        if result.is_err() {
            self.last_failure = Some(self.state);
        }
        self.state = CycleState::Idle;
        result
    }

    async fn cycle_inner(&mut self) -> Result<CycleReport, Error> {
        let started_at = Utc::now();
        let clock = Instant::now();

        self.state = CycleState::Building;
        let snapshot = collect_snapshot(&self.inventory, &self.config).await?;
        debug!(
            nodes = snapshot.nodes.len(),
            endpoints = snapshot.endpoints.len(),
            skipped = snapshot.skipped,
            "collected snapshot"
        );
        let tables = build_tables(&snapshot, &self.config);
        let digest = tables.digest();

        self.state = CycleState::Flipping;
        let generation = self.coordinator.commit(&tables)?;

        let topology_changed = self.last_digest != Some(digest);
        self.last_digest = Some(digest);
        Ok(CycleReport {
            cycle: self.cycles,
            generation,
            started_at,
            elapsed: clock.elapsed(),
            nodes: snapshot.nodes.len(),
            endpoints: snapshot.endpoints.len(),
            skipped: snapshot.skipped,
            stats: tables.stats,
            digest,
            topology_changed,
        })
    }

    /// Runs cycles forever, one per interval. Only returns on a failed
    /// cycle; the caller is expected to exit and be restarted.
    pub async fn run(mut self) -> Result<Infallible, Error> {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval = ?self.config.reconcile_interval,
            active = %self.coordinator.current_active()?,
            "reconciler started"
        );
        loop {
            ticker.tick().await;
            match self.run_cycle().await {
                Ok(report) => {
                    let digest = report.digest.to_hex();
                    info!(
                        cycle = report.cycle,
                        generation = %report.generation,
                        topics = report.stats.topics,
                        nodes = report.stats.nodes,
                        subscribers = report.stats.sub_dests,
                        skipped = report.skipped,
                        changed = report.topology_changed,
                        digest = &digest.as_str()[..16],
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "cycle complete"
                    );
                }
                Err(e) => {
                    error!(
                        error = %e,
                        stage = ?self.last_failure,
                        discovery = e.is_discovery(),
                        "cycle failed, active generation left in service"
                    );
                    return Err(e);
                }
            }
        }
    }
}
