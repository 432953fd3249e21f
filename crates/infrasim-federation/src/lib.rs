//! Lockstep execution of one scenario split across worker threads.
//!
//! A [`Synchronizer`] partitions a scenario's elements into disjoint owned
//! sets and gives each set to a worker thread. Every worker holds a full
//! copy of the scenario in its own [`Engine`], scoped to the elements it
//! owns; the rest are mirrors refreshed from a shared board.
//!
//! # Round protocol
//!
//! ```text
//!   work ─▶ publish ─▶ barrier ─▶ import ─▶ barrier
//! ```
//!
//! One macro tick is `iterations` rounds whose work is a micro-iteration,
//! then one round whose work is prepare + commit. A worker that fails sets
//! the shared abort flag before the first barrier; every worker checks the
//! flag after each barrier, so all of them leave the tick together and the
//! synchronizer reports the first worker error.
//!
//! Partition 0 is the lead: it alone runs the consistency checks and
//! reports optimizer fallbacks, which the synchronizer collects after each
//! tick.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Barrier, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use infrasim_core::config::{ConfigError, SimConfig};
use infrasim_core::diagnostic::{Diagnostic, DiagnosticLog};
use infrasim_core::element::Element;
use infrasim_core::engine::{Engine, SimError};
use infrasim_core::id::ElementId;
use infrasim_core::optimizer::Optimizer;
use infrasim_core::query::ElementView;
use infrasim_core::scenario::Scenario;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Configuration and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub sim: SimConfig,
    /// How long to wait for readiness reports on each attempt.
    pub ready_timeout_ms: u64,
    /// Extra attempts after the first timeout before giving up.
    pub ready_retries: u32,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            sim: SimConfig::default(),
            ready_timeout_ms: 1_000,
            ready_retries: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("a federation needs at least one partition")]
    NoPartitions,
    #[error("element {0:?} is owned by more than one partition")]
    Overlap(ElementId),
    #[error("element {0:?} is not owned by any partition")]
    Unassigned(ElementId),
    #[error("partition lists unknown element {0:?}")]
    UnknownElement(ElementId),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker {partition} not ready after {attempts} attempts")]
    WorkerNotReady { partition: usize, attempts: u32 },
    #[error("worker {partition} failed: {source}")]
    Worker {
        partition: usize,
        #[source]
        source: SimError,
    },
    #[error("worker {0} disconnected")]
    Disconnected(usize),
    #[error("shared board poisoned")]
    BoardPoisoned,
    #[error("run aborted after an earlier worker failure")]
    Aborted,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Committed owned elements, one slot per partition.
type Board = Arc<RwLock<Vec<Vec<Element>>>>;

/// Builds one optimizer per worker.
pub type OptimizerFactory = Arc<dyn Fn() -> Box<dyn Optimizer> + Send + Sync>;

enum Command {
    Advance,
    Shutdown,
}

enum Report {
    Ready {
        partition: usize,
    },
    InitFailed {
        partition: usize,
        error: SimError,
    },
    Done {
        partition: usize,
        tick: u64,
        hash: u64,
        diagnostics: Vec<Diagnostic>,
    },
    Failed {
        partition: usize,
        error: FederationError,
    },
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    partition: usize,
    engine: Engine,
    board: Board,
    barrier: Arc<Barrier>,
    abort: Arc<AtomicBool>,
}

impl Worker {
    fn start(
        partition: usize,
        scenario: Scenario,
        owned: BTreeSet<ElementId>,
        config: SimConfig,
        optimizer: Option<OptimizerFactory>,
        shared: (Board, Arc<Barrier>, Arc<AtomicBool>),
    ) -> Result<Self, SimError> {
        let (board, barrier, abort) = shared;
        let mut engine = Engine::new(scenario, config)?;
        engine.set_scope(owned, partition == 0);
        if let Some(factory) = optimizer {
            engine.set_optimizer(factory());
        }
        engine.initialize()?;
        let worker = Self {
            partition,
            engine,
            board,
            barrier,
            abort,
        };
        // Failure here only means the board is poisoned; the first round
        // reports it.
        let _ = worker.publish();
        Ok(worker)
    }

    fn run(mut self, commands: Receiver<Command>, reports: Sender<Report>) {
        while let Ok(command) = commands.recv() {
            match command {
                Command::Advance => {
                    let report = match self.advance() {
                        Ok(()) => Report::Done {
                            partition: self.partition,
                            tick: self.engine.tick(),
                            hash: self.engine.state_hash(),
                            diagnostics: self.engine.diagnostics_mut().drain(),
                        },
                        Err(error) => Report::Failed {
                            partition: self.partition,
                            error,
                        },
                    };
                    if reports.send(report).is_err() {
                        break;
                    }
                }
                Command::Shutdown => break,
            }
        }
        debug!(partition = self.partition, "worker stopped");
    }

    fn advance(&mut self) -> Result<(), FederationError> {
        for _ in 0..self.engine.config().iterations {
            self.round(Engine::micro_iteration)?;
        }
        self.round(|engine| {
            engine.prepare_tick()?;
            engine.commit_tick()
        })?;
        self.engine.refresh_state_hash();
        Ok(())
    }

    fn round(&mut self, work: impl FnOnce(&mut Engine) -> Result<(), SimError>) -> Result<(), FederationError> {
        let partition = self.partition;
        let worked = work(&mut self.engine)
            .map_err(|source| FederationError::Worker { partition, source })
            .and_then(|()| self.publish());
        if worked.is_err() {
            self.abort.store(true, Ordering::SeqCst);
        }
        self.barrier.wait();
        if self.abort.load(Ordering::SeqCst) {
            return worked.and(Err(FederationError::Aborted));
        }

        let imported = self.import();
        if imported.is_err() {
            self.abort.store(true, Ordering::SeqCst);
        }
        self.barrier.wait();
        if self.abort.load(Ordering::SeqCst) {
            return imported.and(Err(FederationError::Aborted));
        }
        Ok(())
    }

    fn publish(&self) -> Result<(), FederationError> {
        let exported = self.engine.export_owned();
        let mut board = self.board.write().map_err(|_| FederationError::BoardPoisoned)?;
        board[self.partition] = exported;
        Ok(())
    }

    fn import(&mut self) -> Result<(), FederationError> {
        let board = self.board.read().map_err(|_| FederationError::BoardPoisoned)?;
        for (partition, elements) in board.iter().enumerate() {
            if partition == self.partition {
                continue;
            }
            self.engine
                .import(elements)
                .map_err(|source| FederationError::Worker {
                    partition: self.partition,
                    source,
                })?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

struct WorkerHandle {
    partition: usize,
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

pub struct Synchronizer {
    workers: Vec<WorkerHandle>,
    reports: Receiver<Report>,
    board: Board,
    tick: u64,
    state_hash: u64,
    diagnostics: DiagnosticLog,
    aborted: bool,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("workers", &self.workers.len())
            .field("tick", &self.tick)
            .field("state_hash", &self.state_hash)
            .field("aborted", &self.aborted)
            .finish()
    }
}

impl Synchronizer {
    /// Spawn one worker per partition and wait until each reports ready.
    ///
    /// Every element of `scenario` must appear in exactly one partition.
    pub fn initialize(
        scenario: Scenario,
        partitions: Vec<BTreeSet<ElementId>>,
        config: FederationConfig,
        optimizer: Option<OptimizerFactory>,
    ) -> Result<Self, FederationError> {
        config.sim.validate()?;
        check_partitions(&scenario, &partitions)?;

        let n = partitions.len();
        let board: Board = Arc::new(RwLock::new(vec![Vec::new(); n]));
        let barrier = Arc::new(Barrier::new(n));
        let abort = Arc::new(AtomicBool::new(false));
        let (report_tx, report_rx) = mpsc::channel();

        let mut sync = Self {
            workers: Vec::with_capacity(n),
            reports: report_rx,
            board: Arc::clone(&board),
            tick: 0,
            state_hash: 0,
            diagnostics: DiagnosticLog::new(config.sim.diagnostic_capacity),
            aborted: false,
        };

        for (partition, owned) in partitions.into_iter().enumerate() {
            let (command_tx, command_rx) = mpsc::channel();
            let reports = report_tx.clone();
            let scenario = scenario.clone();
            let sim = config.sim.clone();
            let optimizer = optimizer.clone();
            let shared = (Arc::clone(&board), Arc::clone(&barrier), Arc::clone(&abort));
            let spawned = thread::Builder::new()
                .name(format!("infrasim-worker-{partition}"))
                .spawn(move || {
                    match Worker::start(partition, scenario, owned, sim, optimizer, shared) {
                        Ok(worker) => {
                            if reports.send(Report::Ready { partition }).is_ok() {
                                worker.run(command_rx, reports);
                            }
                        }
                        Err(error) => {
                            let _ = reports.send(Report::InitFailed { partition, error });
                        }
                    }
                });
            match spawned {
                Ok(thread) => sync.workers.push(WorkerHandle {
                    partition,
                    commands: command_tx,
                    thread: Some(thread),
                }),
                Err(err) => {
                    sync.shutdown();
                    return Err(FederationError::Spawn(err));
                }
            }
        }
        drop(report_tx);

        if let Err(err) = sync.await_ready(&config) {
            sync.shutdown();
            return Err(err);
        }
        info!(workers = n, "federation ready");
        Ok(sync)
    }

    fn await_ready(&mut self, config: &FederationConfig) -> Result<(), FederationError> {
        let timeout = Duration::from_millis(config.ready_timeout_ms);
        let mut ready = BTreeSet::new();
        let mut attempts = 0;
        while ready.len() < self.workers.len() {
            match self.reports.recv_timeout(timeout) {
                Ok(Report::Ready { partition }) => {
                    debug!(partition, "worker ready");
                    ready.insert(partition);
                }
                Ok(Report::InitFailed { partition, error }) => {
                    error!(partition, %error, "worker failed to initialize");
                    return Err(FederationError::Worker {
                        partition,
                        source: error,
                    });
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    attempts += 1;
                    let missing = (0..self.workers.len()).find(|p| !ready.contains(p)).unwrap_or_default();
                    warn!(partition = missing, attempts, "waiting for worker readiness");
                    if attempts > config.ready_retries {
                        error!(partition = missing, attempts, "worker not ready");
                        return Err(FederationError::WorkerNotReady {
                            partition: missing,
                            attempts,
                        });
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let missing = (0..self.workers.len()).find(|p| !ready.contains(p)).unwrap_or_default();
                    return Err(FederationError::Disconnected(missing));
                }
            }
        }
        Ok(())
    }

    /// Run one macro tick on every worker.
    pub fn advance(&mut self) -> Result<(), FederationError> {
        if self.aborted {
            return Err(FederationError::Aborted);
        }
        for worker in &self.workers {
            if worker.commands.send(Command::Advance).is_err() {
                self.aborted = true;
                return Err(FederationError::Disconnected(worker.partition));
            }
        }

        let mut hashes = BTreeMap::new();
        let mut failure: Option<FederationError> = None;
        for _ in 0..self.workers.len() {
            match self.reports.recv() {
                Ok(Report::Done {
                    partition,
                    tick,
                    hash,
                    diagnostics,
                }) => {
                    hashes.insert(partition, (tick, hash));
                    for diagnostic in diagnostics {
                        self.diagnostics.record(diagnostic);
                    }
                }
                Ok(Report::Failed { partition, error }) => {
                    if !matches!(error, FederationError::Aborted) {
                        error!(partition, %error, "worker failed");
                    }
                    let keep = match &failure {
                        None => true,
                        Some(FederationError::Aborted) => !matches!(error, FederationError::Aborted),
                        Some(_) => false,
                    };
                    if keep {
                        failure = Some(error);
                    }
                }
                Ok(_) => {}
                Err(_) => {
                    self.aborted = true;
                    let missing = (0..self.workers.len()).find(|p| !hashes.contains_key(p)).unwrap_or_default();
                    return Err(FederationError::Disconnected(missing));
                }
            }
        }
        if let Some(error) = failure {
            self.aborted = true;
            return Err(error);
        }

        if let Some(&(tick, hash)) = hashes.get(&0) {
            self.tick = tick;
            self.state_hash = hash;
        }
        if hashes.values().any(|&(_, h)| h != self.state_hash) {
            warn!(tick = self.tick, "workers disagree on the state hash");
        }
        debug!(tick = self.tick, hash = self.state_hash, "federation advanced");
        Ok(())
    }

    pub fn run(&mut self, ticks: u64) -> Result<(), FederationError> {
        for _ in 0..ticks {
            self.advance()?;
        }
        Ok(())
    }

    /// Committed view of every element, ordered by id.
    pub fn elements(&self) -> Result<Vec<ElementView>, FederationError> {
        let board = self.board.read().map_err(|_| FederationError::BoardPoisoned)?;
        let mut views: Vec<ElementView> = board.iter().flatten().map(ElementView::of).collect();
        views.sort_by_key(|v| v.id);
        Ok(views)
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// The lead worker's state hash after the last tick.
    pub fn state_hash(&self) -> u64 {
        self.state_hash
    }

    /// Diagnostics recorded by the lead worker.
    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    pub fn partitions(&self) -> usize {
        self.workers.len()
    }

    /// Stop and join every worker. Idempotent.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for worker in &self.workers {
            let _ = worker.commands.send(Command::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if let Err(e) = thread.join() {
                    error!(partition = worker.partition, "worker panicked: {:?}", e);
                }
            }
        }
        info!(workers = self.workers.len(), "federation stopped");
        self.workers.clear();
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_partitions(scenario: &Scenario, partitions: &[BTreeSet<ElementId>]) -> Result<(), FederationError> {
    if partitions.is_empty() {
        return Err(FederationError::NoPartitions);
    }
    let mut seen = BTreeSet::new();
    for id in partitions.iter().flatten() {
        if !scenario.elements.contains_key(*id) {
            return Err(FederationError::UnknownElement(*id));
        }
        if !seen.insert(*id) {
            return Err(FederationError::Overlap(*id));
        }
    }
    match scenario.elements.keys().find(|id| !seen.contains(id)) {
        Some(id) => Err(FederationError::Unassigned(id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infrasim_core::test_utils::*;

    #[test]
    fn partitions_must_cover_every_element_once() {
        let scenario = west_east_scenario();
        let mut parts = west_east_partitions(&scenario);
        assert!(check_partitions(&scenario, &parts).is_ok());
        assert!(matches!(check_partitions(&scenario, &[]), Err(FederationError::NoPartitions)));

        let moved = *parts[1].iter().next().unwrap();
        parts[0].insert(moved);
        assert!(matches!(
            check_partitions(&scenario, &parts),
            Err(FederationError::Overlap(id)) if id == moved
        ));

        parts[0].remove(&moved);
        parts[1].remove(&moved);
        assert!(matches!(
            check_partitions(&scenario, &parts),
            Err(FederationError::Unassigned(id)) if id == moved
        ));
    }

    #[test]
    fn config_defaults() {
        let config = FederationConfig::default();
        assert_eq!(config.sim, SimConfig::default());
        assert_eq!(config.ready_retries, 3);
    }
}
