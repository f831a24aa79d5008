// src/simulation.rs - Topology setup and run lifecycle
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{Config, ConfigError};
use crate::event_log::{CsvEventLog, EventSink, LogError};
use crate::machine::{MachineError, MachineSummary, RunWindow, VirtualMachine};
use crate::message::MachineId;
use crate::network::{Handshake, Listener, NetworkError, PeerLink, PeerLinks, RetryPolicy};
use crate::queue::MessageQueue;
use crate::random::{ClockRateGenerator, RandomSource, SeededRandom};

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Network setup failed: {0}")]
    Network(#[from] NetworkError),
    #[error("Could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },
    #[error("Event log error: {0}")]
    Log(#[from] LogError),
    #[error("Mesh incomplete after {waited_ms}ms: {detail}")]
    MeshIncomplete { waited_ms: u64, detail: String },
    #[error("Machine failed: {0}")]
    Machine(#[from] MachineError),
    #[error("Machine task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Address and rate assigned to one machine before anything is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MachinePlan {
    pub id: MachineId,
    pub addr: SocketAddr,
    pub rate: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub run_id: String,
    pub log_dir: PathBuf,
    pub interrupted: bool,
    pub elapsed_ms: u64,
    /// Ordered by machine id.
    pub machines: Vec<MachineSummary>,
}

impl SimulationReport {
    pub fn machine(&self, id: MachineId) -> Option<&MachineSummary> {
        self.machines.iter().find(|m| m.id == id)
    }

    /// Largest minus smallest final clock.
    pub fn clock_drift(&self) -> u64 {
        let clocks = self.machines.iter().map(|m| m.final_clock);
        match (clocks.clone().max(), clocks.min()) {
            (Some(max), Some(min)) => max - min,
            _ => 0,
        }
    }
}

pub struct SimulationController {
    config: Config,
    run_id: Uuid,
    rate_source: Box<dyn RandomSource>,
    selector_sources: HashMap<MachineId, Box<dyn RandomSource>>,
    event_sinks: HashMap<MachineId, Box<dyn EventSink>>,
    plans: Vec<MachinePlan>,
}

impl SimulationController {
    pub fn new(config: Config) -> Self {
        let rate_source = Box::new(SeededRandom::from_optional_seed(config.simulation.seed));
        Self {
            config,
            run_id: Uuid::new_v4(),
            rate_source,
            selector_sources: HashMap::new(),
            event_sinks: HashMap::new(),
            plans: Vec::new(),
        }
    }

    /// Source for the per-machine rate draws.
    pub fn with_rate_source(mut self, source: Box<dyn RandomSource>) -> Self {
        self.rate_source = source;
        self
    }

    /// Source for one machine's event-selector draws.
    pub fn with_selector_source(mut self, id: MachineId, source: Box<dyn RandomSource>) -> Self {
        self.selector_sources.insert(id, source);
        self
    }

    /// Sink for one machine's events instead of its `machine_<id>.log`.
    pub fn with_event_sink(mut self, id: MachineId, sink: Box<dyn EventSink>) -> Self {
        self.event_sinks.insert(id, sink);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn plans(&self) -> &[MachinePlan] {
        &self.plans
    }

    /// Validate the config, then assign each machine its address and rate.
    pub fn initialize(&mut self) -> Result<&[MachinePlan], SimulationError> {
        self.config.validate()?;
        let sim = &self.config.simulation;
        let net = &self.config.network;
        let generator = ClockRateGenerator::new(sim.clock_rate);
        tracing::info!("Initializing {} virtual machines", sim.machines);

        let mut plans = Vec::with_capacity(sim.machines as usize);
        for i in 0..sim.machines {
            let port = if net.base_port == 0 { 0 } else { net.base_port + i as u16 };
            let addr = resolve(&net.host, port)?;
            let rate = generator.next_rate(self.rate_source.as_mut());
            tracing::info!("  Machine {}: {}, clock rate {} ticks/second", i, addr, rate);
            plans.push(MachinePlan { id: MachineId(i), addr, rate });
        }
        self.plans = plans;
        Ok(&self.plans)
    }

    /// Build the mesh, run every machine for the configured duration, stop.
    pub async fn run(mut self) -> Result<SimulationReport, SimulationError> {
        if self.plans.is_empty() {
            self.initialize()?;
        }
        let span = tracing::info_span!("simulation", run_id = %self.run_id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> Result<SimulationReport, SimulationError> {
        let n = self.plans.len();
        let net = self.config.network.clone();

        // Every port must bind before anything else happens.
        let mut listeners = Vec::with_capacity(n);
        for plan in &self.plans {
            match Listener::bind(plan.id, plan.addr).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    tracing::error!("Machine {} could not bind {}: {}", plan.id, plan.addr, e);
                    return Err(e.into());
                }
            }
        }
        let addrs: Vec<SocketAddr> = listeners.iter().map(Listener::local_addr).collect();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let (handshake_tx, mut handshake_rx) = mpsc::unbounded_channel::<Handshake>();
        let mut queues = Vec::with_capacity(n);
        let mut listener_tasks = Vec::with_capacity(n);
        for listener in listeners {
            let queue = MessageQueue::new();
            listener_tasks.push(listener.spawn(queue.producer(), handshake_tx.clone(), shutdown_tx.subscribe()));
            queues.push(queue);
        }
        drop(handshake_tx);

        let links = match connect_mesh(&addrs, &RetryPolicy::from(&net), net.write_timeout()).await {
            Ok(links) => links,
            Err(e) => {
                tracing::error!("Mesh setup failed: {}", e);
                abort(&shutdown_tx, listener_tasks).await;
                return Err(e.into());
            }
        };

        let waited = Instant::now();
        if let Err(detail) = wait_for_mesh(&mut handshake_rx, n, net.setup_timeout()).await {
            tracing::error!("Mesh setup failed: {}", detail);
            abort(&shutdown_tx, listener_tasks).await;
            return Err(SimulationError::MeshIncomplete {
                waited_ms: waited.elapsed().as_millis() as u64,
                detail,
            });
        }
        tracing::info!("Full mesh established: {} machines, {} links", n, n * (n - 1));

        let log_dir = self.config.logging.dir.clone();
        let mut machines = Vec::with_capacity(n);
        for ((plan, queue), links) in self.plans.iter().zip(queues).zip(links) {
            let sink: Box<dyn EventSink> = match self.event_sinks.remove(&plan.id) {
                Some(sink) => sink,
                None => match CsvEventLog::create(&log_dir, plan.id, plan.rate) {
                    Ok(sink) => Box::new(sink),
                    Err(e) => {
                        abort(&shutdown_tx, listener_tasks).await;
                        return Err(e.into());
                    }
                },
            };
            let random = self
                .selector_sources
                .remove(&plan.id)
                .unwrap_or_else(|| Box::new(selector_source(self.config.simulation.seed, plan.id)));
            machines.push(VirtualMachine::new(
                plan.id,
                plan.rate,
                queue,
                Box::new(PeerLinks::new(links)),
                sink,
                random,
            ));
        }

        let window = RunWindow::new(Instant::now(), self.config.duration());
        let mut running = JoinSet::new();
        for vm in machines {
            running.spawn(vm.run(window, shutdown_tx.subscribe()));
        }
        tracing::info!("Simulation running for {} seconds", self.config.simulation.duration_secs);

        let mut summaries = Vec::with_capacity(n);
        let mut failure: Option<SimulationError> = None;
        let mut interrupted = false;
        tokio::select! {
            _ = sleep_until(window.deadline) => {
                tracing::info!("Simulation duration elapsed");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Received interrupt signal, shutting down");
                interrupted = true;
            }
            Some(joined) = running.join_next() => {
                // Machines only finish on their own when something broke.
                collect(joined, &mut summaries, &mut failure);
            }
        }

        tracing::info!("Stopping all virtual machines");
        let _ = shutdown_tx.send(());
        while let Some(joined) = running.join_next().await {
            collect(joined, &mut summaries, &mut failure);
        }
        for joined in join_all(listener_tasks).await {
            joined?;
        }

        if let Some(e) = failure {
            tracing::error!("Simulation aborted: {}", e);
            return Err(e);
        }
        summaries.sort_by_key(|s| s.id);
        tracing::info!("All machines stopped. Logs are in {}", log_dir.display());
        Ok(SimulationReport {
            run_id: self.run_id.to_string(),
            log_dir,
            interrupted,
            elapsed_ms: window.start.elapsed().as_millis() as u64,
            machines: summaries,
        })
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, SimulationError> {
    (host, port)
        .to_socket_addrs()
        .map_err(NetworkError::Io)?
        .next()
        .ok_or_else(|| SimulationError::Resolve { host: host.to_string(), port })
}

fn selector_source(seed: Option<u64>, id: MachineId) -> SeededRandom {
    SeededRandom::from_optional_seed(seed.map(|s| s.wrapping_add(u64::from(id.0) + 1)))
}

/// Outbound links per machine, connected pairwise in id order: for each
/// `i < j`, first `i -> j` then `j -> i`.
async fn connect_mesh(
    addrs: &[SocketAddr],
    retry: &RetryPolicy,
    write_timeout: std::time::Duration,
) -> Result<Vec<Vec<PeerLink>>, NetworkError> {
    let n = addrs.len();
    let mut links: Vec<Vec<PeerLink>> = (0..n).map(|_| Vec::with_capacity(n - 1)).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            let (a, b) = (MachineId(i as u32), MachineId(j as u32));
            links[i].push(PeerLink::connect(a, b, addrs[j], retry, write_timeout).await?);
            links[j].push(PeerLink::connect(b, a, addrs[i], retry, write_timeout).await?);
        }
    }
    Ok(links)
}

/// Wait until every listener has greeted all `n - 1` peers.
async fn wait_for_mesh(
    handshakes: &mut mpsc::UnboundedReceiver<Handshake>,
    n: usize,
    limit: std::time::Duration,
) -> Result<(), String> {
    let mut seen: Vec<HashSet<MachineId>> = vec![HashSet::new(); n];
    let complete = |seen: &Vec<HashSet<MachineId>>| seen.iter().all(|s| s.len() == n - 1);
    let gathered = timeout(limit, async {
        while !complete(&seen) {
            match handshakes.recv().await {
                Some(h) if h.listener.index() < n && h.peer != h.listener && h.peer.index() < n => {
                    seen[h.listener.index()].insert(h.peer);
                }
                Some(h) => tracing::warn!("Ignoring unexpected handshake {:?}", h),
                None => break,
            }
        }
    })
    .await;

    if gathered.is_ok() && complete(&seen) {
        return Ok(());
    }
    let missing: Vec<String> = seen
        .iter()
        .enumerate()
        .filter(|(_, s)| s.len() != n - 1)
        .map(|(i, s)| format!("machine {} has {}/{} inbound links", i, s.len(), n - 1))
        .collect();
    Err(missing.join(", "))
}

async fn abort(shutdown_tx: &broadcast::Sender<()>, listener_tasks: Vec<JoinHandle<()>>) {
    let _ = shutdown_tx.send(());
    join_all(listener_tasks).await;
}

fn collect(
    joined: Result<Result<MachineSummary, MachineError>, tokio::task::JoinError>,
    summaries: &mut Vec<MachineSummary>,
    failure: &mut Option<SimulationError>,
) {
    let outcome = match joined {
        Ok(Ok(summary)) => {
            summaries.push(summary);
            return;
        }
        Ok(Err(e)) => SimulationError::from(e),
        Err(e) => SimulationError::from(e),
    };
    tracing::error!("{}", outcome);
    if failure.is_none() {
        *failure = Some(outcome);
    }
}
