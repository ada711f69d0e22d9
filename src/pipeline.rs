//! Wiring and lifecycle of the measurement pipeline.
//!
//! ```text
//! cadences --mpsc--> router --> series buffers <-- windower --> delivery queue --> sink
//! ```
//!
//! Shutdown stops the stages in dependency order: producers first, then the
//! router, the windower (which flushes every open window) and finally the
//! delivery loop, which gets until the shutdown deadline to empty the queue.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::buffer::{SampleBuffer, SeriesBuffers};
use crate::config::AppConfig;
use crate::counters::{Counters, CountersSnapshot};
use crate::error::{AgentError, Result};
use crate::exporter::{self, DeliveryQueue, Exporter, Sink};
use crate::probe;
use crate::scheduler::{CadenceSpec, Scheduler};
use crate::window::{Clock, SystemClock, Windower, WindowerConfig};

/// Capacity of the channel between cadences and the router
pub const SAMPLE_CHANNEL_CAPACITY: usize = 1024;

/// Lifecycle of a [`Pipeline`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Initializing, Running) | (Initializing, Stopped) | (Running, Draining) | (Draining, Stopped)
        )
    }

    /// The state after moving to `next`, if that move is allowed
    pub fn transition(self, next: PipelineState) -> Result<PipelineState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(AgentError::State {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Initializing => "initializing",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Outcome of a shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Records still queued or in flight when the deadline passed
    pub undelivered: usize,
    /// Probes still running after the shutdown grace period
    pub abandoned_probes: usize,
    pub counters: CountersSnapshot,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.undelivered == 0
    }
}

/// Parts handed over from construction to `start`
struct Setup {
    cadences: Vec<CadenceSpec>,
}

/// Tasks of a running pipeline
struct Stages {
    scheduler: Scheduler,
    router: JoinHandle<()>,
    router_cancel: CancellationToken,
    windower: Arc<Windower>,
    windower_task: JoinHandle<()>,
    windower_cancel: CancellationToken,
    exporter: Arc<Exporter>,
    exporter_task: JoinHandle<()>,
    exporter_cancel: CancellationToken,
}

/// The measurement pipeline
pub struct Pipeline {
    config: AppConfig,
    sink: Arc<dyn Sink>,
    counters: Arc<Counters>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<PipelineState>,
    root: CancellationToken,
    setup: Mutex<Option<Setup>>,
    stages: Mutex<Option<Stages>>,
}

impl Pipeline {
    /// Validate the configuration and build probes and sink from it
    pub fn from_config(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let cadences = config
            .targets
            .iter()
            .map(|target_config| {
                let target = target_config.target();
                let probe = probe::probe_for(&target)?;
                Ok(CadenceSpec {
                    target,
                    config: target_config.cadence(),
                    probe,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let sink = exporter::sink_from_config(&config.sink)?;
        Self::new(config, cadences, sink)
    }

    /// Build a pipeline around explicit cadences and sink
    pub fn new(config: AppConfig, cadences: Vec<CadenceSpec>, sink: Arc<dyn Sink>) -> Result<Self> {
        // Window settings are checked here so `start` cannot fail on them
        WindowerConfig::from_config(&config.window)?;
        if cadences.is_empty() {
            return Err(AgentError::config("at least one target must be configured"));
        }
        let (state, _) = watch::channel(PipelineState::Initializing);

        Ok(Self {
            config,
            sink,
            counters: Arc::new(Counters::new()),
            clock: Arc::new(SystemClock),
            state,
            root: CancellationToken::new(),
            setup: Mutex::new(Some(Setup { cadences })),
            stages: Mutex::new(None),
        })
    }

    /// Use another time source; only effective before `start`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    fn transition(&self, next: PipelineState) -> Result<()> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match state.transition(next) {
            Ok(next) => {
                info!("Pipeline {} -> {}", state, next);
                *state = next;
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome
    }

    /// Spawn every stage and move to `Running`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let Setup { cadences } = self
            .setup
            .lock()
            .take()
            .ok_or_else(|| AgentError::State {
                from: self.state().to_string(),
                to: PipelineState::Running.to_string(),
            })?;
        let windower_config = WindowerConfig::from_config(&self.config.window)?;
        let started_at = self.clock.now();

        let buffers = cadences.iter().map(|cadence| {
            SampleBuffer::new(
                cadence.target.key(),
                cadence.target.host.as_str(),
                cadence.target.kind,
                windower_config.spec,
                started_at,
                Arc::clone(&self.counters),
            )
        });
        let buffers = Arc::new(SeriesBuffers::new(buffers, Arc::clone(&self.counters)));

        let queue = Arc::new(DeliveryQueue::new(
            self.config.queue.capacity,
            self.config.queue.eviction,
        ));
        let exporter = Arc::new(Exporter::new(
            Arc::clone(&self.sink),
            queue,
            self.config.delivery.clone(),
            self.config.sink.batch_size,
            Arc::clone(&self.counters),
        ));
        let windower = Arc::new(Windower::new(
            windower_config,
            Arc::clone(&buffers),
            exporter.handle(),
            Arc::clone(&self.counters),
            Arc::clone(&self.clock),
            started_at,
        )?);

        // Held until the stages are stored: a shutdown that sees Running must find them
        let mut stages = self.stages.lock();
        self.transition(PipelineState::Running)?;

        let exporter_cancel = self.root.child_token();
        let exporter_task = tokio::spawn(Arc::clone(&exporter).run(exporter_cancel.clone()));
        let windower_cancel = self.root.child_token();
        let windower_task = tokio::spawn(Arc::clone(&windower).run(windower_cancel.clone()));

        let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
        let router_cancel = self.root.child_token();
        let router = tokio::spawn(Arc::clone(&buffers).run_router(rx, router_cancel.clone()));
        let scheduler = Scheduler::start(
            cadences,
            tx,
            Arc::clone(&self.counters),
            Arc::clone(&self.clock),
            self.root.child_token(),
        );

        info!(
            "Pipeline running: {} series, {:?} windows, sink {}",
            buffers.len(),
            self.config.window.duration,
            self.sink.name()
        );
        *stages = Some(Stages {
            scheduler,
            router,
            router_cancel,
            windower,
            windower_task,
            windower_cancel,
            exporter,
            exporter_task,
            exporter_cancel,
        });
        Ok(())
    }

    /// Drain and stop the pipeline
    ///
    /// Only the first call does any work and returns a report; later or
    /// concurrent calls return `None` at once.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            previous = Some(*state);
            let next = match state {
                PipelineState::Initializing => PipelineState::Stopped,
                PipelineState::Running => PipelineState::Draining,
                PipelineState::Draining | PipelineState::Stopped => return false,
            };
            info!("Pipeline {} -> {}", state, next);
            *state = next;
            true
        });
        match previous {
            Some(PipelineState::Running) => {}
            Some(PipelineState::Initializing) => {
                // Never started: nothing to drain
                self.setup.lock().take();
                return Some(self.report(0, 0));
            }
            _ => return None,
        }

        let Some(stages) = self.stages.lock().take() else {
            let _ = self.transition(PipelineState::Stopped);
            return Some(self.report(0, 0));
        };
        let deadline = Instant::now() + self.config.shutdown.timeout;
        let grace = self.config.shutdown.grace;

        let abandoned = stages.scheduler.stop(grace).await;

        stages.router_cancel.cancel();
        join_until(stages.router, deadline, "sample router").await;

        stages.windower_cancel.cancel();
        join_until(stages.windower_task, deadline, "windower").await;
        stages.windower.flush_all(self.clock.now());

        stages.exporter_cancel.cancel();
        join_until(stages.exporter_task, deadline, "delivery loop").await;
        let undelivered = stages.exporter.flush(deadline).await;

        self.root.cancel();
        let report = self.report(undelivered, abandoned);
        if let Err(e) = self.transition(PipelineState::Stopped) {
            warn!("Unexpected state at end of drain: {}", e);
        }
        info!("Pipeline stopped: {}", report.counters);
        Some(report)
    }

    fn report(&self, undelivered: usize, abandoned_probes: usize) -> ShutdownReport {
        ShutdownReport {
            undelivered,
            abandoned_probes,
            counters: self.counters.snapshot(),
        }
    }
}

/// Wait for a stage task until `deadline`, aborting it afterwards
async fn join_until(task: JoinHandle<()>, deadline: Instant, stage: &str) {
    let abort = task.abort_handle();
    match tokio::time::timeout_at(deadline, task).await {
        Ok(Ok(())) => debug!("Stopped {}", stage),
        Ok(Err(e)) => warn!("{} ended abnormally: {}", stage, e),
        Err(_) => {
            warn!("{} did not stop before the shutdown deadline", stage);
            abort.abort();
        }
    }
}

/// Wait until `state` is reached or `timeout` passes
pub async fn wait_for_state(
    rx: &mut watch::Receiver<PipelineState>,
    state: PipelineState,
    timeout: Duration,
) -> bool {
    tokio::time::timeout(timeout, rx.wait_for(|current| *current == state))
        .await
        .is_ok_and(|result| result.is_ok())
}
