//! Event loop: executes [`ExplorerCmd`]s on a fetch worker pool and feeds the
//! results back through [`update`] as [`ExplorerMsg`]s.
//!
//! Threads:
//! - **Main thread**: owns [`AppState`], applies messages, wakes on the
//!   earliest deadline (refresh timer, filter debounce, status tick).
//! - **Fetch workers**: pull jobs from a shared channel and run one transport
//!   call each. A slow grid never blocks the loop.
//!
//! All state mutation happens on the main thread.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, info, info_span, warn};

use super::model::{AppState, ExplorerCmd, ExplorerMsg};
use super::update::update;
use crate::core::errors::{CexError, Result};
use crate::grid::controller::FetchRequest;
use crate::grid::query::QueryTransport;

/// Default number of fetch workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Work items for the fetch pool.
#[derive(Debug)]
enum Job {
    Query(FetchRequest),
    Lookups,
    Counts,
}

/// Output side of the loop.
pub trait FrameSink {
    /// Called after every applied message.
    fn frame(&mut self, state: &AppState);
    /// Text produced by an `Emit` command (copied records).
    fn emit(&mut self, text: &str);
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn frame(&mut self, _state: &AppState) {}
    fn emit(&mut self, _text: &str) {}
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub workers: usize,
    /// Stop after this many completed refresh cycles.
    pub max_cycles: Option<u64>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_cycles: None,
        }
    }
}

/// Why [`ExplorerRuntime::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Quit,
    Signal,
    MaxCycles,
}

// ──────────────────── shutdown ────────────────────

/// Shared shutdown flag, set by SIGINT/SIGTERM or programmatically.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register SIGINT/SIGTERM. Registration failures are logged, not fatal.
    #[cfg(feature = "signals")]
    pub fn register_os_signals(&self) {
        use signal_hook::consts::{SIGINT, SIGTERM};
        for (name, signal) in [("SIGTERM", SIGTERM), ("SIGINT", SIGINT)] {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&self.flag)) {
                warn!(signal = name, error = %e, "failed to register signal handler");
            }
        }
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

// ──────────────────── runtime ────────────────────

pub struct ExplorerRuntime {
    jobs_tx: Option<Sender<Job>>,
    events_tx: Sender<ExplorerMsg>,
    events_rx: Receiver<ExplorerMsg>,
    workers: Vec<JoinHandle<()>>,
    shutdown: ShutdownSignal,
    options: RuntimeOptions,
    /// Jobs dispatched whose result has not come back yet.
    outstanding: usize,
}

impl ExplorerRuntime {
    /// Spawn the worker pool.
    pub fn start(transport: Arc<dyn QueryTransport>, options: RuntimeOptions) -> Result<Self> {
        let (jobs_tx, jobs_rx) = unbounded::<Job>();
        let (events_tx, events_rx) = unbounded::<ExplorerMsg>();
        let count = options.workers.max(1);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let jobs = jobs_rx.clone();
            let events = events_tx.clone();
            let transport = Arc::clone(&transport);
            let handle = thread::Builder::new()
                .name(format!("cexp-fetch-{index}"))
                .spawn(move || worker_main(index, &jobs, &events, transport.as_ref()))
                .map_err(|source| CexError::Runtime {
                    details: format!("failed to spawn fetch worker {index}: {source}"),
                })?;
            workers.push(handle);
        }
        debug!(workers = count, "fetch pool started");
        Ok(Self {
            jobs_tx: Some(jobs_tx),
            events_tx,
            events_rx,
            workers,
            shutdown: ShutdownSignal::new(),
            options,
            outstanding: 0,
        })
    }

    /// Sender for external message sources (operator input).
    #[must_use]
    pub fn sender(&self) -> Sender<ExplorerMsg> {
        self.events_tx.clone()
    }

    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Drive the loop until quit, a shutdown signal, or `max_cycles`.
    pub fn run(
        &mut self,
        state: &mut AppState,
        initial: ExplorerCmd,
        sink: &mut dyn FrameSink,
    ) -> Result<StopReason> {
        let _span = info_span!("explorer_loop").entered();
        let mut cmd = initial;
        loop {
            if self.execute(cmd, sink)? {
                return Ok(StopReason::Quit);
            }
            sink.frame(state);
            if let Some(reason) = self.stop_reason(state) {
                info!(?reason, cycles = state.coordinator.cycles_completed(), "explorer loop stopping");
                return Ok(reason);
            }
            let now = Instant::now();
            let msg = self.next_message(state.next_wake(now))?;
            cmd = update(state, msg, Instant::now());
        }
    }

    /// Execute `initial` and process messages until no job is outstanding
    /// and no filter is pending. Used by one-shot commands.
    pub fn run_until_idle(
        &mut self,
        state: &mut AppState,
        initial: ExplorerCmd,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut sink = NullSink;
        let mut cmd = initial;
        loop {
            self.execute(cmd, &mut sink)?;
            if self.outstanding == 0 && state.grids.next_filter_deadline().is_none() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CexError::Runtime {
                    details: format!(
                        "timed out after {}ms with {} request(s) outstanding",
                        timeout.as_millis(),
                        self.outstanding
                    ),
                });
            }
            let wake = state.grids.next_filter_deadline().map_or(deadline, |d| d.min(deadline));
            let msg = self.next_message(wake)?;
            cmd = update(state, msg, Instant::now());
        }
    }

    fn stop_reason(&self, state: &AppState) -> Option<StopReason> {
        if state.quit {
            return Some(StopReason::Quit);
        }
        if self.shutdown.is_requested() {
            return Some(StopReason::Signal);
        }
        match self.options.max_cycles {
            Some(max) if state.coordinator.cycles_completed() >= max => Some(StopReason::MaxCycles),
            _ => None,
        }
    }

    fn next_message(&mut self, deadline: Instant) -> Result<ExplorerMsg> {
        match self.events_rx.recv_deadline(deadline) {
            Ok(msg) => {
                if matches!(
                    msg,
                    ExplorerMsg::FetchCompleted { .. }
                        | ExplorerMsg::LookupsLoaded(_)
                        | ExplorerMsg::CountsLoaded(_)
                ) {
                    self.outstanding = self.outstanding.saturating_sub(1);
                }
                Ok(msg)
            }
            Err(RecvTimeoutError::Timeout) => Ok(ExplorerMsg::Tick),
            Err(RecvTimeoutError::Disconnected) => Err(CexError::ChannelClosed {
                component: "explorer events",
            }),
        }
    }

    /// Run a command. Returns `true` when it asks to quit.
    fn execute(&mut self, cmd: ExplorerCmd, sink: &mut dyn FrameSink) -> Result<bool> {
        let mut quit = false;
        for cmd in cmd.flatten() {
            match cmd {
                ExplorerCmd::Fetch(request) => self.dispatch(Job::Query(request))?,
                ExplorerCmd::FetchLookups => self.dispatch(Job::Lookups)?,
                ExplorerCmd::FetchCounts => self.dispatch(Job::Counts)?,
                ExplorerCmd::Emit(text) => sink.emit(&text),
                ExplorerCmd::Quit => quit = true,
                ExplorerCmd::None | ExplorerCmd::Batch(_) => {}
            }
        }
        Ok(quit)
    }

    fn dispatch(&mut self, job: Job) -> Result<()> {
        let tx = self.jobs_tx.as_ref().ok_or(CexError::ChannelClosed {
            component: "fetch pool",
        })?;
        tx.send(job).map_err(|_| CexError::ChannelClosed {
            component: "fetch pool",
        })?;
        self.outstanding += 1;
        Ok(())
    }

    /// Close the job queue and join the workers. In-flight calls finish first.
    pub fn shutdown(&mut self) {
        self.jobs_tx = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("fetch worker panicked");
            }
        }
    }
}

impl Drop for ExplorerRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(
    index: usize,
    jobs: &Receiver<Job>,
    events: &Sender<ExplorerMsg>,
    transport: &dyn QueryTransport,
) {
    while let Ok(job) = jobs.recv() {
        let msg = match job {
            Job::Query(request) => {
                let started = Instant::now();
                let outcome = transport.query(&request.query);
                debug!(
                    worker = index,
                    entity = %request.ticket.entity,
                    draw = request.ticket.draw,
                    ok = outcome.is_ok(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "grid query finished"
                );
                ExplorerMsg::FetchCompleted {
                    ticket: request.ticket,
                    outcome,
                }
            }
            Job::Lookups => ExplorerMsg::LookupsLoaded(transport.lookups()),
            Job::Counts => ExplorerMsg::CountsLoaded(transport.counts()),
        };
        if events.send(msg).is_err() {
            break;
        }
    }
    debug!(worker = index, "fetch worker exiting");
}
