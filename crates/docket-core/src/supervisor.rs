//! Supervision runtime.
//!
//! Every unit runs in its own task. A unit waits until all of its
//! dependencies are ready, launches, and is gated on its readiness probe
//! before dependents may start. Unexpected exits go through the unit's
//! restart policy. The coordinator owns the container state machine: the
//! first fatal condition (or an external stop request) ends supervision, and
//! the remaining processes are then stopped one by one in reverse start order,
//! each with its own grace period before SIGKILL.

use crate::graph::UnitGraph;
use crate::lifecycle::{validate_transition, ContainerState, UnitState};
use crate::restart::RestartManager;
use crate::CoreError;
use docket_runtime::{
    account_environment, ExitOutcome, LaunchSpec, Launcher, StopSignal, UnitProcess,
};
use docket_schema::{RestartMode, TimeoutPolicy, UnitDefinition, UnitKind, UnitName};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A condition that fails the whole container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FatalCondition {
    LaunchFailed {
        unit: UnitName,
        message: String,
    },
    ReadinessTimeout {
        unit: UnitName,
        max_wait: Duration,
    },
    /// A dependency was skipped or failed and the unit's timeout policy is `fail`.
    DependencyUnavailable {
        unit: UnitName,
        dependency: UnitName,
    },
    /// Exit under restart mode `never`.
    UnitExited {
        unit: UnitName,
        outcome: ExitOutcome,
    },
    RestartLimit {
        unit: UnitName,
        restarts: u32,
        outcome: ExitOutcome,
    },
    /// The unit's supervision task panicked.
    TaskFailed {
        unit: UnitName,
        message: String,
    },
}

impl FatalCondition {
    pub fn unit(&self) -> &UnitName {
        match self {
            Self::LaunchFailed { unit, .. }
            | Self::ReadinessTimeout { unit, .. }
            | Self::DependencyUnavailable { unit, .. }
            | Self::UnitExited { unit, .. }
            | Self::RestartLimit { unit, .. }
            | Self::TaskFailed { unit, .. } => unit,
        }
    }

    /// Container exit code: the failing unit's status when it has a non-zero one, else 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UnitExited { outcome, .. } | Self::RestartLimit { outcome, .. } => {
                match outcome.as_status() {
                    0 => 1,
                    status => status,
                }
            }
            _ => 1,
        }
    }
}

impl fmt::Display for FatalCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LaunchFailed { unit, message } => write!(f, "unit '{unit}' failed to start: {message}"),
            Self::ReadinessTimeout { unit, max_wait } => {
                write!(f, "unit '{unit}' not ready within {max_wait:?}")
            }
            Self::DependencyUnavailable { unit, dependency } => {
                write!(f, "unit '{unit}' cannot start: dependency '{dependency}' never became ready")
            }
            Self::UnitExited { unit, outcome } => {
                write!(f, "unit '{unit}' exited ({outcome}) and does not restart")
            }
            Self::RestartLimit {
                unit,
                restarts,
                outcome,
            } => write!(
                f,
                "unit '{unit}' exited ({outcome}) after {restarts} restarts; restart limit reached"
            ),
            Self::TaskFailed { unit, message } => {
                write!(f, "supervision of unit '{unit}' aborted: {message}")
            }
        }
    }
}

/// A unit state change, timed from the start of supervision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitTransition {
    pub unit: UnitName,
    pub state: UnitState,
    pub at: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerTransition {
    pub state: ContainerState,
    pub at: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitSummary {
    pub name: UnitName,
    pub state: UnitState,
    pub launches: u32,
    pub restarts: u32,
    pub last_exit: Option<ExitOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisionReport {
    pub state: ContainerState,
    pub exit_code: i32,
    pub fatal: Option<FatalCondition>,
    pub container: Vec<ContainerTransition>,
    pub units: Vec<UnitSummary>,
    pub transitions: Vec<UnitTransition>,
    pub start_order: Vec<UnitName>,
    pub stop_order: Vec<UnitName>,
}

impl SupervisionReport {
    /// First time `unit` entered `state`.
    pub fn first(&self, unit: &str, state: UnitState) -> Option<Duration> {
        self.transitions
            .iter()
            .find(|t| t.unit == unit && t.state == state)
            .map(|t| t.at)
    }

    pub fn unit(&self, name: &str) -> Option<&UnitSummary> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn container_states(&self) -> Vec<ContainerState> {
        self.container.iter().map(|t| t.state).collect()
    }
}

/// Runs a validated unit graph with a launcher.
pub struct Supervisor {
    graph: UnitGraph,
    launcher: Arc<dyn Launcher>,
    run_as: Option<RunAs>,
}

/// Account every unit runs under when supervision is privileged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
    pub user: String,
    pub home: PathBuf,
}

impl Supervisor {
    /// Build the dependency graph; unknown dependencies and cycles are startup-fatal.
    pub fn new(units: Vec<UnitDefinition>, launcher: Arc<dyn Launcher>) -> Result<Self, CoreError> {
        Ok(Self {
            graph: UnitGraph::build(units)?,
            launcher,
            run_as: None,
        })
    }

    /// Run every unit as this account.
    #[must_use]
    pub fn with_identity(mut self, run_as: Option<RunAs>) -> Self {
        self.run_as = run_as;
        self
    }

    pub fn graph(&self) -> &UnitGraph {
        &self.graph
    }

    /// Supervise until a fatal condition, `shutdown` resolving, or every unit settling.
    pub async fn run<F>(self, shutdown: F) -> SupervisionReport
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let mut coordinator = Coordinator::new(started);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut receivers: BTreeMap<UnitName, watch::Receiver<UnitState>> = BTreeMap::new();
        let mut handles = Vec::with_capacity(self.graph.len());
        for def in self.graph.units() {
            let (state_tx, state_rx) = watch::channel(UnitState::Init);
            let deps = def
                .depends_on
                .iter()
                .filter_map(|dep| receivers.get(dep).map(|rx| (dep.clone(), rx.clone())))
                .collect();
            receivers.insert(def.name.clone(), state_rx);
            coordinator.states.insert(def.name.clone(), UnitState::Init);

            let task = UnitTask {
                spec: launch_spec(def, self.run_as.as_ref()),
                def: def.clone(),
                launcher: Arc::clone(&self.launcher),
                deps,
                state: state_tx,
                shutdown: stop_rx.clone(),
                events: events_tx.clone(),
            };
            handles.push((def.name.clone(), tokio::spawn(guarded(task))));
        }
        drop(events_tx);
        info!("supervising {} units", handles.len());

        tokio::pin!(shutdown);
        loop {
            if coordinator.all_settled() {
                info!("all units settled");
                coordinator.transition(ContainerState::Stopping);
                break;
            }
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => {
                        coordinator.apply(event);
                        if coordinator.fatal.is_some() {
                            break;
                        }
                    }
                    None => {
                        coordinator.transition(ContainerState::Stopping);
                        break;
                    }
                },
                () = &mut shutdown => {
                    info!("stop requested");
                    coordinator.transition(ContainerState::Stopping);
                    break;
                }
            }
        }

        let _ = stop_tx.send(true);
        let mut exits: BTreeMap<UnitName, UnitExit> = BTreeMap::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(exit) => {
                    exits.insert(name, exit);
                }
                Err(e) => error!(unit = %name, "unit task ended abnormally: {e}"),
            }
        }
        while let Ok(event) = events_rx.try_recv() {
            coordinator.apply(event);
        }

        let order = coordinator.start_order.clone();
        for name in order.iter().rev() {
            if let Some(exit) = exits.get_mut(name) {
                coordinator.stop_unit(name, exit).await;
            }
        }
        coordinator.transition(ContainerState::Stopped);
        coordinator.into_report(&self.graph, &exits)
    }
}

fn launch_spec(def: &UnitDefinition, run_as: Option<&RunAs>) -> LaunchSpec {
    let (program, args) = def
        .command
        .split_first()
        .map(|(p, a)| (p.clone(), a.to_vec()))
        .unwrap_or_default();
    let mut env = def.environment.clone();
    if let Some(account) = run_as {
        env.extend(account_environment(&account.user, &account.home));
    }
    LaunchSpec {
        unit: def.name.clone(),
        program,
        args,
        env,
        workdir: def.working_dir.clone(),
        run_as: run_as.map(|account| (account.uid, account.gid)),
    }
}

/// Run a unit task in its own task so a panic surfaces as a fatal condition.
async fn guarded(task: UnitTask) -> UnitExit {
    let unit = task.def.name.clone();
    let grace = task.def.shutdown_grace;
    let events = task.events.clone();
    match tokio::spawn(task.run()).await {
        Ok(exit) => exit,
        Err(e) => {
            error!(unit = %unit, "unit task ended abnormally: {e}");
            let at = Instant::now();
            let _ = events.send(UnitEvent {
                unit: unit.clone(),
                at,
                kind: EventKind::State(UnitState::Failed),
            });
            let _ = events.send(UnitEvent {
                unit: unit.clone(),
                at,
                kind: EventKind::Fatal(FatalCondition::TaskFailed {
                    unit,
                    message: e.to_string(),
                }),
            });
            UnitExit::empty(grace)
        }
    }
}

#[derive(Debug)]
enum EventKind {
    State(UnitState),
    Launched,
    Fatal(FatalCondition),
}

#[derive(Debug)]
struct UnitEvent {
    unit: UnitName,
    at: Instant,
    kind: EventKind,
}

/// What a unit task hands back when supervision ends.
struct UnitExit {
    process: Option<Box<dyn UnitProcess>>,
    grace: Duration,
    launches: u32,
    restarts: u32,
    last_exit: Option<ExitOutcome>,
}

impl UnitExit {
    fn empty(grace: Duration) -> Self {
        Self {
            process: None,
            grace,
            launches: 0,
            restarts: 0,
            last_exit: None,
        }
    }
}

struct Coordinator {
    started: Instant,
    state: ContainerState,
    container: Vec<ContainerTransition>,
    states: BTreeMap<UnitName, UnitState>,
    transitions: Vec<UnitTransition>,
    start_order: Vec<UnitName>,
    stop_order: Vec<UnitName>,
    fatal: Option<FatalCondition>,
}

impl Coordinator {
    fn new(started: Instant) -> Self {
        Self {
            started,
            state: ContainerState::Starting,
            container: vec![ContainerTransition {
                state: ContainerState::Starting,
                at: Duration::ZERO,
            }],
            states: BTreeMap::new(),
            transitions: Vec::new(),
            start_order: Vec::new(),
            stop_order: Vec::new(),
            fatal: None,
        }
    }

    fn elapsed(&self, at: Instant) -> Duration {
        at.saturating_duration_since(self.started)
    }

    fn transition(&mut self, to: ContainerState) {
        match validate_transition(self.state, to) {
            Ok(()) => {
                info!("container {} -> {to}", self.state);
                self.state = to;
                self.container.push(ContainerTransition {
                    state: to,
                    at: self.elapsed(Instant::now()),
                });
            }
            Err(e) => debug!("ignoring container transition: {e}"),
        }
    }

    fn record(&mut self, unit: &UnitName, state: UnitState, at: Instant) {
        self.states.insert(unit.clone(), state);
        let at = self.elapsed(at);
        self.transitions.push(UnitTransition {
            unit: unit.clone(),
            state,
            at,
        });
    }

    fn apply(&mut self, event: UnitEvent) {
        match event.kind {
            EventKind::State(state) => {
                self.record(&event.unit, state, event.at);
                if self.state == ContainerState::Starting && self.startup_complete() {
                    self.transition(ContainerState::Running);
                }
            }
            EventKind::Launched => {
                if !self.start_order.contains(&event.unit) {
                    self.start_order.push(event.unit);
                }
            }
            EventKind::Fatal(condition) => {
                if self.state == ContainerState::Stopping {
                    debug!("failure during stop ignored: {condition}");
                } else if self.fatal.is_none() {
                    error!("{condition}");
                    self.fatal = Some(condition);
                    self.transition(ContainerState::Failed);
                } else {
                    debug!("subsequent failure ignored: {condition}");
                }
            }
        }
    }

    fn startup_complete(&self) -> bool {
        !self.states.is_empty()
            && self.states.values().all(|s| {
                matches!(
                    s,
                    UnitState::Running | UnitState::Done | UnitState::Skipped
                )
            })
    }

    fn all_settled(&self) -> bool {
        self.states.values().all(|s| s.is_settled())
    }

    /// SIGTERM, then SIGKILL once the unit's grace period is over.
    async fn stop_unit(&mut self, name: &UnitName, exit: &mut UnitExit) {
        let Some(mut process) = exit.process.take() else {
            return;
        };
        let failed = self.states.get(name) == Some(&UnitState::Failed);
        if !failed {
            self.record(name, UnitState::Stopping, Instant::now());
        }
        self.stop_order.push(name.clone());
        info!(unit = %name, "stopping");

        if let Err(e) = process.signal(StopSignal::Term) {
            warn!(unit = %name, "SIGTERM failed: {e}");
        }
        let outcome = match tokio::time::timeout(exit.grace, process.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(unit = %name, "still running after {:?}, sending SIGKILL", exit.grace);
                if let Err(e) = process.signal(StopSignal::Kill) {
                    warn!(unit = %name, "SIGKILL failed: {e}");
                }
                process.wait().await
            }
        };
        match outcome {
            Ok(outcome) => {
                debug!(unit = %name, "stopped ({outcome})");
                exit.last_exit = Some(outcome);
            }
            Err(e) => warn!(unit = %name, "failed to collect exit status: {e}"),
        }
        if !failed {
            self.record(name, UnitState::Stopped, Instant::now());
        }
    }

    fn into_report(self, graph: &UnitGraph, exits: &BTreeMap<UnitName, UnitExit>) -> SupervisionReport {
        let units = graph
            .order()
            .iter()
            .map(|name| {
                let exit = exits.get(name);
                UnitSummary {
                    name: name.clone(),
                    state: self.states.get(name).copied().unwrap_or(UnitState::Init),
                    launches: exit.map_or(0, |e| e.launches),
                    restarts: exit.map_or(0, |e| e.restarts),
                    last_exit: exit.and_then(|e| e.last_exit),
                }
            })
            .collect();
        let exit_code = self.fatal.as_ref().map_or(0, FatalCondition::exit_code);
        SupervisionReport {
            state: self.state,
            exit_code,
            fatal: self.fatal,
            container: self.container,
            units,
            transitions: self.transitions,
            start_order: self.start_order,
            stop_order: self.stop_order,
        }
    }
}

/// Resolves once a stop has been requested or the coordinator is gone.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_outcome(unit: &UnitName, process: &mut dyn UnitProcess) -> ExitOutcome {
    match process.wait().await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(unit = %unit, "failed to collect exit status: {e}");
            ExitOutcome::Code(1)
        }
    }
}

enum DependencyWait {
    Satisfied,
    Unavailable(UnitName),
    Stop,
}

enum Readiness {
    Ready,
    Exited(ExitOutcome),
    TimedOut,
    Stop,
}

enum Step {
    Exited(ExitOutcome),
    Stop,
}

struct UnitTask {
    def: UnitDefinition,
    spec: LaunchSpec,
    launcher: Arc<dyn Launcher>,
    deps: Vec<(UnitName, watch::Receiver<UnitState>)>,
    state: watch::Sender<UnitState>,
    shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<UnitEvent>,
}

impl UnitTask {
    fn emit(&self, kind: EventKind) {
        let _ = self.events.send(UnitEvent {
            unit: self.def.name.clone(),
            at: Instant::now(),
            kind,
        });
    }

    fn set(&self, state: UnitState) {
        debug!(unit = %self.def.name, "{state}");
        self.state.send_replace(state);
        self.emit(EventKind::State(state));
    }

    fn fail(&self, condition: FatalCondition) {
        self.set(UnitState::Failed);
        self.emit(EventKind::Fatal(condition));
    }

    async fn wait_for_dependencies(&mut self) -> DependencyWait {
        for (name, rx) in &mut self.deps {
            loop {
                let state = *rx.borrow_and_update();
                if state.satisfies_dependents() {
                    break;
                }
                let changed = if state.blocks_dependents() {
                    false
                } else {
                    tokio::select! {
                        r = rx.changed() => r.is_ok(),
                        () = stop_requested(&mut self.shutdown) => return DependencyWait::Stop,
                    }
                };
                if !changed {
                    // A dependency winding down because of a stop is not a failure.
                    if *self.shutdown.borrow() {
                        return DependencyWait::Stop;
                    }
                    return DependencyWait::Unavailable(name.clone());
                }
            }
        }
        DependencyWait::Satisfied
    }

    async fn await_ready(&mut self, process: &mut dyn UnitProcess, deadline: Instant) -> Readiness {
        let unit = self.def.name.clone();
        if self.def.kind == UnitKind::Oneshot {
            return tokio::select! {
                outcome = wait_outcome(&unit, process) => Readiness::Exited(outcome),
                () = tokio::time::sleep_until(deadline) => Readiness::TimedOut,
                () = stop_requested(&mut self.shutdown) => Readiness::Stop,
            };
        }
        let Some(probe) = self.def.readiness.clone() else {
            return Readiness::Ready;
        };
        loop {
            if self.launcher.probe(&self.spec, &probe).await {
                return Readiness::Ready;
            }
            let next = Instant::now() + probe.interval();
            tokio::select! {
                biased;
                () = stop_requested(&mut self.shutdown) => return Readiness::Stop,
                outcome = wait_outcome(&unit, process) => return Readiness::Exited(outcome),
                () = tokio::time::sleep_until(deadline) => return Readiness::TimedOut,
                () = tokio::time::sleep_until(next) => {}
            }
        }
    }

    /// Stop a process that is being abandoned while supervision continues.
    async fn terminate(&self, mut process: Box<dyn UnitProcess>) -> Option<ExitOutcome> {
        let _ = process.signal(StopSignal::Term);
        match tokio::time::timeout(self.def.shutdown_grace, process.wait()).await {
            Ok(result) => result.ok(),
            Err(_) => {
                let _ = process.signal(StopSignal::Kill);
                process.wait().await.ok()
            }
        }
    }

    /// Whether this exit ends the unit successfully rather than counting as a failure.
    ///
    /// A longrun that exits before its probe passed never finishes, whatever its status.
    fn finishes(&self, outcome: ExitOutcome, ready: bool) -> bool {
        outcome.success()
            && (self.def.kind == UnitKind::Oneshot
                || (ready && self.def.restart.mode == RestartMode::OnFailure))
    }

    #[allow(clippy::too_many_lines)]
    async fn run(mut self) -> UnitExit {
        let name = self.def.name.clone();
        let mut exit = UnitExit::empty(self.def.shutdown_grace);

        match self.wait_for_dependencies().await {
            DependencyWait::Satisfied => {}
            DependencyWait::Stop => {
                self.set(UnitState::Stopped);
                return exit;
            }
            DependencyWait::Unavailable(dependency) => {
                warn!(unit = %name, "dependency '{dependency}' will not become ready");
                match self.def.on_timeout {
                    TimeoutPolicy::Continue => self.set(UnitState::Skipped),
                    TimeoutPolicy::Fail => self.fail(FatalCondition::DependencyUnavailable {
                        unit: name,
                        dependency,
                    }),
                }
                return exit;
            }
        }

        let deadline = Instant::now() + self.def.max_wait;
        let mut restarts = RestartManager::new(self.def.restart.clone());
        let mut ready = false;
        loop {
            self.set(UnitState::Starting);
            let mut process = match self.launcher.launch(&self.spec).await {
                Ok(process) => process,
                Err(e) => {
                    self.fail(FatalCondition::LaunchFailed {
                        unit: name,
                        message: e.to_string(),
                    });
                    return exit;
                }
            };
            exit.launches += 1;
            let launched_at = Instant::now();
            self.emit(EventKind::Launched);

            let mut exited = None;
            if ready {
                self.set(UnitState::Running);
            } else {
                match self.await_ready(process.as_mut(), deadline).await {
                    Readiness::Ready => {
                        ready = true;
                        info!(unit = %name, "ready");
                        self.set(UnitState::Ready);
                        self.set(UnitState::Running);
                    }
                    Readiness::Exited(outcome) => exited = Some(outcome),
                    Readiness::TimedOut => {
                        warn!(unit = %name, "not ready within {:?}", self.def.max_wait);
                        match self.def.on_timeout {
                            TimeoutPolicy::Fail => {
                                exit.process = Some(process);
                                self.fail(FatalCondition::ReadinessTimeout {
                                    unit: name,
                                    max_wait: self.def.max_wait,
                                });
                            }
                            TimeoutPolicy::Continue => {
                                self.set(UnitState::Stopping);
                                exit.last_exit = self.terminate(process).await;
                                self.set(UnitState::Skipped);
                            }
                        }
                        return exit;
                    }
                    Readiness::Stop => {
                        exit.process = Some(process);
                        return exit;
                    }
                }
            }

            let outcome = match exited {
                Some(outcome) => outcome,
                None => {
                    let step = tokio::select! {
                        outcome = wait_outcome(&name, process.as_mut()) => Step::Exited(outcome),
                        () = stop_requested(&mut self.shutdown) => Step::Stop,
                    };
                    match step {
                        Step::Exited(outcome) => outcome,
                        Step::Stop => {
                            exit.process = Some(process);
                            return exit;
                        }
                    }
                }
            };
            exit.last_exit = Some(outcome);

            if self.finishes(outcome, ready) {
                info!(unit = %name, "finished");
                if !ready {
                    self.set(UnitState::Ready);
                }
                self.set(UnitState::Done);
                return exit;
            }
            let wants_restart = if ready || self.def.kind == UnitKind::Oneshot {
                restarts.wants_restart(outcome)
            } else {
                restarts.wants_restart_unready()
            };
            if !wants_restart {
                self.fail(FatalCondition::UnitExited {
                    unit: name,
                    outcome,
                });
                return exit;
            }
            if !restarts.should_restart() {
                self.fail(FatalCondition::RestartLimit {
                    unit: name,
                    restarts: restarts.total_restarts(),
                    outcome,
                });
                return exit;
            }
            let delay = restarts.record_restart(outcome, launched_at.elapsed());
            exit.restarts = restarts.total_restarts();
            warn!(unit = %name, "exited ({outcome}); restart {} in {delay:?}", exit.restarts);
            self.set(UnitState::Restarting);

            let stopped = tokio::select! {
                () = tokio::time::sleep(delay) => false,
                () = stop_requested(&mut self.shutdown) => true,
            };
            if stopped {
                self.set(UnitState::Stopped);
                return exit;
            }
        }
    }
}
