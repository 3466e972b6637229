use crate::launcher::{ExitOutcome, LaunchSpec, Launcher, StopSignal, UnitProcess};
use crate::RuntimeError;
use async_trait::async_trait;
use docket_schema::{ReadinessProbe, UnitName};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Behaviour of one run of a scripted unit, measured from its launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedRun {
    /// Probe passes once this much time has elapsed; `None` never passes.
    pub ready_after: Option<Duration>,
    /// Exit on its own after this long; `None` runs until signalled.
    pub exit_after: Option<(Duration, ExitOutcome)>,
    pub ignores_term: bool,
}

impl Default for ScriptedRun {
    fn default() -> Self {
        Self::daemon()
    }
}

impl ScriptedRun {
    /// Ready immediately and runs until stopped.
    pub fn daemon() -> Self {
        Self {
            ready_after: Some(Duration::ZERO),
            exit_after: None,
            ignores_term: false,
        }
    }

    pub fn ready_after(delay: Duration) -> Self {
        Self {
            ready_after: Some(delay),
            ..Self::daemon()
        }
    }

    pub fn never_ready() -> Self {
        Self {
            ready_after: None,
            ..Self::daemon()
        }
    }

    /// Exits with `outcome` after `after`, never passing its probe.
    pub fn exits(after: Duration, outcome: ExitOutcome) -> Self {
        Self {
            ready_after: None,
            exit_after: Some((after, outcome)),
            ignores_term: false,
        }
    }

    pub fn with_exit(mut self, after: Duration, outcome: ExitOutcome) -> Self {
        self.exit_after = Some((after, outcome));
        self
    }

    pub fn ignoring_term(mut self) -> Self {
        self.ignores_term = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub unit: UnitName,
    pub at: Instant,
    pub run_as: Option<(u32, u32)>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRecord {
    pub unit: UnitName,
    pub signal: StopSignal,
    pub at: Instant,
}

#[derive(Default)]
struct ScriptState {
    scripts: HashMap<UnitName, VecDeque<ScriptedRun>>,
    current: HashMap<UnitName, (Instant, ScriptedRun)>,
    failing: HashSet<UnitName>,
    panicking: HashSet<UnitName>,
    launches: Vec<LaunchRecord>,
    signals: Vec<SignalRecord>,
}

/// Launcher whose units follow a script on tokio's clock.
///
/// Runs for a unit are consumed in order and the last one repeats. Units
/// without a script behave like [`ScriptedRun::daemon`].
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ScriptState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
    }

    pub fn script(&self, unit: &str, runs: impl IntoIterator<Item = ScriptedRun>) -> &Self {
        if let Ok(mut state) = self.lock() {
            state.scripts.insert(UnitName::new(unit), runs.into_iter().collect());
        }
        self
    }

    /// Make every launch of `unit` fail as if the program were missing.
    pub fn fail_launch(&self, unit: &str) -> &Self {
        if let Ok(mut state) = self.lock() {
            state.failing.insert(UnitName::new(unit));
        }
        self
    }

    /// Make the next launch of `unit` panic inside the launcher.
    pub fn panic_on_launch(&self, unit: &str) -> &Self {
        if let Ok(mut state) = self.lock() {
            state.panicking.insert(UnitName::new(unit));
        }
        self
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.lock().map(|s| s.launches.clone()).unwrap_or_default()
    }

    pub fn launch_count(&self, unit: &str) -> usize {
        self.launches().iter().filter(|l| l.unit == unit).count()
    }

    pub fn first_launch(&self, unit: &str) -> Option<Instant> {
        self.launches().iter().find(|l| l.unit == unit).map(|l| l.at)
    }

    pub fn signals(&self) -> Vec<SignalRecord> {
        self.lock().map(|s| s.signals.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn UnitProcess>, RuntimeError> {
        let now = Instant::now();
        // Checked under a short-lived guard so the panic cannot poison the state.
        let panics = self.lock()?.panicking.remove(&spec.unit);
        assert!(!panics, "scripted launcher panicked launching {}", spec.unit);
        let mut state = self.lock()?;
        if state.failing.contains(&spec.unit) {
            return Err(RuntimeError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        let run = match state.scripts.get_mut(&spec.unit) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().copied().unwrap_or_default(),
            None => ScriptedRun::daemon(),
        };
        state.current.insert(spec.unit.clone(), (now, run));
        state.launches.push(LaunchRecord {
            unit: spec.unit.clone(),
            at: now,
            run_as: spec.run_as,
            env: spec.env.clone(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(ScriptedProcess {
            unit: spec.unit.clone(),
            started: now,
            run,
            tx,
            rx,
            done: None,
            state: Arc::clone(&self.state),
        }))
    }

    async fn probe(&self, spec: &LaunchSpec, _probe: &ReadinessProbe) -> bool {
        let Ok(state) = self.lock() else {
            return false;
        };
        state
            .current
            .get(&spec.unit)
            .and_then(|(started, run)| run.ready_after.map(|d| started.elapsed() >= d))
            .unwrap_or(false)
    }
}

struct ScriptedProcess {
    unit: UnitName,
    started: Instant,
    run: ScriptedRun,
    tx: mpsc::UnboundedSender<StopSignal>,
    rx: mpsc::UnboundedReceiver<StopSignal>,
    done: Option<ExitOutcome>,
    state: Arc<Mutex<ScriptState>>,
}

#[async_trait]
impl UnitProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<ExitOutcome, RuntimeError> {
        if let Some(outcome) = self.done {
            return Ok(outcome);
        }
        let deadline = self.run.exit_after.map(|(after, _)| self.started + after);
        let scripted_exit = self.run.exit_after.map(|(_, outcome)| outcome);
        let ignores_term = self.run.ignores_term;
        loop {
            let natural_exit = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let outcome = tokio::select! {
                () = natural_exit => scripted_exit,
                Some(signal) = self.rx.recv() => match signal {
                    StopSignal::Term if ignores_term => None,
                    StopSignal::Term => Some(ExitOutcome::Signal(libc::SIGTERM)),
                    StopSignal::Kill => Some(ExitOutcome::Signal(libc::SIGKILL)),
                },
            };
            if let Some(outcome) = outcome {
                self.done = Some(outcome);
                return Ok(outcome);
            }
        }
    }

    fn signal(&mut self, signal: StopSignal) -> Result<(), RuntimeError> {
        if self.done.is_some() {
            return Ok(());
        }
        if let Ok(mut state) = self.state.lock() {
            state.signals.push(SignalRecord {
                unit: self.unit.clone(),
                signal,
                at: Instant::now(),
            });
        }
        self.tx
            .send(signal)
            .map_err(|e| RuntimeError::ExecFailed(format!("scripted process gone: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(unit: &str) -> LaunchSpec {
        LaunchSpec {
            unit: UnitName::new(unit),
            program: unit.to_owned(),
            args: vec![],
            env: BTreeMap::new(),
            workdir: None,
            run_as: Some((1000, 1000)),
        }
    }

    fn probe() -> ReadinessProbe {
        ReadinessProbe::Path {
            path: "/nonexistent".into(),
            interval: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_follows_the_clock() {
        let launcher = ScriptedLauncher::new();
        launcher.script("a", [ScriptedRun::ready_after(Duration::from_secs(3))]);
        let _p = launcher.launch(&spec("a")).await.unwrap();
        assert!(!launcher.probe(&spec("a"), &probe()).await);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(launcher.probe(&spec("a"), &probe()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_exit_happens_on_time() {
        let launcher = ScriptedLauncher::new();
        launcher.script(
            "a",
            [ScriptedRun::exits(Duration::from_secs(2), ExitOutcome::Code(4))],
        );
        let start = Instant::now();
        let mut p = launcher.launch(&spec("a")).await.unwrap();
        assert_eq!(p.wait().await.unwrap(), ExitOutcome::Code(4));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn runs_are_consumed_then_last_repeats() {
        let launcher = ScriptedLauncher::new();
        launcher.script(
            "a",
            [
                ScriptedRun::exits(Duration::from_secs(1), ExitOutcome::Code(1)),
                ScriptedRun::exits(Duration::from_secs(1), ExitOutcome::Code(2)),
            ],
        );
        for expected in [1, 2, 2, 2] {
            let mut p = launcher.launch(&spec("a")).await.unwrap();
            assert_eq!(p.wait().await.unwrap(), ExitOutcome::Code(expected));
        }
        assert_eq!(launcher.launch_count("a"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn term_is_ignored_when_scripted_but_kill_is_not() {
        let launcher = ScriptedLauncher::new();
        launcher.script("a", [ScriptedRun::daemon().ignoring_term()]);
        let mut p = launcher.launch(&spec("a")).await.unwrap();
        p.signal(StopSignal::Term).unwrap();
        let waited = tokio::time::timeout(Duration::from_secs(5), p.wait()).await;
        assert!(waited.is_err());
        p.signal(StopSignal::Kill).unwrap();
        assert_eq!(p.wait().await.unwrap(), ExitOutcome::Signal(libc::SIGKILL));
        assert_eq!(launcher.signals().len(), 2);
    }

    #[tokio::test]
    async fn failing_launch_is_a_spawn_error() {
        let launcher = ScriptedLauncher::new();
        launcher.fail_launch("a");
        assert!(matches!(
            launcher.launch(&spec("a")).await,
            Err(RuntimeError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn launch_records_identity() {
        let launcher = ScriptedLauncher::new();
        let _p = launcher.launch(&spec("a")).await.unwrap();
        assert_eq!(launcher.launches()[0].run_as, Some((1000, 1000)));
    }
}
