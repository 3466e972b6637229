//! Restart accounting for supervised units.

use docket_runtime::ExitOutcome;
use docket_schema::{RestartMode, RestartPolicy};
use std::time::Duration;
use tokio::time::Instant;

/// One restart within the current window.
#[derive(Debug, Clone, Copy)]
pub struct RestartEntry {
    pub at: Instant,
    pub outcome: ExitOutcome,
    /// Uptime of the run that ended.
    pub uptime: Duration,
    /// Backoff applied before the next run.
    pub delay: Duration,
}

/// Decides whether a unit restarts and how long to wait first.
///
/// Restarts are capped at `max_restarts` within a sliding `window`; the
/// backoff attempt counter resets once a run stays up for a whole window.
#[derive(Debug)]
pub struct RestartManager {
    policy: RestartPolicy,
    history: Vec<RestartEntry>,
    backoff_attempt: u32,
    total: u32,
}

impl RestartManager {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            history: Vec::new(),
            backoff_attempt: 0,
            total: 0,
        }
    }

    /// Whether the restart mode asks for a restart after this exit.
    pub fn wants_restart(&self, outcome: ExitOutcome) -> bool {
        match self.policy.mode {
            RestartMode::Never => false,
            RestartMode::OnFailure => !outcome.success(),
            RestartMode::Always => true,
        }
    }

    /// Whether a run that exited before passing its probe is tried again.
    ///
    /// Such an exit is a failure whatever its status, so only `never` gives up.
    pub fn wants_restart_unready(&self) -> bool {
        self.policy.mode != RestartMode::Never
    }

    /// Whether another restart fits under the cap.
    pub fn should_restart(&self) -> bool {
        self.restart_count() < self.policy.max_restarts as usize
    }

    /// Record a restart and return the backoff delay before the next run.
    pub fn record_restart(&mut self, outcome: ExitOutcome, uptime: Duration) -> Duration {
        if uptime >= self.policy.window {
            self.backoff_attempt = 0;
        }
        self.backoff_attempt += 1;
        self.total += 1;
        let delay = self.policy.backoff.delay_for_attempt(self.backoff_attempt);
        self.history.push(RestartEntry {
            at: Instant::now(),
            outcome,
            uptime,
            delay,
        });
        self.prune_history();
        delay
    }

    fn window_start(&self) -> Option<Instant> {
        Instant::now().checked_sub(self.policy.window)
    }

    fn prune_history(&mut self) {
        if let Some(start) = self.window_start() {
            self.history.retain(|entry| entry.at >= start);
        }
    }

    /// Restarts inside the current window.
    pub fn restart_count(&self) -> usize {
        match self.window_start() {
            Some(start) => self.history.iter().filter(|e| e.at >= start).count(),
            None => self.history.len(),
        }
    }

    /// Restarts over the unit's whole lifetime.
    pub fn total_restarts(&self) -> u32 {
        self.total
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }
}
