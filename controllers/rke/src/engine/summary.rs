//! End-of-run report

use super::plan::Action;
use crate::error::EngineError;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What a run did and which failures it recorded without aborting
#[derive(Debug)]
pub struct RunSummary {
    pub command: &'static str,
    /// Revision of the state written by the run
    pub revision: Option<u64>,
    pub counts: BTreeMap<Action, usize>,
    pub failures: Vec<EngineError>,
    started: Instant,
}

impl RunSummary {
    #[must_use]
    pub fn new(command: &'static str) -> Self {
        Self {
            command,
            revision: None,
            counts: BTreeMap::new(),
            failures: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, failures: impl IntoIterator<Item = EngineError>) {
        self.failures.extend(failures);
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Steps that changed something
    #[must_use]
    pub fn changed(&self) -> usize {
        self.counts
            .iter()
            .filter(|(action, _)| **action != Action::Noop)
            .map(|(_, n)| n)
            .sum()
    }

    /// `0` when clean, otherwise the highest exit code among the failures
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.failures.iter().map(EngineError::exit_code).max().unwrap_or(0)
    }

    /// Log the summary and every recorded failure
    pub fn log(&self) {
        for failure in &self.failures {
            warn!("[summary] {}", failure);
        }
        info!("[summary] {}", self);
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} finished in {:.1}s", self.command, self.elapsed().as_secs_f64())?;
        if !self.counts.is_empty() {
            let counts: Vec<String> = self.counts.iter().map(|(action, n)| format!("{n} {action}")).collect();
            write!(f, ": {}", counts.join(", "))?;
        }
        if let Some(revision) = self.revision {
            write!(f, ", state revision {revision}")?;
        }
        if !self.failures.is_empty() {
            write!(f, ", {} failure(s)", self.failures.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_run() {
        let mut summary = RunSummary::new("up");
        summary.counts.insert(Action::Deploy, 3);
        summary.counts.insert(Action::Noop, 5);
        summary.revision = Some(2);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.changed(), 3);
        let line = summary.to_string();
        assert!(line.starts_with("up finished in"));
        assert!(line.ends_with("state revision 2"));
    }

    #[test]
    fn test_partial_success_exits_four() {
        let mut summary = RunSummary::new("up");
        summary.record([
            EngineError::WorkerDeployFailed {
                host: "10.0.0.3".into(),
                reason: "kubelet failed".into(),
            },
            EngineError::AddonApplyFailed {
                addon: "rke-coredns".into(),
                reason: "timeout".into(),
            },
        ]);
        assert_eq!(summary.exit_code(), 4);
        assert!(summary.to_string().contains("2 failure(s)"));
    }
}
