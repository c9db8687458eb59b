//! Weighted hierarchical progress aggregation and ETA.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::core::errors::DataPilotError;

/// Static phase weights, as percentages summing to 100.
const PHASE_WEIGHTS: &[(&str, f64)] = &[
    ("initialisation", 5.0),
    ("section1", 15.0),
    ("section2", 20.0),
    ("section3", 25.0),
    ("section4", 15.0),
    ("section5", 10.0),
    ("section6", 10.0),
];

/// Internal bookkeeping for one phase's progress.
#[derive(Debug, Clone, Copy)]
struct PhaseState {
    weight: f64,
    progress: f64,
    started: bool,
    completed: bool,
}

/// Observer hooks a caller can install to react to progress events. The
/// default no-op implementation lets callers override only the callbacks
/// they care about.
pub trait ProgressObserver: Send + Sync {
    /// A phase has started.
    fn on_phase_start(&self, _phase: &str) {}
    /// A phase's progress has been updated, as a percentage in `[0, 100]`.
    fn on_progress(&self, _phase: &str, _percent: f64, _weighted_percent: f64, _eta_ms: Option<u64>) {}
    /// A phase has completed.
    fn on_phase_complete(&self, _phase: &str) {}
    /// A non-fatal warning was raised.
    fn on_warning(&self, _message: &str) {}
    /// A fatal error terminated the run.
    fn on_error(&self, _error: &DataPilotError) {}
}

struct LoggingObserver;

impl ProgressObserver for LoggingObserver {
    fn on_phase_start(&self, phase: &str) {
        info!(phase, "phase started");
    }

    fn on_progress(&self, phase: &str, percent: f64, weighted_percent: f64, eta_ms: Option<u64>) {
        info!(phase, percent, weighted_percent, eta_ms, "progress");
    }

    fn on_phase_complete(&self, phase: &str) {
        info!(phase, "phase completed");
    }

    fn on_warning(&self, message: &str) {
        warn!(message, "progress warning");
    }

    fn on_error(&self, error: &DataPilotError) {
        tracing::error!(error = %error, "run failed");
    }
}

/// Aggregates per-phase progress into one weighted percentage and an ETA,
/// dispatching to a pluggable [`ProgressObserver`].
pub struct ProgressOrchestrator {
    phases: Mutex<Vec<(String, PhaseState)>>,
    started_at: Instant,
    observer: Box<dyn ProgressObserver>,
    last_reported_millis: AtomicU64,
}

impl Default for ProgressOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressOrchestrator {
    /// Build an orchestrator with the default (tracing-backed) observer and
    /// the static phase weights.
    pub fn new() -> Self {
        Self::with_observer(Box::new(LoggingObserver))
    }

    /// Build an orchestrator with a custom observer, e.g. one that streams
    /// events to a UI instead of (or in addition to) logging.
    pub fn with_observer(observer: Box<dyn ProgressObserver>) -> Self {
        let phases = PHASE_WEIGHTS
            .iter()
            .map(|(name, weight)| {
                (
                    name.to_string(),
                    PhaseState {
                        weight: *weight,
                        progress: 0.0,
                        started: false,
                        completed: false,
                    },
                )
            })
            .collect();
        Self {
            phases: Mutex::new(phases),
            started_at: Instant::now(),
            observer,
            last_reported_millis: AtomicU64::new(0),
        }
    }

    /// Renormalise phase weights so they still sum to 100 after some phases
    /// are dropped, e.g. when the plan drops conditional nodes.
    pub fn renormalize(&self, active_phases: &[&str]) {
        let mut phases = self.phases.lock();
        let total_weight: f64 = phases
            .iter()
            .filter(|(name, _)| active_phases.contains(&name.as_str()))
            .map(|(_, s)| s.weight)
            .sum();
        if total_weight <= 0.0 {
            return;
        }
        let scale = 100.0 / total_weight;
        for (name, state) in phases.iter_mut() {
            if active_phases.contains(&name.as_str()) {
                state.weight *= scale;
            } else {
                state.weight = 0.0;
            }
        }
    }

    /// Signal that `phase` has begun.
    pub fn on_phase_start(&self, phase: &str) {
        let mut phases = self.phases.lock();
        if let Some((_, state)) = phases.iter_mut().find(|(name, _)| name == phase) {
            state.started = true;
        }
        self.observer.on_phase_start(phase);
    }

    /// Update `phase`'s progress to `percent` (0-100) and report the
    /// aggregate weighted progress and ETA.
    pub fn on_progress(&self, phase: &str, percent: f64) {
        let percent = percent.clamp(0.0, 100.0);
        let (weighted, completed_before) = {
            let mut phases = self.phases.lock();
            if let Some((_, state)) = phases.iter_mut().find(|(name, _)| name == phase) {
                state.progress = percent;
            }
            let completed_weight: f64 = phases
                .iter()
                .filter(|(name, _)| name != phase)
                .map(|(_, s)| if s.completed { s.weight } else { 0.0 })
                .sum();
            let current_weight = phases
                .iter()
                .find(|(name, _)| name == phase)
                .map(|(_, s)| s.weight)
                .unwrap_or(0.0);
            (completed_weight + current_weight * percent / 100.0, completed_weight)
        };

        let eta_ms = if weighted > 0.0 {
            let elapsed_ms = self.started_at.elapsed().as_millis() as f64;
            Some((elapsed_ms * (100.0 / weighted - 1.0)).max(0.0) as u64)
        } else {
            None
        };

        let _ = completed_before;
        self.last_reported_millis
            .store(self.started_at.elapsed().as_millis() as u64, Ordering::SeqCst);
        self.observer.on_progress(phase, percent, weighted, eta_ms);
    }

    /// Signal that `phase` has finished; its full weight now counts toward
    /// the aggregate regardless of the last reported percentage.
    pub fn on_phase_complete(&self, phase: &str) {
        {
            let mut phases = self.phases.lock();
            if let Some((_, state)) = phases.iter_mut().find(|(name, _)| name == phase) {
                state.progress = 100.0;
                state.completed = true;
            }
        }
        self.observer.on_phase_complete(phase);
    }

    /// Report a non-fatal warning.
    pub fn on_warning(&self, message: &str) {
        self.observer.on_warning(message);
    }

    /// Report the fatal error that ended the run.
    pub fn on_error(&self, error: &DataPilotError) {
        self.observer.on_error(error);
    }

    /// Current weighted aggregate progress, in `[0, 100]`.
    pub fn weighted_progress(&self) -> f64 {
        let phases = self.phases.lock();
        phases
            .iter()
            .map(|(_, s)| {
                if s.completed {
                    s.weight
                } else {
                    s.weight * s.progress / 100.0
                }
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_progress_accumulates_across_phases() {
        let orchestrator = ProgressOrchestrator::new();
        orchestrator.on_phase_start("initialisation");
        orchestrator.on_phase_complete("initialisation");
        assert!((orchestrator.weighted_progress() - 5.0).abs() < 1e-6);

        orchestrator.on_phase_start("section1");
        orchestrator.on_progress("section1", 50.0);
        // 5 (initialisation) + 15 * 0.5 (section1 half done) = 12.5
        assert!((orchestrator.weighted_progress() - 12.5).abs() < 1e-6);
    }

    #[test]
    fn renormalize_rescales_active_phases_to_one_hundred() {
        let orchestrator = ProgressOrchestrator::new();
        orchestrator.renormalize(&["initialisation", "section1"]);
        orchestrator.on_phase_start("initialisation");
        orchestrator.on_phase_complete("initialisation");
        orchestrator.on_phase_start("section1");
        orchestrator.on_phase_complete("section1");
        assert!((orchestrator.weighted_progress() - 100.0).abs() < 1e-6);
    }
}
