use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::convergence::{monitor_until_converged, ConvergenceCriteria, MonitorReport};
use crate::lifecycle::{Progress, SimulationController, SimulationState};
use crate::observer::ProgressSubject;

/// Scores one finished simulation batch. Stands in for the fitness function
/// of the optimizer driving the simulations.
pub trait Evaluation {
    fn evaluate(&mut self, index: usize, report: &MonitorReport) -> Result<()>;
}

impl<F> Evaluation for F
where
    F: FnMut(usize, &MonitorReport) -> Result<()>,
{
    fn evaluate(&mut self, index: usize, report: &MonitorReport) -> Result<()> {
        self(index, report)
    }
}

#[derive(Debug, Clone)]
pub struct OptimizationLoop {
    pub evaluations: usize,
    pub processes: usize,
    pub criteria: ConvergenceCriteria,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationSummary {
    pub evaluations_done: usize,
    pub cancelled: bool,
    pub progress: Progress,
    pub reports: Vec<MonitorReport>,
}

impl OptimizationLoop {
    /// Runs one simulation batch per evaluation on `controller`. Each batch
    /// gets a child of `token`, so stopping a batch leaves `token` untouched.
    /// Cancelling `token` ends the loop early and still completes the run
    /// on `subject`; an error stops the simulation and is reported through
    /// `on_error` before being returned.
    pub fn run(
        &self,
        controller: &SimulationController,
        evaluation: &mut dyn Evaluation,
        subject: &ProgressSubject,
        token: &CancellationToken,
    ) -> Result<OptimizationSummary> {
        subject.reset();
        let mut reports = Vec::with_capacity(self.evaluations);
        let mut cancelled = false;
        for index in 0..self.evaluations {
            if token.is_cancellation_requested() {
                cancelled = true;
                break;
            }
            match self.evaluate_once(controller, evaluation, token, index) {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    controller.stop();
                    warn!(evaluation = index, error = %e, "optimization failed");
                    subject.error(e.to_string());
                    return Err(e);
                }
            }
            subject.next(self.evaluations - index - 1);
        }

        let done = reports.len();
        info!(evaluations_done = done, cancelled, "optimization loop ended");
        subject.completed(done);
        Ok(OptimizationSummary {
            evaluations_done: done,
            cancelled,
            progress: controller.poll_progress(),
            reports,
        })
    }

    // Ok(None) means the batch was cancelled before it could be scored.
    fn evaluate_once(
        &self,
        controller: &SimulationController,
        evaluation: &mut dyn Evaluation,
        token: &CancellationToken,
        index: usize,
    ) -> Result<Option<MonitorReport>> {
        // Stopping a batch cancels its own token only; `token` spans the loop.
        let batch = token.child();
        let started = controller.start_with_token(self.processes, batch.clone())?;
        if started.started() == 0 {
            controller.stop();
            return Err(anyhow!(
                "no simulation worker could be started for evaluation {}",
                index
            ));
        }
        let report = monitor_until_converged(controller, &self.criteria, &batch);
        if controller.state() == SimulationState::Running {
            controller.stop();
        }
        if token.is_cancellation_requested() {
            return Ok(None);
        }
        evaluation.evaluate(index, &report)?;
        Ok(Some(report))
    }
}
