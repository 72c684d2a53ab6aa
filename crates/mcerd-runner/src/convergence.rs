use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::lifecycle::{Progress, SimulationController, SimulationState};

/// When a running simulation has produced enough atoms to be abandoned.
///
/// Every `check_interval` the total atom count is compared with the previous
/// check. Once `min_time` has passed, growth below `stop_percent` percent
/// counts as converged. `max_time` caps the run regardless of growth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceCriteria {
    pub check_interval: Duration,
    pub min_time: Duration,
    pub max_time: Duration,
    pub stop_percent: f64,
}

impl Default for ConvergenceCriteria {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(20),
            min_time: Duration::from_secs(60),
            max_time: Duration::from_secs(600),
            stop_percent: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorOutcome {
    Converged,
    TimedOut,
    Cancelled,
    WorkersExited,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MonitorReport {
    pub outcome: MonitorOutcome,
    pub progress: Progress,
    pub elapsed: Duration,
    pub checks: u32,
}

/// Watches a running simulation until it converges, times out, exits on its
/// own, or `token` is cancelled. The simulation is left running; stopping it
/// is up to the caller.
pub fn monitor_until_converged(
    controller: &SimulationController,
    criteria: &ConvergenceCriteria,
    token: &CancellationToken,
) -> MonitorReport {
    let started = Instant::now();
    let mut previous: Option<u64> = None;
    let mut checks = 0u32;
    loop {
        let cancelled = token.sleep_unless_cancelled(criteria.check_interval);
        let elapsed = started.elapsed();
        if cancelled || controller.state() != SimulationState::Running {
            return finish(controller, MonitorOutcome::Cancelled, elapsed, checks);
        }
        if controller.finish_if_idle() {
            return finish(controller, MonitorOutcome::WorkersExited, elapsed, checks);
        }

        checks += 1;
        let progress = controller.poll_progress();
        let total = progress.total_atoms();
        debug!(
            checks,
            total,
            elapsed_s = elapsed.as_secs_f64(),
            "simulation progress"
        );
        if elapsed >= criteria.min_time {
            if let Some(growth) = previous.and_then(|prev| growth_percent(prev, total)) {
                if growth < criteria.stop_percent {
                    info!(growth, total, "simulation converged");
                    return finish(controller, MonitorOutcome::Converged, elapsed, checks);
                }
            }
        }
        if elapsed >= criteria.max_time {
            info!(total, "simulation reached its time limit");
            return finish(controller, MonitorOutcome::TimedOut, elapsed, checks);
        }
        previous = Some(total);
    }
}

fn growth_percent(previous: u64, current: u64) -> Option<f64> {
    if previous == 0 {
        return None;
    }
    Some((current.saturating_sub(previous)) as f64 / previous as f64 * 100.0)
}

fn finish(
    controller: &SimulationController,
    outcome: MonitorOutcome,
    elapsed: Duration,
    checks: u32,
) -> MonitorReport {
    MonitorReport {
        outcome,
        progress: controller.poll_progress(),
        elapsed,
        checks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RecoilElementIdentity;
    use crate::lifecycle::ControllerSettings;
    use crate::registry::ErdFileRegistry;
    use crate::test_support::{append_line, temp_dir};
    use crate::worker::mock::MockLauncher;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;

    fn controller(dir: &Path, launcher: &MockLauncher) -> SimulationController {
        let identity: RecoilElementIdentity = "4He".parse().expect("4He");
        let registry = Arc::new(ErdFileRegistry::new(identity));
        let mut settings = ControllerSettings::new(dir);
        settings.stop_grace = Duration::from_millis(20);
        settings.kill_poll_interval = Duration::from_millis(5);
        SimulationController::new(registry, Arc::new(launcher.clone()), settings)
    }

    fn fast(stop_percent: f64, max_time: Duration) -> ConvergenceCriteria {
        ConvergenceCriteria {
            check_interval: Duration::from_millis(10),
            min_time: Duration::ZERO,
            max_time,
            stop_percent,
        }
    }

    #[test]
    fn growth_is_relative_to_previous_total() {
        assert_eq!(growth_percent(0, 10), None);
        assert_eq!(growth_percent(100, 101), Some(1.0));
        assert_eq!(growth_percent(100, 100), Some(0.0));
    }

    #[test]
    fn stalled_output_converges() {
        let dir = temp_dir("conv_stalled");
        let launcher = MockLauncher::new();
        let ctl = controller(&dir, &launcher);
        let token = CancellationToken::new();
        ctl.start_with_token(1, token.clone()).expect("start");
        append_line(&dir.join("4He-Default.101.erd"));

        let report = monitor_until_converged(&ctl, &fast(1.0, Duration::from_secs(30)), &token);
        assert_eq!(report.outcome, MonitorOutcome::Converged);
        assert_eq!(report.progress.active_atoms, 1);
        assert!(report.checks >= 2);
        assert_eq!(ctl.state(), SimulationState::Running);
        ctl.stop();
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_output_runs_into_time_limit() {
        let dir = temp_dir("conv_timeout");
        let launcher = MockLauncher::new();
        let ctl = controller(&dir, &launcher);
        let token = CancellationToken::new();
        ctl.start_with_token(1, token.clone()).expect("start");
        let report =
            monitor_until_converged(&ctl, &fast(1.0, Duration::from_millis(50)), &token);
        assert_eq!(report.outcome, MonitorOutcome::TimedOut);
        ctl.stop();
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn cancellation_ends_monitoring_promptly() {
        let dir = temp_dir("conv_cancel");
        let launcher = MockLauncher::new();
        let ctl = controller(&dir, &launcher);
        let token = CancellationToken::new();
        ctl.start_with_token(1, token.clone()).expect("start");
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.request_cancellation();
        });
        let criteria = ConvergenceCriteria {
            check_interval: Duration::from_secs(60),
            ..ConvergenceCriteria::default()
        };
        let started = Instant::now();
        let report = monitor_until_converged(&ctl, &criteria, &token);
        assert_eq!(report.outcome, MonitorOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        canceller.join().expect("canceller");
        assert!(ctl.check_cancellation());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn exited_workers_end_monitoring() {
        let dir = temp_dir("conv_exit");
        let launcher = MockLauncher::new();
        let ctl = controller(&dir, &launcher);
        let token = CancellationToken::new();
        ctl.start_with_token(2, token.clone()).expect("start");
        append_line(&dir.join("4He-Default.102.erd"));
        launcher.finish_all();
        let report = monitor_until_converged(&ctl, &fast(0.0, Duration::from_secs(30)), &token);
        assert_eq!(report.outcome, MonitorOutcome::WorkersExited);
        assert_eq!(report.progress.finalized_atoms, 1);
        assert_eq!(ctl.state(), SimulationState::Finished);
        let _ = fs::remove_dir_all(dir);
    }
}
