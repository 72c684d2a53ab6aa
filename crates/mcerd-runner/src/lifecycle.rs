use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::registry::ErdFileRegistry;
use crate::seed::erd_file_name;
use crate::worker::{terminate_with_grace, WorkerHandle, WorkerLauncher, WorkerRequest};
use crate::{Result, RunnerError};

/// First seed handed out when the registry holds no files yet.
pub const DEFAULT_BASE_SEED: i64 = 101;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationState {
    NotStarted,
    Running,
    Stopped,
    Finished,
}

impl SimulationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimulationState::NotStarted => "not_started",
            SimulationState::Running => "running",
            SimulationState::Stopped => "stopped",
            SimulationState::Finished => "finished",
        }
    }
}

impl fmt::Display for SimulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub output_dir: PathBuf,
    pub base_seed: i64,
    pub stop_grace: Duration,
    pub kill_poll_interval: Duration,
}

impl ControllerSettings {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            base_seed: DEFAULT_BASE_SEED,
            stop_grace: Duration::from_secs(5),
            kill_poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub active_atoms: u64,
    pub finalized_atoms: u64,
    pub any_alive: bool,
}

impl Progress {
    pub fn total_atoms(&self) -> u64 {
        self.active_atoms + self.finalized_atoms
    }
}

#[derive(Debug, Default)]
pub struct StartReport {
    pub seeds: Vec<i64>,
    /// `RunnerError::WorkerSpawnFailure` for each worker that did not start.
    pub failures: Vec<RunnerError>,
}

impl StartReport {
    pub fn started(&self) -> usize {
        self.seeds.len() - self.failures.len()
    }
}

struct SpawnedWorker {
    seed: i64,
    handle: Box<dyn WorkerHandle>,
}

struct Run {
    state: SimulationState,
    token: CancellationToken,
    seeds: Vec<i64>,
    workers: Vec<SpawnedWorker>,
}

/// Starts, monitors and stops batches of simulation workers for one recoil
/// element. Every run allocates fresh seeds above everything the registry
/// has seen, so finalized counts accumulate across runs.
pub struct SimulationController {
    registry: Arc<ErdFileRegistry>,
    launcher: Arc<dyn WorkerLauncher>,
    settings: ControllerSettings,
    run: Mutex<Run>,
}

impl SimulationController {
    pub fn new(
        registry: Arc<ErdFileRegistry>,
        launcher: Arc<dyn WorkerLauncher>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            registry,
            launcher,
            settings,
            run: Mutex::new(Run {
                state: SimulationState::NotStarted,
                token: CancellationToken::new(),
                seeds: Vec::new(),
                workers: Vec::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ErdFileRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn state(&self) -> SimulationState {
        self.lock().state
    }

    /// Token of the current (or last) run.
    pub fn token(&self) -> CancellationToken {
        self.lock().token.clone()
    }

    /// Seeds allocated by the current (or last) run.
    pub fn seeds(&self) -> Vec<i64> {
        self.lock().seeds.clone()
    }

    pub fn start(&self, process_count: usize) -> Result<StartReport> {
        self.start_with_token(process_count, CancellationToken::new())
    }

    /// Starts `process_count` workers whose run is cancelled through `token`.
    pub fn start_with_token(
        &self,
        process_count: usize,
        token: CancellationToken,
    ) -> Result<StartReport> {
        if process_count == 0 {
            return Err(RunnerError::InvalidConfig(
                "process count must be at least 1".to_string(),
            ));
        }
        let mut run = self.lock();
        if run.state == SimulationState::Running {
            return Err(RunnerError::AlreadyRunning);
        }

        let identity = self.registry.identity().clone();
        let first_seed =
            allocate_seeds(self.registry.max_seed(), self.settings.base_seed, process_count)?;
        let mut report = StartReport::default();
        let mut workers = Vec::with_capacity(process_count);
        for index in 0..process_count {
            // In range: allocate_seeds checked first_seed + process_count - 1.
            let seed = first_seed + index as i64;
            let output_path = self.settings.output_dir.join(erd_file_name(&identity, seed));
            // Reserve the seed before the worker can write anything.
            if let Err(e) = self.registry.add_active_file(&output_path) {
                warn!(seed, error = %e, "seed reservation failed, aborting start");
                token.request_cancellation();
                let mut started: Vec<Box<dyn WorkerHandle>> =
                    workers.into_iter().map(|w: SpawnedWorker| w.handle).collect();
                terminate_with_grace(
                    &mut started,
                    self.settings.stop_grace,
                    self.settings.kill_poll_interval,
                );
                self.registry.update();
                run.state = SimulationState::Stopped;
                return Err(e);
            }
            report.seeds.push(seed);

            let request = WorkerRequest {
                seed,
                identity: identity.canonical(),
                output_path,
                index,
                process_count,
            };
            match self.launcher.spawn(&request) {
                Ok(handle) => workers.push(SpawnedWorker { seed, handle }),
                Err(e) => {
                    warn!(seed, error = %e, "simulation worker failed to start");
                    report.failures.push(RunnerError::WorkerSpawnFailure {
                        seed,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            identity = %identity,
            first_seed,
            started = workers.len(),
            failed = report.failures.len(),
            "simulation started"
        );
        run.state = SimulationState::Running;
        run.token = token;
        run.seeds = report.seeds.clone();
        run.workers = workers;
        Ok(report)
    }

    /// Cancels the run, terminates its workers and folds their output into
    /// the finalized count. A no-op unless running.
    pub fn stop(&self) -> SimulationState {
        let mut workers = {
            let mut run = self.lock();
            if run.state != SimulationState::Running {
                return run.state;
            }
            run.token.request_cancellation();
            std::mem::take(&mut run.workers)
        };

        let seeds: Vec<i64> = workers.iter().map(|w| w.seed).collect();
        let mut handles: Vec<Box<dyn WorkerHandle>> =
            workers.drain(..).map(|w| w.handle).collect();
        let killed = terminate_with_grace(
            &mut handles,
            self.settings.stop_grace,
            self.settings.kill_poll_interval,
        );
        let folded = self.registry.update();
        info!(
            identity = %self.registry.identity(),
            seeds = ?seeds,
            killed,
            folded,
            "simulation stopped"
        );

        let mut run = self.lock();
        run.state = SimulationState::Stopped;
        run.state
    }

    /// Active and finalized atom counts plus whether any worker still runs.
    pub fn poll_progress(&self) -> Progress {
        let any_alive = {
            let mut run = self.lock();
            run.workers.iter_mut().any(|w| w.handle.is_alive())
        };
        let (active_atoms, finalized_atoms) = self.registry.atom_counts();
        Progress {
            active_atoms,
            finalized_atoms,
            any_alive,
        }
    }

    /// Moves a running simulation whose workers have all exited to
    /// `Finished`. Returns whether the transition happened.
    pub fn finish_if_idle(&self) -> bool {
        {
            let mut run = self.lock();
            if run.state != SimulationState::Running {
                return false;
            }
            if run.workers.iter_mut().any(|w| w.handle.is_alive()) {
                return false;
            }
            run.workers.clear();
            run.state = SimulationState::Finished;
        }
        let folded = self.registry.update();
        info!(
            identity = %self.registry.identity(),
            folded,
            "all simulation workers exited"
        );
        true
    }

    /// Stops the run when another holder of its token requested cancellation.
    pub fn check_cancellation(&self) -> bool {
        let requested = {
            let run = self.lock();
            run.state == SimulationState::Running && run.token.is_cancellation_requested()
        };
        if requested {
            debug!("cancellation observed, stopping simulation");
            self.stop();
        }
        requested
    }

    fn lock(&self) -> MutexGuard<'_, Run> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// First seed of a batch of `count`, or an error when the batch would run
// past i64::MAX.
fn allocate_seeds(max_seed: Option<i64>, base_seed: i64, count: usize) -> Result<i64> {
    let exhausted = || RunnerError::SeedsExhausted {
        after: max_seed.unwrap_or(base_seed),
        count,
    };
    let first = match max_seed {
        Some(max) => max.checked_add(1).ok_or_else(exhausted)?,
        None => base_seed,
    };
    let span = i64::try_from(count.saturating_sub(1)).map_err(|_| exhausted())?;
    first.checked_add(span).ok_or_else(exhausted)?;
    Ok(first)
}

impl Drop for SimulationController {
    fn drop(&mut self) {
        let run = self.run.get_mut().unwrap_or_else(PoisonError::into_inner);
        for worker in run.workers.iter_mut() {
            if worker.handle.is_alive() {
                let _ = worker.handle.kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RecoilElementIdentity;
    use crate::test_support::{append_line, temp_dir};
    use crate::worker::mock::MockLauncher;
    use std::fs;
    use std::thread;

    fn helium() -> RecoilElementIdentity {
        "4He".parse().expect("4He")
    }

    fn settings(dir: &std::path::Path) -> ControllerSettings {
        let mut s = ControllerSettings::new(dir);
        s.stop_grace = Duration::from_millis(50);
        s.kill_poll_interval = Duration::from_millis(5);
        s
    }

    fn controller(dir: &std::path::Path, launcher: &MockLauncher) -> SimulationController {
        let registry = Arc::new(ErdFileRegistry::from_directory(dir, helium()).expect("scan"));
        SimulationController::new(registry, Arc::new(launcher.clone()), settings(dir))
    }

    #[test]
    fn start_allocates_seeds_from_base_when_empty() {
        let dir = temp_dir("ctl_base");
        let launcher = MockLauncher::new();
        let ctl = controller(&dir, &launcher);
        assert_eq!(ctl.state(), SimulationState::NotStarted);

        let report = ctl.start(3).expect("start");
        assert_eq!(report.seeds, vec![101, 102, 103]);
        assert_eq!(report.started(), 3);
        assert_eq!(ctl.state(), SimulationState::Running);
        assert_eq!(launcher.spawned_seeds(), vec![101, 102, 103]);
        assert_eq!(ctl.registry().active_len(), 3);

        let state = launcher.state.lock().expect("mock state");
        assert_eq!(
            state.spawned[1].output_path,
            dir.join("4He-Default.102.erd")
        );
        assert_eq!(state.spawned[1].index, 1);
        assert_eq!(state.spawned[1].process_count, 3);
        drop(state);
        ctl.stop();
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn start_continues_above_existing_seeds() {
        let dir = temp_dir("ctl_existing");
        append_line(&dir.join("4He-Default.101.erd"));
        append_line(&dir.join("4He-Default.250.erd"));
        let launcher = MockLauncher::new();
        let ctl = controller(&dir, &launcher);
        let report = ctl.start(2).expect("start");
        assert_eq!(report.seeds, vec![251, 252]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn start_while_running_fails() {
        let dir = temp_dir("ctl_running");
        let launcher = MockLauncher::new();
        let ctl = controller(&dir, &launcher);
        ctl.start(1).expect("start");
        assert!(matches!(ctl.start(1), Err(RunnerError::AlreadyRunning)));
        assert_eq!(launcher.spawned_seeds().len(), 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn zero_processes_is_rejected() {
        let dir = temp_dir("ctl_zero");
        let ctl = controller(&dir, &MockLauncher::new());
        assert!(matches!(ctl.start(0), Err(RunnerError::InvalidConfig(_))));
        assert_eq!(ctl.state(), SimulationState::NotStarted);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn spawn_failures_do_not_roll_back_the_batch() {
        let dir = temp_dir("ctl_fail");
        let launcher = MockLauncher::failing(vec![1]);
        let ctl = controller(&dir, &launcher);
        let report = ctl.start(3).expect("start");
        assert_eq!(report.seeds, vec![101, 102, 103]);
        assert_eq!(report.started(), 2);
        assert!(matches!(
            report.failures.as_slice(),
            [RunnerError::WorkerSpawnFailure { seed: 102, .. }]
        ));
        assert_eq!(launcher.spawned_seeds(), vec![101, 103]);
        assert_eq!(ctl.state(), SimulationState::Running);
        assert!(ctl.poll_progress().any_alive);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn stop_terminates_workers_and_folds_counts() {
        let dir = temp_dir("ctl_stop");
        append_line(&dir.join("4He-Default.101.erd"));
        let launcher = MockLauncher::new();
        let ctl = controller(&dir, &launcher);
        ctl.start(2).expect("start");
        let token = ctl.token();

        for seed in [102, 103] {
            append_line(&dir.join(format!("4He-Default.{}.erd", seed)));
        }
        append_line(&dir.join("4He-Default.103.erd"));
        assert_eq!(
            ctl.poll_progress(),
            Progress {
                active_atoms: 3,
                finalized_atoms: 1,
                any_alive: true
            }
        );

        assert_eq!(ctl.stop(), SimulationState::Stopped);
        assert!(token.is_cancellation_requested());
        assert_eq!(
            ctl.poll_progress(),
            Progress {
                active_atoms: 0,
                finalized_atoms: 4,
                any_alive: false
            }
        );
        assert_eq!(
            launcher.state.lock().expect("mock state").terminated,
            vec![102, 103]
        );
        // stopping twice is harmless
        assert_eq!(ctl.stop(), SimulationState::Stopped);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn stop_kills_workers_that_ignore_termination() {
        let dir = temp_dir("ctl_stubborn");
        let launcher = MockLauncher::stubborn();
        let ctl = controller(&dir, &launcher);
        ctl.start(2).expect("start");
        ctl.stop();
        let state = launcher.state.lock().expect("mock state");
        assert_eq!(state.killed, vec![101, 102]);
        assert!(state.alive.is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn restart_uses_new_seeds_and_keeps_history() {
        let dir = temp_dir("ctl_restart");
        let launcher = MockLauncher::new();
        let ctl = controller(&dir, &launcher);
        ctl.start(2).expect("first run");
        append_line(&dir.join("4He-Default.101.erd"));
        ctl.stop();
        let first_token = ctl.token();

        let report = ctl.start(2).expect("second run");
        assert_eq!(report.seeds, vec![103, 104]);
        assert!(!ctl.token().is_cancellation_requested());
        assert!(first_token.is_cancellation_requested());
        append_line(&dir.join("4He-Default.104.erd"));
        ctl.stop();
        assert_eq!(ctl.poll_progress().finalized_atoms, 2);
        assert_eq!(ctl.registry().len(), 4);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn finish_if_idle_detects_exited_workers() {
        let dir = temp_dir("ctl_finish");
        let launcher = MockLauncher::new();
        let ctl = controller(&dir, &launcher);
        ctl.start(2).expect("start");
        assert!(!ctl.finish_if_idle());
        append_line(&dir.join("4He-Default.102.erd"));
        launcher.finish_all();
        assert!(!ctl.poll_progress().any_alive);
        assert!(ctl.finish_if_idle());
        assert_eq!(ctl.state(), SimulationState::Finished);
        assert_eq!(ctl.poll_progress().finalized_atoms, 1);
        // a finished run is not stopped again
        assert_eq!(ctl.stop(), SimulationState::Finished);
        assert!(launcher.state.lock().expect("mock state").terminated.is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn external_cancellation_is_observed() {
        let dir = temp_dir("ctl_cancel");
        let launcher = MockLauncher::new();
        let ctl = controller(&dir, &launcher);
        let token = CancellationToken::new();
        ctl.start_with_token(2, token.clone()).expect("start");
        assert!(!ctl.check_cancellation());
        token.request_cancellation();
        assert!(ctl.check_cancellation());
        assert_eq!(ctl.state(), SimulationState::Stopped);
        assert!(!ctl.check_cancellation());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn seeds_registered_elsewhere_are_skipped() {
        let dir = temp_dir("ctl_shared_registry");
        let launcher = MockLauncher::new();
        let registry = Arc::new(ErdFileRegistry::new(helium()));
        let mut s = settings(&dir);
        s.base_seed = 5;
        let ctl = SimulationController::new(Arc::clone(&registry), Arc::new(launcher.clone()), s);
        registry
            .add_active_file(dir.join("4He-Other.9.erd"))
            .expect("seed 9");
        let report = ctl.start(1).expect("start");
        assert_eq!(report.seeds, vec![10]);
        assert!(matches!(
            registry.add_active_file(dir.join("4He-Other.10.erd")),
            Err(RunnerError::DuplicateSeed { seed: 10, .. })
        ));
        ctl.stop();
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn controller_is_shareable_across_threads() {
        let dir = temp_dir("ctl_threads");
        let launcher = MockLauncher::new();
        let ctl = Arc::new(controller(&dir, &launcher));
        ctl.start(2).expect("start");
        let poller = {
            let ctl = Arc::clone(&ctl);
            thread::spawn(move || {
                let mut polls = 0;
                while ctl.state() == SimulationState::Running {
                    let _ = ctl.poll_progress();
                    polls += 1;
                    thread::sleep(Duration::from_millis(1));
                }
                polls
            })
        };
        thread::sleep(Duration::from_millis(20));
        ctl.stop();
        assert!(poller.join().expect("poller") > 0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn seeds_at_the_top_of_the_range_are_exhausted_cleanly() {
        let dir = temp_dir("ctl_seed_limit");
        let launcher = MockLauncher::new();
        let top = format!("4He-Default.{}.erd", i64::MAX);
        let registry = Arc::new(ErdFileRegistry::from_names([top.as_str()], helium()));
        let ctl = SimulationController::new(registry, Arc::new(launcher.clone()), settings(&dir));
        assert!(matches!(
            ctl.start(1),
            Err(RunnerError::SeedsExhausted { after: i64::MAX, count: 1 })
        ));
        assert_eq!(ctl.state(), SimulationState::NotStarted);
        assert!(launcher.spawned_seeds().is_empty());

        let near = format!("4He-Default.{}.erd", i64::MAX - 2);
        let registry = Arc::new(ErdFileRegistry::from_names([near.as_str()], helium()));
        let ctl = SimulationController::new(registry, Arc::new(launcher.clone()), settings(&dir));
        assert!(matches!(
            ctl.start(3),
            Err(RunnerError::SeedsExhausted { count: 3, .. })
        ));
        assert_eq!(ctl.registry().active_len(), 0);
        let report = ctl.start(2).expect("last two seeds");
        assert_eq!(report.seeds, vec![i64::MAX - 1, i64::MAX]);
        ctl.stop();
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn progress_stays_consistent_while_stopping() {
        let dir = temp_dir("ctl_poll_stop");
        append_line(&dir.join("4He-Default.101.erd"));
        let launcher = MockLauncher::new();
        let ctl = Arc::new(controller(&dir, &launcher));
        let mut expected = 1;
        for _ in 0..10 {
            let report = ctl.start(2).expect("start");
            for seed in &report.seeds {
                let path = dir.join(format!("4He-Default.{}.erd", seed));
                append_line(&path);
                append_line(&path);
            }
            expected += 4;
            let poller = {
                let ctl = Arc::clone(&ctl);
                thread::spawn(move || {
                    let mut totals = Vec::new();
                    while ctl.state() == SimulationState::Running {
                        totals.push(ctl.poll_progress().total_atoms());
                    }
                    totals
                })
            };
            thread::sleep(Duration::from_millis(2));
            assert_eq!(ctl.stop(), SimulationState::Stopped);
            let totals = poller.join().expect("poller");
            assert!(totals.iter().all(|&t| t == expected), "{:?}", totals);
            assert_eq!(ctl.poll_progress().finalized_atoms, expected);
        }
        let _ = fs::remove_dir_all(dir);
    }
}
