use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub evaluations_left: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub evaluations_done: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Next(ProgressUpdate),
    Error(ErrorReport),
    Completed(Completion),
}

/// Listener side of the progress protocol. Any number of `on_next` calls
/// are followed by at most one `on_error` or `on_completed` per run.
pub trait ProgressObserver: Send + Sync {
    fn on_next(&self, update: &ProgressUpdate);
    fn on_error(&self, report: &ErrorReport);
    fn on_completed(&self, completion: &Completion);
}

#[derive(Default)]
struct SubjectState {
    observers: Vec<Arc<dyn ProgressObserver>>,
    terminated: bool,
}

/// Fans events out to subscribed observers and drops anything published
/// after the terminal event of the current run.
#[derive(Default)]
pub struct ProgressSubject {
    state: Mutex<SubjectState>,
}

impl ProgressSubject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn ProgressObserver>) {
        self.lock().observers.push(observer);
    }

    /// Arms the subject for a new run.
    pub fn reset(&self) {
        self.lock().terminated = false;
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    pub fn next(&self, evaluations_left: usize) {
        let Some(observers) = self.live_observers(false) else {
            return;
        };
        let update = ProgressUpdate { evaluations_left };
        for o in &observers {
            o.on_next(&update);
        }
    }

    /// Returns false when the run had already terminated.
    pub fn error(&self, error: impl Into<String>) -> bool {
        let Some(observers) = self.live_observers(true) else {
            return false;
        };
        let report = ErrorReport {
            error: error.into(),
        };
        for o in &observers {
            o.on_error(&report);
        }
        true
    }

    /// Returns false when the run had already terminated.
    pub fn completed(&self, evaluations_done: usize) -> bool {
        let Some(observers) = self.live_observers(true) else {
            return false;
        };
        let completion = Completion { evaluations_done };
        for o in &observers {
            o.on_completed(&completion);
        }
        true
    }

    // Observers are called outside the lock so they may publish or subscribe.
    fn live_observers(&self, terminal: bool) -> Option<Vec<Arc<dyn ProgressObserver>>> {
        let mut state = self.lock();
        if state.terminated {
            return None;
        }
        if terminal {
            state.terminated = true;
        }
        Some(state.observers.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SubjectState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forwards every event into a channel; a closed receiver is ignored.
pub struct ChannelObserver {
    tx: Mutex<Sender<ProgressEvent>>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }

    fn send(&self, event: ProgressEvent) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = tx.send(event);
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_next(&self, update: &ProgressUpdate) {
        self.send(ProgressEvent::Next(update.clone()));
    }

    fn on_error(&self, report: &ErrorReport) {
        self.send(ProgressEvent::Error(report.clone()));
    }

    fn on_completed(&self, completion: &Completion) {
        self.send(ProgressEvent::Completed(completion.clone()));
    }
}

pub struct LoggingObserver;

impl ProgressObserver for LoggingObserver {
    fn on_next(&self, update: &ProgressUpdate) {
        info!(evaluations_left = update.evaluations_left, "evaluation finished");
    }

    fn on_error(&self, report: &ErrorReport) {
        warn!(error = %report.error, "optimization stopped with an error");
    }

    fn on_completed(&self, completion: &Completion) {
        info!(
            evaluations_done = completion.evaluations_done,
            "optimization completed"
        );
    }
}
