use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::lifecycle::{Progress, SimulationState};

/// Hidden, so a directory scan never mistakes it for an erd file.
pub const RUN_STATUS_FILE: &str = ".mcerd_run.json";

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: String,
    pub identity: String,
    pub state: SimulationState,
    pub seeds: Vec<i64>,
    pub progress: Option<Progress>,
    pub detail: Option<String>,
}

pub fn run_status_path(output_dir: &Path) -> PathBuf {
    output_dir.join(RUN_STATUS_FILE)
}

pub fn write_run_status(output_dir: &Path, status: &RunStatus) -> Result<()> {
    let payload = json!({
        "schema_version": "mcerd_run_status_v1",
        "run_id": status.run_id,
        "identity": status.identity,
        "state": status.state,
        "seeds": status.seeds,
        "active_atoms": status.progress.map(|p| p.active_atoms),
        "finalized_atoms": status.progress.map(|p| p.finalized_atoms),
        "any_alive": status.progress.map(|p| p.any_alive),
        "detail": status.detail,
        "updated_at": Utc::now().to_rfc3339(),
    });
    let bytes = serde_json::to_vec_pretty(&payload)?;
    replace_file(&run_status_path(output_dir), &bytes)
}

// Readers see either the previous status or the new one, never a torn file.
fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let staging = staging_path(path);
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging)
            .with_context(|| format!("failed to stage {}", staging.display()))?;
        file.write_all(bytes)?;
        file.sync_data()?;
    }
    fs::rename(&staging, path)
        .with_context(|| format!("failed to publish {}", path.display()))?;
    sync_dir(dir);
    Ok(())
}

// Same directory as `path` so the rename stays on one filesystem.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| RUN_STATUS_FILE.to_string());
    path.with_file_name(format!("{}.{}.partial", name, std::process::id()))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Records a run as failed unless `complete` is called before drop.
pub struct RunStatusGuard {
    output_dir: PathBuf,
    status: RunStatus,
    done: bool,
}

impl RunStatusGuard {
    pub fn new(output_dir: &Path, status: RunStatus) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            status,
            done: false,
        }
    }

    pub fn update(&mut self, state: SimulationState, progress: Progress) -> Result<()> {
        self.status.state = state;
        self.status.progress = Some(progress);
        write_run_status(&self.output_dir, &self.status)
    }

    pub fn set_seeds(&mut self, seeds: Vec<i64>) {
        self.status.seeds = seeds;
    }

    pub fn complete(&mut self, state: SimulationState, progress: Progress) -> Result<()> {
        self.update(state, progress)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunStatusGuard {
    fn drop(&mut self) {
        if !self.done {
            self.status.detail = Some("failed".to_string());
            let _ = write_run_status(&self.output_dir, &self.status);
        }
    }
}
