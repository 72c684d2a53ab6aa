use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::convergence::ConvergenceCriteria;
use crate::identity::RecoilElementIdentity;
use crate::lifecycle::{ControllerSettings, DEFAULT_BASE_SEED};
use crate::worker::ProcessLauncher;

pub const TEMPLATE_CONFIG: &str = "\
simulation:
  element: ''                 # REQUIRED: recoil element, e.g. 4He
  label: Default
  output_dir: ''              # REQUIRED: directory the erd files are written to
  processes: 4
  base_seed: 101
  stop_grace_ms: 5000
  poll_interval_ms: 1000
worker:
  command: []                 # REQUIRED: e.g. [mcerd, '{output}.in']
  working_dir: null
  stdout_to_output: true
  inherit_stderr: false
convergence:
  check_interval_s: 20
  min_time_s: 60
  max_time_s: 600
  stop_percent: 1.0
optimization:
  evaluations: 10
";

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub simulation: SimulationSection,
    pub worker: WorkerSection,
    #[serde(default)]
    pub convergence: ConvergenceSection,
    #[serde(default)]
    pub optimization: OptimizationSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulationSection {
    pub element: String,
    #[serde(default = "default_label")]
    pub label: String,
    pub output_dir: PathBuf,
    #[serde(default = "default_processes")]
    pub processes: usize,
    #[serde(default = "default_base_seed")]
    pub base_seed: i64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub stdout_to_output: bool,
    #[serde(default)]
    pub inherit_stderr: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConvergenceSection {
    pub check_interval_s: f64,
    pub min_time_s: f64,
    pub max_time_s: f64,
    pub stop_percent: f64,
}

impl Default for ConvergenceSection {
    fn default() -> Self {
        let d = ConvergenceCriteria::default();
        Self {
            check_interval_s: d.check_interval.as_secs_f64(),
            min_time_s: d.min_time.as_secs_f64(),
            max_time_s: d.max_time.as_secs_f64(),
            stop_percent: d.stop_percent,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizationSection {
    #[serde(default = "default_evaluations")]
    pub evaluations: usize,
}

impl Default for OptimizationSection {
    fn default() -> Self {
        Self {
            evaluations: default_evaluations(),
        }
    }
}

fn default_label() -> String {
    "Default".to_string()
}

fn default_processes() -> usize {
    1
}

fn default_base_seed() -> i64 {
    DEFAULT_BASE_SEED
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_evaluations() -> usize {
    1
}

fn default_true() -> bool {
    true
}

const REQUIRED_FIELDS: [&str; 3] = [
    "/simulation/element",
    "/simulation/output_dir",
    "/worker/command",
];

/// Reads a session config from YAML (or JSON for `.json` files). Relative
/// directories resolve against the directory holding the config.
pub fn load_session_config(path: &Path) -> Result<SessionConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read session config {}", path.display()))?;
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let value: Value = if is_json {
        serde_json::from_str(&raw)?
    } else {
        serde_yaml::from_str(&raw)?
    };
    validate_required_fields(&value)?;
    let mut config: SessionConfig = serde_json::from_value(value)
        .with_context(|| format!("invalid session config {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    config.resolve_paths(base);
    config.validate()?;
    Ok(config)
}

/// Reports every missing or empty required field in one error.
pub fn validate_required_fields(value: &Value) -> Result<()> {
    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|pointer| match value.pointer(pointer) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(Value::Array(a)) => a.is_empty(),
            Some(_) => false,
        })
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(anyhow!(
        "session config is missing required fields: {}",
        missing.join(", ")
    ))
}

impl SessionConfig {
    fn resolve_paths(&mut self, base: &Path) {
        if self.simulation.output_dir.is_relative() {
            self.simulation.output_dir = base.join(&self.simulation.output_dir);
        }
        if let Some(dir) = &self.worker.working_dir {
            if dir.is_relative() {
                self.worker.working_dir = Some(base.join(dir));
            }
        }
    }

    fn validate(&self) -> Result<()> {
        self.identity()?;
        if self.simulation.processes == 0 {
            return Err(anyhow!("simulation.processes must be at least 1"));
        }
        let c = &self.convergence;
        for (name, v) in [
            ("check_interval_s", c.check_interval_s),
            ("min_time_s", c.min_time_s),
            ("max_time_s", c.max_time_s),
            ("stop_percent", c.stop_percent),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(anyhow!("convergence.{} must be a non-negative number", name));
            }
        }
        if c.max_time_s < c.min_time_s {
            return Err(anyhow!("convergence.max_time_s is below min_time_s"));
        }
        Ok(())
    }

    pub fn identity(&self) -> Result<RecoilElementIdentity> {
        let identity: RecoilElementIdentity = self.simulation.element.parse()?;
        Ok(identity.with_name(&self.simulation.label)?)
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        let mut settings = ControllerSettings::new(&self.simulation.output_dir);
        settings.base_seed = self.simulation.base_seed;
        settings.stop_grace = Duration::from_millis(self.simulation.stop_grace_ms);
        settings
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.simulation.poll_interval_ms.max(1))
    }

    pub fn launcher(&self) -> ProcessLauncher {
        let mut launcher = ProcessLauncher::new(self.worker.command.clone())
            .stdout_to_output(self.worker.stdout_to_output)
            .inherit_stderr(self.worker.inherit_stderr);
        if let Some(dir) = &self.worker.working_dir {
            launcher = launcher.working_dir(dir);
        }
        launcher
    }

    pub fn criteria(&self) -> ConvergenceCriteria {
        let c = &self.convergence;
        ConvergenceCriteria {
            check_interval: Duration::from_secs_f64(c.check_interval_s),
            min_time: Duration::from_secs_f64(c.min_time_s),
            max_time: Duration::from_secs_f64(c.max_time_s),
            stop_percent: c.stop_percent,
        }
    }
}
