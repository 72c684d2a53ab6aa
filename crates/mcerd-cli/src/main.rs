use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use mcerd_runner::{
    load_session_config, monitor_until_converged, parse_seed, validate_erd_file_names,
    CancellationToken, ErdFileRegistry, LoggingObserver, MonitorReport, OptimizationLoop,
    ProgressSubject, RecoilElementIdentity, RunStatus, RunStatusGuard, SessionConfig,
    SimulationController, SimulationState, TEMPLATE_CONFIG,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mcerd", version = "0.3.0", about = "MCERD simulation worker runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the seed embedded in each name.
    Seed {
        names: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// List the erd files of an element in a directory with their atom counts.
    Scan {
        dir: PathBuf,
        #[arg(long)]
        element: String,
        #[arg(long)]
        json: bool,
    },
    /// Filter names down to the erd files of an element.
    Filter {
        #[arg(long)]
        element: String,
        names: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Run one simulation batch until it converges or hits its time limit.
    Run {
        config: PathBuf,
        #[arg(long)]
        processes: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Run repeated simulation batches as an optimizer would.
    Optimize {
        config: PathBuf,
        #[arg(long)]
        evaluations: Option<usize>,
        #[arg(long)]
        processes: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    Validate {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long, default_value = "mcerd.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Seed { names, json } => {
            let seeds: Vec<Value> = names
                .iter()
                .map(|n| json!({ "name": n, "seed": parse_seed(n) }))
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "seed",
                    "seeds": seeds,
                })));
            }
            for name in &names {
                match parse_seed(name) {
                    Some(seed) => println!("{}: {}", name, seed),
                    None => println!("{}: none", name),
                }
            }
        }
        Commands::Filter {
            element,
            names,
            json,
        } => {
            let identity: RecoilElementIdentity = element.parse()?;
            let accepted = validate_erd_file_names(&names, &identity);
            if json {
                let files: Vec<Value> = accepted
                    .iter()
                    .map(|(name, seed)| json!({ "name": name, "seed": seed }))
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "filter",
                    "identity": identity.canonical(),
                    "files": files,
                })));
            }
            for (name, seed) in accepted {
                println!("{} {}", seed, name);
            }
        }
        Commands::Scan { dir, element, json } => {
            let identity: RecoilElementIdentity = element.parse()?;
            let registry = ErdFileRegistry::from_directory(&dir, identity)?;
            let files: Vec<Value> = registry
                .iter()
                .map(|e| {
                    json!({
                        "path": e.path.display().to_string(),
                        "seed": e.seed,
                        "lines": mcerd_runner::count_lines(&e.path),
                    })
                })
                .collect();
            let atoms = registry.finalized_atom_count();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "scan",
                    "identity": registry.identity().canonical(),
                    "dir": dir.display().to_string(),
                    "files": files,
                    "max_seed": registry.max_seed(),
                    "atoms": atoms,
                })));
            }
            for e in registry.iter() {
                println!("{} {}", e.seed, e.path.display());
            }
            println!("files: {}", registry.len());
            match registry.max_seed() {
                Some(seed) => println!("max_seed: {}", seed),
                None => println!("max_seed: none"),
            }
            println!("atoms: {}", atoms);
        }
        Commands::Run {
            config,
            processes,
            json,
        } => {
            let session = load_session_config(&config)?;
            let processes = processes.unwrap_or(session.simulation.processes);
            let (controller, output_dir) = build_controller(&session)?;
            let token = CancellationToken::new();
            let mut guard = RunStatusGuard::new(&output_dir, new_status(&session)?);

            let started = controller.start_with_token(processes, token.clone())?;
            guard.set_seeds(started.seeds.clone());
            guard.update(controller.state(), controller.poll_progress())?;
            let failures: Vec<String> = started.failures.iter().map(|f| f.to_string()).collect();

            let report = monitor_until_converged(&controller, &session.criteria(), &token);
            let state = controller.stop();
            let progress = controller.poll_progress();
            guard.complete(state, progress)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "seeds": started.seeds,
                    "spawn_failures": failures,
                    "monitor": monitor_to_json(&report),
                    "state": state,
                    "active_atoms": progress.active_atoms,
                    "finalized_atoms": progress.finalized_atoms,
                })));
            }
            println!("seeds: {:?}", started.seeds);
            for failure in &failures {
                println!("warning: {}", failure);
            }
            println!("outcome: {:?}", report.outcome);
            println!("elapsed_s: {:.1}", report.elapsed.as_secs_f64());
            println!("state: {}", state);
            println!("atoms: {}", progress.total_atoms());
        }
        Commands::Optimize {
            config,
            evaluations,
            processes,
            json,
        } => {
            let session = load_session_config(&config)?;
            let (controller, output_dir) = build_controller(&session)?;
            let optimizer = OptimizationLoop {
                evaluations: evaluations.unwrap_or(session.optimization.evaluations),
                processes: processes.unwrap_or(session.simulation.processes),
                criteria: session.criteria(),
            };
            let subject = ProgressSubject::new();
            subject.subscribe(Arc::new(LoggingObserver));
            let token = CancellationToken::new();
            let mut guard = RunStatusGuard::new(&output_dir, new_status(&session)?);

            let mut atoms_per_evaluation: Vec<u64> = Vec::new();
            let mut record = |index: usize, report: &MonitorReport| -> Result<()> {
                info!(
                    evaluation = index,
                    outcome = ?report.outcome,
                    atoms = report.progress.total_atoms(),
                    "simulation batch evaluated"
                );
                atoms_per_evaluation.push(report.progress.total_atoms());
                Ok(())
            };
            let summary = optimizer.run(&controller, &mut record, &subject, &token)?;
            guard.set_seeds(controller.seeds());
            guard.complete(controller.state(), summary.progress)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "optimize",
                    "evaluations_done": summary.evaluations_done,
                    "cancelled": summary.cancelled,
                    "atoms_per_evaluation": atoms_per_evaluation,
                    "finalized_atoms": summary.progress.finalized_atoms,
                    "monitors": summary.reports.iter().map(monitor_to_json).collect::<Vec<_>>(),
                })));
            }
            println!("evaluations_done: {}", summary.evaluations_done);
            println!("cancelled: {}", summary.cancelled);
            println!("finalized_atoms: {}", summary.progress.finalized_atoms);
        }
        Commands::Validate { config, json } => {
            let session = load_session_config(&config)?;
            let identity = session.identity()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "validate",
                    "valid": true,
                    "identity": identity.canonical(),
                    "output_dir": session.simulation.output_dir.display().to_string(),
                    "worker_command": session.worker.command,
                })));
            }
            println!("identity: {}", identity);
            println!("output_dir: {}", session.simulation.output_dir.display());
            println!("worker_command: {:?}", session.worker.command);
            println!("ok");
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow::anyhow!(
                    "config already exists (use --force): {}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(&path, TEMPLATE_CONFIG)?;
            println!("wrote: {}", path.display());
            println!("next: fill in the fields marked REQUIRED");
            println!("next: mcerd validate {}", path.display());
        }
    }
    Ok(None)
}

fn build_controller(session: &SessionConfig) -> Result<(SimulationController, PathBuf)> {
    let identity = session.identity()?;
    let output_dir = session.simulation.output_dir.clone();
    std::fs::create_dir_all(&output_dir)?;
    let registry = Arc::new(ErdFileRegistry::from_directory(&output_dir, identity)?);
    info!(
        identity = %registry.identity(),
        existing = registry.len(),
        dir = %output_dir.display(),
        "loaded erd registry"
    );
    let controller = SimulationController::new(
        registry,
        Arc::new(session.launcher()),
        session.controller_settings(),
    );
    Ok((controller, output_dir))
}

fn new_status(session: &SessionConfig) -> Result<RunStatus> {
    Ok(RunStatus {
        run_id: format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S")),
        identity: session.identity()?.canonical(),
        state: SimulationState::NotStarted,
        seeds: Vec::new(),
        progress: None,
        detail: None,
    })
}

fn monitor_to_json(report: &MonitorReport) -> Value {
    json!({
        "outcome": report.outcome,
        "elapsed_s": report.elapsed.as_secs_f64(),
        "checks": report.checks,
        "active_atoms": report.progress.active_atoms,
        "finalized_atoms": report.progress.finalized_atoms,
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Seed { json, .. }
        | Commands::Scan { json, .. }
        | Commands::Filter { json, .. }
        | Commands::Run { json, .. }
        | Commands::Optimize { json, .. }
        | Commands::Validate { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}
